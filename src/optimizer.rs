//! Tree-level cleanup run between parsing and macro processing.
//!
//! The only pass for now drops top-level bindings that nothing references.
//! Occurrences are counted over the whole tree, macro bodies included, so a
//! binding only used after expansion is never removed.

use std::collections::HashMap;

use log::debug;

use crate::node::{Keyword, Node, NodeValue};
use crate::FEATURE_REMOVE_UNUSED;

pub struct Optimizer {
    options: u16,
    ast: Node,
}

impl Optimizer {
    pub fn new(options: u16) -> Self {
        Self {
            options,
            ast: Node::list(Vec::new()),
        }
    }

    pub fn feed(&mut self, ast: Node) {
        self.ast = ast;
        if self.options & FEATURE_REMOVE_UNUSED != 0 {
            self.remove_unused();
        }
    }

    pub fn ast(&self) -> &Node {
        &self.ast
    }

    fn remove_unused(&mut self) {
        // removing a binding may orphan another one, so run to a fix point
        let mut removed = 0usize;
        loop {
            let mut counts: HashMap<Box<str>, usize> = HashMap::new();
            count_occurrences(&self.ast, &mut counts);

            let Some(children) = self.ast.children_mut() else {
                return;
            };
            let before = children.len();
            children.retain(|child| !is_unused_binding(child, &counts));
            removed += before - children.len();
            if children.len() == before {
                break;
            }
        }
        if removed > 0 {
            debug!("removed {removed} unused top-level binding(s)");
        }
    }
}

/// `(let|mut name value)` whose name occurs exactly once, as its own target.
fn is_unused_binding(node: &Node, counts: &HashMap<Box<str>, usize>) -> bool {
    let Some(children) = node.children().filter(|_| node.is_list()) else {
        return false;
    };
    if children.len() != 3 {
        return false;
    }
    if !matches!(
        children[0].keyword(),
        Some(Keyword::Let) | Some(Keyword::Mut)
    ) {
        return false;
    }
    match children[1].value() {
        NodeValue::Symbol(name) => counts.get(name).copied() == Some(1),
        _ => false,
    }
}

fn count_occurrences(node: &Node, counts: &mut HashMap<Box<str>, usize>) {
    match node.value() {
        NodeValue::Symbol(name) | NodeValue::Spread(name) | NodeValue::Capture(name) => {
            *counts.entry(name.clone()).or_insert(0) += 1;
        }
        NodeValue::List(children) | NodeValue::Macro(children) => {
            for child in children {
                count_occurrences(child, counts);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::Optimizer;
    use crate::parser::parse;
    use crate::FEATURE_REMOVE_UNUSED;
    use assert2::check;

    fn optimize(source: &str, options: u16) -> String {
        let mut optimizer = Optimizer::new(options);
        optimizer.feed(parse(source, "test.ark").unwrap());
        optimizer.ast().to_string()
    }

    #[test]
    fn unused_bindings_are_dropped() {
        let out = optimize("(let x 1) (let y 2) (print y)", FEATURE_REMOVE_UNUSED);
        check!(out == "(begin (let y 2) (print y))");
    }

    #[test]
    fn removal_cascades() {
        let out = optimize(
            "(let a 1) (let b a) (print \"hi\")",
            FEATURE_REMOVE_UNUSED,
        );
        check!(out == "(begin (print \"hi\"))");
    }

    #[test]
    fn disabled_without_the_feature_bit() {
        let out = optimize("(let x 1)", 0);
        check!(out == "(begin (let x 1))");
    }

    #[test]
    fn macro_bodies_keep_bindings_alive() {
        let out = optimize("(let x 1) !{m (a) (+ a x)} (m 2)", FEATURE_REMOVE_UNUSED);
        check!(out.contains("(let x 1)"));
    }

    #[test]
    fn assignments_count_as_uses() {
        let out = optimize("(mut x 1) (set x 2)", FEATURE_REMOVE_UNUSED);
        check!(out.contains("(mut x 1)"));
    }
}
