//! Compile-time tree rewriting.
//!
//! The processor walks the tree once, registering `!{...}` definitions into a
//! stack of scopes and expanding every use site in place. Expansion itself is
//! delegated to a fixed pipeline of three rules; the first rule that claims a
//! node wins. Conditions of `!{if}` forms run through a small pure evaluator
//! that understands comparisons, boolean connectives and a handful of list
//! operations.

use std::collections::HashMap;

use log::{debug, trace};

use crate::node::{Keyword, Node, NodeValue, SourceLocation};

#[derive(thiserror::Error, Debug, Clone)]
#[error("{message} ({location})")]
pub struct MacroError {
    pub message: String,
    pub location: SourceLocation,
}

impl MacroError {
    fn new(message: impl Into<String>, node: &Node) -> Self {
        Self {
            message: message.into(),
            location: node.location().clone(),
        }
    }
}

/// One level of macro definitions, opened at a given tree depth and closed
/// when the walk leaves that depth.
#[derive(Debug)]
struct Scope {
    depth: u32,
    macros: HashMap<Box<str>, Node>,
}

impl Scope {
    fn new(depth: u32) -> Self {
        Self {
            depth,
            macros: HashMap::new(),
        }
    }
}

/// The expansion rules, tried in this order on every node.
#[derive(Debug, Clone, Copy)]
enum Rule {
    /// a symbol aliased by a `!{name value}` macro
    Symbol,
    /// a `!{if cond then else}` form
    Conditional,
    /// a call form whose head names a function-shaped macro
    List,
}

const PIPELINE: [Rule; 3] = [Rule::Symbol, Rule::Conditional, Rule::List];

pub struct MacroProcessor {
    debug: u32,
    options: u16,
    ast: Node,
    scopes: Vec<Scope>,
}

impl MacroProcessor {
    pub fn new(debug: u32, options: u16) -> Self {
        Self {
            debug,
            options,
            ast: Node::list(Vec::new()),
            scopes: Vec::new(),
        }
    }

    /// Consume the root tree and expand every macro in it.
    pub fn feed(&mut self, ast: Node) -> Result<(), MacroError> {
        if self.debug >= 2 {
            debug!("processing macros (options {:#06x})", self.options);
        }

        let mut ast = ast;
        self.process(&mut ast, 0)?;
        self.ast = ast;

        if self.debug >= 3 {
            trace!("ast after macro processing: {}", self.ast);
        }
        Ok(())
    }

    /// The expanded tree.
    pub fn ast(&self) -> &Node {
        &self.ast
    }

    fn process(&mut self, node: &mut Node, depth: u32) -> Result<(), MacroError> {
        if !node.is_list() {
            return Ok(());
        }

        let mut i = 0;
        loop {
            let Some(children) = node.children_mut() else {
                break;
            };
            if i >= children.len() {
                break;
            }

            if children[i].is_macro() {
                // open a scope unless the current one belongs to this depth
                if self.scopes.last().map(|scope| scope.depth) != Some(depth) {
                    self.scopes.push(Scope::new(depth));
                }

                self.register_macro(&mut children[i])?;
                // a definition is erased once registered; an executed `!{if}`
                // leaves its branch behind, picked up on the next turn
                let Some(children) = node.children_mut() else {
                    break;
                };
                if children[i].is_macro() {
                    children.remove(i);
                }
            } else {
                // expand only once at least one macro is in scope
                if self.scopes.iter().any(|scope| !scope.macros.is_empty()) {
                    self.execute(&mut children[i])?;
                }
                // an expansion may itself produce a definition; treat it as
                // one instead of walking past it
                let Some(children) = node.children_mut() else {
                    break;
                };
                if children[i].is_macro() {
                    continue;
                }
                self.process(&mut children[i], depth + 1)?;
                i += 1;
            }
        }

        if self.scopes.last().is_some_and(|scope| scope.depth == depth) {
            self.scopes.pop();
        }
        Ok(())
    }

    /// Register a `!{...}` node into the innermost scope, or run it if it is
    /// a conditional.
    fn register_macro(&mut self, node: &mut Node) -> Result<(), MacroError> {
        let Some(children) = node.children() else {
            return Err(MacroError::new("invalid macro, missing value", node));
        };
        if children.len() < 2 {
            return Err(MacroError::new("invalid macro, missing value", node));
        }

        let first = &children[0];
        let second = &children[1];

        match children.len() {
            // !{name value} and !{undef name}
            2 => match first.value() {
                NodeValue::Symbol(name) if name.as_ref() == "undef" => match second.value() {
                    NodeValue::Symbol(target) => {
                        let target = target.clone();
                        self.delete_nearest_macro(&target);
                        Ok(())
                    }
                    _ => Err(MacroError::new(
                        "can not undefine a macro without it's name",
                        second,
                    )),
                },
                NodeValue::Symbol(name) => {
                    self.bind_macro(name.clone(), node.clone());
                    Ok(())
                }
                _ => Err(MacroError::new(
                    "can not define a macro without a symbol",
                    first,
                )),
            },
            // !{name (args) body}
            3 if first.is_symbol() => {
                let NodeValue::Symbol(name) = first.value() else {
                    unreachable!("guarded by is_symbol");
                };
                let NodeValue::List(params) = second.value() else {
                    return Err(MacroError::new("invalid macro argument's list", second));
                };

                let mut had_spread = false;
                for param in params {
                    match param.value() {
                        NodeValue::Spread(_) if had_spread => {
                            return Err(MacroError::new(
                                "got another spread argument, only one is allowed",
                                param,
                            ));
                        }
                        NodeValue::Spread(_) => had_spread = true,
                        NodeValue::Symbol(_) if had_spread => {
                            return Err(MacroError::new(
                                "got another argument after a spread argument, which is invalid",
                                param,
                            ));
                        }
                        NodeValue::Symbol(_) => {}
                        _ => {
                            return Err(MacroError::new(
                                "invalid macro argument's list, expected symbols",
                                param,
                            ));
                        }
                    }
                }

                self.bind_macro(name.clone(), node.clone());
                Ok(())
            }
            // !{if cond then [else]}
            3 | 4 => match first.value() {
                NodeValue::Keyword(Keyword::If) => {
                    self.execute(node)?;
                    Ok(())
                }
                NodeValue::Keyword(_) => Err(MacroError::new(
                    "the only authorized keyword in macros is `if'",
                    first,
                )),
                _ => Err(MacroError::new("unrecognized macro form", node)),
            },
            _ => Err(MacroError::new("unrecognized macro form", node)),
        }
    }

    fn bind_macro(&mut self, name: Box<str>, node: Node) {
        if self.debug >= 3 {
            trace!("registering macro `{name}'");
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.macros.insert(name, node);
        }
    }

    /// Innermost definition for a name, scanning scopes top to bottom.
    fn find_nearest_macro(&self, name: &str) -> Option<&Node> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.macros.get(name))
    }

    /// Remove the innermost definition for a name, used by `!{undef name}`.
    fn delete_nearest_macro(&mut self, name: &str) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.macros.remove(name).is_some() {
                return;
            }
        }
    }

    /// Run the rule pipeline on a node; the first rule that claims it wins.
    fn execute(&mut self, node: &mut Node) -> Result<bool, MacroError> {
        for rule in PIPELINE {
            let applied = match rule {
                Rule::Symbol => self.apply_symbol_rule(node)?,
                Rule::Conditional => self.apply_conditional_rule(node)?,
                Rule::List => self.apply_list_rule(node)?,
            };
            if applied {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Substitute a symbol aliased by a `!{name value}` macro.
    fn apply_symbol_rule(&mut self, node: &mut Node) -> Result<bool, MacroError> {
        let NodeValue::Symbol(name) = node.value() else {
            return Ok(false);
        };
        let Some(children) = self.find_nearest_macro(name).and_then(Node::children) else {
            return Ok(false);
        };
        if children.len() == 2 {
            let replacement = children[1].clone();
            node.replace_with(replacement);
            // an alias may name another macro, or a whole call form
            self.execute(node)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Rewrite `!{if cond then else}` into the taken branch.
    fn apply_conditional_rule(&mut self, node: &mut Node) -> Result<bool, MacroError> {
        if !node.is_macro() {
            return Ok(false);
        }
        let Some(children) = node.children() else {
            return Ok(false);
        };
        if children.first().and_then(Node::keyword) != Some(Keyword::If) {
            return Ok(false);
        }

        let condition = self.evaluate(&children[1], true)?;
        let replacement = if self.is_truthy(&condition)? {
            children[2].clone()
        } else if children.len() > 3 {
            children[3].clone()
        } else {
            // nothing matched, the whole form dissolves
            Node::new(NodeValue::Unused, node.location().clone())
        };
        node.replace_with(replacement);

        // the branch may itself be a definition
        if node.is_macro() {
            self.register_macro(node)?;
        }
        Ok(true)
    }

    /// Expand a call form whose head names a macro.
    fn apply_list_rule(&mut self, node: &mut Node) -> Result<bool, MacroError> {
        if !node.is_list() {
            return Ok(false);
        }
        let Some(children) = node.children() else {
            return Ok(false);
        };
        let Some(NodeValue::Symbol(name)) = children.first().map(Node::value) else {
            return Ok(false);
        };
        let name = name.clone();
        let Some(mac) = self.find_nearest_macro(&name).cloned() else {
            return Ok(false);
        };
        let Some(mac_children) = mac.children() else {
            return Ok(false);
        };

        match mac_children.len() {
            // alias used as the head of a call
            2 => {
                let replacement = mac_children[1].clone();
                if let Some(children) = node.children_mut() {
                    children[0].replace_with(replacement);
                    self.execute(&mut children[0])?;
                }
                Ok(true)
            }
            // function-shaped macro
            3 => {
                let empty = Vec::new();
                let params = mac_children[1].children().unwrap_or(&empty);
                let args = &children[1..];

                let mut map: HashMap<Box<str>, Node> = HashMap::new();
                let mut param_index = 0;
                let mut too_many = false;
                for arg in args {
                    match params.get(param_index).map(Node::value) {
                        Some(NodeValue::Symbol(param)) => {
                            map.insert(param.clone(), arg.clone());
                            param_index += 1;
                        }
                        Some(NodeValue::Spread(param)) => {
                            map.entry(param.clone())
                                .or_insert_with(empty_data_list)
                                .push(arg.clone());
                        }
                        _ => {
                            too_many = true;
                            break;
                        }
                    }
                }
                // a trailing spread that received no argument still binds an
                // empty list
                if map.len() + 1 == params.len() {
                    if let Some(NodeValue::Spread(param)) = params.last().map(Node::value) {
                        map.insert(param.clone(), empty_data_list());
                    }
                }
                if too_many || map.len() != params.len() {
                    return Err(MacroError::new(
                        format!(
                            "macro `{name}' got {} argument(s) but needed {}",
                            args.len(),
                            params.len()
                        ),
                        node,
                    ));
                }

                let mut body = mac_children[2].clone();
                if !map.is_empty() {
                    unify(&map, &mut body)?;
                }
                let expanded = self.evaluate(&body, false)?;
                node.replace_with(expanded);
                // the body may expand to another macro invocation
                self.execute(node)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The compile-time mini-language. Comparisons and boolean connectives
    /// are only recognized while evaluating a condition (`is_not_body`), so
    /// they do not silently run inside macro bodies; the list operations are
    /// always available.
    fn evaluate(&mut self, node: &Node, is_not_body: bool) -> Result<Node, MacroError> {
        match node.value() {
            NodeValue::Symbol(name) => {
                if let Some(children) = self.find_nearest_macro(name).and_then(Node::children) {
                    if children.len() == 2 {
                        return Ok(children[1].clone());
                    }
                }
                Ok(node.clone())
            }
            NodeValue::List(children) if children.len() > 1 && children[0].is_symbol() => {
                let Some(name) = children[0].string().map(Box::<str>::from) else {
                    return Ok(node.clone());
                };

                // a macro used as the head resolves first
                let mut node = node.clone();
                if self.find_nearest_macro(&name).is_some() {
                    if let Some(children) = node.children_mut() {
                        self.execute(&mut children[0])?;
                    }
                }

                let children = node.children().unwrap_or(&[]).to_vec();
                match name.as_ref() {
                    "=" | "!=" | "<" | ">" | "<=" | ">=" if is_not_body => {
                        if children.len() != 3 {
                            return Err(MacroError::new(
                                format!(
                                    "interpreting a `{name}' condition with {} arguments, instead of 2",
                                    children.len() - 1
                                ),
                                &node,
                            ));
                        }
                        let one = self.evaluate(&children[1], is_not_body)?;
                        let two = self.evaluate(&children[2], is_not_body)?;
                        let truth = match name.as_ref() {
                            "=" => one == two,
                            "!=" => one != two,
                            ordered => {
                                let ordering = one.partial_cmp(&two).ok_or_else(|| {
                                    MacroError::new(
                                        format!(
                                            "can not compare a {} and a {}",
                                            one.kind_name(),
                                            two.kind_name()
                                        ),
                                        &node,
                                    )
                                })?;
                                match ordered {
                                    "<" => ordering.is_lt(),
                                    ">" => ordering.is_gt(),
                                    "<=" => ordering.is_le(),
                                    _ => ordering.is_ge(),
                                }
                            }
                        };
                        Ok(truth_node(truth))
                    }
                    "not" if is_not_body => {
                        if children.len() != 2 {
                            return Err(MacroError::new(
                                format!(
                                    "interpreting a `not' condition with {} arguments, instead of 1",
                                    children.len() - 1
                                ),
                                &node,
                            ));
                        }
                        let value = self.evaluate(&children[1], is_not_body)?;
                        Ok(truth_node(!self.is_truthy(&value)?))
                    }
                    connective @ ("and" | "or") if is_not_body => {
                        if children.len() < 3 {
                            return Err(MacroError::new(
                                format!(
                                    "interpreting a `{connective}' chain with {} arguments, expected at least 2",
                                    children.len() - 1
                                ),
                                &node,
                            ));
                        }
                        let stop_on = connective == "or";
                        for operand in &children[1..] {
                            let value = self.evaluate(operand, is_not_body)?;
                            if self.is_truthy(&value)? == stop_on {
                                return Ok(truth_node(stop_on));
                            }
                        }
                        Ok(truth_node(!stop_on))
                    }
                    "len" => {
                        if children.len() > 2 {
                            return Err(MacroError::new(
                                format!(
                                    "when expanding `len' inside a macro, got {} arguments, needed only 1",
                                    children.len() - 1
                                ),
                                &node,
                            ));
                        }
                        let Some(elements) = children[1].children().filter(|_| children[1].is_list())
                        else {
                            return Err(MacroError::new(
                                format!(
                                    "when expanding `len' inside a macro, got a {}, needed a List",
                                    children[1].kind_name()
                                ),
                                &node,
                            ));
                        };
                        let mut count = elements.len();
                        if elements.first() == Some(Node::list_node()) {
                            count -= 1;
                        }
                        Ok(Node::number(count as f64))
                    }
                    "@" => {
                        if children.len() != 3 {
                            return Err(MacroError::new(
                                format!(
                                    "interpreting a `@' with {} arguments, instead of 2",
                                    children.len() - 1
                                ),
                                &node,
                            ));
                        }
                        let sublist = self.evaluate(&children[1], is_not_body)?;
                        let index = self.evaluate(&children[2], is_not_body)?;

                        let Some(elements) = sublist.children().filter(|_| sublist.is_list())
                        else {
                            return Err(MacroError::new(
                                format!(
                                    "interpreting a `@' with a {} instead of a List",
                                    sublist.kind_name()
                                ),
                                &sublist,
                            ));
                        };
                        let Some(raw_index) = index.as_number() else {
                            return Err(MacroError::new(
                                format!(
                                    "interpreting a `@' with a {} as the index type, instead of a Number",
                                    index.kind_name()
                                ),
                                &index,
                            ));
                        };

                        let elements = skip_list_marker(elements);
                        let len = elements.len() as i64;
                        let raw_index = raw_index as i64;
                        let resolved = if raw_index < 0 {
                            len + raw_index
                        } else {
                            raw_index
                        };
                        if (0..len).contains(&resolved) {
                            Ok(elements[resolved as usize].clone())
                        } else {
                            Err(MacroError::new(
                                format!(
                                    "index error when processing `@' in macro: got index {raw_index}, while max size was {len}"
                                ),
                                &node,
                            ))
                        }
                    }
                    "head" => {
                        let elements = one_list_argument(&name, &children, &node)?;
                        Ok(skip_list_marker(elements)
                            .first()
                            .cloned()
                            .unwrap_or_else(|| Node::nil_node().clone()))
                    }
                    "tail" => {
                        let elements = one_list_argument(&name, &children, &node)?;
                        let has_marker = elements.first() == Some(Node::list_node());
                        let mut tail = elements.to_vec();
                        if skip_list_marker(elements).is_empty() {
                            Ok(empty_data_list())
                        } else {
                            // drop the first real element, keep the marker
                            tail.remove(usize::from(has_marker));
                            Ok(Node::list(tail))
                        }
                    }
                    _ => Ok(node),
                }
            }
            NodeValue::List(children) if children.len() > 1 => {
                let mut evaluated = Vec::with_capacity(children.len());
                for child in children {
                    evaluated.push(self.evaluate(child, is_not_body)?);
                }
                Ok(Node::new(NodeValue::List(evaluated), node.location().clone()))
            }
            _ => Ok(node.clone()),
        }
    }

    fn is_truthy(&self, node: &Node) -> Result<bool, MacroError> {
        match node.value() {
            NodeValue::Symbol(name) => Ok(name.as_ref() == "true"),
            NodeValue::Number(n) => Ok(*n != 0.0),
            NodeValue::String(s) => Ok(!s.is_empty()),
            NodeValue::Spread(_) => Err(MacroError::new(
                "can not determine the truth value of a spreaded symbol",
                node,
            )),
            _ => Ok(false),
        }
    }
}

/// Replace every mapped symbol in the target by its bound node, splicing
/// spread expansions into the surrounding list.
fn unify(map: &HashMap<Box<str>, Node>, target: &mut Node) -> Result<(), MacroError> {
    match target.value() {
        NodeValue::Symbol(name) => {
            if let Some(bound) = map.get(name) {
                target.replace_with(bound.clone());
            }
            Ok(())
        }
        NodeValue::List(_) | NodeValue::Macro(_) => {
            let Some(children) = target.children_mut() else {
                return Ok(());
            };
            let mut i = 0;
            while i < children.len() {
                if let NodeValue::Spread(name) = children[i].value() {
                    let expansion = map.get(name).cloned().ok_or_else(|| {
                        MacroError::new(
                            "got a non-list while trying to apply the spread operator",
                            &children[i],
                        )
                    })?;
                    let Some(elements) = expansion.children().filter(|_| expansion.is_list())
                    else {
                        return Err(MacroError::new(
                            "got a non-list while trying to apply the spread operator",
                            &children[i],
                        ));
                    };
                    let elements = skip_list_marker(elements).to_vec();
                    let inserted = elements.len();
                    children.splice(i..=i, elements);
                    i += inserted;
                } else {
                    unify(map, &mut children[i])?;
                    i += 1;
                }
            }
            Ok(())
        }
        NodeValue::Spread(name) => {
            // a body that is nothing but a spread collapses to the bound list
            let expansion = map.get(name).cloned().ok_or_else(|| {
                MacroError::new(
                    "got a non-list while trying to apply the spread operator",
                    target,
                )
            })?;
            if !expansion.is_list() {
                return Err(MacroError::new(
                    "got a non-list while trying to apply the spread operator",
                    target,
                ));
            }
            target.replace_with(expansion);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// `(list)` with the marker symbol, the empty data list.
fn empty_data_list() -> Node {
    Node::list(vec![Node::list_node().clone()])
}

fn truth_node(truth: bool) -> Node {
    if truth {
        Node::true_node().clone()
    } else {
        Node::false_node().clone()
    }
}

/// A data list starts with the `list` marker symbol; skip it when indexing.
fn skip_list_marker(elements: &[Node]) -> &[Node] {
    if elements.first() == Some(Node::list_node()) {
        &elements[1..]
    } else {
        elements
    }
}

/// Arity and type checking shared by `head` and `tail`.
fn one_list_argument<'a>(
    name: &str,
    children: &'a [Node],
    node: &Node,
) -> Result<&'a [Node], MacroError> {
    if children.len() > 2 {
        return Err(MacroError::new(
            format!(
                "when expanding `{name}' inside a macro, got {} arguments, needed only 1",
                children.len() - 1
            ),
            node,
        ));
    }
    children[1]
        .children()
        .filter(|_| children[1].is_list())
        .ok_or_else(|| {
            MacroError::new(
                format!(
                    "when expanding `{name}' inside a macro, got a {}, needed a List",
                    children[1].kind_name()
                ),
                node,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::MacroProcessor;
    use crate::node::{Node, NodeValue};
    use crate::parser::parse;
    use assert2::{assert, check};

    fn expand(source: &str) -> Node {
        let ast = parse(source, "test.ark").unwrap();
        let mut processor = MacroProcessor::new(0, 0);
        processor.feed(ast).unwrap();
        processor.ast().clone()
    }

    fn expand_err(source: &str) -> String {
        let ast = parse(source, "test.ark").unwrap();
        let mut processor = MacroProcessor::new(0, 0);
        processor.feed(ast).unwrap_err().message
    }

    fn forms(root: &Node) -> &[Node] {
        &root.children().unwrap()[1..]
    }

    fn no_transients(node: &Node) -> bool {
        if node.is_macro() || node.is_spread() {
            return false;
        }
        node.children()
            .map_or(true, |children| children.iter().all(no_transients))
    }

    #[test]
    fn symbol_alias_expands() {
        let root = expand("!{foo 1} (let x foo)");
        check!(root.to_string() == "(begin (let x 1))");
    }

    #[test]
    fn alias_used_as_call_head() {
        let root = expand("!{say print} (say \"hi\")");
        check!(root.to_string() == r#"(begin (print "hi"))"#);
    }

    #[test]
    fn function_macro_expands() {
        let root = expand("!{sq (x) (* x x)} (let y (sq 3))");
        check!(root.to_string() == "(begin (let y (* 3 3)))");
    }

    #[test]
    fn conditional_registers_the_taken_branch() {
        let root = expand("!{if (= 1 1) !{a 1} !{a 2}} (let v a)");
        check!(root.to_string() == "(begin (let v 1))");
        let root = expand("!{if (!= 1 1) !{a 1} !{a 2}} (let v a)");
        check!(root.to_string() == "(begin (let v 2))");
    }

    #[test]
    fn else_less_false_conditional_dissolves() {
        let root = expand("!{if (= 1 2) !{a 1}} (let v 2)");
        let kids = forms(&root);
        check!(matches!(kids[0].value(), NodeValue::Unused));
        check!(kids[1].to_string() == "(let v 2)");
    }

    #[test]
    fn spread_arguments_inline() {
        let root = expand("!{foo (a @rest) (+ a @rest)} (foo 1 2 3)");
        check!(root.to_string() == "(begin (+ 1 2 3))");
    }

    #[test]
    fn empty_spread_binds_an_empty_list() {
        let root = expand("!{foo (a @rest) (+ a @rest)} (foo 1)");
        check!(root.to_string() == "(begin (+ 1))");
    }

    #[test]
    fn expansion_reaches_a_fix_point() {
        let root = expand(
            "!{sq (x) (* x x)} !{four (sq 2)} (let a four) (let b (sq (sq 3))) [1 2]",
        );
        assert!(no_transients(&root));
    }

    #[test]
    fn nested_scopes_are_invisible_to_siblings() {
        let root = expand("(begin !{a 1} (let y a)) (let x a)");
        // expanded inside the begin, left alone next to it
        check!(forms(&root)[0].to_string() == "(begin (let y 1))");
        check!(forms(&root)[1].to_string() == "(let x a)");
    }

    #[test]
    fn top_level_macros_reach_nested_forms() {
        let root = expand("!{a 1} (begin (let x a))");
        check!(forms(&root)[0].to_string() == "(begin (let x 1))");
    }

    #[test]
    fn undef_removes_the_nearest_definition() {
        let root = expand("!{a 1} !{undef a} (let x a)");
        check!(forms(&root)[0].to_string() == "(let x a)");
    }

    #[test]
    fn evaluator_comparisons() {
        // comparisons must agree with the numbers behind them
        for (a, b) in [(1.0, 2.0), (2.0, 1.0), (2.0, 2.0)] {
            for (op, expected) in [
                ("=", a == b),
                ("!=", a != b),
                ("<", a < b),
                (">", a > b),
                ("<=", a <= b),
                (">=", a >= b),
            ] {
                let source = format!("!{{if ({op} {a} {b}) yes no}}");
                let root = expand(&source);
                let picked = forms(&root)[0].to_string();
                check!(
                    picked == if expected { "yes" } else { "no" },
                    "({op} {a} {b})"
                );
            }
        }
    }

    #[test]
    fn evaluator_connectives() {
        check!(forms(&expand("!{if (and (= 1 1) (= 2 2)) yes no}"))[0].to_string() == "yes");
        check!(forms(&expand("!{if (and (= 1 1) (= 2 3)) yes no}"))[0].to_string() == "no");
        check!(forms(&expand("!{if (or (= 1 2) (= 2 2)) yes no}"))[0].to_string() == "yes");
        check!(forms(&expand("!{if (not (= 1 2)) yes no}"))[0].to_string() == "yes");
    }

    #[test]
    fn evaluator_list_operations() {
        check!(forms(&expand("!{m (xs) (len xs)} (let n (m [4 5 6]))"))[0].to_string()
            == "(let n 3)");
        check!(forms(&expand("!{m (xs) (@ xs 1)} (let n (m [4 5 6]))"))[0].to_string()
            == "(let n 5)");
        check!(forms(&expand("!{m (xs) (@ xs -1)} (let n (m [4 5 6]))"))[0].to_string()
            == "(let n 6)");
        check!(forms(&expand("!{m (xs) (head xs)} (let n (m [4 5 6]))"))[0].to_string()
            == "(let n 4)");
        check!(forms(&expand("!{m (xs) (tail xs)} (let n (m [4 5 6]))"))[0].to_string()
            == "(let n (list 5 6))");
        check!(forms(&expand("!{m (xs) (head xs)} (let n (m []))"))[0].to_string()
            == "(let n nil)");
        check!(forms(&expand("!{m (xs) (tail xs)} (let n (m []))"))[0].to_string()
            == "(let n (list))");
    }

    #[test]
    fn sentinels_survive_expansion() {
        let nil_before = Node::nil_node().clone();
        let _ = expand("!{if (= 1 1) !{a 1}} (let x [1 2]) (let y a)");
        check!(Node::nil_node() == &nil_before);
        check!(Node::list_node() == &Node::symbol("list"));
        check!(Node::true_node() == &Node::symbol("true"));
        check!(Node::false_node() == &Node::symbol("false"));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let message = expand_err("!{sq (x) (* x x)} (sq 1 2)");
        check!(message.contains("got 2 argument(s) but needed 1"));
    }

    #[test]
    fn malformed_macros_are_reported() {
        check!(expand_err("!{}").contains("invalid macro, missing value"));
        check!(expand_err("!{1 2}").contains("can not define a macro without a symbol"));
        check!(expand_err("!{undef 1}").contains("can not undefine a macro without it's name"));
        check!(expand_err("!{m 1 2 3 4}").contains("unrecognized macro form"));
        check!(expand_err("!{m (a @b c) a}")
            .contains("got another argument after a spread argument"));
        check!(expand_err("!{m (@a @b) a}").contains("got another spread argument"));
        check!(expand_err("!{m (1) a}").contains("expected symbols"));
        check!(expand_err("!{let 1 2}").contains("the only authorized keyword in macros"));
    }

    #[test]
    fn evaluator_misuse_is_reported() {
        check!(expand_err("!{if (= 1) yes no}").contains("instead of 2"));
        // `=` is structural and never fails on kinds, but ordering does
        check!(forms(&expand("!{if (= 1 \"a\") yes no}"))[0].to_string() == "no");
        check!(expand_err("!{if (< 1 \"a\") yes no}").contains("can not compare"));
        check!(expand_err("!{m (xs) (@ xs 9)} (m [1 2])").contains("index error"));
        check!(expand_err("!{m (xs) (len xs)} (m 1)").contains("needed a List"));
        check!(expand_err("!{if @x yes no}")
            .contains("can not determine the truth value of a spreaded symbol"));
    }
}
