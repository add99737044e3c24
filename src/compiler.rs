//! Walks the expanded tree and emits the bytecode container.
//!
//! Compilation is a single recursive walk that interns symbols and constants
//! into deduplicated tables, grows one instruction page per function body
//! (page 0 is the top-level program), and finally serializes headers, tables
//! and pages into one binary blob.

pub mod instructions;
pub mod value;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace};

use crate::macros::MacroProcessor;
use crate::node::{Keyword, Node, NodeValue, SourceLocation};
use crate::optimizer::Optimizer;
use crate::parser;
use crate::Error;

use instructions::{builtin_index, operator, specific, Inst, Instruction};
use value::{Constant, NUMBER_TAG, PAGE_REF_TAG, STRING_TAG};

#[derive(thiserror::Error, Debug, Clone)]
#[error("{message} ({location})")]
pub struct CompilerError {
    pub message: String,
    pub location: SourceLocation,
}

impl CompilerError {
    fn new(message: impl Into<String>, node: &Node) -> Self {
        Self {
            message: message.into(),
            location: node.location().clone(),
        }
    }
}

pub struct Compiler {
    optimizer: Optimizer,
    macro_processor: MacroProcessor,
    debug: u32,
    ast: Node,
    // tables: symbols, values, plugins and code pages
    symbols: Vec<Node>,
    defined_symbols: HashSet<Box<str>>,
    plugins: Vec<Box<str>>,
    values: Vec<Constant>,
    code_pages: Vec<Vec<Inst>>,
    /// scratch pages for sub-forms whose final page is not known while they
    /// are being emitted; addressed by negative page ids
    temp_pages: Vec<Vec<Inst>>,
    bytecode: Vec<u8>,
}

impl Compiler {
    pub fn new(debug: u32, options: u16) -> Self {
        Self {
            optimizer: Optimizer::new(options),
            macro_processor: MacroProcessor::new(debug, options),
            debug,
            ast: Node::list(Vec::new()),
            symbols: Vec::new(),
            defined_symbols: HashSet::new(),
            plugins: Vec::new(),
            values: Vec::new(),
            code_pages: Vec::new(),
            temp_pages: Vec::new(),
            bytecode: Vec::new(),
        }
    }

    /// Parse source text into the tree the later passes consume.
    pub fn feed(&mut self, code: &str, filename: &str) -> Result<(), Error> {
        self.ast = parser::parse(code, filename)?;
        Ok(())
    }

    /// Run the whole pipeline: optimize, expand macros, walk, serialize.
    /// The instance is single-use; after an error it must be discarded.
    pub fn compile(&mut self) -> Result<(), Error> {
        let ast = std::mem::replace(&mut self.ast, Node::list(Vec::new()));
        self.optimizer.feed(ast);
        self.macro_processor.feed(self.optimizer.ast().clone())?;
        let ast = self.macro_processor.ast().clone();

        if self.debug >= 3 {
            trace!("compiling: {ast}");
        }

        self.push_headers_phase1();
        self.code_pages.push(Vec::new());
        self.compile_node(&ast, 0)?;
        self.check_for_undefined_symbols()?;
        self.push_headers_phase2();

        if self.debug >= 1 {
            debug!(
                "compiled {} page(s), {} symbol(s), {} value(s)",
                self.code_pages.len(),
                self.symbols.len(),
                self.values.len()
            );
        }
        Ok(())
    }

    /// The produced binary blob; only valid after a successful [`compile`].
    ///
    /// [`compile`]: Compiler::compile
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        fs::write(path, &self.bytecode)
    }

    // read-only views over the tables, for inspection
    pub fn symbols(&self) -> &[Node] {
        &self.symbols
    }

    pub fn constants(&self) -> &[Constant] {
        &self.values
    }

    pub fn plugins(&self) -> &[Box<str>] {
        &self.plugins
    }

    pub fn pages(&self) -> &[Vec<Inst>] {
        &self.code_pages
    }

    fn compile_node(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        match node.value() {
            NodeValue::Symbol(_) => self.compile_symbol(node, page),
            NodeValue::Number(n) => {
                let index = self.add_constant(Constant::Number(*n));
                self.emit(page, Inst::with_arg(Instruction::LoadConst, index));
                Ok(())
            }
            NodeValue::String(s) => {
                let index = self.add_constant(Constant::String(s.clone()));
                self.emit(page, Inst::with_arg(Instruction::LoadConst, index));
                Ok(())
            }
            NodeValue::Capture(_) => {
                let index = self.add_symbol(node);
                self.emit(page, Inst::with_arg(Instruction::Capture, index));
                Ok(())
            }
            NodeValue::GetField(_) => {
                let index = self.add_symbol(node);
                self.emit(page, Inst::with_arg(Instruction::GetField, index));
                Ok(())
            }
            NodeValue::List(children) => {
                let Some(head) = children.first() else {
                    return Err(CompilerError::new("can not compile an empty list", node));
                };
                match head.value() {
                    NodeValue::Keyword(keyword) => match keyword {
                        Keyword::If => self.compile_if(node, page),
                        Keyword::Let | Keyword::Mut => self.compile_let_mut(*keyword, node, page),
                        Keyword::Set => self.compile_set(node, page),
                        Keyword::Fun => self.compile_function(node, page),
                        Keyword::While => self.compile_while(node, page),
                        Keyword::Begin => {
                            for child in &children[1..] {
                                self.compile_node(child, page)?;
                            }
                            Ok(())
                        }
                        Keyword::Import => self.compile_plugin_import(node, page),
                        Keyword::Quote => self.compile_quote(node, page),
                        Keyword::Del => self.compile_del(node, page),
                    },
                    NodeValue::Symbol(name)
                        if operator(name).is_some()
                            || specific(name).is_some()
                            || matches!(name.as_ref(), "and" | "or") =>
                    {
                        self.compile_specific(name.clone(), node, page)
                    }
                    _ => self.handle_calls(node, page),
                }
            }
            NodeValue::Keyword(keyword) => Err(CompilerError::new(
                format!("can not compile the keyword `{}' outside of a form", keyword.name()),
                node,
            )),
            NodeValue::Macro(_) => Err(CompilerError::new(
                "can not compile an unexpanded macro",
                node,
            )),
            NodeValue::Spread(_) => Err(CompilerError::new(
                "can not use a spread outside of a macro",
                node,
            )),
            NodeValue::Unused => Ok(()),
            NodeValue::Closure => Err(CompilerError::new(
                "can not compile a runtime closure",
                node,
            )),
        }
    }

    /// Resolution order: operators, builtins, then a plain symbol load.
    /// `false`, `true` and `nil` sit at the front of the builtin table.
    fn compile_symbol(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let Some(name) = node.string() else {
            return Err(CompilerError::new("expected a symbol", node));
        };

        if let Some(inst) = operator(name) {
            self.emit(page, Inst::new(inst));
        } else if let Some(index) = builtin_index(name) {
            self.emit(page, Inst::with_arg(Instruction::Builtin, index as u16));
        } else {
            let index = self.add_symbol(node);
            self.emit(page, Inst::with_arg(Instruction::LoadSymbol, index));
        }
        Ok(())
    }

    /// `(if cond then [else])` with forward jumps patched once the branch
    /// extents are known; a missing else loads `nil`.
    fn compile_if(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if !(3..=4).contains(&children.len()) {
            return Err(CompilerError::new(
                "an `if' needs a condition, a branch and an optional else branch",
                node,
            ));
        }

        self.compile_node(&children[1], page)?;
        let jump_to_else = self.emit_jump(page, Instruction::PopJumpIfFalse);
        self.compile_node(&children[2], page)?;
        let jump_to_end = self.emit_jump(page, Instruction::Jump);
        self.patch_jump(page, jump_to_else);
        if let Some(alternative) = children.get(3) {
            self.compile_node(alternative, page)?;
        } else {
            self.compile_symbol(Node::nil_node(), page)?;
        }
        self.patch_jump(page, jump_to_end);
        Ok(())
    }

    fn compile_let_mut(
        &mut self,
        keyword: Keyword,
        node: &Node,
        page: i32,
    ) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if children.len() != 3 {
            return Err(CompilerError::new(
                format!("`{}' needs a symbol and a value", keyword.name()),
                node,
            ));
        }
        let NodeValue::Symbol(name) = children[1].value() else {
            return Err(CompilerError::new(
                format!("missing a symbol to bind with `{}'", keyword.name()),
                &children[1],
            ));
        };

        self.compile_node(&children[2], page)?;
        let index = self.add_symbol(&children[1]);
        self.defined_symbols.insert(name.clone());
        let inst = if keyword == Keyword::Let {
            Instruction::Let
        } else {
            Instruction::Mut
        };
        self.emit(page, Inst::with_arg(inst, index));
        Ok(())
    }

    /// `(set name value)`; the name must have been defined elsewhere, which
    /// the undefined-symbol pass enforces.
    fn compile_set(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if children.len() != 3 {
            return Err(CompilerError::new("`set' needs a symbol and a value", node));
        }
        if !children[1].is_symbol() {
            return Err(CompilerError::new(
                "missing a symbol to assign to with `set'",
                &children[1],
            ));
        }

        self.compile_node(&children[2], page)?;
        let index = self.add_symbol(&children[1]);
        self.emit(page, Inst::with_arg(Instruction::Store, index));
        Ok(())
    }

    /// `(fun (params…) body)`: the body goes on a fresh page, parameters are
    /// bound there in declaration order, and the parent page only loads the
    /// page reference.
    fn compile_function(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if children.len() != 3 {
            return Err(CompilerError::new(
                "`fun' needs an argument list and a body",
                node,
            ));
        }
        let Some(params) = children[1].children().filter(|_| children[1].is_list()) else {
            return Err(CompilerError::new(
                "expected an argument list for `fun'",
                &children[1],
            ));
        };

        self.code_pages.push(Vec::new());
        let function_page = self.code_pages.len() as i32 - 1;

        let index = self.add_constant(Constant::PageRef(function_page as usize));
        self.emit(page, Inst::with_arg(Instruction::LoadConst, index));

        for param in params {
            match param.value() {
                NodeValue::Symbol(name) => {
                    let index = self.add_symbol(param);
                    self.defined_symbols.insert(name.clone());
                    self.emit(function_page, Inst::with_arg(Instruction::Mut, index));
                }
                NodeValue::Capture(_) => {
                    let index = self.add_symbol(param);
                    self.emit(function_page, Inst::with_arg(Instruction::Capture, index));
                }
                _ => {
                    return Err(CompilerError::new(
                        "function parameters must be symbols or captures",
                        param,
                    ));
                }
            }
        }

        self.compile_node(&children[2], function_page)?;
        self.emit(function_page, Inst::new(Instruction::Ret));
        Ok(())
    }

    fn compile_while(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if children.len() != 3 {
            return Err(CompilerError::new(
                "`while' needs a condition and a body",
                node,
            ));
        }

        let start = self.page_len(page) as u16;
        self.compile_node(&children[1], page)?;
        let exit = self.emit_jump(page, Instruction::PopJumpIfFalse);
        self.compile_node(&children[2], page)?;
        self.emit(page, Inst::with_arg(Instruction::Jump, start));
        self.patch_jump(page, exit);
        Ok(())
    }

    /// `(quote form)` becomes a zero-argument thunk: the form is emitted on a
    /// scratch page, which receives its definitive index once finished; the
    /// current page loads the page reference and captures the environment.
    fn compile_quote(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if children.len() != 2 {
            return Err(CompilerError::new("`quote' needs a value", node));
        }

        self.temp_pages.push(Vec::new());
        let temp_page = -(self.temp_pages.len() as i32);
        self.compile_node(&children[1], temp_page)?;
        self.emit(temp_page, Inst::new(Instruction::Ret));

        // splice the finished thunk body after the real pages
        if let Some(finished) = self.temp_pages.pop() {
            self.code_pages.push(finished);
        }
        let index = self.add_constant(Constant::PageRef(self.code_pages.len() - 1));
        self.emit(page, Inst::with_arg(Instruction::LoadConst, index));
        self.emit(page, Inst::new(Instruction::SaveEnv));
        Ok(())
    }

    /// `(import name)` registers the plugin and asks the runtime to load it.
    fn compile_plugin_import(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        let name = match children.get(1).map(Node::value) {
            Some(NodeValue::Symbol(name)) | Some(NodeValue::String(name))
                if children.len() == 2 =>
            {
                name.clone()
            }
            _ => {
                return Err(CompilerError::new("`import' needs a plugin name", node));
            }
        };

        let index = match self.plugins.iter().position(|plugin| *plugin == name) {
            Some(index) => index,
            None => {
                self.plugins.push(name);
                self.plugins.len() - 1
            }
        };
        self.emit(page, Inst::with_arg(Instruction::Plugin, index as u16));
        Ok(())
    }

    fn compile_del(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        if children.len() != 2 || !children[1].is_symbol() {
            return Err(CompilerError::new("`del' needs a symbol", node));
        }
        let index = self.add_symbol(&children[1]);
        self.emit(page, Inst::with_arg(Instruction::Del, index));
        Ok(())
    }

    /// A plain call: callee, arguments in source order, then `CALL argc`.
    /// Field accesses chained on the callee do not count as arguments.
    fn handle_calls(&mut self, node: &Node, page: i32) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        for child in children {
            self.compile_node(child, page)?;
        }
        let argc = children
            .iter()
            .filter(|child| !matches!(child.value(), NodeValue::GetField(_)))
            .count()
            .saturating_sub(1);
        self.emit(page, Inst::with_arg(Instruction::Call, argc as u16));
        Ok(())
    }

    /// Operators and the specific forms: operands in source order, one
    /// opcode carrying the argument count inline. `and`/`or` instead become
    /// short-circuit jump sequences.
    fn compile_specific(
        &mut self,
        name: Box<str>,
        node: &Node,
        page: i32,
    ) -> Result<(), CompilerError> {
        let children = expect_children(node)?;
        let args = &children[1..];

        match name.as_ref() {
            "and" | "or" => {
                if args.len() < 2 {
                    return Err(CompilerError::new(
                        format!("`{name}' needs at least 2 operands, got {}", args.len()),
                        node,
                    ));
                }
                let shortcut = if name.as_ref() == "and" {
                    Instruction::PopJumpIfFalse
                } else {
                    Instruction::PopJumpIfTrue
                };
                let marker = if name.as_ref() == "and" {
                    Node::false_node()
                } else {
                    Node::true_node()
                };

                let mut shortcut_jumps = Vec::new();
                let last = args.len() - 1;
                for (i, arg) in args.iter().enumerate() {
                    self.compile_node(arg, page)?;
                    if i < last {
                        shortcut_jumps.push(self.emit_jump(page, shortcut));
                    }
                }
                let jump_to_end = self.emit_jump(page, Instruction::Jump);
                for jump in shortcut_jumps {
                    self.patch_jump(page, jump);
                }
                self.compile_symbol(marker, page)?;
                self.patch_jump(page, jump_to_end);
                Ok(())
            }
            _ => {
                for arg in args {
                    self.compile_node(arg, page)?;
                }
                let inst = specific(&name).or_else(|| operator(&name)).ok_or_else(|| {
                    CompilerError::new(format!("unknown specific form `{name}'"), node)
                })?;
                self.push_specific_inst_argc(inst, args.len() as u8, page);
                Ok(())
            }
        }
    }

    fn push_specific_inst_argc(&mut self, inst: Instruction, argc: u8, page: i32) {
        self.emit(
            page,
            Inst {
                op: inst,
                arg: 0,
                extra: argc,
            },
        );
    }

    /// Intern a symbol node, returning its table index. Lookup is a linear
    /// scan by structural equality.
    fn add_symbol(&mut self, node: &Node) -> u16 {
        let index = match self.symbols.iter().position(|sym| sym == node) {
            Some(index) => index,
            None => {
                self.symbols.push(node.clone());
                self.symbols.len() - 1
            }
        };
        index as u16
    }

    /// Intern a constant, returning its table index.
    fn add_constant(&mut self, constant: Constant) -> u16 {
        let index = match self.values.iter().position(|value| *value == constant) {
            Some(index) => index,
            None => {
                self.values.push(constant);
                self.values.len() - 1
            }
        };
        index as u16
    }

    /// Every interned symbol must be defined, or plausibly provided by an
    /// imported plugin; operators and builtins never reach the symbol table.
    fn check_for_undefined_symbols(&self) -> Result<(), CompilerError> {
        for sym in &self.symbols {
            let Some(name) = sym.string() else {
                continue;
            };
            if self.defined_symbols.contains(name) || self.may_be_from_plugin(name) {
                continue;
            }
            return Err(CompilerError::new(
                format!("unbound variable \"{name}\" (variable is used but not defined)"),
                sym,
            ));
        }
        Ok(())
    }

    /// A symbol `prefix:rest` may come from a plugin named `prefix`, with any
    /// file extension stripped.
    fn may_be_from_plugin(&self, name: &str) -> bool {
        let prefix = name.split(':').next().unwrap_or(name);
        self.plugins.iter().any(|plugin| {
            let stem = plugin
                .rsplit_once('.')
                .map_or(plugin.as_ref(), |(stem, _)| stem);
            stem == prefix
        })
    }

    fn page_mut(&mut self, id: i32) -> &mut Vec<Inst> {
        if id < 0 {
            &mut self.temp_pages[(-id - 1) as usize]
        } else {
            &mut self.code_pages[id as usize]
        }
    }

    fn page_len(&self, id: i32) -> usize {
        if id < 0 {
            self.temp_pages[(-id - 1) as usize].len()
        } else {
            self.code_pages[id as usize].len()
        }
    }

    fn emit(&mut self, page: i32, inst: Inst) {
        self.page_mut(page).push(inst);
    }

    /// Emit a jump with a placeholder target, returning its index for
    /// [`patch_jump`].
    ///
    /// [`patch_jump`]: Compiler::patch_jump
    fn emit_jump(&mut self, page: i32, op: Instruction) -> usize {
        let at = self.page_len(page);
        self.emit(page, Inst::new(op));
        at
    }

    /// Point a previously emitted jump at the current end of the page.
    fn patch_jump(&mut self, page: i32, at: usize) {
        let target = self.page_len(page) as u16;
        self.page_mut(page)[at].arg = target;
    }

    /// The fixed preamble: magic, version, build timestamp.
    fn push_headers_phase1(&mut self) {
        self.bytecode.extend_from_slice(b"ark\0");
        for part in [
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR"),
            env!("CARGO_PKG_VERSION_PATCH"),
        ] {
            let n: u16 = part.parse().unwrap_or(0);
            self.bytecode.extend_from_slice(&n.to_be_bytes());
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.bytecode.extend_from_slice(&timestamp.to_be_bytes());
    }

    /// The tables and pages, which are only known once the walk is done.
    /// Each serialized page gets a trailing `HALT`.
    fn push_headers_phase2(&mut self) {
        let mut out = std::mem::take(&mut self.bytecode);

        out.push(Instruction::SymTableStart as u8);
        out.extend_from_slice(&(self.symbols.len() as u16).to_be_bytes());
        for sym in &self.symbols {
            if let Some(name) = sym.string() {
                out.extend_from_slice(name.as_bytes());
            }
            out.push(0);
        }

        out.push(Instruction::ValTableStart as u8);
        out.extend_from_slice(&(self.values.len() as u16).to_be_bytes());
        for value in &self.values {
            match value {
                Constant::Number(n) => {
                    out.push(NUMBER_TAG);
                    out.extend_from_slice(n.to_string().as_bytes());
                    out.push(0);
                }
                Constant::String(s) => {
                    out.push(STRING_TAG);
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                Constant::PageRef(index) => {
                    out.push(PAGE_REF_TAG);
                    out.extend_from_slice(&(*index as u16).to_be_bytes());
                }
            }
        }

        out.push(Instruction::PluginTableStart as u8);
        out.extend_from_slice(&(self.plugins.len() as u16).to_be_bytes());
        for plugin in &self.plugins {
            out.extend_from_slice(plugin.as_bytes());
            out.push(0);
        }

        for page in &self.code_pages {
            out.push(Instruction::CodeSegmentStart as u8);
            let byte_len = (page.len() as u32 + 1) * 4;
            out.extend_from_slice(&byte_len.to_be_bytes());
            for inst in page {
                out.extend_from_slice(&inst.bytes());
            }
            out.extend_from_slice(&Inst::new(Instruction::Halt).bytes());
        }

        out.push(0);
        self.bytecode = out;
    }
}

fn expect_children(node: &Node) -> Result<&[Node], CompilerError> {
    node.children()
        .ok_or_else(|| CompilerError::new("expected a form", node))
}
