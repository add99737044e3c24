//! Front-end compilation pipeline for the Ark language: source text is
//! parsed into a tree, cleaned up, run through the compile-time macro
//! processor, and finally compiled into a compact stack-machine bytecode
//! blob. Execution is left to the companion virtual machine.

pub mod compiler;
pub mod lexer;
pub mod macros;
pub mod node;
pub mod optimizer;
pub mod parser;

pub use compiler::{Compiler, CompilerError};
pub use macros::{MacroError, MacroProcessor};
pub use node::{Keyword, Node, NodeValue, SourceLocation};
pub use optimizer::Optimizer;
pub use parser::{parse, ParseError};

// bits of the options field carried through the pipeline
pub const FEATURE_REMOVE_UNUSED: u16 = 1 << 0;
pub const DEFAULT_FEATURES: u16 = FEATURE_REMOVE_UNUSED;

/// Any failure of the pipeline; all of them abort the compilation and carry
/// the source location of the node that caused them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Macro(#[from] MacroError),
    #[error(transparent)]
    Compiler(#[from] CompilerError),
}

impl Error {
    /// Where the failure happened, for diagnostics rendering.
    pub fn location(&self) -> &SourceLocation {
        match self {
            Self::Parse(err) => &err.location,
            Self::Macro(err) => &err.location,
            Self::Compiler(err) => &err.location,
        }
    }
}
