//! Scripting AST for the Lumen compiler
//!
//! These are the syntax trees the front-end parser produces for macro
//! scripts and that the macro evaluator consumes. The parser itself lives
//! upstream; this crate only defines the shared node types.

mod ast;

pub use ast::*;
