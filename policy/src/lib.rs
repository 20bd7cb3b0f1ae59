//! Policy language toolchain for Warden.
//!
//! Source text goes through three stages: `parser::parse` produces a spanned
//! AST, `typeck::check` validates symbols, member access, and negation
//! range-restriction, and `compile::lower` normalizes each rule body into a
//! generator/filter plan the engine executes. [`compile`] runs the whole
//! pipeline.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

pub mod ast;
mod compile;
mod error;
mod parser;
mod token;
mod typeck;

pub use compile::{CompiledPolicy, CompiledRule, Step, lower};
pub use error::{CompileError, CompileErrors, ParseError, TypeError};
pub use parser::parse;
pub use token::{Span, Token, TokenKind, tokenize};
pub use typeck::{CLASSIFIERS, CallTarget, SymbolTable, check};

/// Compile a policy source into its executable form.
///
/// Parse errors abort immediately; type errors are collected so the author
/// sees every problem in one pass.
pub fn compile_source(source: &str) -> Result<CompiledPolicy, CompileErrors> {
    let ast = parse(source).map_err(CompileErrors::parse)?;
    check(&ast).map_err(CompileErrors::types)?;
    lower(ast).map_err(CompileErrors::types)
}
