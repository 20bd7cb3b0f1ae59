//! Compile-time error surface: parse errors abort loading, type errors are
//! collected into a bag so a policy author sees all of them at once.

use std::fmt;

use thiserror::Error;

use crate::token::Span;

/// Policy source failed to tokenize or parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{col}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl ParseError {
    #[must_use]
    pub fn at(span: Span, message: impl Into<String>) -> Self {
        Self {
            line: span.line,
            col: span.col,
            message: message.into(),
        }
    }
}

/// Rule body references an undefined symbol, uses a value at the wrong type,
/// or violates range restriction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{span}: {message}")]
pub struct TypeError {
    pub span: Span,
    pub message: String,
}

impl TypeError {
    #[must_use]
    pub fn at(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

/// One failure from policy compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("parse error at {0}")]
    Parse(ParseError),
    #[error("type error at {0}")]
    Type(TypeError),
}

/// Everything that went wrong while compiling one policy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors {
    pub errors: Vec<CompileError>,
}

impl CompileErrors {
    #[must_use]
    pub fn parse(error: ParseError) -> Self {
        Self {
            errors: vec![CompileError::Parse(error)],
        }
    }

    #[must_use]
    pub fn types(errors: Vec<TypeError>) -> Self {
        Self {
            errors: errors.into_iter().map(CompileError::Type).collect(),
        }
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.errors.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}
