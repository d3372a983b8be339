//! Syntax check for standalone script sources.
//!
//! Sources are parsed into a module AST and discarded. Nothing is compiled or
//! evaluated.

use rustpython_parser::{ast, Parse};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

pub fn check_source(source: &str, source_path: &str) -> Result<(), SyntaxIssue> {
    if let Some(offset) = source.find('\0') {
        return Err(SyntaxIssue {
            line: line_at(source, offset),
            message: "source contains a NUL byte".to_string(),
        });
    }
    match ast::Suite::parse(source, source_path) {
        Ok(_) => Ok(()),
        Err(err) => {
            let offset = u32::from(err.offset) as usize;
            Err(SyntaxIssue {
                line: line_at(source, offset),
                message: err.error.to_string(),
            })
        }
    }
}

/// 1-based line containing byte `offset`.
fn line_at(source: &str, offset: usize) -> usize {
    let end = offset.min(source.len());
    source.as_bytes()[..end].iter().filter(|byte| **byte == b'\n').count() + 1
}
