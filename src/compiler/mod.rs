//! Policy compiler: turns untrusted source into a restricted [`CodeUnit`].
//!
//! Compilation runs in three passes: [`lexer`] tokenizes, [`parser`] builds
//! the syntax tree, and [`policy`] rejects forbidden constructs while
//! rewriting every attribute read, item read and iteration into a call of the
//! matching guard primitive. The runtime only ever sees lowered code.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod policy;

use std::fmt;

use thiserror::Error;

use ast::{Expr, Stmt};

/// Guard called for every `obj.name` read.
pub const GUARD_GETATTR: &str = "_getattr_";
/// Guard called for every `obj[key]` read.
pub const GUARD_GETITEM: &str = "_getitem_";
/// Guard wrapped around the iterable of loops and comprehensions.
pub const GUARD_GETITER: &str = "_getiter_";
/// Guard used instead of [`GUARD_GETITER`] when the loop target unpacks.
pub const GUARD_ITER_UNPACK: &str = "_iter_unpack_sequence_";

/// Label used in diagnostics when the caller does not name the source.
pub const DEFAULT_FILENAME: &str = "<string>";

/// A problem found while compiling, before it is tied to a filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Source was rejected: malformed, or uses a construct the policy forbids.
///
/// No part of a script that fails to compile is ever executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("File \"{filename}\", line {line}, column {column}: {message}")]
pub struct CompileError {
    pub filename: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl CompileError {
    fn from_diagnostic(filename: &str, diagnostic: Diagnostic) -> Self {
        Self {
            filename: filename.to_string(),
            line: diagnostic.line,
            column: diagnostic.column,
            message: diagnostic.message,
        }
    }
}

/// How the source is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// A whole program of statements.
    #[default]
    Exec,
    /// A single expression whose value is the outcome.
    Eval,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Exec => write!(f, "exec"),
            Mode::Eval => write!(f, "eval"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CodeBody {
    Module(Vec<Stmt>),
    Expression(Expr),
}

/// Restricted executable form of a script.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    filename: String,
    mode: Mode,
    body: CodeBody,
}

impl CodeUnit {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn body(&self) -> &CodeBody {
        &self.body
    }
}

/// Compiles `source` under the restriction policy.
///
/// # Arguments
///
/// * `source` - Script text
/// * `filename` - Label reported in diagnostics, usually [`DEFAULT_FILENAME`]
/// * `mode` - Whether `source` is a program or a single expression
///
/// # Errors
///
/// Returns a [`CompileError`] for syntax errors and for restricted
/// constructs: imports, `global`/`nonlocal`, names starting with `_`,
/// attribute assignment or deletion, and unsupported statements.
///
/// # Example
///
/// ```
/// use scriptbox::compiler::{compile_restricted, Mode};
///
/// assert!(compile_restricted("result = 1 + 1", "<string>", Mode::Exec).is_ok());
/// assert!(compile_restricted("import os", "<string>", Mode::Exec).is_err());
/// ```
pub fn compile_restricted(
    source: &str,
    filename: &str,
    mode: Mode,
) -> Result<CodeUnit, CompileError> {
    let to_error = |diagnostic| CompileError::from_diagnostic(filename, diagnostic);

    let body = match mode {
        Mode::Exec => {
            let module = parser::parse_module(source).map_err(to_error)?;
            CodeBody::Module(policy::restrict_module(module).map_err(to_error)?)
        }
        Mode::Eval => {
            let expr = parser::parse_expression(source).map_err(to_error)?;
            CodeBody::Expression(policy::restrict_expression(expr).map_err(to_error)?)
        }
    };

    tracing::debug!(filename, %mode, "Compiled restricted code");
    Ok(CodeUnit {
        filename: filename.to_string(),
        mode,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_simple_program() {
        let unit = compile_restricted("result = input['a']", DEFAULT_FILENAME, Mode::Exec).unwrap();
        assert_eq!(unit.filename(), "<string>");
        assert_eq!(unit.mode(), Mode::Exec);
        assert!(matches!(unit.body(), CodeBody::Module(body) if body.len() == 1));
    }

    #[test]
    fn test_compile_expression() {
        let unit = compile_restricted("1 + 2", DEFAULT_FILENAME, Mode::Eval).unwrap();
        assert!(matches!(unit.body(), CodeBody::Expression(_)));
    }

    #[test]
    fn test_eval_mode_rejects_statements() {
        assert!(compile_restricted("x = 1", DEFAULT_FILENAME, Mode::Eval).is_err());
    }

    #[test]
    fn test_import_rejected_with_location() {
        let err = compile_restricted("x = 1\nimport os\n", "job.py", Mode::Exec).unwrap_err();
        assert_eq!(err.filename, "job.py");
        assert_eq!(err.line, 2);
        assert!(err.to_string().starts_with("File \"job.py\", line 2"));
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let err = compile_restricted("result = (", DEFAULT_FILENAME, Mode::Exec).unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::Exec.to_string(), "exec");
        assert_eq!(Mode::Eval.to_string(), "eval");
    }
}
