//! Top-level error type for sandbox invocations.

use thiserror::Error;

use crate::compiler::CompileError;
use crate::runtime::RuntimeExecutionError;

/// Why an invocation produced no result.
///
/// Compile failures and guest exceptions stay distinguishable so callers
/// can tell "the script was refused" apart from "the script failed".
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    /// The script was rejected before any of it ran.
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// An exception escaped the script.
    #[error("Runtime error: {0}")]
    Execution(#[from] RuntimeExecutionError),

    /// The input payload is not valid JSON.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The policy or a host registration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The worker thread could not be started or died unexpectedly.
    #[error("Worker failure: {0}")]
    Worker(String),
}

impl SandboxError {
    pub fn is_compile(&self) -> bool {
        matches!(self, SandboxError::Compile(_))
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, SandboxError::Execution(_))
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_keeps_guest_message() {
        let err = SandboxError::from(RuntimeExecutionError {
            exc_type: "ValueError".to_string(),
            message: "boom".to_string(),
            line: Some(1),
        });
        assert!(err.is_execution());
        assert_eq!(err.to_string(), "Runtime error: ValueError: boom");
    }

    #[test]
    fn test_compile_variant() {
        let err = SandboxError::from(CompileError {
            filename: "<string>".to_string(),
            line: 1,
            column: 1,
            message: "import statements are not allowed".to_string(),
        });
        assert!(err.is_compile());
        assert!(!err.is_execution());
        assert!(err.to_string().starts_with("Compile error: File \"<string>\", line 1"));
    }
}
