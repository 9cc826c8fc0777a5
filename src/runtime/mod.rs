//! Sandboxed runtime.
//!
//! Builds the execution scope from a [`CapabilityTable`], runs a compiled
//! [`CodeUnit`] against it and marshals the result back to JSON.
//!
//! Everything in here is single-threaded: guest values are `Rc`-based and
//! never cross a thread boundary. Only JSON goes in and comes out.

pub mod builtins;
pub mod exception;
pub mod guards;
pub mod interpreter;
pub mod marshal;
pub mod methods;
pub mod ops;
pub mod scope;
pub mod value;

use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::compiler::CodeUnit;

pub use exception::Exception;
pub use guards::{is_sensitive_attribute, AttributePolicy};
pub use interpreter::Interpreter;
pub use scope::{Capability, CapabilityTable, Env, GuardKind, INPUT_NAME, RESULT_NAME};
pub use value::{CallArgs, HostFn, HostObject, Value};

/// An exception escaped the script.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render(.exc_type, .message))]
pub struct RuntimeExecutionError {
    /// Name of the guest exception type, e.g. `ValueError`.
    pub exc_type: String,
    pub message: String,
    /// Script line of the statement that raised, when known.
    pub line: Option<usize>,
}

fn render(exc_type: &str, message: &str) -> String {
    if message.is_empty() {
        exc_type.to_string()
    } else {
        format!("{}: {}", exc_type, message)
    }
}

impl From<Exception> for RuntimeExecutionError {
    fn from(exc: Exception) -> Self {
        Self {
            exc_type: exc.kind,
            message: exc.message,
            line: exc.line,
        }
    }
}

/// What a finished script produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    /// The JSON form of `result`, or `None` when the script never set it.
    pub result: Option<serde_json::Value>,
    /// Everything the script printed.
    pub printed: String,
}

/// Runs `unit` against `globals` and extracts the result.
///
/// In exec mode the result is whatever `result` is bound to at the end; in
/// eval mode it is the value of the expression. The scope is cleared when
/// this returns.
///
/// # Errors
///
/// Returns a [`RuntimeExecutionError`] for any uncaught guest exception,
/// including a result that cannot be represented as JSON.
pub fn run(
    unit: &CodeUnit,
    globals: Rc<Env>,
    policy: Arc<AttributePolicy>,
) -> Result<Outcome, RuntimeExecutionError> {
    let mut interp = Interpreter::new(policy, globals);
    let outcome = interp.run(unit).and_then(|value| match value {
        Value::Unset => Ok(None),
        value => marshal::to_json(&value).map(Some),
    });
    let printed = interp.take_output();

    match outcome {
        Ok(result) => Ok(Outcome { result, printed }),
        Err(exc) => {
            if !printed.is_empty() {
                tracing::debug!(printed = %printed, "Output captured before failure");
            }
            Err(exc.into())
        }
    }
}
