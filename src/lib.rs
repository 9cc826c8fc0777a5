//! scriptbox - restricted execution sandbox for untrusted scripts
//!
//! Scripts are written in a small Python-flavoured language. They read a
//! JSON payload bound to `input` and hand back whatever they assign to
//! `result`. Every attribute read, item read and iteration is routed through
//! a guard, and only an allow-listed set of builtins is in scope.
//!
//! - [`compiler`] rejects forbidden syntax and lowers guarded operations
//! - [`runtime`] builds the scope and interprets the lowered code
//! - [`sandbox`] owns the policy and runs invocations
//! - [`config`] loads and validates the JSON policy

pub mod compiler;
pub mod config;
pub mod error;
pub mod runtime;
pub mod sandbox;
pub mod utils;

pub use compiler::{compile_restricted, CompileError, Mode};
pub use config::PolicyConfig;
pub use error::{SandboxError, SandboxResult};
pub use runtime::RuntimeExecutionError;
pub use sandbox::{ExecutionReport, Sandbox};
