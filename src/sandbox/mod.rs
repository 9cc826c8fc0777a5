//! Sandbox executor.
//!
//! Ties the policy compiler and the runtime together behind [`Sandbox`],
//! which owns the policy and runs each invocation on its own worker.

pub mod executor;

pub use executor::{host_fn, parse_input, ExecutionReport, InvocationState, Sandbox};
