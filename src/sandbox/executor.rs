//! Invocation orchestration.
//!
//! [`Sandbox`] owns the policy and the capability table and drives each
//! invocation through its one-shot lifecycle:
//!
//! 1. **Received**: the source and JSON input are handed to a fresh worker
//! 2. **Compiled**: the policy compiler accepted the source
//! 3. **Executing**: the scope is built and the code runs
//! 4. **Succeeded**, **CompileFailed** or **ExecutionFailed**
//!
//! Guest values are `Rc`-based, so every invocation compiles and runs on a
//! dedicated worker thread with its own stack and nothing shared but the
//! immutable policy. Only JSON crosses back.
//!
//! # Example
//!
//! ```
//! use scriptbox::config::PolicyConfig;
//! use scriptbox::sandbox::Sandbox;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), scriptbox::SandboxError> {
//! let sandbox = Sandbox::new(PolicyConfig::default())?;
//! let report = sandbox.execute("result = input['a'] + input['b']", json!({"a": 2, "b": 3}))?;
//! assert_eq!(report.result, Some(json!(5)));
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::compiler::{compile_restricted, Mode, DEFAULT_FILENAME};
use crate::config::PolicyConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::runtime::{
    self, marshal, AttributePolicy, CallArgs, CapabilityTable, Exception, HostFn, Value,
    INPUT_NAME, RESULT_NAME,
};

/// Name given to worker threads.
const WORKER_NAME: &str = "scriptbox-worker";

/// Stack reserved for each worker. Deeply nested guest calls recurse in the
/// interpreter, and debug builds use large frames.
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Lifecycle of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Received,
    Compiled,
    Executing,
    Succeeded,
    CompileFailed,
    ExecutionFailed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Succeeded
                | InvocationState::CompileFailed
                | InvocationState::ExecutionFailed
        )
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationState::Received => "received",
            InvocationState::Compiled => "compiled",
            InvocationState::Executing => "executing",
            InvocationState::Succeeded => "succeeded",
            InvocationState::CompileFailed => "compile_failed",
            InvocationState::ExecutionFailed => "execution_failed",
        };
        f.write_str(name)
    }
}

/// What a successful invocation produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionReport {
    /// JSON form of `result`; `None` when the script never assigned it.
    pub result: Option<serde_json::Value>,

    /// Output of `print` calls, in order.
    pub printed: String,
}

impl ExecutionReport {
    /// The result as it is written to stdout: unset becomes `null`.
    pub fn result_or_null(&self) -> serde_json::Value {
        self.result.clone().unwrap_or(serde_json::Value::Null)
    }
}

/// Restricted script executor.
///
/// Cheap to clone and safe to share between threads: each invocation gets a
/// fresh scope, so nothing a script does is visible to the next one.
#[derive(Clone)]
pub struct Sandbox {
    /// Policy the sandbox was built from.
    config: PolicyConfig,

    /// Compiled attribute rules for the attribute guard.
    attributes: Arc<AttributePolicy>,

    /// Every name the execution scope binds.
    capabilities: CapabilityTable,

    /// Host-provided functions, by scope name.
    host_functions: HashMap<String, HostFn>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hosts: Vec<&String> = self.host_functions.keys().collect();
        hosts.sort();
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("host_functions", &hosts)
            .finish()
    }
}

impl Sandbox {
    /// Creates a sandbox governed by `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - Builtin and attribute policy
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] if the policy fails validation.
    pub fn new(config: PolicyConfig) -> SandboxResult<Self> {
        config
            .validate()
            .map_err(|e| SandboxError::Config(format!("{:#}", e)))?;
        let attributes = config
            .attribute_policy()
            .map_err(|e| SandboxError::Config(format!("{:#}", e)))?;

        let capabilities = CapabilityTable::new(|name| config.builtin_permitted(name), []);
        tracing::debug!(
            bindings = capabilities.len(),
            "Sandbox created"
        );

        Ok(Self {
            config,
            attributes: attributes.shared(),
            capabilities,
            host_functions: HashMap::new(),
        })
    }

    /// Makes a host function callable from scripts under `name`.
    ///
    /// The function runs on the invocation's worker thread and may return
    /// host objects, which scripts reach only through the guards.
    /// Registering the same name again replaces the earlier function.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] if `name` is not an identifier,
    /// starts with `_`, or is already bound to `input`, `result`, a safe
    /// builtin or an exception type.
    ///
    /// # Example
    ///
    /// ```
    /// use scriptbox::runtime::Value;
    /// use scriptbox::sandbox::{host_fn, Sandbox};
    /// use serde_json::json;
    ///
    /// # fn main() -> Result<(), scriptbox::SandboxError> {
    /// let mut sandbox = Sandbox::default();
    /// sandbox.register_function("answer", host_fn("answer", |_args| Ok(Value::Int(42))))?;
    /// let report = sandbox.execute("result = answer()", json!(null))?;
    /// assert_eq!(report.result, Some(json!(42)));
    /// # Ok(())
    /// # }
    /// ```
    pub fn register_function(&mut self, name: &str, func: HostFn) -> SandboxResult<()> {
        validate_host_name(name)?;
        if !self.host_functions.contains_key(name) && self.capabilities.contains(name) {
            return Err(SandboxError::Config(format!(
                "Host function '{}' would shadow an existing binding",
                name
            )));
        }

        self.host_functions.insert(name.to_string(), func);
        self.capabilities = CapabilityTable::new(
            |builtin| self.config.builtin_permitted(builtin),
            self.host_functions.keys().map(String::as_str),
        );
        tracing::debug!(name, "Registered host function");
        Ok(())
    }

    /// The names every script sees, and what each one is.
    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Returns a reference to the policy configuration.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Runs a script with `input` bound and returns what it left in `result`.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::Compile`] if the source is rejected; nothing runs
    /// - [`SandboxError::Execution`] if a guest exception escapes
    /// - [`SandboxError::Worker`] if the worker thread fails
    pub fn execute(&self, script: &str, input: serde_json::Value) -> SandboxResult<ExecutionReport> {
        self.invoke(script, DEFAULT_FILENAME, Mode::Exec, input)
    }

    /// Like [`execute`](Self::execute), labelling diagnostics with `filename`.
    pub fn execute_named(
        &self,
        script: &str,
        filename: &str,
        input: serde_json::Value,
    ) -> SandboxResult<ExecutionReport> {
        self.invoke(script, filename, Mode::Exec, input)
    }

    /// Runs a script with input given as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidInput`] if `input` is not valid JSON,
    /// otherwise as [`execute`](Self::execute).
    pub fn execute_json(&self, script: &str, input: &str) -> SandboxResult<ExecutionReport> {
        let input = parse_input(input)?;
        self.execute(script, input)
    }

    /// Evaluates a single expression against the same scope a script gets.
    ///
    /// The report's `result` is the expression's value.
    pub fn evaluate(&self, expression: &str, input: serde_json::Value) -> SandboxResult<ExecutionReport> {
        self.invoke(expression, DEFAULT_FILENAME, Mode::Eval, input)
    }

    /// Like [`evaluate`](Self::evaluate), labelling diagnostics with `filename`.
    pub fn evaluate_named(
        &self,
        expression: &str,
        filename: &str,
        input: serde_json::Value,
    ) -> SandboxResult<ExecutionReport> {
        self.invoke(expression, filename, Mode::Eval, input)
    }

    /// Runs a script on tokio's blocking pool and awaits its report.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute); a failed blocking task becomes
    /// [`SandboxError::Worker`].
    pub async fn execute_detached(
        &self,
        script: String,
        input: serde_json::Value,
    ) -> SandboxResult<ExecutionReport> {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || sandbox.execute(&script, input))
            .await
            .map_err(|e| SandboxError::Worker(format!("Blocking task failed: {}", e)))?
    }

    fn invoke(
        &self,
        source: &str,
        filename: &str,
        mode: Mode,
        input: serde_json::Value,
    ) -> SandboxResult<ExecutionReport> {
        let invocation = Invocation {
            source: source.to_string(),
            filename: filename.to_string(),
            mode,
            input,
            attributes: Arc::clone(&self.attributes),
            capabilities: self.capabilities.clone(),
            host_functions: self.host_functions.clone(),
            state: InvocationState::Received,
        };

        let worker = std::thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || invocation.run())
            .map_err(|e| SandboxError::Worker(format!("Failed to spawn worker thread: {}", e)))?;

        worker
            .join()
            .map_err(|panic| SandboxError::Worker(panic_message(panic.as_ref())))?
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        let config = PolicyConfig::default();
        let capabilities = CapabilityTable::new(|name| config.builtin_permitted(name), []);
        // The default attribute patterns are fixed globs that always compile.
        let attributes = config.attribute_policy().unwrap_or_default();
        Self {
            config,
            attributes: attributes.shared(),
            capabilities,
            host_functions: HashMap::new(),
        }
    }
}

/// Everything one worker needs; moved onto its thread.
struct Invocation {
    source: String,
    filename: String,
    mode: Mode,
    input: serde_json::Value,
    attributes: Arc<AttributePolicy>,
    capabilities: CapabilityTable,
    host_functions: HashMap<String, HostFn>,
    state: InvocationState,
}

impl Invocation {
    fn advance(&mut self, next: InvocationState) {
        tracing::debug!(from = %self.state, to = %next, mode = %self.mode, "Invocation state change");
        self.state = next;
    }

    fn run(mut self) -> SandboxResult<ExecutionReport> {
        tracing::info!(
            filename = %self.filename,
            mode = %self.mode,
            bytes = self.source.len(),
            "Running script in sandbox"
        );

        let unit = match compile_restricted(&self.source, &self.filename, self.mode) {
            Ok(unit) => unit,
            Err(err) => {
                self.advance(InvocationState::CompileFailed);
                tracing::warn!(line = err.line, column = err.column, "Script rejected: {}", err.message);
                return Err(err.into());
            }
        };
        self.advance(InvocationState::Compiled);

        let globals = self
            .capabilities
            .build_scope(&self.host_functions, marshal::from_json(&self.input));
        self.advance(InvocationState::Executing);

        match runtime::run(&unit, globals, Arc::clone(&self.attributes)) {
            Ok(outcome) => {
                self.advance(InvocationState::Succeeded);
                if !outcome.printed.is_empty() {
                    tracing::debug!(printed = %outcome.printed, "Captured script output");
                }
                tracing::info!(result_set = outcome.result.is_some(), "Script finished");
                Ok(ExecutionReport {
                    result: outcome.result,
                    printed: outcome.printed,
                })
            }
            Err(err) => {
                self.advance(InvocationState::ExecutionFailed);
                tracing::warn!(line = ?err.line, "Script raised {}", err);
                Err(err.into())
            }
        }
    }
}

/// Parses the JSON input payload.
///
/// # Errors
///
/// Returns [`SandboxError::InvalidInput`] describing the parse failure.
pub fn parse_input(input: &str) -> SandboxResult<serde_json::Value> {
    serde_json::from_str(input).map_err(|e| SandboxError::InvalidInput(e.to_string()))
}

fn validate_host_name(name: &str) -> SandboxResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(SandboxError::Config(format!(
            "Host function name '{}' is not an identifier",
            name
        )));
    }
    if name.starts_with('_') {
        return Err(SandboxError::Config(format!(
            "Host function name '{}' must not start with '_'",
            name
        )));
    }
    if name == INPUT_NAME || name == RESULT_NAME {
        return Err(SandboxError::Config(format!(
            "Host function name '{}' is reserved",
            name
        )));
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Worker panicked: {}", message)
    } else {
        "Worker panicked".to_string()
    }
}

/// Wraps a plain Rust closure over positional arguments as a [`HostFn`].
///
/// Keyword arguments are rejected with `TypeError`.
pub fn host_fn<F>(name: &'static str, func: F) -> HostFn
where
    F: Fn(Vec<Value>) -> Result<Value, Exception> + Send + Sync + 'static,
{
    Arc::new(move |args: CallArgs| {
        if let Some((keyword, _)) = args.keywords.first() {
            return Err(Exception::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, keyword
            )));
        }
        func(args.positional)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttributesConfig, BuiltinsConfig};
    use crate::runtime::{Capability, HostObject};
    use serde_json::json;

    #[derive(Debug)]
    struct Response {
        status: i64,
    }

    impl HostObject for Response {
        fn type_name(&self) -> &str {
            "Response"
        }

        fn get_attribute(&self, name: &str) -> Option<Value> {
            match name {
                "status" => Some(Value::Int(self.status)),
                "raw" => Some(Value::str("raw bytes")),
                _ => None,
            }
        }

        fn has_method(&self, name: &str) -> bool {
            name == "json"
        }

        fn call_method(&self, name: &str, _args: CallArgs) -> Result<Value, Exception> {
            match name {
                "json" => Ok(marshal::from_json(&json!({"ok": true}))),
                _ => Err(Exception::attribute_error(name.to_string())),
            }
        }
    }

    fn with_fetch(config: PolicyConfig) -> Sandbox {
        let mut sandbox = Sandbox::new(config).unwrap();
        sandbox
            .register_function(
                "fetch",
                host_fn("fetch", |_args| Ok(Value::host(Response { status: 200 }))),
            )
            .unwrap();
        sandbox
    }

    fn execution_error(err: SandboxError) -> crate::runtime::RuntimeExecutionError {
        match err {
            SandboxError::Execution(err) => err,
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_adds_input_fields() {
        let report = Sandbox::default()
            .execute("result = input['a'] + input['b']", json!({"a": 2, "b": 3}))
            .unwrap();
        assert_eq!(report.result, Some(json!(5)));
    }

    #[test]
    fn test_sums_by_iteration() {
        let script = "total = 0\nfor x in input:\n    total += x\nresult = total";
        let report = Sandbox::default().execute(script, json!([1, 2, 3])).unwrap();
        assert_eq!(report.result, Some(json!(6)));
    }

    #[test]
    fn test_dunder_attribute_is_runtime_error() {
        let err = Sandbox::default()
            .execute("result = input.__class__", json!({}))
            .unwrap_err();
        let err = execution_error(err);
        assert_eq!(err.exc_type, "AttributeError");
    }

    #[test]
    fn test_import_is_compile_error() {
        let sandbox = with_fetch(PolicyConfig::default());
        let err = sandbox.execute("x = fetch()\nimport os", json!(null)).unwrap_err();
        assert!(err.is_compile());
    }

    #[test]
    fn test_raise_is_runtime_error() {
        let err = Sandbox::default()
            .execute("raise ValueError(\"boom\")", json!(null))
            .unwrap_err();
        let err = execution_error(err);
        assert_eq!(err.exc_type, "ValueError");
        assert_eq!(err.message, "boom");
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_input_round_trips() {
        let doc = json!({"list": [1, 2.5, "three", null, false], "nested": {"k": []}});
        let report = Sandbox::default().execute("result = input", doc.clone()).unwrap();
        assert_eq!(report.result, Some(doc));
    }

    #[test]
    fn test_unset_result_is_not_an_error() {
        let report = Sandbox::default().execute("x = 1", json!(null)).unwrap();
        assert_eq!(report.result, None);
        assert_eq!(report.result_or_null(), json!(null));
    }

    #[test]
    fn test_deep_recursion_raises() {
        let script = "def down(n):\n    return down(n + 1)\ndown(0)";
        let err = Sandbox::default().execute(script, json!(null)).unwrap_err();
        assert_eq!(execution_error(err).exc_type, "RecursionError");
    }

    #[test]
    fn test_bounded_recursion_succeeds() {
        let script = "def fact(n):\n    if n <= 1:\n        return 1\n    return n * fact(n - 1)\nresult = fact(20)";
        let report = Sandbox::default().execute(script, json!(null)).unwrap();
        assert_eq!(report.result, Some(json!(2432902008176640000i64)));
    }

    #[test]
    fn test_host_object_through_guards() {
        let sandbox = with_fetch(PolicyConfig::default());
        let report = sandbox
            .execute("r = fetch()\nresult = [r.status, r.json()['ok']]", json!(null))
            .unwrap();
        assert_eq!(report.result, Some(json!([200, true])));

        let err = sandbox
            .execute("result = fetch().__class__", json!(null))
            .unwrap_err();
        assert_eq!(execution_error(err).exc_type, "AttributeError");
    }

    #[test]
    fn test_attribute_policy_applies_to_host_objects() {
        let config = PolicyConfig::new(
            BuiltinsConfig::default(),
            AttributesConfig::new(vec!["Response.raw".to_string()]),
        );
        let sandbox = with_fetch(config);
        let err = sandbox.execute("result = fetch().raw", json!(null)).unwrap_err();
        assert_eq!(execution_error(err).exc_type, "AttributeError");
    }

    #[test]
    fn test_host_object_result_is_not_serializable() {
        let sandbox = with_fetch(PolicyConfig::default());
        let err = sandbox.execute("result = fetch()", json!(null)).unwrap_err();
        let err = execution_error(err);
        assert_eq!(err.exc_type, "TypeError");
        assert!(err.message.contains("Response"));
    }

    #[test]
    fn test_blocked_builtin_is_unbound() {
        let config = PolicyConfig::new(
            BuiltinsConfig::new(vec!["*".to_string()], vec!["print".to_string()]),
            AttributesConfig::default(),
        );
        let sandbox = Sandbox::new(config).unwrap();
        assert!(!sandbox.capabilities().contains("print"));
        let err = sandbox.execute("print('x')", json!(null)).unwrap_err();
        assert_eq!(execution_error(err).exc_type, "NameError");
    }

    #[test]
    fn test_str_format_blocked_by_default() {
        let err = Sandbox::default()
            .execute("result = '{}'.format(1)", json!(null))
            .unwrap_err();
        assert_eq!(execution_error(err).exc_type, "AttributeError");
    }

    #[test]
    fn test_register_function_rejects_reserved_names() {
        let mut sandbox = Sandbox::default();
        let noop = || host_fn("noop", |_| Ok(Value::None));
        assert!(sandbox.register_function("_secret", noop()).is_err());
        assert!(sandbox.register_function("input", noop()).is_err());
        assert!(sandbox.register_function("result", noop()).is_err());
        assert!(sandbox.register_function("len", noop()).is_err());
        assert!(sandbox.register_function("ValueError", noop()).is_err());
        assert!(sandbox.register_function("9lives", noop()).is_err());
        assert!(sandbox.register_function("", noop()).is_err());
        assert!(sandbox.register_function("noop", noop()).is_ok());
        assert!(sandbox.register_function("noop", noop()).is_ok());
        assert_eq!(sandbox.capabilities().get("noop"), Some(Capability::HostFunction));
    }

    #[test]
    fn test_host_fn_rejects_keywords() {
        let mut sandbox = Sandbox::default();
        sandbox
            .register_function("echo", host_fn("echo", |args| Ok(Value::list(args))))
            .unwrap();
        let report = sandbox.execute("result = echo(1, 'a')", json!(null)).unwrap();
        assert_eq!(report.result, Some(json!([1, "a"])));
        let err = sandbox.execute("echo(x=1)", json!(null)).unwrap_err();
        assert_eq!(execution_error(err).exc_type, "TypeError");
    }

    #[test]
    fn test_execute_json_invalid_input() {
        let err = Sandbox::default().execute_json("result = 1", "{not json").unwrap_err();
        assert!(matches!(err, SandboxError::InvalidInput(_)));
    }

    #[test]
    fn test_execute_json() {
        let report = Sandbox::default()
            .execute_json("result = len(input)", "[1, 2, 3, 4]")
            .unwrap();
        assert_eq!(report.result, Some(json!(4)));
    }

    #[test]
    fn test_evaluate_expression() {
        let report = Sandbox::default()
            .evaluate("[x * 2 for x in input]", json!([1, 2]))
            .unwrap();
        assert_eq!(report.result, Some(json!([2, 4])));

        let err = Sandbox::default().evaluate("x = 1", json!(null)).unwrap_err();
        assert!(err.is_compile());
    }

    #[test]
    fn test_printed_output_is_reported() {
        let report = Sandbox::default()
            .execute("print('a', 1)\nresult = True", json!(null))
            .unwrap();
        assert_eq!(report.printed, "a 1\n");
        assert_eq!(report.result, Some(json!(true)));
    }

    #[test]
    fn test_invocations_do_not_share_state() {
        let sandbox = Sandbox::default();
        sandbox.execute("leaked = 1\nresult = leaked", json!(null)).unwrap();
        let err = sandbox.execute("result = leaked", json!(null)).unwrap_err();
        assert_eq!(execution_error(err).exc_type, "NameError");
    }

    #[test]
    fn test_execute_named_reports_filename() {
        let err = Sandbox::default()
            .execute_named("import os", "job.py", json!(null))
            .unwrap_err();
        match err {
            SandboxError::Compile(err) => assert_eq!(err.filename, "job.py"),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[test]
    fn test_evaluate_named_reports_filename() {
        let err = Sandbox::default()
            .evaluate_named("input[", "expr.py", json!(null))
            .unwrap_err();
        match err {
            SandboxError::Compile(err) => assert_eq!(err.filename, "expr.py"),
            other => panic!("expected compile error, got {:?}", other),
        }
        let report = Sandbox::default()
            .evaluate_named("input + 1", "expr.py", json!(1))
            .unwrap();
        assert_eq!(report.result, Some(json!(2)));
    }

    #[test]
    fn test_long_operator_chain_is_compile_error() {
        let sandbox = Sandbox::default();
        let sum = format!("result = 1{}", " + 1".repeat(100_000));
        assert!(sandbox.execute(&sum, json!(null)).unwrap_err().is_compile());
        let lookups = format!("result = input{}", "[0]".repeat(100_000));
        assert!(sandbox.execute(&lookups, json!(null)).unwrap_err().is_compile());
        let chained = format!("result = 1{}", " + 1".repeat(50));
        assert_eq!(
            sandbox.execute(&chained, json!(null)).unwrap().result,
            Some(json!(51))
        );
    }

    #[test]
    fn test_huge_range_values() {
        let sandbox = Sandbox::default();
        let bounds = "lo = -2**62 * 2\nhi = (2**62 - 1) * 2 + 1\n";
        let err = sandbox
            .execute(&format!("{}result = len(range(lo, hi))", bounds), json!(null))
            .unwrap_err();
        assert_eq!(execution_error(err).exc_type, "OverflowError");

        let report = sandbox
            .execute(
                &format!("{}result = [x for x in range(lo, hi, 2**62)]", bounds),
                json!(null),
            )
            .unwrap();
        assert_eq!(
            report.result,
            Some(json!([i64::MIN, -(1_i64 << 62), 0, 1_i64 << 62]))
        );

        let report = sandbox
            .execute(&format!("{}result = range(lo, 0)[-1]", bounds), json!(null))
            .unwrap();
        assert_eq!(report.result, Some(json!(-1)));
    }

    #[test]
    fn test_int_float_equality_is_exact() {
        let report = Sandbox::default()
            .execute("result = 2**53 + 1 == float(2**53 + 1)", json!(null))
            .unwrap();
        assert_eq!(report.result, Some(json!(false)));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let config = PolicyConfig::new(
            BuiltinsConfig::new(vec!["".to_string()], vec![]),
            AttributesConfig::default(),
        );
        assert!(matches!(Sandbox::new(config), Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_invocation_state_terminal() {
        assert!(!InvocationState::Received.is_terminal());
        assert!(!InvocationState::Executing.is_terminal());
        assert!(InvocationState::Succeeded.is_terminal());
        assert!(InvocationState::CompileFailed.is_terminal());
        assert_eq!(InvocationState::ExecutionFailed.to_string(), "execution_failed");
    }

    #[tokio::test]
    async fn test_execute_detached() {
        let sandbox = Sandbox::default();
        let report = sandbox
            .execute_detached("result = sorted(input)".to_string(), json!([3, 1, 2]))
            .await
            .unwrap();
        assert_eq!(report.result, Some(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_execute_detached_concurrently() {
        let sandbox = Sandbox::default();
        let first = sandbox.execute_detached("result = input * 2".to_string(), json!(21));
        let second = sandbox.execute_detached("raise KeyError('k')".to_string(), json!(null));
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().result, Some(json!(42)));
        assert!(second.unwrap_err().is_execution());
    }
}
