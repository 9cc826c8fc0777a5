//! Variable environments and the capability table the global scope is built
//! from.
//!
//! The table is the single source of truth for what a script can reach: the
//! scope is populated from it and from nothing else, and the same table is
//! what `--list-capabilities` prints.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::Serialize;

use crate::compiler::{GUARD_GETATTR, GUARD_GETITEM, GUARD_GETITER, GUARD_ITER_UNPACK};

use super::builtins;
use super::exception;
use super::guards;
use super::value::{HostFn, HostFunction, Value};

/// Name the decoded input is bound to.
pub const INPUT_NAME: &str = "input";
/// Name of the output slot.
pub const RESULT_NAME: &str = "result";

/// A scope of variables chained to its enclosing scope.
///
/// Assignment always binds in the innermost scope; lookup walks outward.
#[derive(Default)]
pub struct Env {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    pub fn new_global() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn child(parent: &Rc<Env>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(name))
    }

    pub fn set(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    /// Unbinds a name from this scope only.
    pub fn remove(&self, name: &str) -> bool {
        self.vars.borrow_mut().remove(name).is_some()
    }

    /// Drops every binding, breaking reference cycles through closures.
    pub fn clear(&self) {
        let drained: Vec<Value> = self.vars.borrow_mut().drain().map(|(_, v)| v).collect();
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.vars.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.borrow().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    GetAttr,
    GetItem,
    GetIter,
    IterUnpackSequence,
}

impl GuardKind {
    pub const ALL: [GuardKind; 4] = [
        GuardKind::GetAttr,
        GuardKind::GetItem,
        GuardKind::GetIter,
        GuardKind::IterUnpackSequence,
    ];

    /// Scope name the compiler lowers this guard to.
    pub fn binding(self) -> &'static str {
        match self {
            GuardKind::GetAttr => GUARD_GETATTR,
            GuardKind::GetItem => GUARD_GETITEM,
            GuardKind::GetIter => GUARD_GETITER,
            GuardKind::IterUnpackSequence => GUARD_ITER_UNPACK,
        }
    }
}

/// What a scope name is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "guard", rename_all = "snake_case")]
pub enum Capability {
    SafeBuiltin,
    ExceptionType,
    Guard(GuardKind),
    HostFunction,
    InputBinding,
    ResultSlot,
}

/// Every name visible to a script, and what it is.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct CapabilityTable {
    entries: BTreeMap<String, Capability>,
}

impl CapabilityTable {
    /// Builds the table from the builtins `permitted` lets through and the
    /// host function names.
    ///
    /// Guards, exception types, `input` and `result` are always present.
    /// Host functions never shadow them.
    pub fn new<'a>(
        permitted: impl Fn(&str) -> bool,
        host_functions: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for name in builtins::names().filter(|name| permitted(name)) {
            entries.insert(name.to_string(), Capability::SafeBuiltin);
        }
        for name in exception::builtin_exception_types() {
            entries.insert(name.to_string(), Capability::ExceptionType);
        }
        for name in host_functions {
            entries
                .entry(name.to_string())
                .or_insert(Capability::HostFunction);
        }
        for guard in GuardKind::ALL {
            entries.insert(guard.binding().to_string(), Capability::Guard(guard));
        }
        entries.insert(INPUT_NAME.to_string(), Capability::InputBinding);
        entries.insert(RESULT_NAME.to_string(), Capability::ResultSlot);
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<Capability> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Capability)> {
        self.entries.iter().map(|(name, cap)| (name.as_str(), *cap))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Creates a fresh global scope for one invocation.
    pub fn build_scope(&self, host_functions: &HashMap<String, HostFn>, input: Value) -> Rc<Env> {
        let globals = Env::new_global();
        for (name, capability) in self.iter() {
            let value = match capability {
                Capability::SafeBuiltin => builtins::lookup(name),
                Capability::ExceptionType => exception::lookup_type(name).map(Value::ExceptionType),
                Capability::Guard(kind) => Some(guards::guard_value(kind)),
                Capability::HostFunction => {
                    host_functions.get(name).map(|func| {
                        Value::HostFunction(HostFunction {
                            name: Rc::from(name),
                            func: func.clone(),
                        })
                    })
                }
                Capability::InputBinding => Some(input.clone()),
                Capability::ResultSlot => Some(Value::Unset),
            };
            match value {
                Some(value) => globals.set(name, value),
                None => tracing::warn!(name, "Capability has no implementation, skipping"),
            }
        }
        globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_lookup_walks_parents() {
        let globals = Env::new_global();
        globals.set("x", Value::Int(1));
        let local = Env::child(&globals);
        local.set("y", Value::Int(2));
        assert!(local.get("x").is_some());
        assert!(globals.get("y").is_none());
        local.set("x", Value::Int(3));
        assert_eq!(globals.get("x").unwrap().repr(), "1");
        assert_eq!(local.get("x").unwrap().repr(), "3");
    }

    #[test]
    fn test_table_contains_core_bindings() {
        let table = CapabilityTable::new(|_| true, []);
        assert_eq!(table.get("input"), Some(Capability::InputBinding));
        assert_eq!(table.get("result"), Some(Capability::ResultSlot));
        assert_eq!(
            table.get("_getattr_"),
            Some(Capability::Guard(GuardKind::GetAttr))
        );
        assert_eq!(table.get("len"), Some(Capability::SafeBuiltin));
        assert_eq!(table.get("ValueError"), Some(Capability::ExceptionType));
    }

    #[test]
    fn test_dangerous_names_absent() {
        let table = CapabilityTable::new(|_| true, []);
        for name in [
            "open", "__import__", "exec", "eval", "compile", "getattr", "setattr", "globals",
            "vars", "type", "dir",
        ] {
            assert!(!table.contains(name), "{} must not be reachable", name);
        }
    }

    #[test]
    fn test_permitted_filter_applies_to_builtins_only() {
        let table = CapabilityTable::new(|name| name != "print", []);
        assert!(!table.contains("print"));
        assert!(table.contains("_getiter_"));
    }

    #[test]
    fn test_host_functions_cannot_shadow_core() {
        let table = CapabilityTable::new(|_| true, ["fetch", "input"]);
        assert_eq!(table.get("fetch"), Some(Capability::HostFunction));
        assert_eq!(table.get("input"), Some(Capability::InputBinding));
    }

    #[test]
    fn test_build_scope_binds_everything() {
        let table = CapabilityTable::new(|_| true, []);
        let scope = table.build_scope(&HashMap::new(), Value::Int(7));
        assert_eq!(scope.len(), table.len());
        assert_eq!(scope.get("input").unwrap().repr(), "7");
        assert!(matches!(scope.get("result"), Some(Value::Unset)));
    }

    #[test]
    fn test_manifest_serializes() {
        let table = CapabilityTable::new(|_| true, []);
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["abs"]["kind"], "safe_builtin");
        assert_eq!(json["_getitem_"]["guard"], "get_item");
    }
}
