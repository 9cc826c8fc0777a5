//! Guard primitives.
//!
//! The compiler rewrites every attribute read, item read and loop iteration
//! into a call of one of these. They are the only path from a script to the
//! inside of a value.

use std::sync::Arc;

use regex::Regex;

use crate::utils::glob::glob_to_regex;

use super::exception::Exception;
use super::interpreter::Interpreter;
use super::methods;
use super::scope::GuardKind;
use super::value::{BoundMethod, Builtin, BuiltinFn, CallArgs, Slice, Value};

/// Sequences longer than this are not materialized by iteration.
const MAX_MATERIALIZED_LEN: usize = 1 << 26;

/// Compiled attribute rules from the policy configuration.
#[derive(Debug, Clone, Default)]
pub struct AttributePolicy {
    blocked: Vec<Regex>,
}

impl AttributePolicy {
    /// Compiles the blocked-attribute glob patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is not a valid glob.
    pub fn from_patterns(patterns: &[String]) -> anyhow::Result<Self> {
        let blocked = patterns
            .iter()
            .map(|pattern| glob_to_regex(pattern))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { blocked })
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Decides whether `type_name.name` must not be reachable from a script.
///
/// Names beginning with `_` are always sensitive. Policy patterns are
/// matched against the bare name and against `type_name.name`.
pub fn is_sensitive_attribute(policy: &AttributePolicy, type_name: &str, name: &str) -> bool {
    if name.starts_with('_') {
        return true;
    }
    let qualified = format!("{}.{}", type_name, name);
    policy
        .blocked
        .iter()
        .any(|pattern| pattern.is_match(name) || pattern.is_match(&qualified))
}

/// The scope value bound to a guard's name.
pub fn guard_value(kind: GuardKind) -> Value {
    let func: BuiltinFn = match kind {
        GuardKind::GetAttr => guarded_getattr,
        GuardKind::GetItem => guarded_getitem,
        GuardKind::GetIter => guarded_getiter,
        GuardKind::IterUnpackSequence => guarded_iter_unpack_sequence,
    };
    Value::Builtin(Builtin {
        name: kind.binding(),
        func,
    })
}

fn guarded_getattr(interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check(GuardKind::GetAttr.binding(), 2, 2)?;
    let Value::Str(name) = &args.positional[1] else {
        return Err(Exception::type_error("attribute name must be string"));
    };
    get_attribute(interp.policy(), &args.positional[0], name)
}

fn guarded_getitem(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check(GuardKind::GetItem.binding(), 2, 2)?;
    get_item(&args.positional[0], &args.positional[1])
}

fn guarded_getiter(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check(GuardKind::GetIter.binding(), 1, 1)?;
    match &args.positional[0] {
        // Ranges stay lazy; everything else is snapshotted.
        Value::Range(range) => Ok(Value::Range(*range)),
        other => Ok(Value::list(iterate(other)?)),
    }
}

fn guarded_iter_unpack_sequence(
    _interp: &mut Interpreter,
    args: CallArgs,
) -> Result<Value, Exception> {
    args.check(GuardKind::IterUnpackSequence.binding(), 2, 2)?;
    let spec = &args.positional[1];
    let unpacked = iterate(&args.positional[0])?
        .iter()
        .map(|item| unpack(item, spec))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::list(unpacked))
}

/// Resolves `obj.name` for a script.
pub fn get_attribute(policy: &AttributePolicy, obj: &Value, name: &str) -> Result<Value, Exception> {
    let type_name = obj.type_name();
    if is_sensitive_attribute(policy, type_name, name) {
        tracing::debug!(type_name, name, "Blocked sensitive attribute access");
        return Err(Exception::attribute_error(format!(
            "access to attribute '{}' of '{}' object is not allowed",
            name, type_name
        )));
    }

    let bound = || {
        Value::BoundMethod(std::rc::Rc::new(BoundMethod {
            receiver: obj.clone(),
            name: name.to_string(),
        }))
    };
    match obj {
        Value::Host(object) => {
            if let Some(value) = object.get_attribute(name) {
                return Ok(value);
            }
            if object.has_method(name) {
                return Ok(bound());
            }
        }
        _ if methods::has_method(obj, name) => return Ok(bound()),
        _ => {}
    }
    Err(Exception::attribute_error(format!(
        "'{}' object has no attribute '{}'",
        type_name, name
    )))
}

/// Converts an index value, accepting `bool` as `0`/`1`.
pub fn as_index(value: &Value, container: &str) -> Result<i64, Exception> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(Exception::type_error(format!(
            "{} indices must be integers or slices, not {}",
            container,
            other.type_name()
        ))),
    }
}

/// Maps a possibly negative index onto `0..len`.
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i128;
    let index = if index < 0 {
        index as i128 + len
    } else {
        index as i128
    };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn index_sequence<T: Clone>(
    items: &[T],
    key: &Value,
    container: &str,
) -> Result<Result<T, Vec<T>>, Exception> {
    if let Value::Slice(slice) = key {
        let picked = slice
            .indices(items.len())?
            .into_iter()
            .map(|i| items[i].clone())
            .collect();
        return Ok(Err(picked));
    }
    let index = as_index(key, container)?;
    normalize_index(index, items.len())
        .map(|i| Ok(items[i].clone()))
        .ok_or_else(|| Exception::index_error(format!("{} index out of range", container)))
}

/// Resolves `obj[key]` for a script.
pub fn get_item(obj: &Value, key: &Value) -> Result<Value, Exception> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            Ok(match index_sequence(items.as_slice(), key, "list")? {
                Ok(item) => item,
                Err(slice) => Value::list(slice),
            })
        }
        Value::Tuple(items) => Ok(match index_sequence(items.as_slice(), key, "tuple")? {
            Ok(item) => item,
            Err(slice) => Value::tuple(slice),
        }),
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(match index_sequence(chars.as_slice(), key, "string")? {
                Ok(ch) => Value::str(ch.to_string()),
                Err(slice) => Value::str(slice.into_iter().collect::<String>()),
            })
        }
        Value::Range(range) => {
            if let Value::Slice(slice) = key {
                if range.len() > MAX_MATERIALIZED_LEN {
                    return Err(too_large_range());
                }
                let picked = slice
                    .indices(range.len())?
                    .into_iter()
                    .map(|i| Value::Int(range.get(i)))
                    .collect();
                return Ok(Value::list(picked));
            }
            let index = as_index(key, "range")?;
            normalize_index(index, range.len())
                .map(|i| Value::Int(range.get(i)))
                .ok_or_else(|| Exception::index_error("range object index out of range"))
        }
        Value::Dict(dict) => dict
            .borrow()
            .get(key)?
            .ok_or_else(|| Exception::key_error(key.repr())),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Evaluates a slice expression's bounds.
pub fn make_slice(lower: Value, upper: Value, step: Value) -> Result<Value, Exception> {
    let bound = |value: Value| match value {
        Value::None => Ok(None),
        Value::Int(i) => Ok(Some(i)),
        Value::Bool(b) => Ok(Some(b as i64)),
        _ => Err(Exception::type_error(
            "slice indices must be integers or None",
        )),
    };
    Ok(Value::Slice(Slice {
        lower: bound(lower)?,
        upper: bound(upper)?,
        step: bound(step)?,
    }))
}

/// Snapshot of the items a script would see iterating `obj`.
///
/// Only lists, tuples, strings (characters), dicts (keys), ranges and host
/// objects that opt in are iterable.
pub fn iterate(obj: &Value) -> Result<Vec<Value>, Exception> {
    match obj {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::Str(text) => Ok(text.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Dict(dict) => Ok(dict.borrow().keys()),
        Value::Range(range) => {
            if range.len() > MAX_MATERIALIZED_LEN {
                return Err(too_large_range());
            }
            Ok(range.iter().map(Value::Int).collect())
        }
        Value::Host(object) => object.iterate().ok_or_else(|| not_iterable(obj)),
        _ => Err(not_iterable(obj)),
    }
}

fn too_large_range() -> Exception {
    Exception::new("OverflowError", "range is too large to materialize")
}

fn not_iterable(obj: &Value) -> Exception {
    Exception::type_error(format!("'{}' object is not iterable", obj.type_name()))
}

/// Unpacks `value` according to a nested spec of `None` leaves and tuples.
fn unpack(value: &Value, spec: &Value) -> Result<Value, Exception> {
    let Value::Tuple(children) = spec else {
        return Ok(value.clone());
    };
    let items = iterate(value).map_err(|_| {
        Exception::type_error(format!(
            "cannot unpack non-iterable {} object",
            value.type_name()
        ))
    })?;
    check_arity(items.len(), children.len())?;
    let unpacked = items
        .iter()
        .zip(children.iter())
        .map(|(item, child)| unpack(item, child))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::tuple(unpacked))
}

/// Fails when `got` items cannot fill `expected` targets.
pub fn check_arity(got: usize, expected: usize) -> Result<(), Exception> {
    if got > expected {
        return Err(Exception::value_error(format!(
            "too many values to unpack (expected {})",
            expected
        )));
    }
    if got < expected {
        return Err(Exception::value_error(format!(
            "not enough values to unpack (expected {}, got {})",
            expected, got
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::{Dict, HostObject, Range};

    #[derive(Debug)]
    struct Response;

    impl HostObject for Response {
        fn type_name(&self) -> &str {
            "Response"
        }

        fn get_attribute(&self, name: &str) -> Option<Value> {
            (name == "status").then(|| Value::Int(200))
        }

        fn has_method(&self, name: &str) -> bool {
            name == "json"
        }
    }

    fn policy(patterns: &[&str]) -> AttributePolicy {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        AttributePolicy::from_patterns(&patterns).unwrap()
    }

    #[test]
    fn test_underscore_names_always_sensitive() {
        let policy = AttributePolicy::default();
        assert!(is_sensitive_attribute(&policy, "dict", "__class__"));
        assert!(is_sensitive_attribute(&policy, "Response", "_session"));
        assert!(!is_sensitive_attribute(&policy, "str", "upper"));
    }

    #[test]
    fn test_policy_patterns_match_qualified_names() {
        let policy = policy(&["str.format*", "secret"]);
        assert!(is_sensitive_attribute(&policy, "str", "format"));
        assert!(is_sensitive_attribute(&policy, "str", "format_map"));
        assert!(!is_sensitive_attribute(&policy, "Template", "format"));
        assert!(is_sensitive_attribute(&policy, "Response", "secret"));
    }

    #[test]
    fn test_get_attribute_blocks_dunder_on_plain_values() {
        let err = get_attribute(&AttributePolicy::default(), &Value::dict(Dict::new()), "__class__")
            .unwrap_err();
        assert_eq!(err.kind, "AttributeError");
    }

    #[test]
    fn test_get_attribute_on_host_object() {
        let policy = AttributePolicy::default();
        let response = Value::host(Response);
        assert_eq!(get_attribute(&policy, &response, "status").unwrap().repr(), "200");
        assert!(matches!(
            get_attribute(&policy, &response, "json").unwrap(),
            Value::BoundMethod(_)
        ));
        assert!(get_attribute(&policy, &response, "__class__").is_err());
        assert!(get_attribute(&policy, &response, "missing").is_err());
    }

    #[test]
    fn test_builtin_methods_are_bound() {
        let policy = AttributePolicy::default();
        let bound = get_attribute(&policy, &Value::from("abc"), "upper").unwrap();
        assert!(matches!(bound, Value::BoundMethod(_)));
        assert!(get_attribute(&policy, &Value::Int(1), "real").is_err());
    }

    #[test]
    fn test_get_item_variants() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(get_item(&list, &Value::Int(-1)).unwrap().repr(), "3");
        let err = get_item(&list, &Value::Int(5)).unwrap_err();
        assert_eq!(err.kind, "IndexError");
        let err = get_item(&list, &Value::from("a")).unwrap_err();
        assert_eq!(err.message, "list indices must be integers or slices, not str");

        let slice = make_slice(Value::Int(1), Value::None, Value::None).unwrap();
        assert_eq!(get_item(&list, &slice).unwrap().repr(), "[2, 3]");
        assert_eq!(get_item(&Value::from("hey"), &Value::Int(0)).unwrap().repr(), "'h'");

        let mut dict = Dict::new();
        dict.insert(Value::from("a"), Value::Int(1)).unwrap();
        let dict = Value::dict(dict);
        assert_eq!(get_item(&dict, &Value::from("a")).unwrap().repr(), "1");
        let err = get_item(&dict, &Value::from("b")).unwrap_err();
        assert_eq!(err.kind, "KeyError");
        assert_eq!(err.message, "'b'");

        assert!(get_item(&Value::Int(3), &Value::Int(0)).is_err());
    }

    #[test]
    fn test_range_items_at_integer_bounds() {
        let range = Value::Range(Range {
            start: i64::MIN,
            stop: 0,
            step: 1,
        });
        assert_eq!(get_item(&range, &Value::Int(-1)).unwrap().repr(), "-1");
        assert_eq!(
            get_item(&range, &Value::Int(0)).unwrap().repr(),
            i64::MIN.to_string()
        );
        let err = get_item(&range, &Value::Int(i64::MIN)).unwrap_err();
        assert_eq!(err.kind, "IndexError");

        let slice = make_slice(Value::None, Value::Int(2), Value::None).unwrap();
        let err = get_item(&range, &slice).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
        assert!(iterate(&range).is_err());
    }

    #[test]
    fn test_normalize_index_extremes() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(i64::MIN, 3), None);
        assert_eq!(normalize_index(i64::MAX, 3), None);
        assert_eq!(normalize_index(-1, u64::MAX as usize), Some(u64::MAX as usize - 1));
    }

    #[test]
    fn test_iterate_rejects_non_iterables() {
        let err = iterate(&Value::Int(3)).unwrap_err();
        assert_eq!(err.message, "'int' object is not iterable");
        assert!(iterate(&Value::host(Response)).is_err());
    }

    #[test]
    fn test_iterate_snapshots() {
        let list = Value::list(vec![Value::Int(1)]);
        let snapshot = iterate(&list).unwrap();
        if let Value::List(items) = &list {
            items.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(snapshot.len(), 1);
        let range = Value::Range(Range {
            start: 0,
            stop: 3,
            step: 1,
        });
        assert_eq!(iterate(&range).unwrap().len(), 3);
    }

    #[test]
    fn test_unpack_nested_spec() {
        let spec = Value::tuple(vec![Value::None, Value::tuple(vec![Value::None, Value::None])]);
        let item = Value::tuple(vec![
            Value::Int(1),
            Value::list(vec![Value::Int(2), Value::Int(3)]),
        ]);
        assert_eq!(unpack(&item, &spec).unwrap().repr(), "(1, (2, 3))");

        let short = Value::tuple(vec![Value::Int(1)]);
        let err = unpack(&short, &spec).unwrap_err();
        assert_eq!(err.message, "not enough values to unpack (expected 2, got 1)");
        let err = unpack(&Value::Int(1), &spec).unwrap_err();
        assert_eq!(err.message, "cannot unpack non-iterable int object");
    }
}
