//! Conversion between JSON and guest values.
//!
//! This is the only way data crosses the sandbox boundary: the input is
//! decoded into fresh guest values, and the result is encoded back before
//! anything leaves the worker.

use std::rc::Rc;

use serde_json::{Map, Number};

use super::exception::Exception;
use super::value::{format_float, Dict, Value};

/// Nesting limit when encoding the result.
const MAX_DEPTH: usize = 200;

/// Decodes a JSON document into a guest value.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s.as_str()),
        serde_json::Value::Array(items) => Value::list(items.iter().map(from_json).collect()),
        serde_json::Value::Object(entries) => {
            let mut dict = Dict::new();
            for (key, value) in entries {
                // String keys always hash.
                let _ = dict.insert(Value::str(key.as_str()), from_json(value));
            }
            Value::dict(dict)
        }
    }
}

/// Encodes a guest value as JSON.
///
/// `Unset` nested inside a container becomes `null`; callers handle a
/// top-level `Unset` themselves.
///
/// # Errors
///
/// `ValueError` for NaN or infinite floats and for circular containers,
/// `TypeError` for values with no JSON form and for dict keys that are not
/// str, int, float, bool or None.
pub fn to_json(value: &Value) -> Result<serde_json::Value, Exception> {
    Encoder::default().encode(value, 0)
}

#[derive(Default)]
struct Encoder {
    /// Containers on the current path, by address.
    active: Vec<usize>,
}

impl Encoder {
    fn encode(&mut self, value: &Value, depth: usize) -> Result<serde_json::Value, Exception> {
        if depth > MAX_DEPTH {
            return Err(Exception::recursion());
        }
        Ok(match value {
            Value::None | Value::Unset => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::Number(encode_float(*f)?),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                let items = items.borrow().clone();
                self.within(id, |encoder| encoder.encode_array(&items, depth))?
            }
            Value::Tuple(items) => self.encode_array(items, depth)?,
            Value::Dict(dict) => {
                let id = Rc::as_ptr(dict) as *const () as usize;
                let entries: Vec<(Value, Value)> = dict.borrow().iter().cloned().collect();
                self.within(id, |encoder| {
                    let mut object = Map::with_capacity(entries.len());
                    for (key, value) in &entries {
                        object.insert(encode_key(key)?, encoder.encode(value, depth + 1)?);
                    }
                    Ok(serde_json::Value::Object(object))
                })?
            }
            other => {
                return Err(Exception::type_error(format!(
                    "Object of type {} is not JSON serializable",
                    other.type_name()
                )))
            }
        })
    }

    fn encode_array(&mut self, items: &[Value], depth: usize) -> Result<serde_json::Value, Exception> {
        items
            .iter()
            .map(|item| self.encode(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array)
    }

    fn within(
        &mut self,
        id: usize,
        encode: impl FnOnce(&mut Self) -> Result<serde_json::Value, Exception>,
    ) -> Result<serde_json::Value, Exception> {
        if self.active.contains(&id) {
            return Err(Exception::value_error("Circular reference detected"));
        }
        self.active.push(id);
        let encoded = encode(self);
        self.active.pop();
        encoded
    }
}

fn encode_float(f: f64) -> Result<Number, Exception> {
    Number::from_f64(f).ok_or_else(|| {
        Exception::value_error("Out of range float values are not JSON compliant")
    })
}

fn encode_key(key: &Value) -> Result<String, Exception> {
    match key {
        Value::Str(s) => Ok(s.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::None => Ok("null".to_string()),
        Value::Float(f) => {
            encode_float(*f)?;
            Ok(format_float(*f))
        }
        other => Err(Exception::type_error(format!(
            "keys must be str, int, float, bool or None, not {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_numbers() {
        assert!(matches!(from_json(&json!(3)), Value::Int(3)));
        assert!(matches!(from_json(&json!(2.5)), Value::Float(f) if f == 2.5));
        assert!(matches!(from_json(&json!(u64::MAX)), Value::Float(_)));
    }

    #[test]
    fn test_round_trip_preserves_structure_and_order() {
        let doc = json!({"z": [1, 2.5, "x", null, true], "a": {"nested": []}});
        let encoded = to_json(&from_json(&doc)).unwrap();
        assert_eq!(encoded, doc);
        let keys: Vec<&String> = encoded.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["z", "a"]);
    }

    #[test]
    fn test_tuples_become_arrays() {
        let value = Value::tuple(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(to_json(&value).unwrap(), json!([1, "a"]));
    }

    #[test]
    fn test_non_string_keys_are_stringified() {
        let mut dict = Dict::new();
        dict.insert(Value::Int(1), Value::Bool(true)).unwrap();
        dict.insert(Value::None, Value::Int(0)).unwrap();
        dict.insert(Value::Float(1.5), Value::Int(0)).unwrap();
        assert_eq!(
            to_json(&Value::dict(dict)).unwrap(),
            json!({"1": true, "null": 0, "1.5": 0})
        );
    }

    #[test]
    fn test_tuple_key_rejected() {
        let mut dict = Dict::new();
        dict.insert(Value::tuple(vec![Value::Int(1)]), Value::None)
            .unwrap();
        let err = to_json(&Value::dict(dict)).unwrap_err();
        assert_eq!(err.kind, "TypeError");
        assert_eq!(err.message, "keys must be str, int, float, bool or None, not tuple");
    }

    #[test]
    fn test_nan_rejected() {
        let err = to_json(&Value::Float(f64::NAN)).unwrap_err();
        assert_eq!(err.kind, "ValueError");
    }

    #[test]
    fn test_unserializable_value() {
        let err = to_json(&Value::ExceptionType("ValueError")).unwrap_err();
        assert_eq!(err.message, "Object of type type is not JSON serializable");
    }

    #[test]
    fn test_nested_unset_is_null() {
        let value = Value::list(vec![Value::Unset]);
        assert_eq!(to_json(&value).unwrap(), json!([null]));
    }

    #[test]
    fn test_circular_reference() {
        let list = Value::list(vec![]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        let err = to_json(&list).unwrap_err();
        assert_eq!(err.message, "Circular reference detected");
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_shared_but_acyclic_is_fine() {
        let shared = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![shared.clone(), shared]);
        assert_eq!(to_json(&outer).unwrap(), json!([[1], [1]]));
    }
}
