//! Methods of the builtin `str`, `list` and `dict` types.
//!
//! Scripts reach these only through the attribute guard, which hands back a
//! bound method; calling it lands in [`call_method`].

use std::rc::Rc;

use super::builtins::sort_values;
use super::exception::Exception;
use super::guards::{self, normalize_index};
use super::interpreter::Interpreter;
use super::ops;
use super::value::{CallArgs, Dict, Value};

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "find", "count", "title", "capitalize", "isdigit", "isalpha", "isalnum",
    "isspace", "zfill",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "reverse", "sort", "copy",
    "clear",
];

const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "setdefault", "update", "copy", "clear",
];

pub fn has_method(receiver: &Value, name: &str) -> bool {
    let table = match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

/// Invokes `receiver.name(*args)`.
pub fn call_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: CallArgs,
) -> Result<Value, Exception> {
    match receiver {
        Value::Str(text) => str_method(text, name, args),
        Value::List(_) => list_method(interp, receiver, name, args),
        Value::Dict(_) => dict_method(receiver, name, args),
        other => Err(Exception::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            name
        ))),
    }
}

fn expect_str<'a>(value: &'a Value, what: &str) -> Result<&'a str, Exception> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(Exception::type_error(format!(
            "{} must be str, not {}",
            what,
            other.type_name()
        ))),
    }
}

fn optional_chars(args: &CallArgs, method: &str) -> Result<Option<Vec<char>>, Exception> {
    args.check(method, 0, 1)?;
    match args.positional.first() {
        None | Some(Value::None) => Ok(None),
        Some(value) => Ok(Some(expect_str(value, "strip arg")?.chars().collect())),
    }
}

fn str_method(text: &Rc<str>, name: &str, mut args: CallArgs) -> Result<Value, Exception> {
    let method = format!("str.{}", name);
    let s: &str = text;
    let no_args = |args: &CallArgs| args.check(&method, 0, 0);

    let value = match name {
        "upper" => {
            no_args(&args)?;
            Value::str(s.to_uppercase())
        }
        "lower" => {
            no_args(&args)?;
            Value::str(s.to_lowercase())
        }
        "strip" | "lstrip" | "rstrip" => {
            let chars = optional_chars(&args, &method)?;
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match name {
                "strip" => s.trim_matches(matches),
                "lstrip" => s.trim_start_matches(matches),
                _ => s.trim_end_matches(matches),
            })
        }
        "split" => {
            let sep = args.take_keyword("sep");
            let maxsplit = args.take_keyword("maxsplit");
            args.check(&method, 0, 2)?;
            let mut positional = args.positional.into_iter();
            let sep = positional.next().or(sep).unwrap_or(Value::None);
            let maxsplit = match positional.next().or(maxsplit) {
                None => -1,
                Some(value) => guards::as_index(&value, "maxsplit")?,
            };
            let parts = match sep {
                Value::None => split_whitespace(s, maxsplit),
                other => {
                    let sep = expect_str(&other, "separator")?;
                    if sep.is_empty() {
                        return Err(Exception::value_error("empty separator"));
                    }
                    if maxsplit < 0 {
                        s.split(sep).map(str::to_string).collect()
                    } else {
                        s.splitn(maxsplit as usize + 1, sep)
                            .map(str::to_string)
                            .collect()
                    }
                }
            };
            Value::list(parts.into_iter().map(Value::from).collect())
        }
        "join" => {
            args.check(&method, 1, 1)?;
            let mut pieces = Vec::new();
            for (i, item) in guards::iterate(&args.positional[0])?.iter().enumerate() {
                match item {
                    Value::Str(piece) => pieces.push(piece.to_string()),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            other.type_name()
                        )))
                    }
                }
            }
            Value::str(pieces.join(s))
        }
        "replace" => {
            args.check(&method, 2, 3)?;
            let old = expect_str(&args.positional[0], "replace() argument 1")?;
            let new = expect_str(&args.positional[1], "replace() argument 2")?;
            match args.positional.get(2) {
                Some(count) => {
                    let count = guards::as_index(count, "count")?;
                    if count < 0 {
                        Value::str(s.replace(old, new))
                    } else {
                        Value::str(s.replacen(old, new, count as usize))
                    }
                }
                None => Value::str(s.replace(old, new)),
            }
        }
        "startswith" | "endswith" => {
            args.check(&method, 1, 1)?;
            let candidates = match &args.positional[0] {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other.clone()],
            };
            let mut found = false;
            for candidate in &candidates {
                let affix = expect_str(candidate, &format!("{} arg", name))?;
                if (name == "startswith" && s.starts_with(affix))
                    || (name == "endswith" && s.ends_with(affix))
                {
                    found = true;
                    break;
                }
            }
            Value::Bool(found)
        }
        "find" => {
            args.check(&method, 1, 1)?;
            let needle = expect_str(&args.positional[0], "find() argument")?;
            match s.find(needle) {
                Some(byte) => Value::Int(s[..byte].chars().count() as i64),
                None => Value::Int(-1),
            }
        }
        "count" => {
            args.check(&method, 1, 1)?;
            let needle = expect_str(&args.positional[0], "count() argument")?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Value::Int(count as i64)
        }
        "title" => {
            no_args(&args)?;
            let mut out = String::with_capacity(s.len());
            let mut previous_cased = false;
            for c in s.chars() {
                if previous_cased {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                previous_cased = c.is_alphabetic();
            }
            Value::str(out)
        }
        "capitalize" => {
            no_args(&args)?;
            let mut chars = s.chars();
            let out: String = match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            };
            Value::str(out)
        }
        "isdigit" | "isalpha" | "isalnum" | "isspace" => {
            no_args(&args)?;
            let test: fn(char) -> bool = match name {
                "isdigit" => |c| c.is_ascii_digit(),
                "isalpha" => char::is_alphabetic,
                "isalnum" => char::is_alphanumeric,
                _ => char::is_whitespace,
            };
            Value::Bool(!s.is_empty() && s.chars().all(test))
        }
        "zfill" => {
            args.check(&method, 1, 1)?;
            let width = guards::as_index(&args.positional[0], "width")?.max(0) as usize;
            let len = s.chars().count();
            if len >= width {
                Value::str(s)
            } else if width > ops::MAX_REPEAT_LEN {
                return Err(Exception::new("OverflowError", "padded string is too long"));
            } else {
                let padding = "0".repeat(width - len);
                match s.chars().next() {
                    Some(sign @ ('+' | '-')) => {
                        Value::str(format!("{}{}{}", sign, padding, &s[sign.len_utf8()..]))
                    }
                    _ => Value::str(format!("{}{}", padding, s)),
                }
            }
        }
        _ => return Err(no_attribute("str", name)),
    };
    Ok(value)
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<String> {
    if maxsplit < 0 {
        return s.split_whitespace().map(str::to_string).collect();
    }
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if parts.len() as i64 == maxsplit {
            parts.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest.to_string());
                break;
            }
        }
    }
    parts
}

fn no_attribute(type_name: &str, name: &str) -> Exception {
    Exception::attribute_error(format!(
        "'{}' object has no attribute '{}'",
        type_name, name
    ))
}

fn list_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    mut args: CallArgs,
) -> Result<Value, Exception> {
    let Value::List(list) = receiver else {
        return Err(no_attribute(receiver.type_name(), name));
    };
    let method = format!("list.{}", name);

    match name {
        "append" => {
            args.check(&method, 1, 1)?;
            let item = args.positional.swap_remove(0);
            list.borrow_mut().push(item);
            Ok(Value::None)
        }
        "extend" => {
            args.check(&method, 1, 1)?;
            let items = guards::iterate(&args.positional[0])?;
            list.borrow_mut().extend(items);
            Ok(Value::None)
        }
        "insert" => {
            args.check(&method, 2, 2)?;
            let index = guards::as_index(&args.positional[0], "list")?;
            let item = args.positional.swap_remove(1);
            let mut items = list.borrow_mut();
            let len = items.len() as i64;
            let position = if index < 0 {
                (index + len).max(0)
            } else {
                index.min(len)
            };
            items.insert(position as usize, item);
            Ok(Value::None)
        }
        "pop" => {
            args.check(&method, 0, 1)?;
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(Exception::index_error("pop from empty list"));
            }
            let index = match args.positional.first() {
                Some(value) => guards::as_index(value, "list")?,
                None => -1,
            };
            let position = normalize_index(index, items.len())
                .ok_or_else(|| Exception::index_error("pop index out of range"))?;
            Ok(items.remove(position))
        }
        "remove" | "index" | "count" => {
            args.check(&method, 1, 1)?;
            let target = &args.positional[0];
            let snapshot = list.borrow().clone();
            let mut positions = Vec::new();
            for (i, item) in snapshot.iter().enumerate() {
                if ops::equals(item, target)? {
                    positions.push(i);
                    if name != "count" {
                        break;
                    }
                }
            }
            match name {
                "count" => Ok(Value::Int(positions.len() as i64)),
                "index" => positions
                    .first()
                    .map(|&i| Value::Int(i as i64))
                    .ok_or_else(|| {
                        Exception::value_error(format!("{} is not in list", target.repr()))
                    }),
                _ => {
                    let Some(&position) = positions.first() else {
                        return Err(Exception::value_error("list.remove(x): x not in list"));
                    };
                    let mut items = list.borrow_mut();
                    if position < items.len() {
                        items.remove(position);
                    }
                    Ok(Value::None)
                }
            }
        }
        "reverse" => {
            args.check(&method, 0, 0)?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "sort" => {
            let key = args.take_keyword("key").filter(|k| !matches!(k, Value::None));
            let reverse = args
                .take_keyword("reverse")
                .map(|r| r.truthy())
                .unwrap_or(false);
            args.check(&method, 0, 0)?;
            let snapshot = list.borrow().clone();
            let sorted = sort_values(interp, snapshot, key.as_ref(), reverse)?;
            *list.borrow_mut() = sorted;
            Ok(Value::None)
        }
        "copy" => {
            args.check(&method, 0, 0)?;
            Ok(Value::list(list.borrow().clone()))
        }
        "clear" => {
            args.check(&method, 0, 0)?;
            let drained: Vec<Value> = list.borrow_mut().drain(..).collect();
            drop(drained);
            Ok(Value::None)
        }
        _ => Err(no_attribute("list", name)),
    }
}

/// Adds `source` into `target`: a dict, or an iterable of key/value pairs.
pub fn update_dict(target: &mut Dict, source: &Value) -> Result<(), Exception> {
    if let Value::Dict(other) = source {
        let entries: Vec<(Value, Value)> = other.borrow().iter().cloned().collect();
        for (key, value) in entries {
            target.insert(key, value)?;
        }
        return Ok(());
    }
    for (i, pair) in guards::iterate(source)?.iter().enumerate() {
        let items = guards::iterate(pair).map_err(|_| {
            Exception::type_error(format!(
                "cannot convert dictionary update sequence element #{} to a sequence",
                i
            ))
        })?;
        if items.len() != 2 {
            return Err(Exception::value_error(format!(
                "dictionary update sequence element #{} has length {}; 2 is required",
                i,
                items.len()
            )));
        }
        let mut items = items.into_iter();
        if let (Some(key), Some(value)) = (items.next(), items.next()) {
            target.insert(key, value)?;
        }
    }
    Ok(())
}

fn dict_method(receiver: &Value, name: &str, mut args: CallArgs) -> Result<Value, Exception> {
    let Value::Dict(dict) = receiver else {
        return Err(no_attribute(receiver.type_name(), name));
    };
    let method = format!("dict.{}", name);

    match name {
        "get" => {
            args.check(&method, 1, 2)?;
            let default = args.positional.get(1).cloned().unwrap_or(Value::None);
            Ok(dict.borrow().get(&args.positional[0])?.unwrap_or(default))
        }
        "keys" => {
            args.check(&method, 0, 0)?;
            Ok(Value::list(dict.borrow().keys()))
        }
        "values" => {
            args.check(&method, 0, 0)?;
            Ok(Value::list(dict.borrow().values()))
        }
        "items" => {
            args.check(&method, 0, 0)?;
            let items = dict
                .borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect();
            Ok(Value::list(items))
        }
        "pop" => {
            args.check(&method, 1, 2)?;
            let key = &args.positional[0];
            let removed = dict.borrow_mut().remove(key)?;
            match (removed, args.positional.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(Exception::key_error(key.repr())),
            }
        }
        "setdefault" => {
            args.check(&method, 1, 2)?;
            let key = args.positional[0].clone();
            if let Some(existing) = dict.borrow().get(&key)? {
                return Ok(existing);
            }
            let default = args.positional.get(1).cloned().unwrap_or(Value::None);
            dict.borrow_mut().insert(key, default.clone())?;
            Ok(default)
        }
        "update" => {
            let keywords = std::mem::take(&mut args.keywords);
            args.check(&method, 0, 1)?;
            let mut merged = dict.borrow().clone();
            if let Some(source) = args.positional.first() {
                update_dict(&mut merged, source)?;
            }
            for (key, value) in keywords {
                merged.insert(Value::from(key), value)?;
            }
            *dict.borrow_mut() = merged;
            Ok(Value::None)
        }
        "copy" => {
            args.check(&method, 0, 0)?;
            Ok(Value::dict(dict.borrow().clone()))
        }
        "clear" => {
            args.check(&method, 0, 0)?;
            let drained = std::mem::take(&mut *dict.borrow_mut());
            drop(drained);
            Ok(Value::None)
        }
        _ => Err(no_attribute("dict", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_str(text: &str, name: &str, args: Vec<Value>) -> Result<Value, Exception> {
        str_method(&Rc::from(text), name, CallArgs::new(args))
    }

    #[test]
    fn test_has_method() {
        assert!(has_method(&Value::from("x"), "upper"));
        assert!(!has_method(&Value::from("x"), "format"));
        assert!(has_method(&Value::list(vec![]), "append"));
        assert!(!has_method(&Value::Int(1), "append"));
    }

    #[test]
    fn test_case_methods() {
        assert_eq!(call_str("Hello", "upper", vec![]).unwrap().repr(), "'HELLO'");
        assert_eq!(
            call_str("hello world", "title", vec![]).unwrap().repr(),
            "'Hello World'"
        );
        assert_eq!(
            call_str("hELLO", "capitalize", vec![]).unwrap().repr(),
            "'Hello'"
        );
    }

    #[test]
    fn test_strip_with_chars() {
        assert_eq!(call_str("  x  ", "strip", vec![]).unwrap().repr(), "'x'");
        assert_eq!(
            call_str("xxhixx", "strip", vec![Value::from("x")]).unwrap().repr(),
            "'hi'"
        );
        assert_eq!(call_str("  x", "rstrip", vec![]).unwrap().repr(), "'  x'");
    }

    #[test]
    fn test_split_variants() {
        assert_eq!(
            call_str(" a  b c ", "split", vec![]).unwrap().repr(),
            "['a', 'b', 'c']"
        );
        assert_eq!(
            call_str("a,b,,c", "split", vec![Value::from(",")]).unwrap().repr(),
            "['a', 'b', '', 'c']"
        );
        assert_eq!(
            call_str("a b c", "split", vec![Value::None, Value::Int(1)])
                .unwrap()
                .repr(),
            "['a', 'b c']"
        );
        assert!(call_str("abc", "split", vec![Value::from("")]).is_err());
    }

    #[test]
    fn test_join_requires_strings() {
        let items = Value::list(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(call_str("-", "join", vec![items]).unwrap().repr(), "'a-b'");
        let err = call_str("-", "join", vec![Value::list(vec![Value::Int(1)])]).unwrap_err();
        assert_eq!(err.message, "sequence item 0: expected str instance, int found");
    }

    #[test]
    fn test_find_counts_characters() {
        assert_eq!(
            call_str("héllo", "find", vec![Value::from("l")]).unwrap().repr(),
            "2"
        );
        assert_eq!(
            call_str("abc", "find", vec![Value::from("z")]).unwrap().repr(),
            "-1"
        );
    }

    #[test]
    fn test_predicates_and_zfill() {
        assert!(call_str("123", "isdigit", vec![]).unwrap().truthy());
        assert!(!call_str("", "isdigit", vec![]).unwrap().truthy());
        assert_eq!(
            call_str("-42", "zfill", vec![Value::Int(5)]).unwrap().repr(),
            "'-0042'"
        );
        assert!(call_str("http://x", "startswith", vec![Value::tuple(vec![
            Value::from("ftp"),
            Value::from("http")
        ])])
        .unwrap()
        .truthy());
    }

    #[test]
    fn test_zfill_width_is_capped() {
        let err = call_str("1", "zfill", vec![Value::Int(1 << 40)]).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
        let err = call_str("1", "zfill", vec![Value::Int(i64::MAX)]).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
        assert_eq!(
            call_str("long", "zfill", vec![Value::Int(-5)]).unwrap().repr(),
            "'long'"
        );
    }

    #[test]
    fn test_unknown_method() {
        let err = call_str("x", "format", vec![]).unwrap_err();
        assert_eq!(err.kind, "AttributeError");
    }

    #[test]
    fn test_dict_methods() {
        let dict = Value::dict(Dict::new());
        let call = |name: &str, args: Vec<Value>| dict_method(&dict, name, CallArgs::new(args));

        call("setdefault", vec![Value::from("a"), Value::Int(1)]).unwrap();
        assert_eq!(call("get", vec![Value::from("a")]).unwrap().repr(), "1");
        assert_eq!(
            call("get", vec![Value::from("z"), Value::Int(0)]).unwrap().repr(),
            "0"
        );
        assert_eq!(call("items", vec![]).unwrap().repr(), "[('a', 1)]");
        assert_eq!(call("pop", vec![Value::from("a")]).unwrap().repr(), "1");
        let err = call("pop", vec![Value::from("a")]).unwrap_err();
        assert_eq!(err.kind, "KeyError");
    }

    #[test]
    fn test_dict_update_from_pairs() {
        let mut dict = Dict::new();
        let pairs = Value::list(vec![Value::tuple(vec![Value::from("k"), Value::Int(1)])]);
        update_dict(&mut dict, &pairs).unwrap();
        assert_eq!(dict.len(), 1);
        let bad = Value::list(vec![Value::tuple(vec![Value::Int(1)])]);
        assert!(update_dict(&mut dict, &bad).is_err());
    }
}
