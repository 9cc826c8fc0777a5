//! The safe builtin set.
//!
//! Everything here operates on guest values only. Nothing reaches the
//! filesystem, the network, the process or the interpreter's own internals.

use std::cmp::Ordering;

use crate::compiler::ast::{BinOp, CmpOp};

use super::exception::{self, Exception};
use super::guards;
use super::interpreter::Interpreter;
use super::methods::update_dict;
use super::ops;
use super::value::{Builtin, BuiltinFn, CallArgs, Dict, Range, Value};

/// Name constants bound alongside the functions.
const CONSTANTS: &[&str] = &["None", "True", "False"];

const SAFE_BUILTINS: &[(&str, BuiltinFn)] = &[
    ("abs", builtin_abs),
    ("all", builtin_all),
    ("any", builtin_any),
    ("bool", builtin_bool),
    ("dict", builtin_dict),
    ("divmod", builtin_divmod),
    ("enumerate", builtin_enumerate),
    ("filter", builtin_filter),
    ("float", builtin_float),
    ("int", builtin_int),
    ("isinstance", builtin_isinstance),
    ("len", builtin_len),
    ("list", builtin_list),
    ("map", builtin_map),
    ("max", builtin_max),
    ("min", builtin_min),
    ("pow", builtin_pow),
    ("print", builtin_print),
    ("range", builtin_range),
    ("repr", builtin_repr),
    ("reversed", builtin_reversed),
    ("round", builtin_round),
    ("sorted", builtin_sorted),
    ("str", builtin_str),
    ("sum", builtin_sum),
    ("tuple", builtin_tuple),
    ("zip", builtin_zip),
];

/// Every name the builtin set can provide.
pub fn names() -> impl Iterator<Item = &'static str> {
    CONSTANTS
        .iter()
        .copied()
        .chain(SAFE_BUILTINS.iter().map(|(name, _)| *name))
}

pub fn lookup(name: &str) -> Option<Value> {
    match name {
        "None" => return Some(Value::None),
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        _ => {}
    }
    SAFE_BUILTINS
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(name, func)| {
            Value::Builtin(Builtin {
                name: *name,
                func: *func,
            })
        })
}

/// Stable sort with a fallible comparison, optionally through a key
/// function.
///
/// Uses a merge sort so an exception raised mid-comparison aborts cleanly
/// and equal elements keep their order, also when `reverse` is set.
pub fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Result<Vec<Value>, Exception> {
    let keyed: Vec<(Value, Value)> = match key {
        Some(func) => items
            .into_iter()
            .map(|item| Ok((interp.call(func, CallArgs::new(vec![item.clone()]))?, item)))
            .collect::<Result<_, Exception>>()?,
        None => items.into_iter().map(|item| (item.clone(), item)).collect(),
    };
    let sorted = merge_sort(keyed, &mut |a: &Value, b: &Value| {
        let ordering = order(a, b)?;
        Ok(if reverse { ordering.reverse() } else { ordering })
    })?;
    Ok(sorted.into_iter().map(|(_, item)| item).collect())
}

fn order(a: &Value, b: &Value) -> Result<Ordering, Exception> {
    if ops::compare(CmpOp::Lt, a, b)? {
        Ok(Ordering::Less)
    } else if ops::compare(CmpOp::Lt, b, a)? {
        Ok(Ordering::Greater)
    } else {
        Ok(Ordering::Equal)
    }
}

type Compare<'a> = dyn FnMut(&Value, &Value) -> Result<Ordering, Exception> + 'a;

fn merge_sort(
    mut items: Vec<(Value, Value)>,
    cmp: &mut Compare<'_>,
) -> Result<Vec<(Value, Value)>, Exception> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, cmp)?;
    let right = merge_sort(right, cmp)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        // Take from the right only when strictly smaller, for stability.
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => cmp(&r.0, &l.0)? == Ordering::Less,
            _ => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn one_iterable(args: &CallArgs, name: &str) -> Result<Vec<Value>, Exception> {
    args.check(name, 1, 1)?;
    guards::iterate(&args.positional[0])
}

fn builtin_abs(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("abs", 1, 1)?;
    match &args.positional[0] {
        Value::Int(i) => i.checked_abs().map(Value::Int).ok_or_else(Exception::overflow),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(Exception::type_error(format!(
            "bad operand type for abs(): '{}'",
            other.type_name()
        ))),
    }
}

fn builtin_all(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    Ok(Value::Bool(one_iterable(&args, "all")?.iter().all(Value::truthy)))
}

fn builtin_any(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    Ok(Value::Bool(one_iterable(&args, "any")?.iter().any(Value::truthy)))
}

fn builtin_bool(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("bool", 0, 1)?;
    Ok(Value::Bool(args.positional.first().is_some_and(Value::truthy)))
}

fn builtin_dict(_interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    let keywords = std::mem::take(&mut args.keywords);
    args.check("dict", 0, 1)?;
    let mut dict = Dict::new();
    if let Some(source) = args.positional.first() {
        update_dict(&mut dict, source)?;
    }
    for (key, value) in keywords {
        dict.insert(Value::from(key), value)?;
    }
    Ok(Value::dict(dict))
}

fn builtin_divmod(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("divmod", 2, 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    Ok(Value::tuple(vec![
        ops::binary(BinOp::FloorDiv, a, b)?,
        ops::binary(BinOp::Mod, a, b)?,
    ]))
}

fn builtin_enumerate(_interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    let start = args.take_keyword("start");
    args.check("enumerate", 1, 2)?;
    let start = match args.positional.get(1).or(start.as_ref()) {
        Some(value) => guards::as_index(value, "enumerate start")?,
        None => 0,
    };
    let items = guards::iterate(&args.positional[0])?;
    let mut pairs = Vec::with_capacity(items.len());
    for (offset, item) in items.into_iter().enumerate() {
        let index = start
            .checked_add(offset as i64)
            .ok_or_else(Exception::overflow)?;
        pairs.push(Value::tuple(vec![Value::Int(index), item]));
    }
    Ok(Value::list(pairs))
}

fn builtin_filter(interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("filter", 2, 2)?;
    let func = &args.positional[0];
    let mut kept = Vec::new();
    for item in guards::iterate(&args.positional[1])? {
        let keep = match func {
            Value::None => item.truthy(),
            func => interp.call(func, CallArgs::new(vec![item.clone()]))?.truthy(),
        };
        if keep {
            kept.push(item);
        }
    }
    Ok(Value::list(kept))
}

fn parse_float(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let unsigned = trimmed.trim_start_matches(['+', '-']);
    let special = matches!(
        unsigned.to_ascii_lowercase().as_str(),
        "inf" | "infinity" | "nan"
    );
    if !special && !unsigned.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    trimmed.replace('_', "").parse().ok()
}

fn builtin_float(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("float", 0, 1)?;
    let Some(value) = args.positional.first() else {
        return Ok(Value::Float(0.0));
    };
    match value {
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::Str(text) => parse_float(text).map(Value::Float).ok_or_else(|| {
            Exception::value_error(format!(
                "could not convert string to float: {}",
                value.repr()
            ))
        }),
        other => Err(Exception::type_error(format!(
            "float() argument must be a string or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn parse_int(text: &str, base: u32) -> Option<i64> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lowered = digits.to_ascii_lowercase();
    let lowered = lowered.as_str();
    let digits = match base {
        16 => lowered.strip_prefix("0x").unwrap_or(lowered),
        8 => lowered.strip_prefix("0o").unwrap_or(lowered),
        2 => lowered.strip_prefix("0b").unwrap_or(lowered),
        _ => lowered,
    };
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__")
    {
        return None;
    }
    let magnitude = i128::from_str_radix(&digits.replace('_', ""), base).ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

fn builtin_int(_interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    let base = args.take_keyword("base");
    args.check("int", 0, 2)?;
    let base = match args.positional.get(1).or(base.as_ref()) {
        Some(value) => Some(guards::as_index(value, "int base")?),
        None => None,
    };
    let Some(value) = args.positional.first() else {
        return Ok(Value::Int(0));
    };

    if let Some(base) = base {
        let Value::Str(text) = value else {
            return Err(Exception::type_error(
                "int() can't convert non-string with explicit base",
            ));
        };
        if !(2..=36).contains(&base) {
            return Err(Exception::value_error("int() base must be >= 2 and <= 36"));
        }
        return parse_int(text, base as u32).map(Value::Int).ok_or_else(|| {
            Exception::value_error(format!(
                "invalid literal for int() with base {}: {}",
                base,
                value.repr()
            ))
        });
    }

    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => float_to_int(*f),
        Value::Str(text) => parse_int(text, 10).map(Value::Int).ok_or_else(|| {
            Exception::value_error(format!(
                "invalid literal for int() with base 10: {}",
                value.repr()
            ))
        }),
        other => Err(Exception::type_error(format!(
            "int() argument must be a string or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn float_to_int(f: f64) -> Result<Value, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            "OverflowError",
            "cannot convert float infinity to integer",
        ));
    }
    let truncated = f.trunc();
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(Exception::overflow());
    }
    Ok(Value::Int(truncated as i64))
}

fn matches_class(value: &Value, class: &Value) -> Result<bool, Exception> {
    match class {
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if matches_class(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::ExceptionType(ancestor) => Ok(match value {
            Value::Exception(exc) => exception::is_subtype(&exc.kind, ancestor),
            _ => false,
        }),
        Value::Builtin(builtin) => Ok(match builtin.name {
            "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
            "bool" => matches!(value, Value::Bool(_)),
            "float" => matches!(value, Value::Float(_)),
            "str" => matches!(value, Value::Str(_)),
            "list" => matches!(value, Value::List(_)),
            "tuple" => matches!(value, Value::Tuple(_)),
            "dict" => matches!(value, Value::Dict(_)),
            _ => return Err(not_a_type()),
        }),
        _ => Err(not_a_type()),
    }
}

fn not_a_type() -> Exception {
    Exception::type_error("isinstance() arg 2 must be a type or tuple of types")
}

fn builtin_isinstance(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("isinstance", 2, 2)?;
    Ok(Value::Bool(matches_class(
        &args.positional[0],
        &args.positional[1],
    )?))
}

fn builtin_len(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("len", 1, 1)?;
    let len = match &args.positional[0] {
        Value::Str(text) => text.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(dict) => dict.borrow().len(),
        Value::Range(range) => range.len(),
        other => {
            return Err(Exception::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    i64::try_from(len).map(Value::Int).map_err(|_| {
        Exception::new(
            "OverflowError",
            "Python int too large to convert to C ssize_t",
        )
    })
}

fn builtin_list(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("list", 0, 1)?;
    match args.positional.first() {
        Some(value) => Ok(Value::list(guards::iterate(value)?)),
        None => Ok(Value::list(Vec::new())),
    }
}

fn builtin_map(interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    args.check("map", 2, usize::MAX)?;
    let func = args.positional.remove(0);
    let columns = args
        .positional
        .iter()
        .map(guards::iterate)
        .collect::<Result<Vec<_>, _>>()?;
    let len = columns.iter().map(Vec::len).min().unwrap_or(0);
    let mut mapped = Vec::with_capacity(len);
    for row in 0..len {
        let call_args = columns.iter().map(|column| column[row].clone()).collect();
        mapped.push(interp.call(&func, CallArgs::new(call_args))?);
    }
    Ok(Value::list(mapped))
}

fn extremum(
    interp: &mut Interpreter,
    mut args: CallArgs,
    name: &str,
    wanted: CmpOp,
) -> Result<Value, Exception> {
    let key = args.take_keyword("key").filter(|k| !matches!(k, Value::None));
    let default = args.take_keyword("default");
    args.check(name, 1, usize::MAX)?;

    let candidates = if args.positional.len() == 1 {
        guards::iterate(&args.positional[0])?
    } else {
        if default.is_some() {
            return Err(Exception::type_error(format!(
                "Cannot specify a default for {}() with multiple positional arguments",
                name
            )));
        }
        args.positional
    };

    let mut best: Option<(Value, Value)> = None;
    for item in candidates {
        let rank = match &key {
            Some(func) => interp.call(func, CallArgs::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let better = match &best {
            Some((best_rank, _)) => ops::compare(wanted, &rank, best_rank)?,
            None => true,
        };
        if better {
            best = Some((rank, item));
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Exception::value_error(format!(
            "{}() arg is an empty sequence",
            name
        ))),
    }
}

fn builtin_max(interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    extremum(interp, args, "max", CmpOp::Gt)
}

fn builtin_min(interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    extremum(interp, args, "min", CmpOp::Lt)
}

fn modular_pow(base: i64, exp: i64, modulus: i64) -> Result<Value, Exception> {
    if exp < 0 {
        return Err(Exception::value_error(
            "pow() 2nd argument cannot be negative when 3rd argument specified",
        ));
    }
    if modulus == 0 {
        return Err(Exception::value_error("pow() 3rd argument cannot be 0"));
    }
    let m = modulus as i128;
    let mut result: i128 = 1 % m.abs();
    let mut base = (base as i128).rem_euclid(m.abs());
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % m.abs();
        }
        base = base * base % m.abs();
        exp >>= 1;
    }
    // Python gives the result the sign of the modulus.
    if m < 0 && result != 0 {
        result += m;
    }
    Ok(Value::Int(result as i64))
}

fn builtin_pow(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("pow", 2, 3)?;
    let (base, exp) = (&args.positional[0], &args.positional[1]);
    match args.positional.get(2) {
        None | Some(Value::None) => ops::binary(BinOp::Pow, base, exp),
        Some(modulus) => {
            let as_int = |value: &Value| match value {
                Value::Int(i) => Some(*i),
                Value::Bool(b) => Some(*b as i64),
                _ => None,
            };
            match (as_int(base), as_int(exp), as_int(modulus)) {
                (Some(b), Some(e), Some(m)) => modular_pow(b, e, m),
                _ => Err(Exception::type_error(
                    "pow() 3rd argument not allowed unless all arguments are integers",
                )),
            }
        }
    }
}

fn builtin_print(interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    let separator = |value: Option<Value>, default: &str, what: &str| match value {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(Exception::type_error(format!(
            "{} must be None or a string, not {}",
            what,
            other.type_name()
        ))),
    };
    let sep = separator(args.take_keyword("sep"), " ", "sep")?;
    let end = separator(args.take_keyword("end"), "\n", "end")?;
    args.check("print", 0, usize::MAX)?;

    let line = args
        .positional
        .iter()
        .map(Value::to_str)
        .collect::<Vec<_>>()
        .join(&sep);
    interp.write_output(&line);
    interp.write_output(&end);
    Ok(Value::None)
}

fn builtin_range(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("range", 1, 3)?;
    let bounds = args
        .positional
        .iter()
        .map(|value| match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(Exception::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity checked above"),
    };
    if step == 0 {
        return Err(Exception::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(Range { start, stop, step }))
}

fn builtin_repr(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("repr", 1, 1)?;
    Ok(Value::str(args.positional[0].repr()))
}

fn builtin_reversed(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("reversed", 1, 1)?;
    let value = &args.positional[0];
    match value {
        Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range(_) | Value::Dict(_) => {
            let mut items = guards::iterate(value)?;
            items.reverse();
            Ok(Value::list(items))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not reversible",
            other.type_name()
        ))),
    }
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

fn builtin_round(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("round", 1, 2)?;
    let digits = match args.positional.get(1) {
        None | Some(Value::None) => None,
        Some(value) => Some(guards::as_index(value, "round ndigits")?),
    };

    match (&args.positional[0], digits) {
        (Value::Int(i), None) => Ok(Value::Int(*i)),
        (Value::Bool(b), None) => Ok(Value::Int(*b as i64)),
        (Value::Int(i), Some(digits)) => {
            if digits >= 0 {
                return Ok(Value::Int(*i));
            }
            let Some(unit) = u32::try_from(-digits)
                .ok()
                .and_then(|exp| 10i64.checked_pow(exp))
            else {
                return Ok(Value::Int(0));
            };
            let quotient = round_half_even(*i as f64 / unit as f64) as i64;
            quotient
                .checked_mul(unit)
                .map(Value::Int)
                .ok_or_else(Exception::overflow)
        }
        (Value::Float(f), None) => float_to_int(round_half_even(*f)),
        (Value::Float(f), Some(digits)) => {
            if !f.is_finite() {
                return Ok(Value::Float(*f));
            }
            let digits = digits.clamp(-308, 308) as i32;
            let scale = 10f64.powi(digits);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(round_half_even(scaled) / scale))
        }
        (other, _) => Err(Exception::type_error(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

fn builtin_sorted(interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    let key = args.take_keyword("key").filter(|k| !matches!(k, Value::None));
    let reverse = args
        .take_keyword("reverse")
        .map(|r| r.truthy())
        .unwrap_or(false);
    let items = one_iterable(&args, "sorted")?;
    Ok(Value::list(sort_values(interp, items, key.as_ref(), reverse)?))
}

fn builtin_str(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("str", 0, 1)?;
    Ok(Value::str(
        args.positional.first().map(Value::to_str).unwrap_or_default(),
    ))
}

fn builtin_sum(_interp: &mut Interpreter, mut args: CallArgs) -> Result<Value, Exception> {
    let start = args.take_keyword("start");
    args.check("sum", 1, 2)?;
    let mut total = args
        .positional
        .get(1)
        .cloned()
        .or(start)
        .unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(Exception::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    for item in guards::iterate(&args.positional[0])? {
        total = ops::binary(BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn builtin_tuple(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("tuple", 0, 1)?;
    match args.positional.first() {
        Some(Value::Tuple(items)) => Ok(Value::Tuple(items.clone())),
        Some(value) => Ok(Value::tuple(guards::iterate(value)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

fn builtin_zip(_interp: &mut Interpreter, args: CallArgs) -> Result<Value, Exception> {
    args.check("zip", 0, usize::MAX)?;
    let columns = args
        .positional
        .iter()
        .map(guards::iterate)
        .collect::<Result<Vec<_>, _>>()?;
    let len = columns.iter().map(Vec::len).min().unwrap_or(0);
    let rows = (0..len)
        .map(|row| Value::tuple(columns.iter().map(|column| column[row].clone()).collect()))
        .collect();
    Ok(Value::list(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::guards::AttributePolicy;
    use crate::runtime::scope::Env;

    fn interp() -> Interpreter {
        Interpreter::new(AttributePolicy::default().shared(), Env::new_global())
    }

    fn call(name: &str, args: Vec<Value>) -> Result<Value, Exception> {
        let Some(Value::Builtin(builtin)) = lookup(name) else {
            panic!("{} is not a builtin", name);
        };
        (builtin.func)(&mut interp(), CallArgs::new(args))
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn test_names_cover_constants_and_functions() {
        let names: Vec<&str> = names().collect();
        assert!(names.contains(&"None"));
        assert!(names.contains(&"sorted"));
        assert!(!names.contains(&"open"));
        assert!(matches!(lookup("True"), Some(Value::Bool(true))));
        assert!(lookup("eval").is_none());
    }

    #[test]
    fn test_len_and_sum() {
        assert_eq!(call("len", vec![Value::from("héllo")]).unwrap().repr(), "5");
        assert_eq!(call("sum", vec![ints(&[1, 2, 3])]).unwrap().repr(), "6");
        assert_eq!(
            call("sum", vec![ints(&[1]), Value::Float(0.5)]).unwrap().repr(),
            "1.5"
        );
        assert!(call("len", vec![Value::Int(3)]).is_err());
        assert!(call("sum", vec![ints(&[]), Value::from("")]).is_err());
    }

    #[test]
    fn test_int_conversions() {
        assert_eq!(call("int", vec![Value::from(" 42 ")]).unwrap().repr(), "42");
        assert_eq!(call("int", vec![Value::Float(-3.9)]).unwrap().repr(), "-3");
        assert_eq!(
            call("int", vec![Value::from("ff"), Value::Int(16)]).unwrap().repr(),
            "255"
        );
        let err = call("int", vec![Value::from("abc")]).unwrap_err();
        assert_eq!(err.message, "invalid literal for int() with base 10: 'abc'");
        assert!(call("int", vec![Value::Float(f64::NAN)]).is_err());
    }

    #[test]
    fn test_float_conversions() {
        assert_eq!(call("float", vec![Value::from("2.5")]).unwrap().repr(), "2.5");
        assert_eq!(call("float", vec![Value::from("-inf")]).unwrap().repr(), "-inf");
        assert!(call("float", vec![Value::from("abc")]).is_err());
        assert!(call("float", vec![Value::from("in")]).is_err());
    }

    #[test]
    fn test_round_ties_to_even() {
        assert_eq!(call("round", vec![Value::Float(2.5)]).unwrap().repr(), "2");
        assert_eq!(call("round", vec![Value::Float(3.5)]).unwrap().repr(), "4");
        assert_eq!(call("round", vec![Value::Float(-0.5)]).unwrap().repr(), "0");
        assert_eq!(
            call("round", vec![Value::Float(3.14159), Value::Int(2)])
                .unwrap()
                .repr(),
            "3.14"
        );
        assert_eq!(
            call("round", vec![Value::Int(1250), Value::Int(-2)]).unwrap().repr(),
            "1200"
        );
    }

    #[test]
    fn test_pow_modular() {
        assert_eq!(
            call("pow", vec![Value::Int(3), Value::Int(4), Value::Int(5)])
                .unwrap()
                .repr(),
            "1"
        );
        assert_eq!(
            call("pow", vec![Value::Int(2), Value::Int(3), Value::Int(-5)])
                .unwrap()
                .repr(),
            "-2"
        );
        assert!(call("pow", vec![Value::Int(2), Value::Int(3), Value::Int(0)]).is_err());
        assert_eq!(call("pow", vec![Value::Int(2), Value::Int(10)]).unwrap().repr(), "1024");
    }

    #[test]
    fn test_min_max() {
        assert_eq!(call("max", vec![ints(&[3, 9, 2])]).unwrap().repr(), "9");
        assert_eq!(
            call("min", vec![Value::Int(4), Value::Int(-1)]).unwrap().repr(),
            "-1"
        );
        let err = call("max", vec![ints(&[])]).unwrap_err();
        assert_eq!(err.message, "max() arg is an empty sequence");
        let err = call("max", vec![Value::list(vec![Value::Int(1), Value::from("a")])]).unwrap_err();
        assert_eq!(err.kind, "TypeError");
    }

    #[test]
    fn test_sorted_is_stable_and_reversible() {
        let mut args = CallArgs::new(vec![ints(&[3, 1, 2])]);
        args.keywords.push(("reverse".to_string(), Value::Bool(true)));
        let Some(Value::Builtin(sorted)) = lookup("sorted") else {
            panic!("sorted missing");
        };
        assert_eq!((sorted.func)(&mut interp(), args).unwrap().repr(), "[3, 2, 1]");

        let pairs = Value::list(vec![
            Value::tuple(vec![Value::Int(1), Value::from("b")]),
            Value::tuple(vec![Value::Int(0), Value::from("a")]),
        ]);
        assert_eq!(
            call("sorted", vec![pairs]).unwrap().repr(),
            "[(0, 'a'), (1, 'b')]"
        );
        assert!(call("sorted", vec![Value::list(vec![Value::Int(1), Value::None])]).is_err());
    }

    #[test]
    fn test_isinstance() {
        let int_type = lookup("int").unwrap();
        assert!(call("isinstance", vec![Value::Bool(true), int_type.clone()])
            .unwrap()
            .truthy());
        let either = Value::tuple(vec![lookup("str").unwrap(), lookup("list").unwrap()]);
        assert!(call("isinstance", vec![Value::from("x"), either]).unwrap().truthy());
        assert!(!call("isinstance", vec![Value::Float(1.0), int_type]).unwrap().truthy());
        let exc = Value::Exception(std::rc::Rc::new(Exception::key_error("'k'")));
        assert!(call("isinstance", vec![exc, Value::ExceptionType("LookupError")])
            .unwrap()
            .truthy());
        assert!(call("isinstance", vec![Value::Int(1), Value::Int(1)]).is_err());
    }

    #[test]
    fn test_range_validation() {
        assert_eq!(
            call("range", vec![Value::Int(1), Value::Int(4)]).unwrap().repr(),
            "range(1, 4)"
        );
        let err = call("range", vec![Value::Int(0), Value::Int(4), Value::Int(0)]).unwrap_err();
        assert_eq!(err.kind, "ValueError");
        assert!(call("range", vec![Value::Float(1.0)]).is_err());
    }

    #[test]
    fn test_len_of_huge_range_overflows() {
        let full = call("range", vec![Value::Int(i64::MIN), Value::Int(i64::MAX)]).unwrap();
        let err = call("len", vec![full]).unwrap_err();
        assert_eq!(err.kind, "OverflowError");

        let half = call("range", vec![Value::Int(i64::MIN), Value::Int(-1)]).unwrap();
        assert_eq!(call("len", vec![half]).unwrap().repr(), i64::MAX.to_string());
    }

    #[test]
    fn test_zip_enumerate_divmod() {
        assert_eq!(
            call("zip", vec![ints(&[1, 2, 3]), Value::from("ab")]).unwrap().repr(),
            "[(1, 'a'), (2, 'b')]"
        );
        assert_eq!(
            call("enumerate", vec![Value::from("ab"), Value::Int(1)])
                .unwrap()
                .repr(),
            "[(1, 'a'), (2, 'b')]"
        );
        assert_eq!(
            call("divmod", vec![Value::Int(-7), Value::Int(2)]).unwrap().repr(),
            "(-4, 1)"
        );
    }

    #[test]
    fn test_print_captures_output() {
        let mut interp = interp();
        let Some(Value::Builtin(print)) = lookup("print") else {
            panic!("print missing");
        };
        let mut args = CallArgs::new(vec![Value::from("a"), Value::Int(1)]);
        args.keywords.push(("sep".to_string(), Value::from("-")));
        (print.func)(&mut interp, args).unwrap();
        assert_eq!(interp.take_output(), "a-1\n");
    }

    #[test]
    fn test_dict_constructor() {
        let pairs = Value::list(vec![Value::tuple(vec![Value::from("a"), Value::Int(1)])]);
        let mut args = CallArgs::new(vec![pairs]);
        args.keywords.push(("b".to_string(), Value::Int(2)));
        let Some(Value::Builtin(dict)) = lookup("dict") else {
            panic!("dict missing");
        };
        assert_eq!(
            (dict.func)(&mut interp(), args).unwrap().repr(),
            "{'a': 1, 'b': 2}"
        );
    }
}
