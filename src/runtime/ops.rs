//! Operators: arithmetic, bitwise, comparison, membership and identity.
//!
//! Integers are 64-bit; any result that does not fit raises `OverflowError`
//! instead of wrapping. `bool` takes part in arithmetic as `0`/`1`.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::compiler::ast::{BinOp, CmpOp, UnaryOp};

use super::exception::Exception;
use super::value::Value;

/// Nesting depth at which structural comparison gives up.
const MAX_COMPARE_DEPTH: usize = 200;

/// Largest sequence a repetition may produce.
pub(crate) const MAX_REPEAT_LEN: usize = 1 << 26;

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn to_float(num: Num) -> f64 {
    match num {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

/// 2**63, the first float above every `i64`.
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Orders an int against a float without rounding the int through `f64`.
fn compare_int_float(i: i64, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f >= TWO_POW_63 {
        return Some(Ordering::Less);
    }
    if f < -TWO_POW_63 {
        return Some(Ordering::Greater);
    }
    let whole = f.trunc();
    Some(i.cmp(&(whole as i64)).then_with(|| {
        // Same integer part: the fraction decides.
        0.0_f64
            .partial_cmp(&(f - whole))
            .unwrap_or(Ordering::Equal)
    }))
}

fn compare_nums(a: Num, b: Num) -> Option<Ordering> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
        (Num::Int(x), Num::Float(y)) => compare_int_float(x, y),
        (Num::Float(x), Num::Int(y)) => compare_int_float(y, x).map(Ordering::reverse),
        (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y),
    }
}

/// The `i64` equal to `f`, if there is one.
fn exact_int(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f)).then_some(f as i64)
}

fn unsupported(op: &str, left: &Value, right: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

/// Integer division rounding toward negative infinity.
pub fn floor_div(a: i64, b: i64) -> Result<i64, Exception> {
    if b == 0 {
        return Err(Exception::zero_division("integer division or modulo by zero"));
    }
    let quotient = a.checked_div(b).ok_or_else(Exception::overflow)?;
    let remainder = a.checked_rem(b).ok_or_else(Exception::overflow)?;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

/// Remainder taking the sign of the divisor.
pub fn floor_mod(a: i64, b: i64) -> Result<i64, Exception> {
    if b == 0 {
        return Err(Exception::zero_division("integer division or modulo by zero"));
    }
    let remainder = a.checked_rem(b).ok_or_else(Exception::overflow)?;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        Ok(remainder + b)
    } else {
        Ok(remainder)
    }
}

fn float_mod(a: f64, b: f64) -> Result<f64, Exception> {
    if b == 0.0 {
        return Err(Exception::zero_division("float modulo"));
    }
    let remainder = a % b;
    if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
        Ok(remainder + b)
    } else {
        Ok(remainder)
    }
}

fn int_pow(base: i64, exponent: i64) -> Result<Value, Exception> {
    if exponent < 0 {
        if base == 0 {
            return Err(Exception::zero_division(
                "0.0 cannot be raised to a negative power",
            ));
        }
        return Ok(Value::Float((base as f64).powf(exponent as f64)));
    }
    let result = match base {
        0 | 1 => Some(if exponent == 0 { 1 } else { base }),
        -1 => Some(if exponent % 2 == 0 { 1 } else { -1 }),
        _ => u32::try_from(exponent)
            .ok()
            .and_then(|e| base.checked_pow(e)),
    };
    result.map(Value::Int).ok_or_else(Exception::overflow)
}

fn float_pow(base: f64, exponent: f64) -> Result<Value, Exception> {
    if base == 0.0 && exponent < 0.0 {
        return Err(Exception::zero_division(
            "0.0 cannot be raised to a negative power",
        ));
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err(Exception::value_error("math domain error"));
    }
    Ok(Value::Float(base.powf(exponent)))
}

fn repeat<T: Clone>(items: &[T], count: i64) -> Result<Vec<T>, Exception> {
    let count = count.max(0) as usize;
    match items.len().checked_mul(count) {
        Some(total) if total <= MAX_REPEAT_LEN => {}
        _ => return Err(Exception::new("OverflowError", "repeated sequence is too long")),
    }
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend_from_slice(items);
    }
    Ok(out)
}

fn repeat_count(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

/// Applies a binary operator.
pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, Exception> {
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        return numeric(op, a, b, left, right);
    }

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::str(joined))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, seq, count) | (BinOp::Mul, count, seq) if repeat_count(count).is_some() => {
            let n = repeat_count(count).unwrap_or(0);
            match seq {
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    Ok(Value::str(repeat(chars.as_slice(), n)?.into_iter().collect::<String>()))
                }
                Value::List(items) => Ok(Value::list(repeat(items.borrow().as_slice(), n)?)),
                Value::Tuple(items) => Ok(Value::tuple(repeat(items.as_slice(), n)?)),
                _ => Err(unsupported(op.symbol(), left, right)),
            }
        }
        (BinOp::BitOr, Value::Dict(a), Value::Dict(b)) => {
            let mut merged = a.borrow().clone();
            for (key, value) in b.borrow().iter() {
                merged.insert(key.clone(), value.clone())?;
            }
            Ok(Value::dict(merged))
        }
        (BinOp::Mod, Value::Str(_), _) => Err(Exception::type_error(
            "printf-style string formatting is not supported; use f-strings",
        )),
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

fn numeric(op: BinOp, a: Num, b: Num, left: &Value, right: &Value) -> Result<Value, Exception> {
    let both_bool = matches!((left, right), (Value::Bool(_), Value::Bool(_)));

    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let checked = |result: Option<i64>| result.map(Value::Int).ok_or_else(Exception::overflow);
        return match op {
            BinOp::Add => checked(x.checked_add(y)),
            BinOp::Sub => checked(x.checked_sub(y)),
            BinOp::Mul => checked(x.checked_mul(y)),
            BinOp::Div => {
                if y == 0 {
                    Err(Exception::zero_division("division by zero"))
                } else {
                    Ok(Value::Float(x as f64 / y as f64))
                }
            }
            BinOp::FloorDiv => floor_div(x, y).map(Value::Int),
            BinOp::Mod => floor_mod(x, y).map(Value::Int),
            BinOp::Pow => int_pow(x, y),
            BinOp::BitAnd if both_bool => Ok(Value::Bool(x & y != 0)),
            BinOp::BitOr if both_bool => Ok(Value::Bool(x | y != 0)),
            BinOp::BitXor if both_bool => Ok(Value::Bool(x ^ y != 0)),
            BinOp::BitAnd => Ok(Value::Int(x & y)),
            BinOp::BitOr => Ok(Value::Int(x | y)),
            BinOp::BitXor => Ok(Value::Int(x ^ y)),
            BinOp::LShift => {
                if y < 0 {
                    return Err(Exception::value_error("negative shift count"));
                }
                if x == 0 {
                    return Ok(Value::Int(0));
                }
                let shifted = u32::try_from(y)
                    .ok()
                    .filter(|&s| s < 64)
                    .map(|s| x << s)
                    .filter(|&r| (r >> y) == x);
                checked(shifted)
            }
            BinOp::RShift => {
                if y < 0 {
                    return Err(Exception::value_error("negative shift count"));
                }
                Ok(Value::Int(if y >= 64 {
                    if x < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    x >> y
                }))
            }
        };
    }

    let (x, y) = (to_float(a), to_float(b));
    match op {
        BinOp::Add => Ok(Value::Float(x + y)),
        BinOp::Sub => Ok(Value::Float(x - y)),
        BinOp::Mul => Ok(Value::Float(x * y)),
        BinOp::Div => {
            if y == 0.0 {
                Err(Exception::zero_division("float division by zero"))
            } else {
                Ok(Value::Float(x / y))
            }
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                Err(Exception::zero_division("float floor division by zero"))
            } else {
                Ok(Value::Float((x / y).floor()))
            }
        }
        BinOp::Mod => float_mod(x, y).map(Value::Float),
        BinOp::Pow => float_pow(x, y),
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

/// Applies a unary operator.
pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value, Exception> {
    let bad = |symbol: &str| {
        Exception::type_error(format!(
            "bad operand type for unary {}: '{}'",
            symbol,
            operand.type_name()
        ))
    };
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg => match as_num(operand) {
            Some(Num::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(Exception::overflow),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => Err(bad("-")),
        },
        UnaryOp::Pos => match as_num(operand) {
            Some(Num::Int(i)) => Ok(Value::Int(i)),
            Some(Num::Float(f)) => Ok(Value::Float(f)),
            None => Err(bad("+")),
        },
        UnaryOp::Invert => match operand {
            Value::Int(i) => Ok(Value::Int(!i)),
            Value::Bool(b) => Ok(Value::Int(!(*b as i64))),
            _ => Err(bad("~")),
        },
    }
}

/// Structural equality.
pub fn equals(left: &Value, right: &Value) -> Result<bool, Exception> {
    equals_at(left, right, 0)
}

fn equals_at(left: &Value, right: &Value, depth: usize) -> Result<bool, Exception> {
    if depth > MAX_COMPARE_DEPTH {
        return Err(Exception::recursion());
    }
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        return Ok(compare_nums(a, b) == Some(Ordering::Equal));
    }
    let sequences = |a: &[Value], b: &[Value]| -> Result<bool, Exception> {
        if a.len() != b.len() {
            return Ok(false);
        }
        for (x, y) in a.iter().zip(b) {
            if !equals_at(x, y, depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    };
    match (left, right) {
        (Value::None, Value::None) | (Value::Unset, Value::Unset) => Ok(true),
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::List(a), Value::List(b)) => {
            if Rc::ptr_eq(a, b) {
                return Ok(true);
            }
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            sequences(a.as_slice(), b.as_slice())
        }
        (Value::Tuple(a), Value::Tuple(b)) => sequences(a.as_slice(), b.as_slice()),
        (Value::Dict(a), Value::Dict(b)) => {
            if Rc::ptr_eq(a, b) {
                return Ok(true);
            }
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            if a.len() != b.len() {
                return Ok(false);
            }
            for (key, value) in a.iter() {
                match b.get(key)? {
                    Some(other) if equals_at(value, &other, depth + 1)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (Value::Range(a), Value::Range(b)) => Ok(a == b),
        (Value::Slice(a), Value::Slice(b)) => Ok(a == b),
        _ => Ok(identical(left, right)),
    }
}

/// Identity as observed by `is`.
pub fn identical(left: &Value, right: &Value) -> bool {
    fn addr<T: ?Sized>(rc: &Rc<T>) -> *const () {
        Rc::as_ptr(rc) as *const ()
    }
    match (left, right) {
        (Value::None, Value::None) | (Value::Unset, Value::Unset) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
        (Value::HostFunction(a), Value::HostFunction(b)) => a.name == b.name,
        (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
        (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
        (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
        (Value::Host(a), Value::Host(b)) => addr(a) == addr(b),
        _ => false,
    }
}

/// Ordering used by `<`, `sorted`, `min` and `max`. `None` when the values
/// are unordered (NaN).
pub fn partial_order(left: &Value, right: &Value) -> Result<Option<Ordering>, Exception> {
    order_at(left, right, 0)
}

fn order_at(left: &Value, right: &Value, depth: usize) -> Result<Option<Ordering>, Exception> {
    if depth > MAX_COMPARE_DEPTH {
        return Err(Exception::recursion());
    }
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        return Ok(compare_nums(a, b));
    }
    let sequences = |a: &[Value], b: &[Value]| -> Result<Option<Ordering>, Exception> {
        for (x, y) in a.iter().zip(b) {
            if !equals_at(x, y, depth + 1)? {
                return order_at(x, y, depth + 1);
            }
        }
        Ok(Some(a.len().cmp(&b.len())))
    };
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            sequences(a.as_slice(), b.as_slice())
        }
        (Value::Tuple(a), Value::Tuple(b)) => sequences(a.as_slice(), b.as_slice()),
        _ => Err(Exception::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn ordering_holds(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Exception> {
    let ordering = partial_order(left, right).map_err(|err| {
        if err.kind == "TypeError" {
            Exception::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))
        } else {
            err
        }
    })?;
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::LtE => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::GtE => ordering != Ordering::Less,
        _ => false,
    })
}

/// Membership test behind `in`.
pub fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => {
            let items = items.borrow().clone();
            any_equal(&items, item)
        }
        Value::Tuple(items) => any_equal(items, item),
        Value::Dict(dict) => dict.borrow().contains_key(item),
        Value::Range(range) => {
            let target = match as_num(item) {
                Some(Num::Int(i)) => i,
                Some(Num::Float(f)) => match exact_int(f) {
                    Some(i) => i,
                    None => return Ok(false),
                },
                None => return Ok(false),
            };
            let offset = target as i128 - range.start as i128;
            let step = range.step as i128;
            let index = offset / step;
            Ok(offset % step == 0
                && usize::try_from(index).is_ok_and(|index| index < range.len()))
        }
        Value::Host(object) => match object.iterate() {
            Some(items) => any_equal(&items, item),
            None => Err(not_iterable_argument(container)),
        },
        _ => Err(not_iterable_argument(container)),
    }
}

fn not_iterable_argument(container: &Value) -> Exception {
    Exception::type_error(format!(
        "argument of type '{}' is not iterable",
        container.type_name()
    ))
}

fn any_equal(items: &[Value], item: &Value) -> Result<bool, Exception> {
    for candidate in items {
        if equals(candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evaluates one link of a comparison chain.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Exception> {
    match op {
        CmpOp::Eq => equals(left, right),
        CmpOp::NotEq => equals(left, right).map(|eq| !eq),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => ordering_holds(op, left, right),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Is => Ok(identical(left, right)),
        CmpOp::IsNot => Ok(!identical(left, right)),
    }
}
