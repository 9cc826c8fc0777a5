//! Guest values.
//!
//! Containers share structure through `Rc`/`RefCell`, so aliasing behaves the
//! way scripts expect (`b = a; b.append(1)` is visible through `a`). Values
//! never leave the thread that created them; the JSON boundary in
//! [`super::marshal`] is the only way in or out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::compiler::ast::{Expr, Stmt};

use super::exception::Exception;
use super::interpreter::Interpreter;
use super::scope::Env;

/// Containers nested deeper than this are rendered as `...`.
const MAX_REPR_DEPTH: usize = 200;

/// Native implementation of a safe builtin or guard.
pub type BuiltinFn = fn(&mut Interpreter, CallArgs) -> Result<Value, Exception>;

/// Function supplied by the embedding host.
pub type HostFn = Arc<dyn Fn(CallArgs) -> Result<Value, Exception> + Send + Sync>;

/// An object owned by the host and exposed to scripts.
///
/// Scripts only reach host objects through the guard primitives, so
/// sensitive attribute names are refused before any of these methods run.
pub trait HostObject: fmt::Debug {
    /// Name reported by error messages and matched by attribute policy globs.
    fn type_name(&self) -> &str;

    /// Plain data attribute, if the object has one called `name`.
    fn get_attribute(&self, _name: &str) -> Option<Value> {
        None
    }

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    fn call_method(&self, name: &str, _args: CallArgs) -> Result<Value, Exception> {
        Err(Exception::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            self.type_name(),
            name
        )))
    }

    /// Items produced when a script iterates the object; `None` if it is not
    /// iterable.
    fn iterate(&self) -> Option<Vec<Value>> {
        None
    }
}

#[derive(Clone)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

#[derive(Clone)]
pub struct HostFunction {
    pub name: Rc<str>,
    pub func: HostFn,
}

#[derive(Clone)]
pub enum FunctionBody {
    Block(Rc<Vec<Stmt>>),
    Lambda(Rc<Expr>),
}

/// A function defined by the script, closing over its defining scope.
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    /// Default values, evaluated once at definition time.
    pub defaults: Vec<Option<Value>>,
    pub body: FunctionBody,
    pub closure: Rc<Env>,
}

#[derive(Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            (self.stop as i128 - self.start as i128 + self.step as i128 - 1) / self.step as i128
        } else {
            (self.start as i128 - self.stop as i128 - self.step as i128 - 1) / (-(self.step as i128))
        };
        usize::try_from(span.max(0)).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item at `index`, which must be below `len()`; such items always
    /// lie between `start` and `stop`.
    pub fn get(&self, index: usize) -> i64 {
        let item = self.start as i128 + self.step as i128 * index as i128;
        item as i64
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> {
        let range = *self;
        (0..range.len()).map(move |i| range.get(i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
    pub step: Option<i64>,
}

impl Slice {
    /// Resolves the slice against a sequence of `len` items, returning the
    /// selected indices in order.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>, Exception> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(Exception::value_error("slice step cannot be zero"));
        }
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let clamp = |bound: Option<i64>, default: i64, low: i64, high: i64| match bound {
            None => default,
            Some(b) if b < 0 => b.saturating_add(len).max(low),
            Some(b) => b.min(high),
        };

        let mut out = Vec::new();
        if step > 0 {
            let start = clamp(self.lower, 0, 0, len);
            let stop = clamp(self.upper, len, 0, len);
            let mut i = start;
            while i < stop {
                out.push(i as usize);
                match i.checked_add(step) {
                    Some(next) => i = next,
                    None => break,
                }
            }
        } else {
            let start = clamp(self.lower, len - 1, -1, len - 1);
            let stop = clamp(self.upper, -1, -1, len - 1);
            let mut i = start;
            while i > stop {
                out.push(i as usize);
                match i.checked_add(step) {
                    Some(next) => i = next,
                    None => break,
                }
            }
        }
        Ok(out)
    }
}

/// Key used for dict lookups. Equal numbers hash alike across bool, int
/// and integral floats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
}

impl HashKey {
    pub fn from_value(value: &Value) -> Result<Self, Exception> {
        Ok(match value {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(*b as i64),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    HashKey::Int(*f as i64)
                } else {
                    HashKey::Float(f.to_bits())
                }
            }
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => HashKey::Tuple(
                items
                    .iter()
                    .map(HashKey::from_value)
                    .collect::<Result<_, _>>()?,
            ),
            other => {
                return Err(Exception::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }
}

/// Insertion-ordered dictionary.
#[derive(Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, Exception> {
        let hashed = HashKey::from_value(key)?;
        Ok(self.index.get(&hashed).map(|&i| self.entries[i].1.clone()))
    }

    pub fn contains_key(&self, key: &Value) -> Result<bool, Exception> {
        Ok(self.index.contains_key(&HashKey::from_value(key)?))
    }

    /// Inserts or overwrites; an existing key keeps its position.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), Exception> {
        let hashed = HashKey::from_value(&key)?;
        match self.index.get(&hashed) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hashed, self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> Result<Option<Value>, Exception> {
        let hashed = HashKey::from_value(key)?;
        let Some(position) = self.index.remove(&hashed) else {
            return Ok(None);
        };
        let (_, value) = self.entries.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Ok(Some(value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

/// Positional and keyword arguments of a call.
#[derive(Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    /// Removes and returns the keyword argument `name`.
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let position = self.keywords.iter().position(|(k, _)| k == name)?;
        Some(self.keywords.remove(position).1)
    }

    /// Fails unless the call has between `min` and `max` positional
    /// arguments and no keyword arguments left unconsumed.
    pub fn check(&self, name: &str, min: usize, max: usize) -> Result<(), Exception> {
        if let Some((keyword, _)) = self.keywords.first() {
            return Err(Exception::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, keyword
            )));
        }
        let count = self.positional.len();
        if count < min || count > max {
            let expected = if min == max {
                format!("exactly {}", min)
            } else if count < min {
                format!("at least {}", min)
            } else {
                format!("at most {}", max)
            };
            return Err(Exception::type_error(format!(
                "{}() takes {} argument{} ({} given)",
                name,
                expected,
                if min == max && min == 1 { "" } else { "s" },
                count
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub enum Value {
    None,
    /// Initial value of `result`; means "the script produced nothing".
    Unset,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Range(Range),
    Slice(Slice),
    Function(Rc<Function>),
    Builtin(Builtin),
    HostFunction(HostFunction),
    BoundMethod(Rc<BoundMethod>),
    ExceptionType(&'static str),
    Exception(Rc<Exception>),
    Host(Rc<dyn HostObject>),
}

impl Value {
    pub fn str(text: impl Into<Rc<str>>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(dict: Dict) -> Self {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn host(object: impl HostObject + 'static) -> Self {
        Value::Host(Rc::new(object))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Unset => "unset",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range(_) => "range",
            Value::Slice(_) => "slice",
            Value::Function(_) => "function",
            Value::Builtin(_) | Value::HostFunction(_) => "builtin_function_or_method",
            Value::BoundMethod(_) => "method",
            Value::ExceptionType(_) => "type",
            Value::Exception(exc) => exc.kind.as_str(),
            Value::Host(object) => object.type_name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None | Value::Unset => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(dict) => !dict.borrow().is_empty(),
            Value::Range(range) => !range.is_empty(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::HostFunction(_)
                | Value::BoundMethod(_)
                | Value::ExceptionType(_)
        )
    }

    /// Text produced by `str(value)` and `print`.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(exc) => exc.message.clone(),
            other => other.repr(),
        }
    }

    /// Text produced by `repr(value)`.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        let mut seen = Vec::new();
        self.write_repr(&mut out, &mut seen, 0);
        out
    }

    fn write_repr(&self, out: &mut String, seen: &mut Vec<usize>, depth: usize) {
        if depth > MAX_REPR_DEPTH {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Unset => out.push_str("<unset>"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&quote_str(s)),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                if seen.contains(&id) {
                    out.push_str("[...]");
                    return;
                }
                seen.push(id);
                out.push('[');
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, seen, depth + 1);
                }
                out.push(']');
                seen.pop();
            }
            Value::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, seen, depth + 1);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(dict) => {
                let id = Rc::as_ptr(dict) as *const () as usize;
                if seen.contains(&id) {
                    out.push_str("{...}");
                    return;
                }
                seen.push(id);
                out.push('{');
                for (i, (key, value)) in dict.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.write_repr(out, seen, depth + 1);
                    out.push_str(": ");
                    value.write_repr(out, seen, depth + 1);
                }
                out.push('}');
                seen.pop();
            }
            Value::Range(range) => {
                if range.step == 1 {
                    out.push_str(&format!("range({}, {})", range.start, range.stop));
                } else {
                    out.push_str(&format!(
                        "range({}, {}, {})",
                        range.start, range.stop, range.step
                    ));
                }
            }
            Value::Slice(slice) => {
                let part = |bound: Option<i64>| bound.map_or("None".to_string(), |b| b.to_string());
                out.push_str(&format!(
                    "slice({}, {}, {})",
                    part(slice.lower),
                    part(slice.upper),
                    part(slice.step)
                ));
            }
            Value::Function(function) => {
                out.push_str(&format!("<function {}>", function.name))
            }
            Value::Builtin(builtin) => {
                out.push_str(&format!("<built-in function {}>", builtin.name))
            }
            Value::HostFunction(function) => {
                out.push_str(&format!("<built-in function {}>", function.name))
            }
            Value::BoundMethod(method) => out.push_str(&format!(
                "<built-in method {} of {} object>",
                method.name,
                method.receiver.type_name()
            )),
            Value::ExceptionType(name) => out.push_str(&format!("<class '{}'>", name)),
            Value::Exception(exc) => {
                out.push_str(&format!("{}({})", exc.kind, quote_str(&exc.message)))
            }
            Value::Host(object) => out.push_str(&format!("<{} object>", object.type_name())),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::str(value)
    }
}

/// Formats a float the way Python's `repr` does: shortest round-trip
/// digits, always with a decimal point or exponent.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let scientific = format!("{:e}", value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    }

    let plain = value.to_string();
    if plain.contains('.') {
        plain
    } else {
        format!("{}.0", plain)
    }
}

/// Quotes a string like Python's `repr`.
pub fn quote_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(123456.0), "123456.0");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn test_string_repr_quoting() {
        assert_eq!(quote_str("abc"), "'abc'");
        assert_eq!(quote_str("it's"), "\"it's\"");
        assert_eq!(quote_str("a\nb"), "'a\\nb'");
    }

    #[test]
    fn test_container_repr() {
        let mut dict = Dict::new();
        dict.insert(Value::from("a"), Value::list(vec![Value::Int(1), Value::None]))
            .unwrap();
        dict.insert(Value::Int(2), Value::tuple(vec![Value::Bool(true)]))
            .unwrap();
        assert_eq!(
            Value::dict(dict).repr(),
            "{'a': [1, None], 2: (True,)}"
        );
    }

    #[test]
    fn test_cyclic_list_repr() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(list.repr(), "[1, [...]]");
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_dict_preserves_order_and_overwrites_in_place() {
        let mut dict = Dict::new();
        dict.insert(Value::from("b"), Value::Int(1)).unwrap();
        dict.insert(Value::from("a"), Value::Int(2)).unwrap();
        dict.insert(Value::from("b"), Value::Int(3)).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(Value::dict(dict).repr(), "{'b': 3, 'a': 2}");
    }

    #[test]
    fn test_dict_numeric_keys_unify() {
        let mut dict = Dict::new();
        dict.insert(Value::Int(1), Value::from("int")).unwrap();
        assert!(dict.contains_key(&Value::Float(1.0)).unwrap());
        assert!(dict.contains_key(&Value::Bool(true)).unwrap());
    }

    #[test]
    fn test_dict_remove_reindexes() {
        let mut dict = Dict::new();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            dict.insert(Value::from(*key), Value::Int(i as i64)).unwrap();
        }
        assert!(dict.remove(&Value::from("a")).unwrap().is_some());
        assert_eq!(dict.get(&Value::from("c")).unwrap().unwrap().repr(), "2");
    }

    #[test]
    fn test_unhashable_key() {
        let mut dict = Dict::new();
        let err = dict.insert(Value::list(vec![]), Value::None).unwrap_err();
        assert_eq!(err.kind, "TypeError");
        assert!(err.message.contains("unhashable type: 'list'"));
    }

    #[test]
    fn test_range_len() {
        assert_eq!(Range { start: 0, stop: 5, step: 1 }.len(), 5);
        assert_eq!(Range { start: 5, stop: 0, step: -2 }.len(), 3);
        assert_eq!(Range { start: 5, stop: 0, step: 1 }.len(), 0);
    }

    #[test]
    fn test_range_at_integer_bounds() {
        let full = Range {
            start: i64::MIN,
            stop: i64::MAX,
            step: 1,
        };
        assert_eq!(full.len(), u64::MAX as usize);
        assert_eq!(full.get(full.len() - 1), i64::MAX - 1);

        let coarse = Range {
            start: i64::MIN,
            stop: i64::MAX,
            step: 1 << 62,
        };
        assert_eq!(
            coarse.iter().collect::<Vec<_>>(),
            vec![i64::MIN, -(1 << 62), 0, 1 << 62]
        );

        let negative = Range {
            start: i64::MIN,
            stop: 0,
            step: 1,
        };
        assert_eq!(negative.get(negative.len() - 1), -1);
    }

    #[test]
    fn test_slice_with_huge_step_stops() {
        let slice = Slice {
            lower: Some(1),
            upper: None,
            step: Some(i64::MAX),
        };
        assert_eq!(slice.indices(5).unwrap(), vec![1]);
        let reverse = Slice {
            lower: None,
            upper: Some(i64::MIN),
            step: Some(i64::MIN),
        };
        assert_eq!(reverse.indices(3).unwrap(), vec![2]);
    }

    #[test]
    fn test_slice_indices() {
        let slice = Slice {
            lower: Some(1),
            upper: Some(-1),
            step: None,
        };
        assert_eq!(slice.indices(5).unwrap(), vec![1, 2, 3]);
        let reverse = Slice {
            lower: None,
            upper: None,
            step: Some(-1),
        };
        assert_eq!(reverse.indices(3).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::Unset.truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::list(vec![Value::None]).truthy());
        assert!(!Value::Float(0.0).truthy());
    }

    #[test]
    fn test_call_args_check() {
        let args = CallArgs::new(vec![Value::Int(1)]);
        assert!(args.check("len", 1, 1).is_ok());
        let err = args.check("pow", 2, 3).unwrap_err();
        assert_eq!(err.message, "pow() takes at least 2 arguments (1 given)");
    }
}
