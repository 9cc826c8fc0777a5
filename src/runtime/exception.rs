//! Guest exceptions and the fixed exception hierarchy.

use std::fmt;

/// Builtin exception types as `(name, parent)`. The root has no parent.
const HIERARCHY: &[(&str, Option<&str>)] = &[
    ("Exception", None),
    ("ArithmeticError", Some("Exception")),
    ("ZeroDivisionError", Some("ArithmeticError")),
    ("OverflowError", Some("ArithmeticError")),
    ("LookupError", Some("Exception")),
    ("KeyError", Some("LookupError")),
    ("IndexError", Some("LookupError")),
    ("AssertionError", Some("Exception")),
    ("AttributeError", Some("Exception")),
    ("NameError", Some("Exception")),
    ("RuntimeError", Some("Exception")),
    ("RecursionError", Some("RuntimeError")),
    ("TypeError", Some("Exception")),
    ("ValueError", Some("Exception")),
];

/// Names of every builtin exception type, root first.
pub fn builtin_exception_types() -> impl Iterator<Item = &'static str> {
    HIERARCHY.iter().map(|(name, _)| *name)
}

/// Returns the `'static` name of a builtin exception type.
pub fn lookup_type(name: &str) -> Option<&'static str> {
    HIERARCHY
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(candidate, _)| *candidate)
}

fn parent_of(kind: &str) -> Option<&'static str> {
    match HIERARCHY.iter().find(|(name, _)| *name == kind) {
        Some((_, parent)) => *parent,
        // Kinds raised by host functions hang directly off the root.
        None => Some("Exception"),
    }
}

/// True when an exception of `kind` is caught by a handler for `ancestor`.
pub fn is_subtype(kind: &str, ancestor: &str) -> bool {
    let mut current = Some(kind);
    let mut steps = 0;
    while let Some(name) = current {
        if name == ancestor {
            return true;
        }
        steps += 1;
        if steps > HIERARCHY.len() + 1 {
            break;
        }
        current = parent_of(name);
    }
    false
}

/// A raised guest exception.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    /// Line of the statement that raised it, filled in while unwinding.
    pub line: Option<usize>,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            line: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new("IndexError", message)
    }

    /// `message` should already be the repr of the missing key.
    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{}' is not defined", name))
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new("ZeroDivisionError", message)
    }

    pub fn overflow() -> Self {
        Self::new("OverflowError", "integer arithmetic overflowed 64 bits")
    }

    pub fn recursion() -> Self {
        Self::new("RecursionError", "maximum recursion depth exceeded")
    }

    pub fn with_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}
