//! Syntax tree for guest scripts.
//!
//! The same types describe both the parsed program and the lowered program
//! handed to the runtime; lowering only rewrites nodes in place.

use std::rc::Rc;

/// Source position of a statement, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    Literal(String),
    Field { value: Expr, conversion: Option<char> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: Target,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FString(Vec<FStringPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda {
        params: Vec<Param>,
        body: Rc<Expr>,
    },
    ListComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
    },
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    /// Builds a plain positional call of the global `callee`.
    pub fn call(callee: &str, args: Vec<Expr>) -> Self {
        Expr::Call {
            func: Box::new(Expr::name(callee)),
            args,
            keywords: Vec::new(),
        }
    }

    /// Height of the expression tree; a leaf is 1.
    pub fn depth(&self) -> usize {
        fn deepest<'a>(exprs: impl IntoIterator<Item = &'a Expr>) -> usize {
            exprs.into_iter().map(Expr::depth).max().unwrap_or(0)
        }
        fn comprehension(generators: &[Comprehension]) -> usize {
            deepest(generators.iter().flat_map(|g| std::iter::once(&g.iter).chain(&g.ifs)))
        }

        let inner = match self {
            Expr::None
            | Expr::Bool(_)
            | Expr::Int(_)
            | Expr::Float(_)
            | Expr::Str(_)
            | Expr::Name(_) => 0,
            Expr::FString(parts) => deepest(parts.iter().filter_map(|part| match part {
                FStringPart::Field { value, .. } => Some(value),
                FStringPart::Literal(_) => None,
            })),
            Expr::List(items) | Expr::Tuple(items) => deepest(items),
            Expr::Dict(entries) => deepest(entries.iter().flat_map(|(k, v)| [k, v])),
            Expr::Attribute { value, .. } => value.depth(),
            Expr::Subscript { value, index } => value.depth().max(index.depth()),
            Expr::Slice { lower, upper, step } => {
                deepest([lower, upper, step].into_iter().flatten().map(|b| &**b))
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => func
                .depth()
                .max(deepest(args))
                .max(deepest(keywords.iter().map(|(_, value)| value))),
            Expr::Unary { operand, .. } => operand.depth(),
            Expr::Binary { left, right, .. } | Expr::BoolOp { left, right, .. } => {
                left.depth().max(right.depth())
            }
            Expr::Compare { left, ops } => {
                left.depth().max(deepest(ops.iter().map(|(_, operand)| operand)))
            }
            Expr::IfExp { test, body, orelse } => {
                test.depth().max(body.depth()).max(orelse.depth())
            }
            Expr::Lambda { params, body } => body
                .depth()
                .max(deepest(params.iter().filter_map(|p| p.default.as_ref()))),
            Expr::ListComp {
                element,
                generators,
            } => element.depth().max(comprehension(generators)),
            Expr::DictComp {
                key,
                value,
                generators,
            } => key
                .depth()
                .max(value.depth())
                .max(comprehension(generators)),
        };
        inner + 1
    }
}

/// Left-hand side of an assignment, loop variable, or `del` operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Subscript { value: Expr, index: Expr },
    Attribute { value: Expr, attr: String },
    Sequence(Vec<Target>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub kind: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    FunctionDef {
        name: String,
        params: Vec<Param>,
        body: Rc<Vec<Stmt>>,
    },
    Return(Option<Expr>),
    Raise(Option<Expr>),
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    Delete(Vec<Target>),
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Import(Vec<String>),
    ImportFrom {
        module: String,
        names: Vec<String>,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Break,
    Continue,
    Pass,
}
