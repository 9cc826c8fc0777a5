//! Restriction pass.
//!
//! Walks the parsed tree once, refusing constructs the sandbox cannot allow
//! and lowering the ones it guards:
//!
//! | source                    | lowered                                      |
//! |---------------------------|----------------------------------------------|
//! | `obj.name`                | `_getattr_(obj, "name")`                     |
//! | `obj[key]` (read)         | `_getitem_(obj, key)`                        |
//! | `for x in it`             | `for x in _getiter_(it)`                     |
//! | `for a, (b, c) in it`     | `for ... in _iter_unpack_sequence_(it, spec)` |
//!
//! Item *assignment* keeps its subscript target; only the container and key
//! expressions inside it are lowered.

use std::rc::Rc;

use super::ast::{
    Comprehension, ExceptHandler, Expr, FStringPart, Location, Param, Stmt, StmtKind, Target,
};
use super::{Diagnostic, GUARD_GETATTR, GUARD_GETITEM, GUARD_GETITER, GUARD_ITER_UNPACK};

type PolicyResult<T> = Result<T, Diagnostic>;

/// Checks and lowers a whole program.
pub fn restrict_module(body: Vec<Stmt>) -> PolicyResult<Vec<Stmt>> {
    Lowering::default().stmts(body)
}

/// Checks and lowers a single expression.
pub fn restrict_expression(expr: Expr) -> PolicyResult<Expr> {
    let mut lowering = Lowering {
        loc: Location { line: 1, column: 1 },
        ..Lowering::default()
    };
    lowering.expr(expr)
}

/// Identifiers starting with `_` are reserved for the guard primitives.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('_') && name != "_"
}

#[derive(Default)]
struct Lowering {
    /// Location of the statement being lowered; expressions carry none.
    loc: Location,
    /// Enclosing `def` bodies.
    functions: usize,
    /// Enclosing loop bodies within the innermost function.
    loops: usize,
}

impl Lowering {
    fn reject(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.loc.line, self.loc.column, message)
    }

    fn check_name(&self, name: &str) -> PolicyResult<()> {
        if is_reserved_name(name) {
            return Err(self.reject(format!(
                "\"{}\" is an invalid variable name because it starts with \"_\"",
                name
            )));
        }
        Ok(())
    }

    fn stmts(&mut self, body: Vec<Stmt>) -> PolicyResult<Vec<Stmt>> {
        body.into_iter().map(|stmt| self.stmt(stmt)).collect()
    }

    fn loop_body(&mut self, body: Vec<Stmt>) -> PolicyResult<Vec<Stmt>> {
        self.loops += 1;
        let lowered = self.stmts(body);
        self.loops -= 1;
        lowered
    }

    fn function_body(&mut self, body: Vec<Stmt>) -> PolicyResult<Vec<Stmt>> {
        let outer_loops = std::mem::take(&mut self.loops);
        self.functions += 1;
        let lowered = self.stmts(body);
        self.functions -= 1;
        self.loops = outer_loops;
        lowered
    }

    fn stmt(&mut self, stmt: Stmt) -> PolicyResult<Stmt> {
        self.loc = stmt.loc;
        let loc = stmt.loc;

        let kind = match stmt.kind {
            StmtKind::Expr(expr) => StmtKind::Expr(self.expr(expr)?),
            StmtKind::Assign { targets, value } => StmtKind::Assign {
                targets: targets
                    .into_iter()
                    .map(|target| self.target(target))
                    .collect::<PolicyResult<_>>()?,
                value: self.expr(value)?,
            },
            StmtKind::AugAssign { target, op, value } => StmtKind::AugAssign {
                target: self.target(target)?,
                op,
                value: self.expr(value)?,
            },
            StmtKind::If { test, body, orelse } => StmtKind::If {
                test: self.expr(test)?,
                body: self.stmts(body)?,
                orelse: self.stmts(orelse)?,
            },
            StmtKind::While { test, body, orelse } => StmtKind::While {
                test: self.expr(test)?,
                body: self.loop_body(body)?,
                orelse: self.stmts(orelse)?,
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let target = self.target(target)?;
                let iter = self.guarded_iter(&target, iter)?;
                StmtKind::For {
                    target,
                    iter,
                    body: self.loop_body(body)?,
                    orelse: self.stmts(orelse)?,
                }
            }
            StmtKind::FunctionDef { name, params, body } => {
                self.check_name(&name)?;
                let params = self.params(params)?;
                let body = Rc::try_unwrap(body).unwrap_or_else(|shared| (*shared).clone());
                StmtKind::FunctionDef {
                    name,
                    params,
                    body: Rc::new(self.function_body(body)?),
                }
            }
            StmtKind::Return(_) if self.functions == 0 => {
                return Err(self.reject("'return' outside function"))
            }
            StmtKind::Return(value) => StmtKind::Return(self.opt_expr(value)?),
            StmtKind::Raise(value) => StmtKind::Raise(self.opt_expr(value)?),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => StmtKind::Try {
                body: self.stmts(body)?,
                handlers: handlers
                    .into_iter()
                    .map(|handler| self.handler(handler))
                    .collect::<PolicyResult<_>>()?,
                orelse: self.stmts(orelse)?,
                finalbody: self.stmts(finalbody)?,
            },
            StmtKind::Delete(targets) => StmtKind::Delete(
                targets
                    .into_iter()
                    .map(|target| self.delete_target(target))
                    .collect::<PolicyResult<_>>()?,
            ),
            StmtKind::Assert { test, msg } => StmtKind::Assert {
                test: self.expr(test)?,
                msg: self.opt_expr(msg)?,
            },
            StmtKind::Import(_) | StmtKind::ImportFrom { .. } => {
                return Err(self.reject("import statements are not allowed in restricted code"))
            }
            StmtKind::Global(_) => {
                return Err(self.reject("'global' statements are not allowed in restricted code"))
            }
            StmtKind::Nonlocal(_) => {
                return Err(
                    self.reject("'nonlocal' statements are not allowed in restricted code")
                )
            }
            StmtKind::Break if self.loops == 0 => return Err(self.reject("'break' outside loop")),
            StmtKind::Continue if self.loops == 0 => {
                return Err(self.reject("'continue' not properly in loop"))
            }
            kind @ (StmtKind::Break | StmtKind::Continue | StmtKind::Pass) => kind,
        };
        Ok(Stmt { kind, loc })
    }

    fn handler(&mut self, handler: ExceptHandler) -> PolicyResult<ExceptHandler> {
        self.loc = handler.loc;
        if let Some(name) = &handler.name {
            self.check_name(name)?;
        }
        Ok(ExceptHandler {
            kind: self.opt_expr(handler.kind)?,
            name: handler.name,
            body: self.stmts(handler.body)?,
            loc: handler.loc,
        })
    }

    fn params(&mut self, params: Vec<Param>) -> PolicyResult<Vec<Param>> {
        params
            .into_iter()
            .map(|param| {
                self.check_name(&param.name)?;
                Ok(Param {
                    name: param.name,
                    default: self.opt_expr(param.default)?,
                })
            })
            .collect()
    }

    fn target(&mut self, target: Target) -> PolicyResult<Target> {
        match target {
            Target::Name(name) => {
                self.check_name(&name)?;
                Ok(Target::Name(name))
            }
            Target::Subscript { value, index } => Ok(Target::Subscript {
                value: self.expr(value)?,
                index: self.expr(index)?,
            }),
            Target::Attribute { attr, .. } => Err(self.reject(format!(
                "assignment to attribute \"{}\" is not allowed in restricted code",
                attr
            ))),
            Target::Sequence(items) => Ok(Target::Sequence(
                items
                    .into_iter()
                    .map(|item| self.target(item))
                    .collect::<PolicyResult<_>>()?,
            )),
        }
    }

    fn delete_target(&mut self, target: Target) -> PolicyResult<Target> {
        match target {
            Target::Attribute { attr, .. } => Err(self.reject(format!(
                "deletion of attribute \"{}\" is not allowed in restricted code",
                attr
            ))),
            other => self.target(other),
        }
    }

    /// Wraps a loop iterable in the guard matching the loop target's shape.
    fn guarded_iter(&mut self, target: &Target, iter: Expr) -> PolicyResult<Expr> {
        let iter = self.expr(iter)?;
        Ok(match target {
            Target::Sequence(_) => Expr::call(GUARD_ITER_UNPACK, vec![iter, unpack_spec(target)]),
            _ => Expr::call(GUARD_GETITER, vec![iter]),
        })
    }

    fn opt_expr(&mut self, expr: Option<Expr>) -> PolicyResult<Option<Expr>> {
        expr.map(|expr| self.expr(expr)).transpose()
    }

    fn boxed(&mut self, expr: Box<Expr>) -> PolicyResult<Box<Expr>> {
        Ok(Box::new(self.expr(*expr)?))
    }

    fn exprs(&mut self, exprs: Vec<Expr>) -> PolicyResult<Vec<Expr>> {
        exprs.into_iter().map(|expr| self.expr(expr)).collect()
    }

    fn generators(&mut self, generators: Vec<Comprehension>) -> PolicyResult<Vec<Comprehension>> {
        generators
            .into_iter()
            .map(|generator| {
                let target = self.target(generator.target)?;
                let iter = self.guarded_iter(&target, generator.iter)?;
                Ok(Comprehension {
                    target,
                    iter,
                    ifs: self.exprs(generator.ifs)?,
                })
            })
            .collect()
    }

    fn expr(&mut self, expr: Expr) -> PolicyResult<Expr> {
        Ok(match expr {
            Expr::Name(name) => {
                self.check_name(&name)?;
                Expr::Name(name)
            }
            Expr::Attribute { value, attr } => {
                Expr::call(GUARD_GETATTR, vec![self.expr(*value)?, Expr::Str(attr)])
            }
            Expr::Subscript { value, index } => {
                Expr::call(GUARD_GETITEM, vec![self.expr(*value)?, self.expr(*index)?])
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => {
                let keywords = keywords
                    .into_iter()
                    .map(|(name, value)| {
                        self.check_name(&name)?;
                        Ok((name, self.expr(value)?))
                    })
                    .collect::<PolicyResult<_>>()?;
                Expr::Call {
                    func: self.boxed(func)?,
                    args: self.exprs(args)?,
                    keywords,
                }
            }
            Expr::FString(parts) => Expr::FString(
                parts
                    .into_iter()
                    .map(|part| match part {
                        FStringPart::Field { value, conversion } => Ok(FStringPart::Field {
                            value: self.expr(value)?,
                            conversion,
                        }),
                        literal => Ok(literal),
                    })
                    .collect::<PolicyResult<_>>()?,
            ),
            Expr::List(items) => Expr::List(self.exprs(items)?),
            Expr::Tuple(items) => Expr::Tuple(self.exprs(items)?),
            Expr::Dict(items) => Expr::Dict(
                items
                    .into_iter()
                    .map(|(key, value)| Ok((self.expr(key)?, self.expr(value)?)))
                    .collect::<PolicyResult<_>>()?,
            ),
            Expr::Slice { lower, upper, step } => Expr::Slice {
                lower: lower.map(|e| self.boxed(e)).transpose()?,
                upper: upper.map(|e| self.boxed(e)).transpose()?,
                step: step.map(|e| self.boxed(e)).transpose()?,
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: self.boxed(operand)?,
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: self.boxed(left)?,
                right: self.boxed(right)?,
            },
            Expr::BoolOp { op, left, right } => Expr::BoolOp {
                op,
                left: self.boxed(left)?,
                right: self.boxed(right)?,
            },
            Expr::Compare { left, ops } => Expr::Compare {
                left: self.boxed(left)?,
                ops: ops
                    .into_iter()
                    .map(|(op, operand)| Ok((op, self.expr(operand)?)))
                    .collect::<PolicyResult<_>>()?,
            },
            Expr::IfExp { test, body, orelse } => Expr::IfExp {
                test: self.boxed(test)?,
                body: self.boxed(body)?,
                orelse: self.boxed(orelse)?,
            },
            Expr::Lambda { params, body } => {
                let params = self.params(params)?;
                let body = Rc::try_unwrap(body).unwrap_or_else(|shared| (*shared).clone());
                Expr::Lambda {
                    params,
                    body: Rc::new(self.expr(body)?),
                }
            }
            Expr::ListComp {
                element,
                generators,
            } => {
                let generators = self.generators(generators)?;
                Expr::ListComp {
                    element: self.boxed(element)?,
                    generators,
                }
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let generators = self.generators(generators)?;
                Expr::DictComp {
                    key: self.boxed(key)?,
                    value: self.boxed(value)?,
                    generators,
                }
            }
            literal @ (Expr::None
            | Expr::Bool(_)
            | Expr::Int(_)
            | Expr::Float(_)
            | Expr::Str(_)) => literal,
        })
    }
}

/// Describes a nested unpacking target as a tuple of `None` leaves and
/// nested tuples, e.g. `a, (b, c)` becomes `(None, (None, None))`.
fn unpack_spec(target: &Target) -> Expr {
    match target {
        Target::Sequence(items) => Expr::Tuple(items.iter().map(unpack_spec).collect()),
        _ => Expr::None,
    }
}
