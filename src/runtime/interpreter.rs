//! Tree-walking evaluator for lowered code.
//!
//! The interpreter trusts the restriction pass: it never sees imports or
//! reserved names, and every attribute read, item read and loop iterable
//! arrives as a call of a guard bound in the global scope.

use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::compiler::ast::{
    BinOp, BoolOp, Comprehension, Expr, ExceptHandler, FStringPart, Param, Stmt, StmtKind, Target,
};
use crate::compiler::{CodeBody, CodeUnit};

use super::exception::{self, Exception};
use super::guards::{self, AttributePolicy};
use super::methods;
use super::ops;
use super::scope::{Env, RESULT_NAME};
use super::value::{CallArgs, Function, FunctionBody, Value};

/// Nested guest calls deeper than this raise `RecursionError`.
pub const MAX_CALL_DEPTH: usize = 200;

/// How a statement finished.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type Emit<'a> = dyn FnMut(&mut Interpreter, &Rc<Env>) -> Result<(), Exception> + 'a;

/// Executes one code unit against one global scope.
///
/// Dropping the interpreter clears the global scope and every scope a
/// function closed over, so closures referring to themselves are freed.
pub struct Interpreter {
    policy: Arc<AttributePolicy>,
    globals: Rc<Env>,
    output: String,
    depth: usize,
    /// Exceptions whose `except` block is running, innermost last.
    handling: Vec<Rc<Exception>>,
    closures: Vec<Weak<Env>>,
}

impl Interpreter {
    pub fn new(policy: Arc<AttributePolicy>, globals: Rc<Env>) -> Self {
        Self {
            policy,
            globals,
            output: String::new(),
            depth: 0,
            handling: Vec::new(),
            closures: Vec::new(),
        }
    }

    pub fn policy(&self) -> &AttributePolicy {
        &self.policy
    }

    /// Appends to the captured `print` output.
    pub fn write_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Runs `unit` to completion.
    ///
    /// Returns the value bound to `result` for a program, which may still be
    /// [`Value::Unset`], or the value of the expression in eval mode.
    pub fn run(&mut self, unit: &CodeUnit) -> Result<Value, Exception> {
        let globals = self.globals.clone();
        match unit.body() {
            CodeBody::Module(body) => {
                self.exec_block(body, &globals)?;
                Ok(globals.get(RESULT_NAME).unwrap_or(Value::Unset))
            }
            CodeBody::Expression(expr) => self.eval(expr, &globals).map_err(|e| e.with_line(1)),
        }
    }

    /// Calls any callable guest value.
    pub fn call(&mut self, func: &Value, args: CallArgs) -> Result<Value, Exception> {
        match func {
            Value::Builtin(builtin) => (builtin.func)(self, args),
            Value::HostFunction(host) => (host.func)(args),
            Value::Function(function) => self.call_function(function, args),
            Value::BoundMethod(method) => match &method.receiver {
                Value::Host(object) => object.call_method(&method.name, args),
                receiver => methods::call_method(self, receiver, &method.name, args),
            },
            Value::ExceptionType(kind) => Ok(Value::Exception(Rc::new(instantiate(kind, args)?))),
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(&mut self, function: &Rc<Function>, args: CallArgs) -> Result<Value, Exception> {
        let env = Env::child(&function.closure);
        bind_arguments(function, args, &env)?;

        if self.depth >= MAX_CALL_DEPTH {
            return Err(Exception::recursion());
        }
        self.depth += 1;
        let outcome = match &function.body {
            FunctionBody::Block(body) => match self.exec_block(body, &env) {
                Ok(Flow::Return(value)) => Ok(value),
                Ok(_) => Ok(Value::None),
                Err(err) => Err(err),
            },
            FunctionBody::Lambda(expr) => self.eval(expr, &env),
        };
        self.depth -= 1;
        outcome
    }

    fn make_function(
        &mut self,
        name: &str,
        params: &[Param],
        body: FunctionBody,
        env: &Rc<Env>,
    ) -> Result<Value, Exception> {
        let defaults = params
            .iter()
            .map(|param| param.default.as_ref().map(|d| self.eval(d, env)).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        let closure = Rc::downgrade(env);
        if !self.closures.last().is_some_and(|last| last.ptr_eq(&closure)) {
            self.closures.push(closure);
        }
        Ok(Value::Function(Rc::new(Function {
            name: name.to_string(),
            params: params.iter().map(|param| param.name.clone()).collect(),
            defaults,
            body,
            closure: env.clone(),
        })))
    }

    fn exec_block(&mut self, body: &[Stmt], env: &Rc<Env>) -> Result<Flow, Exception> {
        for stmt in body {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Rc<Env>) -> Result<Flow, Exception> {
        self.exec_kind(&stmt.kind, env)
            .map_err(|err| err.with_line(stmt.loc.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind, env: &Rc<Env>) -> Result<Flow, Exception> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, env)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, env)?,
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test, env)?.truthy() {
                    body
                } else {
                    orelse
                };
                return self.exec_block(branch, env);
            }
            StmtKind::While { test, body, orelse } => {
                while self.eval(test, env)?.truthy() {
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                return self.exec_block(orelse, env);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter, env)?;
                for item in loop_items(iterable)? {
                    self.assign(target, item, env)?;
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                return self.exec_block(orelse, env);
            }
            StmtKind::FunctionDef { name, params, body } => {
                let function =
                    self.make_function(name, params, FunctionBody::Block(body.clone()), env)?;
                env.set(name, function);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Raise(value) => return Err(self.raise(value.as_ref(), env)?),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, env),
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, env)?;
                }
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, env)?.truthy() {
                    let message = match msg {
                        Some(msg) => self.eval(msg, env)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Exception::new("AssertionError", message));
                }
            }
            StmtKind::Import(_)
            | StmtKind::ImportFrom { .. }
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_) => {
                return Err(Exception::new(
                    "RuntimeError",
                    "statement is not available in restricted code",
                ))
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    /// Builds the exception a `raise` statement throws.
    fn raise(&mut self, value: Option<&Expr>, env: &Rc<Env>) -> Result<Exception, Exception> {
        let Some(expr) = value else {
            return Ok(match self.handling.last() {
                Some(active) => (**active).clone(),
                None => Exception::new("RuntimeError", "No active exception to reraise"),
            });
        };
        match self.eval(expr, env)? {
            Value::ExceptionType(kind) => Ok(Exception::new(kind, "")),
            Value::Exception(exc) => Ok(Exception {
                line: None,
                ..(*exc).clone()
            }),
            _ => Ok(Exception::type_error(
                "exceptions must derive from BaseException",
            )),
        }
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        env: &Rc<Env>,
    ) -> Result<Flow, Exception> {
        let outcome = match self.exec_block(body, env) {
            Ok(Flow::Normal) => self.exec_block(orelse, env),
            Ok(flow) => Ok(flow),
            Err(exc) => self.handle(exc, handlers, env),
        };
        if finalbody.is_empty() {
            return outcome;
        }
        // A `finally` that breaks, continues, returns or raises wins.
        match self.exec_block(finalbody, env)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(
        &mut self,
        exc: Exception,
        handlers: &[ExceptHandler],
        env: &Rc<Env>,
    ) -> Result<Flow, Exception> {
        for handler in handlers {
            let caught = match &handler.kind {
                None => true,
                Some(kind) => {
                    let kind = self
                        .eval(kind, env)
                        .map_err(|err| err.with_line(handler.loc.line))?;
                    handler_matches(&kind, &exc.kind).map_err(|err| err.with_line(handler.loc.line))?
                }
            };
            if !caught {
                continue;
            }

            let active = Rc::new(exc);
            if let Some(name) = &handler.name {
                env.set(name, Value::Exception(active.clone()));
            }
            self.handling.push(active);
            let outcome = self.exec_block(&handler.body, env);
            self.handling.pop();
            if let Some(name) = &handler.name {
                env.remove(name);
            }
            return outcome;
        }
        Err(exc)
    }

    fn assign(&mut self, target: &Target, value: Value, env: &Rc<Env>) -> Result<(), Exception> {
        match target {
            Target::Name(name) => env.set(name, value),
            Target::Subscript { value: container, index } => {
                let container = self.eval(container, env)?;
                let key = self.eval(index, env)?;
                set_item(&container, key, value)?;
            }
            Target::Sequence(targets) => {
                let items = guards::iterate(&value).map_err(|_| {
                    Exception::type_error(format!(
                        "cannot unpack non-iterable {} object",
                        value.type_name()
                    ))
                })?;
                guards::check_arity(items.len(), targets.len())?;
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
            }
            Target::Attribute { attr, .. } => {
                return Err(Exception::attribute_error(format!(
                    "cannot assign attribute '{}' in restricted code",
                    attr
                )))
            }
        }
        Ok(())
    }

    fn aug_assign(
        &mut self,
        target: &Target,
        op: BinOp,
        value: &Expr,
        env: &Rc<Env>,
    ) -> Result<(), Exception> {
        match target {
            Target::Name(name) => {
                let current = lookup(env, name)?;
                let operand = self.eval(value, env)?;
                let updated = in_place(op, current, &operand)?;
                env.set(name, updated);
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, env)?;
                let key = self.eval(index, env)?;
                let current = guards::get_item(&container, &key)?;
                let operand = self.eval(value, env)?;
                let updated = in_place(op, current, &operand)?;
                set_item(&container, key, updated)?;
            }
            _ => {
                return Err(Exception::type_error(
                    "illegal expression for augmented assignment",
                ))
            }
        }
        Ok(())
    }

    fn delete(&mut self, target: &Target, env: &Rc<Env>) -> Result<(), Exception> {
        match target {
            Target::Name(name) => {
                if !env.remove(name) {
                    return Err(Exception::name_error(name));
                }
            }
            Target::Subscript { value, index } => {
                let container = self.eval(value, env)?;
                let key = self.eval(index, env)?;
                delete_item(&container, &key)?;
            }
            Target::Sequence(targets) => {
                for target in targets {
                    self.delete(target, env)?;
                }
            }
            Target::Attribute { attr, .. } => {
                return Err(Exception::attribute_error(format!(
                    "cannot delete attribute '{}' in restricted code",
                    attr
                )))
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr, env: &Rc<Env>) -> Result<Value, Exception> {
        Ok(match expr {
            Expr::None => Value::None,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Int(i) => Value::Int(*i),
            Expr::Float(f) => Value::Float(*f),
            Expr::Str(s) => Value::str(s.as_str()),
            Expr::FString(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(literal) => text.push_str(literal),
                        FStringPart::Field { value, conversion } => {
                            let value = self.eval(value, env)?;
                            match conversion {
                                Some('r') | Some('a') => text.push_str(&value.repr()),
                                _ => text.push_str(&value.to_str()),
                            }
                        }
                    }
                }
                Value::str(text)
            }
            Expr::Name(name) => lookup(env, name)?,
            Expr::List(items) => Value::list(self.eval_all(items, env)?),
            Expr::Tuple(items) => Value::tuple(self.eval_all(items, env)?),
            Expr::Dict(entries) => {
                let mut dict = super::value::Dict::new();
                for (key, value) in entries {
                    let key = self.eval(key, env)?;
                    let value = self.eval(value, env)?;
                    dict.insert(key, value)?;
                }
                Value::dict(dict)
            }
            Expr::Attribute { value, attr } => {
                let value = self.eval(value, env)?;
                guards::get_attribute(&self.policy, &value, attr)?
            }
            Expr::Subscript { value, index } => {
                let value = self.eval(value, env)?;
                let index = self.eval(index, env)?;
                guards::get_item(&value, &index)?
            }
            Expr::Slice { lower, upper, step } => {
                let lower = self.eval_opt(lower.as_deref(), env)?;
                let upper = self.eval_opt(upper.as_deref(), env)?;
                let step = self.eval_opt(step.as_deref(), env)?;
                guards::make_slice(lower, upper, step)?
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => {
                let func = self.eval(func, env)?;
                let positional = self.eval_all(args, env)?;
                let mut evaluated = Vec::with_capacity(keywords.len());
                for (name, value) in keywords {
                    evaluated.push((name.clone(), self.eval(value, env)?));
                }
                self.call(
                    &func,
                    CallArgs {
                        positional,
                        keywords: evaluated,
                    },
                )?
            }
            Expr::Unary { op, operand } => ops::unary(*op, &self.eval(operand, env)?)?,
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                ops::binary(*op, &left, &right)?
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left, env)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => left,
                    _ => self.eval(right, env)?,
                }
            }
            Expr::Compare { left, ops: links } => {
                let mut left = self.eval(left, env)?;
                for (op, right) in links {
                    let right = self.eval(right, env)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Value::Bool(true)
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test, env)?.truthy() {
                    self.eval(body, env)?
                } else {
                    self.eval(orelse, env)?
                }
            }
            Expr::Lambda { params, body } => {
                self.make_function("<lambda>", params, FunctionBody::Lambda(body.clone()), env)?
            }
            Expr::ListComp {
                element,
                generators,
            } => {
                let scope = Env::child(env);
                let mut items = Vec::new();
                self.comprehend(generators, &scope, &mut |interp: &mut Interpreter,
                                                         scope: &Rc<Env>| {
                    items.push(interp.eval(element, scope)?);
                    Ok(())
                })?;
                Value::list(items)
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let scope = Env::child(env);
                let mut dict = super::value::Dict::new();
                self.comprehend(generators, &scope, &mut |interp: &mut Interpreter,
                                                         scope: &Rc<Env>| {
                    let key = interp.eval(key, scope)?;
                    let value = interp.eval(value, scope)?;
                    dict.insert(key, value)
                })?;
                Value::dict(dict)
            }
        })
    }

    fn eval_all(&mut self, exprs: &[Expr], env: &Rc<Env>) -> Result<Vec<Value>, Exception> {
        exprs.iter().map(|expr| self.eval(expr, env)).collect()
    }

    fn eval_opt(&mut self, expr: Option<&Expr>, env: &Rc<Env>) -> Result<Value, Exception> {
        match expr {
            Some(expr) => self.eval(expr, env),
            None => Ok(Value::None),
        }
    }

    /// Drives nested comprehension loops, calling `emit` for every
    /// combination that passes the filters.
    fn comprehend(
        &mut self,
        generators: &[Comprehension],
        scope: &Rc<Env>,
        emit: &mut Emit<'_>,
    ) -> Result<(), Exception> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self, scope);
        };
        let iterable = self.eval(&first.iter, scope)?;
        'items: for item in loop_items(iterable)? {
            self.assign(&first.target, item, scope)?;
            for condition in &first.ifs {
                if !self.eval(condition, scope)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehend(rest, scope, emit)?;
        }
        Ok(())
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.globals.clear();
        for closure in self.closures.drain(..) {
            if let Some(env) = closure.upgrade() {
                env.clear();
            }
        }
    }
}

fn lookup(env: &Env, name: &str) -> Result<Value, Exception> {
    match env.get(name) {
        Some(Value::Unset) => Ok(Value::None),
        Some(value) => Ok(value),
        None => Err(Exception::name_error(name)),
    }
}

/// Items a loop visits. Ranges are produced lazily; anything else was
/// already snapshotted by the iteration guard.
fn loop_items(iterable: Value) -> Result<Box<dyn Iterator<Item = Value>>, Exception> {
    Ok(match iterable {
        Value::Range(range) => Box::new(range.iter().map(Value::Int)),
        Value::List(items) => {
            let snapshot = items.borrow().clone();
            Box::new(snapshot.into_iter())
        }
        other => Box::new(guards::iterate(&other)?.into_iter()),
    })
}

fn bind_arguments(function: &Function, args: CallArgs, env: &Env) -> Result<(), Exception> {
    let name = &function.name;
    let params = &function.params;
    if args.positional.len() > params.len() {
        return Err(Exception::type_error(format!(
            "{}() takes {} positional argument{} but {} were given",
            name,
            params.len(),
            if params.len() == 1 { "" } else { "s" },
            args.positional.len()
        )));
    }

    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in slots.iter_mut().zip(args.positional) {
        *slot = Some(value);
    }
    for (keyword, value) in args.keywords {
        let Some(position) = params.iter().position(|param| *param == keyword) else {
            return Err(Exception::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, keyword
            )));
        };
        if slots[position].is_some() {
            return Err(Exception::type_error(format!(
                "{}() got multiple values for argument '{}'",
                name, keyword
            )));
        }
        slots[position] = Some(value);
    }

    let mut missing = Vec::new();
    for ((param, slot), default) in params.iter().zip(slots).zip(&function.defaults) {
        match slot.or_else(|| default.clone()) {
            Some(value) => env.set(param, value),
            None => missing.push(format!("'{}'", param)),
        }
    }
    if !missing.is_empty() {
        return Err(Exception::type_error(format!(
            "{}() missing {} required positional argument{}: {}",
            name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Creates an exception instance from a call of its type.
fn instantiate(kind: &str, args: CallArgs) -> Result<Exception, Exception> {
    if !args.keywords.is_empty() {
        return Err(Exception::type_error(format!(
            "{}() takes no keyword arguments",
            kind
        )));
    }
    let message = match args.positional.as_slice() {
        [] => String::new(),
        [single] => single.to_str(),
        many => Value::tuple(many.to_vec()).repr(),
    };
    Ok(Exception::new(kind, message))
}

fn handler_matches(kind: &Value, raised: &str) -> Result<bool, Exception> {
    match kind {
        Value::ExceptionType(name) => Ok(exception::is_subtype(raised, name)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if handler_matches(kind, raised)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// Applies an augmented operator; `list += iterable` extends in place.
fn in_place(op: BinOp, current: Value, operand: &Value) -> Result<Value, Exception> {
    if let (BinOp::Add, Value::List(items)) = (op, &current) {
        let extra = guards::iterate(operand)?;
        items.borrow_mut().extend(extra);
        return Ok(current);
    }
    ops::binary(op, &current, operand)
}

fn set_item(container: &Value, key: Value, value: Value) -> Result<(), Exception> {
    match container {
        Value::List(items) => {
            if let Value::Slice(slice) = &key {
                let replacement = guards::iterate(&value)?;
                let mut items = items.borrow_mut();
                let len = items.len();
                if slice.step.unwrap_or(1) == 1 {
                    let start = clamp_bound(slice.lower, len, 0);
                    let end = clamp_bound(slice.upper, len, len).max(start);
                    items.splice(start..end, replacement);
                    return Ok(());
                }
                let indices = slice.indices(len)?;
                if indices.len() != replacement.len() {
                    return Err(Exception::value_error(format!(
                        "attempt to assign sequence of size {} to extended slice of size {}",
                        replacement.len(),
                        indices.len()
                    )));
                }
                for (index, item) in indices.into_iter().zip(replacement) {
                    items[index] = item;
                }
                return Ok(());
            }
            let index = guards::as_index(&key, "list")?;
            let mut items = items.borrow_mut();
            let position = guards::normalize_index(index, items.len())
                .ok_or_else(|| Exception::index_error("list assignment index out of range"))?;
            items[position] = value;
            Ok(())
        }
        Value::Dict(dict) => dict.borrow_mut().insert(key, value),
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Resolves one bound of a step-1 slice against `len`.
fn clamp_bound(bound: Option<i64>, len: usize, default: usize) -> usize {
    let len = len as i64;
    match bound {
        None => default,
        Some(b) if b < 0 => (b + len).max(0) as usize,
        Some(b) => b.min(len) as usize,
    }
}

fn delete_item(container: &Value, key: &Value) -> Result<(), Exception> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            if let Value::Slice(slice) = key {
                let mut indices = slice.indices(items.len())?;
                indices.sort_unstable();
                for index in indices.into_iter().rev() {
                    items.remove(index);
                }
                return Ok(());
            }
            let index = guards::as_index(key, "list")?;
            let position = guards::normalize_index(index, items.len())
                .ok_or_else(|| Exception::index_error("list assignment index out of range"))?;
            items.remove(position);
            Ok(())
        }
        Value::Dict(dict) => {
            let removed = dict.borrow_mut().remove(key)?;
            removed
                .map(|_| ())
                .ok_or_else(|| Exception::key_error(key.repr()))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::compiler::{compile_restricted, Mode, DEFAULT_FILENAME};
    use crate::runtime::marshal;
    use crate::runtime::scope::CapabilityTable;
    use serde_json::json;

    fn execute(source: &str, input: serde_json::Value) -> Result<(Value, String), Exception> {
        let unit = compile_restricted(source, DEFAULT_FILENAME, Mode::Exec)
            .unwrap_or_else(|err| panic!("{}", err));
        let table = CapabilityTable::new(|_| true, []);
        let globals = table.build_scope(&HashMap::new(), marshal::from_json(&input));
        let mut interp = Interpreter::new(AttributePolicy::default().shared(), globals);
        let result = interp.run(&unit)?;
        Ok((result, interp.take_output()))
    }

    fn result_of(source: &str) -> String {
        execute(source, json!(null)).unwrap().0.repr()
    }

    fn error_of(source: &str) -> Exception {
        execute(source, json!(null)).unwrap_err()
    }

    #[test]
    fn test_reads_input_and_sets_result() {
        let (result, _) = execute("result = input['a'] + input['b']", json!({"a": 2, "b": 3})).unwrap();
        assert_eq!(result.repr(), "5");
    }

    #[test]
    fn test_unset_result_stays_unset() {
        let (result, _) = execute("x = 1", json!(null)).unwrap();
        assert!(matches!(result, Value::Unset));
        assert_eq!(result_of("result = result"), "None");
    }

    #[test]
    fn test_loops_and_else() {
        assert_eq!(result_of("result = 0\nfor x in [1, 2, 3]:\n    result += x\n"), "6");
        assert_eq!(
            result_of("result = 'none'\nfor x in range(10):\n    if x == 3:\n        result = x\n        break\nelse:\n    result = 'no break'\n"),
            "3"
        );
        assert_eq!(
            result_of("i = 0\nwhile i < 3:\n    i += 1\nelse:\n    result = i\n"),
            "3"
        );
        assert_eq!(
            result_of("result = []\nfor i in range(5):\n    if i % 2:\n        continue\n    result.append(i)\n"),
            "[0, 2, 4]"
        );
    }

    #[test]
    fn test_unpacking() {
        assert_eq!(
            result_of("result = []\nfor k, (a, b) in [('x', (1, 2))]:\n    result.append(k + str(a + b))\n"),
            "['x3']"
        );
        assert_eq!(result_of("a, b = 1, 2\na, b = b, a\nresult = (a, b)"), "(2, 1)");
        let err = error_of("a, b = [1, 2, 3]");
        assert_eq!(err.message, "too many values to unpack (expected 2)");
    }

    #[test]
    fn test_functions_closures_and_defaults() {
        let source = "\
def make_counter(step=1):
    def add(x):
        return x + step
    return add

inc = make_counter(step=10)
result = [inc(1), make_counter()(1)]
";
        assert_eq!(result_of(source), "[11, 2]");
        assert_eq!(
            result_of("def fact(n):\n    return 1 if n <= 1 else n * fact(n - 1)\nresult = fact(10)\n"),
            "3628800"
        );
        let err = error_of("def f(a, b):\n    return a\nf(1)\n");
        assert_eq!(err.message, "f() missing 1 required positional argument: 'b'");
    }

    #[test]
    fn test_comprehensions_and_lambda() {
        assert_eq!(
            result_of("result = [x * y for x in range(3) if x for y in [10, 100]]"),
            "[10, 100, 20, 200]"
        );
        assert_eq!(
            result_of("result = {k: v for k, v in [('a', 1), ('b', 2)]}"),
            "{'a': 1, 'b': 2}"
        );
        assert_eq!(
            result_of("result = sorted(['bb', 'a', 'ccc'], key=lambda s: len(s))"),
            "['a', 'bb', 'ccc']"
        );
    }

    #[test]
    fn test_methods_and_fstrings() {
        assert_eq!(
            result_of("name = 'world'\nresult = f'hello {name.upper()}!'"),
            "'hello WORLD!'"
        );
        assert_eq!(
            result_of("d = {}\nd.setdefault('k', []).append(1)\nresult = d"),
            "{'k': [1]}"
        );
        assert_eq!(result_of("result = f'{[1]!r} {\"x\"!r}'"), "\"[1] 'x'\"");
    }

    #[test]
    fn test_try_except_else_finally() {
        let source = "\
log = []
try:
    {}['missing']
except (ValueError, LookupError) as e:
    log.append('caught ' + str(e))
else:
    log.append('else')
finally:
    log.append('finally')
result = log
";
        assert_eq!(result_of(source), "[\"caught 'missing'\", 'finally']");
        assert_eq!(
            result_of("try:\n    x = 1\nexcept Exception:\n    x = 2\nelse:\n    x = 3\nresult = x\n"),
            "3"
        );
    }

    #[test]
    fn test_finally_runs_on_return() {
        let source = "\
log = []
def f():
    try:
        return 'body'
    finally:
        log.append('cleanup')
result = [f(), log]
";
        assert_eq!(result_of(source), "['body', ['cleanup']]");
    }

    #[test]
    fn test_raise_and_reraise() {
        let err = error_of("raise ValueError('boom')");
        assert_eq!(err.kind, "ValueError");
        assert_eq!(err.message, "boom");
        assert_eq!(err.line, Some(1));

        let err = error_of("x = 1\ntry:\n    1 / 0\nexcept ZeroDivisionError:\n    raise\n");
        assert_eq!(err.kind, "ZeroDivisionError");
        assert_eq!(err.line, Some(3));

        let err = error_of("raise");
        assert_eq!(err.message, "No active exception to reraise");
        assert_eq!(error_of("raise KeyError").kind, "KeyError");
        assert_eq!(error_of("raise 5").kind, "TypeError");
    }

    #[test]
    fn test_handler_order_and_uncaught() {
        let err = error_of("try:\n    [][1]\nexcept KeyError:\n    pass\n");
        assert_eq!(err.kind, "IndexError");
        assert_eq!(
            result_of("try:\n    int('x')\nexcept Exception as e:\n    result = str(e)\n"),
            "\"invalid literal for int() with base 10: 'x'\""
        );
    }

    #[test]
    fn test_guards_block_dunder_access() {
        let err = execute("result = input.__class__", json!({})).unwrap_err();
        assert_eq!(err.kind, "AttributeError");
        let err = error_of("result = 'abc'.format");
        assert_eq!(err.kind, "AttributeError");
    }

    #[test]
    fn test_iterating_non_iterable_fails() {
        let err = error_of("for x in 5:\n    pass\n");
        assert_eq!(err.message, "'int' object is not iterable");
    }

    #[test]
    fn test_item_assignment_and_deletion() {
        assert_eq!(
            result_of("d = {'a': 1}\nd['b'] = 2\nd['a'] += 5\ndel d['b']\nresult = d"),
            "{'a': 6}"
        );
        assert_eq!(
            result_of("l = [1, 2, 3, 4]\nl[1:3] = ['x']\ndel l[0]\nresult = l"),
            "['x', 4]"
        );
        assert_eq!(error_of("t = (1,)\nt[0] = 2").kind, "TypeError");
        assert_eq!(error_of("x = 1\ndel x\nx").kind, "NameError");
    }

    #[test]
    fn test_list_augmented_add_is_in_place() {
        assert_eq!(
            result_of("a = [1]\nb = a\nb += [2]\nresult = a"),
            "[1, 2]"
        );
    }

    #[test]
    fn test_assert() {
        let err = error_of("assert 1 == 2, 'math is broken'");
        assert_eq!(err.kind, "AssertionError");
        assert_eq!(err.message, "math is broken");
    }

    #[test]
    fn test_print_is_captured() {
        let (_, output) = execute("print('a', 1)\nprint('b', end='')", json!(null)).unwrap();
        assert_eq!(output, "a 1\nb");
    }

    #[test]
    fn test_error_line_numbers() {
        let err = error_of("x = 1\ny = 2\nz = x + 'a'\n");
        assert_eq!(err.kind, "TypeError");
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_exception_instances() {
        assert_eq!(
            result_of("e = ValueError('a', 2)\nresult = str(e)"),
            "\"('a', 2)\""
        );
        assert_eq!(
            result_of("result = isinstance(KeyError('k'), LookupError)"),
            "True"
        );
    }

    #[test]
    fn test_eval_mode() {
        let unit = compile_restricted("input * 2", DEFAULT_FILENAME, Mode::Eval).unwrap();
        let table = CapabilityTable::new(|_| true, []);
        let globals = table.build_scope(&HashMap::new(), Value::Int(21));
        let mut interp = Interpreter::new(AttributePolicy::default().shared(), globals);
        assert_eq!(interp.run(&unit).unwrap().repr(), "42");
    }

    #[test]
    fn test_drop_clears_scopes() {
        let unit = compile_restricted(
            "def f():\n    def g():\n        return g\n    return g\nh = f()\n",
            DEFAULT_FILENAME,
            Mode::Exec,
        )
        .unwrap();
        let globals = CapabilityTable::new(|_| true, []).build_scope(&HashMap::new(), Value::None);
        let mut interp = Interpreter::new(AttributePolicy::default().shared(), globals.clone());
        interp.run(&unit).unwrap();
        drop(interp);
        assert!(globals.is_empty());
    }
}
