//! Recursive-descent parser producing the syntax tree in [`super::ast`].
//!
//! The grammar follows the familiar Python precedence ladder. Constructs the
//! restricted language never supports (classes, context managers, coroutines,
//! generators, decorators, argument unpacking) are refused here with a
//! targeted message; constructs that parse but are forbidden by policy
//! (imports, `global`) are left for [`super::policy`].

use std::rc::Rc;

use super::ast::{
    BinOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, FStringPart, Location, Param,
    Stmt, StmtKind, Target, UnaryOp,
};
use super::lexer::{tokenize, unescape, Token, TokenKind};
use super::Diagnostic;

/// Bracket/block nesting allowed before parsing gives up.
const MAX_NESTING: usize = 64;

/// Tallest expression tree that operator and postfix chains may build.
const MAX_EXPR_DEPTH: usize = 100;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const UNSUPPORTED_STATEMENTS: &[&str] = &["class", "with", "async", "await", "yield"];

type ParseResult<T> = Result<T, Diagnostic>;

/// Parses a whole program.
pub fn parse_module(source: &str) -> ParseResult<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(source)?);
    let mut body = Vec::new();
    loop {
        match parser.peek_kind() {
            TokenKind::Eof => break,
            TokenKind::Newline => {
                parser.advance();
            }
            _ => body.extend(parser.parse_statement()?),
        }
    }
    Ok(body)
}

/// Parses a single expression; trailing tokens are a syntax error.
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let mut parser = Parser::new(tokenize(source.trim())?);
    let expr = parser.parse_expr_list()?;
    while matches!(parser.peek_kind(), TokenKind::Newline) {
        parser.advance();
    }
    if !matches!(parser.peek_kind(), TokenKind::Eof) {
        return Err(parser.error_here("invalid syntax"));
    }
    Ok(expr)
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    // ---- token helpers -------------------------------------------------

    fn peek(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_nth_kind(&self, n: usize) -> &TokenKind {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn loc(&self) -> Location {
        let token = self.peek();
        Location {
            line: token.line,
            column: token.column,
        }
    }

    fn error_here(&self, message: impl Into<String>) -> Diagnostic {
        let token = self.peek();
        Diagnostic::new(token.line, token.column, message)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected '{}'", op)))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected '{}'", keyword)))
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Name(name) if !is_keyword(&name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_here("expected a name")),
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Eof) || self.is_op(";")
    }

    fn starts_expression(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Name(name) => {
                !is_keyword(name)
                    || matches!(name.as_str(), "None" | "True" | "False" | "not" | "lambda")
            }
            TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::FStr { .. } => true,
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~"),
            _ => false,
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error_here("code is nested too deeply"));
        }
        let result = f(self);
        self.nesting -= 1;
        result
    }

    /// Depth of a chain after one more link joins an operand of
    /// `operand_depth` onto a spine of `spine_depth`.
    ///
    /// Left-associative chains grow the tree without recursing in the
    /// parser, so their height is bounded here instead.
    fn chain_link(&self, spine_depth: usize, operand_depth: usize) -> ParseResult<usize> {
        let depth = spine_depth.max(operand_depth) + 1;
        if depth > MAX_EXPR_DEPTH {
            return Err(self.error_here("code is nested too deeply"));
        }
        Ok(depth)
    }

    // ---- statements ----------------------------------------------------

    fn parse_statement(&mut self) -> ParseResult<Vec<Stmt>> {
        if let TokenKind::Name(word) = self.peek_kind().clone() {
            match word.as_str() {
                "if" => return Ok(vec![self.parse_if()?]),
                "while" => return Ok(vec![self.parse_while()?]),
                "for" => return Ok(vec![self.parse_for()?]),
                "def" => return Ok(vec![self.parse_def()?]),
                "try" => return Ok(vec![self.parse_try()?]),
                w if UNSUPPORTED_STATEMENTS.contains(&w) => {
                    return Err(
                        self.error_here(format!("'{}' is not supported in restricted code", w))
                    );
                }
                _ => {}
            }
        }
        match self.peek_kind() {
            TokenKind::Indent => Err(self.error_here("unexpected indent")),
            TokenKind::Dedent => Err(self.error_here("unexpected dedent")),
            TokenKind::Op("@") => Err(self.error_here("decorators are not supported")),
            _ => self.parse_simple_line(),
        }
    }

    fn parse_simple_line(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = vec![self.parse_simple_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Eof) {
                break;
            }
            statements.push(self.parse_simple_statement()?);
        }
        match self.peek_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(statements)
            }
            TokenKind::Eof | TokenKind::Dedent => Ok(statements),
            _ => Err(self.error_here("invalid syntax")),
        }
    }

    fn parse_simple_statement(&mut self) -> ParseResult<Stmt> {
        let loc = self.loc();
        let word = match self.peek_kind() {
            TokenKind::Name(word) => Some(word.clone()),
            _ => None,
        };

        let kind = match word.as_deref() {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr_list()?))
                }
            }
            Some("raise") => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.parse_expr()?;
                    if self.is_keyword("from") {
                        return Err(self.error_here("'raise ... from' is not supported"));
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            Some("del") => {
                self.advance();
                let expr = self.parse_expr_list()?;
                let targets = match expr {
                    Expr::Tuple(items) => items
                        .into_iter()
                        .map(|item| self.to_target(item, loc))
                        .collect::<ParseResult<Vec<_>>>()?,
                    other => vec![self.to_target(other, loc)?],
                };
                StmtKind::Delete(targets)
            }
            Some("assert") => {
                self.advance();
                let test = self.parse_expr()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Some("import") => {
                self.advance();
                let mut names = vec![self.parse_dotted_name()?];
                self.skip_alias()?;
                while self.eat_op(",") {
                    names.push(self.parse_dotted_name()?);
                    self.skip_alias()?;
                }
                StmtKind::Import(names)
            }
            Some("from") => {
                self.advance();
                let mut module = String::new();
                while self.eat_op(".") {
                    module.push('.');
                }
                if !self.is_keyword("import") {
                    module.push_str(&self.parse_dotted_name()?);
                }
                self.expect_keyword("import")?;
                let parenthesized = self.eat_op("(");
                let mut names = Vec::new();
                if self.eat_op("*") {
                    names.push("*".to_string());
                } else {
                    loop {
                        names.push(self.expect_name()?);
                        self.skip_alias()?;
                        if !self.eat_op(",") || (parenthesized && self.is_op(")")) {
                            break;
                        }
                    }
                }
                if parenthesized {
                    self.expect_op(")")?;
                }
                StmtKind::ImportFrom { module, names }
            }
            Some(scope @ ("global" | "nonlocal")) => {
                let scope = scope.to_string();
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                if scope == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            _ => self.parse_expression_statement(loc)?,
        };
        Ok(Stmt { kind, loc })
    }

    fn parse_dotted_name(&mut self) -> ParseResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn skip_alias(&mut self) -> ParseResult<()> {
        if self.eat_keyword("as") {
            self.expect_name()?;
        }
        Ok(())
    }

    fn parse_expression_statement(&mut self, loc: Location) -> ParseResult<StmtKind> {
        let first = self.parse_expr_list()?;

        let augmented = match self.peek_kind() {
            TokenKind::Op(op) => augmented_op(op),
            _ => None,
        };
        if let Some(op) = augmented {
            self.advance();
            let target = self.to_target(first, loc)?;
            if matches!(target, Target::Sequence(_)) {
                return Err(Diagnostic::new(
                    loc.line,
                    loc.column,
                    "illegal expression for augmented assignment",
                ));
            }
            let value = self.parse_expr_list()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        if !self.is_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.parse_expr_list()?);
        }
        let value = exprs.pop().unwrap_or(Expr::None);
        let targets = exprs
            .into_iter()
            .map(|expr| self.to_target(expr, loc))
            .collect::<ParseResult<Vec<_>>>()?;
        Ok(StmtKind::Assign { targets, value })
    }

    fn to_target(&self, expr: Expr, loc: Location) -> ParseResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            Expr::Attribute { value, attr } => Ok(Target::Attribute {
                value: *value,
                attr,
            }),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Sequence(
                items
                    .into_iter()
                    .map(|item| self.to_target(item, loc))
                    .collect::<ParseResult<Vec<_>>>()?,
            )),
            _ => Err(Diagnostic::new(
                loc.line,
                loc.column,
                "cannot assign to expression",
            )),
        }
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek_kind(), TokenKind::Newline) {
            return self.parse_simple_line();
        }
        self.advance();
        if !matches!(self.peek_kind(), TokenKind::Indent) {
            return Err(self.error_here("expected an indented block"));
        }
        self.advance();
        self.nested(|parser| {
            let mut body = Vec::new();
            loop {
                match parser.peek_kind() {
                    TokenKind::Dedent => {
                        parser.advance();
                        break;
                    }
                    TokenKind::Eof => break,
                    TokenKind::Newline => {
                        parser.advance();
                    }
                    _ => body.extend(parser.parse_statement()?),
                }
            }
            Ok(body)
        })
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let mut branches = Vec::new();
        loop {
            let loc = self.loc();
            self.advance(); // `if` or `elif`
            let test = self.parse_expr()?;
            let body = self.parse_block()?;
            branches.push((loc, test, body));
            if !self.is_keyword("elif") {
                break;
            }
            if branches.len() >= MAX_EXPR_DEPTH {
                return Err(self.error_here("code is nested too deeply"));
            }
        }
        let mut orelse = if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };

        // Each `elif` is an `if` nested in the previous branch's `else`.
        while let Some((loc, test, body)) = branches.pop() {
            orelse = vec![Stmt {
                kind: StmtKind::If { test, body, orelse },
                loc,
            }];
        }
        orelse
            .pop()
            .ok_or_else(|| self.error_here("expected 'if'"))
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let loc = self.loc();
        self.advance();
        let test = self.parse_expr()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            loc,
        })
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let loc = self.loc();
        self.advance();
        let target = self.parse_target_list(loc)?;
        self.expect_keyword("in")?;
        let iter = self.parse_expr_list()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            loc,
        })
    }

    /// Loop targets stop at `in`, so they are parsed below comparison level.
    fn parse_target_list(&mut self, loc: Location) -> ParseResult<Target> {
        let first = self.parse_bitor()?;
        if !self.is_op(",") {
            return self.to_target(first, loc);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_keyword("in") {
                break;
            }
            items.push(self.parse_bitor()?);
        }
        self.to_target(Expr::Tuple(items), loc)
    }

    fn parse_def(&mut self) -> ParseResult<Stmt> {
        let loc = self.loc();
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_expr()?;
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef {
                name,
                params,
                body: Rc::new(body),
            },
            loc,
        })
    }

    fn parse_params(&mut self, close: &str) -> ParseResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(close) {
            if self.is_op("*") || self.is_op("**") || self.is_op("/") {
                return Err(self.error_here("variadic and positional-only parameters are not supported"));
            }
            let name = self.expect_name()?;
            // Annotations are accepted and ignored in `def`; lambdas have none.
            if close == ")" && self.eat_op(":") {
                self.parse_expr()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error_here("non-default argument follows default argument"));
                }
                None
            };
            if params.iter().any(|p| p.name == name) {
                return Err(self.error_here(format!(
                    "duplicate argument '{}' in function definition",
                    name
                )));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn parse_try(&mut self) -> ParseResult<Stmt> {
        let loc = self.loc();
        self.advance();
        let body = self.parse_block()?;

        let mut handlers = Vec::new();
        while self.is_keyword("except") {
            let handler_loc = self.loc();
            self.advance();
            let (kind, name) = if self.is_op(":") {
                (None, None)
            } else {
                let kind = self.parse_expr()?;
                let name = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.parse_block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body,
                loc: handler_loc,
            });
        }

        let orelse = if !handlers.is_empty() && self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_keyword("finally") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error_here("expected 'except' or 'finally' block"));
        }

        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            loc,
        })
    }

    // ---- expressions ---------------------------------------------------

    /// An expression, or a bare tuple of expressions separated by commas.
    fn parse_expr_list(&mut self) -> ParseResult<Expr> {
        let first = self.parse_expr()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.nested(|parser| {
            if parser.is_keyword("lambda") {
                return parser.parse_lambda();
            }
            let body = parser.parse_or_test()?;
            if !parser.eat_keyword("if") {
                return Ok(body);
            }
            let test = parser.parse_or_test()?;
            parser.expect_keyword("else")?;
            let orelse = parser.parse_expr()?;
            Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            })
        })
    }

    fn parse_lambda(&mut self) -> ParseResult<Expr> {
        self.advance();
        let params = self.parse_params(":")?;
        self.expect_op(":")?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda {
            params,
            body: Rc::new(body),
        })
    }

    fn parse_or_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and_test()?;
        let mut depth = None;
        while self.eat_keyword("or") {
            let right = self.parse_and_test()?;
            let spine = depth.unwrap_or_else(|| left.depth());
            depth = Some(self.chain_link(spine, right.depth())?);
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not_test()?;
        let mut depth = None;
        while self.eat_keyword("and") {
            let right = self.parse_not_test()?;
            let spine = depth.unwrap_or_else(|| left.depth());
            depth = Some(self.chain_link(spine, right.depth())?);
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_test(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.nested(|parser| parser.parse_not_test())?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        while let Some((op, width)) = self.peek_comparison() {
            for _ in 0..width {
                self.advance();
            }
            ops.push((op, self.parse_bitor()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    /// The comparison operator at the cursor and how many tokens it spans.
    fn peek_comparison(&self) -> Option<(CmpOp, usize)> {
        let next_is = |word: &str| matches!(self.peek_nth_kind(1), TokenKind::Name(n) if n == word);
        Some(match self.peek_kind() {
            TokenKind::Op("==") => (CmpOp::Eq, 1),
            TokenKind::Op("!=") => (CmpOp::NotEq, 1),
            TokenKind::Op("<") => (CmpOp::Lt, 1),
            TokenKind::Op("<=") => (CmpOp::LtE, 1),
            TokenKind::Op(">") => (CmpOp::Gt, 1),
            TokenKind::Op(">=") => (CmpOp::GtE, 1),
            TokenKind::Name(n) if n == "in" => (CmpOp::In, 1),
            TokenKind::Name(n) if n == "not" && next_is("in") => (CmpOp::NotIn, 2),
            TokenKind::Name(n) if n == "is" && next_is("not") => (CmpOp::IsNot, 2),
            TokenKind::Name(n) if n == "is" => (CmpOp::Is, 1),
            _ => return None,
        })
    }

    fn parse_binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> ParseResult<Expr>,
    ) -> ParseResult<Expr> {
        let mut left = next(self)?;
        let mut depth = None;
        'outer: loop {
            for (symbol, op) in table {
                if self.is_op(symbol) {
                    self.advance();
                    let right = next(self)?;
                    let spine = depth.unwrap_or_else(|| left.depth());
                    depth = Some(self.chain_link(spine, right.depth())?);
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_bitor(&mut self) -> ParseResult<Expr> {
        self.parse_binary_level(&[("|", BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> ParseResult<Expr> {
        self.parse_binary_level(&[("^", BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> ParseResult<Expr> {
        self.parse_binary_level(&[("&", BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> ParseResult<Expr> {
        self.parse_binary_level(
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> ParseResult<Expr> {
        self.parse_binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_term)
    }

    fn parse_term(&mut self) -> ParseResult<Expr> {
        self.parse_binary_level(
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
            ],
            Self::parse_factor,
        )
    }

    fn parse_factor(&mut self) -> ParseResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Op("-") => Some(UnaryOp::Neg),
            TokenKind::Op("+") => Some(UnaryOp::Pos),
            TokenKind::Op("~") => Some(UnaryOp::Invert),
            _ => None,
        };
        let Some(op) = op else {
            return self.parse_power();
        };
        self.advance();
        let operand = self.nested(|parser| parser.parse_factor())?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_power(&mut self) -> ParseResult<Expr> {
        let base = self.parse_primary()?;
        if self.eat_op("**") {
            let exponent = self.nested(|parser| parser.parse_factor())?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_atom()?;
        let mut depth = None;
        loop {
            if self.eat_op("(") {
                let spine = depth.unwrap_or_else(|| expr.depth());
                expr = self.parse_call(expr)?;
                let operands = match &expr {
                    Expr::Call { args, keywords, .. } => args
                        .iter()
                        .chain(keywords.iter().map(|(_, value)| value))
                        .map(Expr::depth)
                        .max()
                        .unwrap_or(0),
                    _ => 0,
                };
                depth = Some(self.chain_link(spine, operands)?);
            } else if self.eat_op("[") {
                let spine = depth.unwrap_or_else(|| expr.depth());
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                depth = Some(self.chain_link(spine, index.depth())?);
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = match self.peek_kind().clone() {
                    TokenKind::Name(name) => {
                        self.advance();
                        name
                    }
                    _ => return Err(self.error_here("expected attribute name")),
                };
                let spine = depth.unwrap_or_else(|| expr.depth());
                depth = Some(self.chain_link(spine, 0)?);
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_call(&mut self, func: Expr) -> ParseResult<Expr> {
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        while !self.is_op(")") {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.error_here("argument unpacking is not supported"));
            }
            let is_keyword_arg = matches!(self.peek_kind(), TokenKind::Name(_))
                && matches!(self.peek_nth_kind(1), TokenKind::Op("="));
            if is_keyword_arg {
                let name = self.expect_name()?;
                self.advance();
                if keywords.iter().any(|(k, _)| *k == name) {
                    return Err(self.error_here(format!("keyword argument repeated: {}", name)));
                }
                keywords.push((name, self.parse_expr()?));
            } else {
                if !keywords.is_empty() {
                    return Err(self.error_here("positional argument follows keyword argument"));
                }
                let arg = self.parse_expr()?;
                if self.is_keyword("for") {
                    let generators = self.parse_comprehension_clauses()?;
                    args.push(Expr::ListComp {
                        element: Box::new(arg),
                        generators,
                    });
                    break;
                }
                args.push(arg);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            keywords,
        })
    }

    fn parse_subscript(&mut self) -> ParseResult<Expr> {
        let lower = if self.is_op(":") {
            None
        } else {
            let expr = self.parse_expr_list()?;
            if !self.is_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let upper = if self.is_op("]") || self.is_op(":") {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.eat_op(":") && !self.is_op("]") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn parse_comprehension_clauses(&mut self) -> ParseResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.is_keyword("for") {
            let loc = self.loc();
            self.advance();
            let target = self.parse_target_list(loc)?;
            self.expect_keyword("in")?;
            let iter = self.parse_or_test()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.parse_or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Op("(") => {
                self.advance();
                self.nested(|parser| parser.parse_paren())
            }
            TokenKind::Op("[") => {
                self.advance();
                self.nested(|parser| parser.parse_list())
            }
            TokenKind::Op("{") => {
                self.advance();
                self.nested(|parser| parser.parse_dict())
            }
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            TokenKind::Str(_) | TokenKind::FStr { .. } => self.parse_strings(),
            TokenKind::Name(name) => match name.as_str() {
                "None" => {
                    self.advance();
                    Ok(Expr::None)
                }
                "True" => {
                    self.advance();
                    Ok(Expr::Bool(true))
                }
                "False" => {
                    self.advance();
                    Ok(Expr::Bool(false))
                }
                "yield" | "await" => Err(self.error_here(format!(
                    "'{}' is not supported in restricted code",
                    name
                ))),
                n if is_keyword(n) => Err(self.error_here("invalid syntax")),
                _ => {
                    self.advance();
                    Ok(Expr::Name(name))
                }
            },
            TokenKind::Eof | TokenKind::Newline => Err(self.error_here("unexpected end of input")),
            _ => Err(self.error_here("invalid syntax")),
        }
    }

    fn parse_paren(&mut self) -> ParseResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.parse_expr()?;
        if self.is_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                generators,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(")") {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn parse_list(&mut self) -> ParseResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expr()?;
        if self.is_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn parse_dict(&mut self) -> ParseResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        if self.is_op("**") {
            return Err(self.error_here("dict unpacking is not supported"));
        }
        let key = self.parse_expr()?;
        if !self.eat_op(":") {
            return Err(self.error_here("set literals are not supported"));
        }
        let value = self.parse_expr()?;
        if self.is_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                generators,
            });
        }
        let mut items = vec![(key, value)];
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            let key = self.parse_expr()?;
            self.expect_op(":")?;
            items.push((key, self.parse_expr()?));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(items))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole
    /// run an f-string.
    fn parse_strings(&mut self) -> ParseResult<Expr> {
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;
        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Str(text) => {
                    self.advance();
                    parts.push(FStringPart::Literal(text));
                }
                TokenKind::FStr { ref body, raw } => {
                    self.advance();
                    formatted = true;
                    parts.extend(parse_fstring(body, raw, &token)?);
                }
                _ => break,
            }
        }

        if !formatted {
            let text = parts
                .into_iter()
                .map(|part| match part {
                    FStringPart::Literal(text) => text,
                    FStringPart::Field { .. } => String::new(),
                })
                .collect();
            return Ok(Expr::Str(text));
        }
        Ok(Expr::FString(parts))
    }
}

fn augmented_op(op: &str) -> Option<BinOp> {
    Some(match op {
        "+=" => BinOp::Add,
        "-=" => BinOp::Sub,
        "*=" => BinOp::Mul,
        "/=" => BinOp::Div,
        "//=" => BinOp::FloorDiv,
        "%=" => BinOp::Mod,
        "**=" => BinOp::Pow,
        "&=" => BinOp::BitAnd,
        "|=" => BinOp::BitOr,
        "^=" => BinOp::BitXor,
        "<<=" => BinOp::LShift,
        ">>=" => BinOp::RShift,
        _ => return None,
    })
}

/// Splits an f-string body into literal text and `{expression}` fields.
fn parse_fstring(body: &str, raw: bool, token: &Token) -> ParseResult<Vec<FStringPart>> {
    let at_token = |message: String| Diagnostic::new(token.line, token.column, message);
    let decode = |text: &str| -> ParseResult<String> {
        if raw {
            Ok(text.to_string())
        } else {
            unescape(text).map_err(|msg| at_token(msg))
        }
    };

    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '{' && chars.get(i + 1) == Some(&'{') {
            literal.push('{');
            i += 2;
            continue;
        }
        if ch == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(at_token("f-string: single '}' is not allowed".to_string()));
        }
        if ch != '{' {
            literal.push(ch);
            i += 1;
            continue;
        }

        if !literal.is_empty() {
            parts.push(FStringPart::Literal(decode(&literal)?));
            literal.clear();
        }

        // Scan to the closing brace, respecting nested brackets and quotes.
        let start = i + 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut conversion_at = None;
        let mut j = start;
        let end = loop {
            let Some(&c) = chars.get(j) else {
                return Err(at_token("f-string: expecting '}'".to_string()));
            };
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None => match c {
                    '\'' | '"' => quote = Some(c),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' => depth = depth.saturating_sub(1),
                    '}' if depth > 0 => depth -= 1,
                    '}' => break j,
                    '!' if depth == 0 && chars.get(j + 1) != Some(&'=') => {
                        conversion_at = Some(j)
                    }
                    ':' if depth == 0 => {
                        return Err(at_token(
                            "f-string: format specifications are not supported".to_string(),
                        ))
                    }
                    _ => {}
                },
            }
            j += 1;
        };

        let expr_end = conversion_at.unwrap_or(end);
        let source: String = chars[start..expr_end].iter().collect();
        if source.trim().is_empty() {
            return Err(at_token("f-string: empty expression not allowed".to_string()));
        }
        let conversion = match conversion_at {
            Some(at) => {
                let spec: String = chars[at + 1..end].iter().collect();
                match spec.as_str() {
                    "r" => Some('r'),
                    "s" => Some('s'),
                    _ => {
                        return Err(at_token(format!(
                            "f-string: invalid conversion character '{}'",
                            spec
                        )))
                    }
                }
            }
            None => None,
        };
        let value = parse_expression(&source)
            .map_err(|diag| at_token(format!("f-string: {}", diag.message)))?;
        parts.push(FStringPart::Field { value, conversion });
        i = end + 1;
    }

    if !literal.is_empty() {
        parts.push(FStringPart::Literal(decode(&literal)?));
    }
    Ok(parts)
}
