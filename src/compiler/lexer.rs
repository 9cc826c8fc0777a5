//! Tokenizer for guest scripts.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and `Dedent`
//! tokens so the parser never has to look at raw whitespace. Newlines inside
//! brackets are ignored, as are blank and comment-only lines.

use super::Diagnostic;

/// Operators and delimiters, longest first so greedy matching works.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "<<", ">>", ":=", "+", "-", "*", "/", "%", "<", ">", "=",
    "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

const TAB_WIDTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string, escapes not yet processed.
    FStr { body: String, raw: bool },
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

/// Splits `source` into tokens.
///
/// # Errors
///
/// Returns a [`Diagnostic`] pointing at the offending character for
/// unterminated strings, malformed numbers, inconsistent dedents and
/// characters outside the language.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Diagnostic> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    indents: Vec<usize>,
    depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            indents: vec![0],
            depth: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.line, self.column, message)
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline) | Some(TokenKind::Indent) | Some(TokenKind::Dedent)
        )
    }

    fn run(mut self) -> Result<Vec<Token>, Diagnostic> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.handle_indentation()? {
                    break;
                }
                continue;
            }

            let Some(ch) = self.peek() else { break };
            match ch {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    let (line, column) = (self.line, self.column);
                    self.advance();
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(TokenKind::Newline, line, column);
                        }
                        self.at_line_start = true;
                    }
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.advance();
                    while matches!(self.peek(), Some('\r')) {
                        self.advance();
                    }
                    if self.peek() != Some('\n') {
                        return Err(self.error("unexpected character after line continuation"));
                    }
                    self.advance();
                }
                '"' | '\'' => self.lex_string(String::new())?,
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_name()?,
                _ => self.lex_operator()?,
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected end of input inside brackets"));
        }
        let (line, column) = (self.line, self.column);
        if !self.last_is_newline() {
            self.push(TokenKind::Newline, line, column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, line, column);
        }
        self.push(TokenKind::Eof, line, column);
        Ok(self.tokens)
    }

    /// Measures leading whitespace and emits `Indent`/`Dedent` tokens.
    ///
    /// Returns `false` once the end of input is reached.
    fn handle_indentation(&mut self) -> Result<bool, Diagnostic> {
        let mut width = 0;
        while let Some(ch) = self.peek() {
            match ch {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.advance();
        }

        match self.peek() {
            None => return Ok(false),
            Some('\n') => {
                self.advance();
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.advance();
                }
                return Ok(true);
            }
            _ => {}
        }

        self.at_line_start = false;
        let current = self.indents.last().copied().unwrap_or(0);
        let (line, column) = (self.line, self.column);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, line, column);
        } else if width < current {
            while self.indents.last().is_some_and(|&level| level > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, line, column);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn lex_name(&mut self) -> Result<(), Diagnostic> {
        let (line, column) = (self.line, self.column);
        let mut name = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if matches!(self.peek(), Some('"') | Some('\'')) && is_string_prefix(&name) {
            return self.lex_string(name.to_ascii_lowercase());
        }

        self.push(TokenKind::Name(name), line, column);
        Ok(())
    }

    fn lex_string(&mut self, prefix: String) -> Result<(), Diagnostic> {
        let line = self.line;
        let column = self.column.saturating_sub(prefix.len());
        if prefix.contains('b') {
            return Err(Diagnostic::new(line, column, "bytes literals are not supported"));
        }
        let raw = prefix.contains('r');
        let formatted = prefix.contains('f');

        let quote = self.advance().ok_or_else(|| self.error("expected string"))?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        let mut body = String::new();
        loop {
            let Some(ch) = self.advance() else {
                return Err(Diagnostic::new(line, column, "unterminated string literal"));
            };
            if ch == '\\' {
                body.push(ch);
                if let Some(next) = self.advance() {
                    body.push(next);
                }
                continue;
            }
            if ch == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.advance();
                    self.advance();
                    break;
                }
            }
            if ch == '\n' && !triple {
                return Err(Diagnostic::new(line, column, "unterminated string literal"));
            }
            body.push(ch);
        }

        let kind = if formatted {
            TokenKind::FStr { body, raw }
        } else if raw {
            TokenKind::Str(body)
        } else {
            TokenKind::Str(unescape(&body).map_err(|msg| Diagnostic::new(line, column, msg))?)
        };
        self.push(kind, line, column);
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), Diagnostic> {
        let (line, column) = (self.line, self.column);

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.advance();
                self.advance();
                let mut digits = String::new();
                while let Some(ch) = self.peek() {
                    if ch.is_digit(radix) {
                        digits.push(ch);
                    } else if ch != '_' {
                        break;
                    }
                    self.advance();
                }
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| Diagnostic::new(line, column, "invalid integer literal"))?;
                self.push(TokenKind::Int(value), line, column);
                return Ok(());
            }
        }

        let mut text = String::new();
        let mut is_float = false;
        self.take_digits(&mut text);
        if self.peek() == Some('.')
            && !self.peek_at(1).is_some_and(|c| c.is_alphabetic() || c == '_')
        {
            is_float = true;
            text.push('.');
            self.advance();
            self.take_digits(&mut text);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let exponent_follows = match sign {
                Some('+') | Some('-') => self.peek_at(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if exponent_follows {
                is_float = true;
                text.push('e');
                self.advance();
                if let Some(s @ ('+' | '-')) = self.peek() {
                    text.push(s);
                    self.advance();
                }
                self.take_digits(&mut text);
            }
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(self.error("invalid numeric literal"));
        }

        let kind = if is_float {
            TokenKind::Float(
                text.parse()
                    .map_err(|_| Diagnostic::new(line, column, "invalid float literal"))?,
            )
        } else {
            TokenKind::Int(
                text.parse()
                    .map_err(|_| Diagnostic::new(line, column, "integer literal is too large"))?,
            )
        };
        self.push(kind, line, column);
        Ok(())
    }

    fn take_digits(&mut self, text: &mut String) {
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
            } else if ch != '_' {
                break;
            }
            self.advance();
        }
    }

    fn lex_operator(&mut self) -> Result<(), Diagnostic> {
        let (line, column) = (self.line, self.column);
        let rest: String = self.chars[self.pos..].iter().take(3).collect();
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            return Err(self.error(format!(
                "invalid character '{}' in source",
                self.peek().unwrap_or('?')
            )));
        };
        for _ in 0..op.len() {
            self.advance();
        }
        match *op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                if self.depth == 0 {
                    return Err(Diagnostic::new(line, column, format!("unmatched '{}'", op)));
                }
                self.depth -= 1;
            }
            _ => {}
        }
        self.push(TokenKind::Op(op), line, column);
        Ok(())
    }
}

fn is_string_prefix(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "r" | "u" | "f" | "b" | "rf" | "fr" | "rb" | "br"
    )
}

/// Processes backslash escapes in a non-raw string body.
pub fn unescape(body: &str) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            None => out.push('\\'),
            Some('\n') => {}
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(kind @ ('x' | 'u' | 'U')) => {
                let len = match kind {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = chars.by_ref().take(len).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == len)
                    .ok_or_else(|| format!("truncated \\{}{} escape", kind, "X".repeat(len)))?;
                let decoded = char::from_u32(code)
                    .ok_or_else(|| format!("invalid unicode escape \\{}{}", kind, hex))?;
                out.push(decoded);
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            kinds("x = 1\n"),
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Op("="),
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let tokens = kinds("if x:\n    y = 1\nz = 2");
        assert!(tokens.contains(&TokenKind::Indent));
        assert!(tokens.contains(&TokenKind::Dedent));
        let indent = tokens.iter().position(|t| *t == TokenKind::Indent).unwrap();
        let dedent = tokens.iter().position(|t| *t == TokenKind::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let tokens = kinds("x = 1\n\n   # note\n\ny = 2\n");
        let newlines = tokens.iter().filter(|t| **t == TokenKind::Newline).count();
        assert_eq!(newlines, 2);
        assert!(!tokens.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_newlines_inside_brackets_ignored() {
        let tokens = kinds("x = [\n  1,\n  2,\n]\n");
        let newlines = tokens.iter().filter(|t| **t == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("0x1f")[0], TokenKind::Int(31));
        assert_eq!(kinds("1_000")[0], TokenKind::Int(1000));
        assert_eq!(kinds("2.5")[0], TokenKind::Float(2.5));
        assert_eq!(kinds(".5")[0], TokenKind::Float(0.5));
        assert_eq!(kinds("1e3")[0], TokenKind::Float(1000.0));
    }

    #[test]
    fn test_integer_literal_too_large() {
        let err = tokenize("99999999999999999999").unwrap_err();
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(kinds(r#""a\nb""#)[0], TokenKind::Str("a\nb".into()));
        assert_eq!(kinds(r#"'it\'s'"#)[0], TokenKind::Str("it's".into()));
        assert_eq!(kinds(r#"r"a\nb""#)[0], TokenKind::Str("a\\nb".into()));
        assert_eq!(kinds("'''multi\nline'''")[0], TokenKind::Str("multi\nline".into()));
        assert_eq!(kinds(r#""\x41\u00e9""#)[0], TokenKind::Str("Aé".into()));
    }

    #[test]
    fn test_fstring_token() {
        assert_eq!(
            kinds(r#"f"v={x}""#)[0],
            TokenKind::FStr {
                body: "v={x}".into(),
                raw: false
            }
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x = 'abc\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_bytes_rejected() {
        assert!(tokenize("b'abc'").is_err());
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n        a = 1\n    b = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(kinds("a **= 2")[1], TokenKind::Op("**="));
        assert_eq!(kinds("a // b")[1], TokenKind::Op("//"));
    }

    #[test]
    fn test_invalid_character() {
        let err = tokenize("x = $").unwrap_err();
        assert_eq!(err.column, 5);
    }

    #[test]
    fn test_token_positions() {
        let tokens = tokenize("a = 1\nbb = 2\n").unwrap();
        let bb = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Name("bb".into()))
            .unwrap();
        assert_eq!((bb.line, bb.column), (2, 1));
    }
}
