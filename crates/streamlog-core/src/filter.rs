//! Record Filter Expressions
//!
//! Iterators and stream listings accept an optional filter written in a small
//! jq-like language. A filter is compiled once and evaluated against each
//! record payload (or a stream's properties object); it must produce a
//! boolean.
//!
//! ## Supported Syntax
//!
//! ```text
//! .                      identity
//! .level  .a.b  .a[0]    path access (missing keys yield null)
//! .["odd key"]           quoted key access
//! "s"  12  1.5  true  false  null
//! ==  !=  <  <=  >  >=   comparisons (jq ordering across types)
//! and  or                boolean connectives (false and null are falsy)
//! a | b                  pipe: evaluate b with the output of a as input
//! ( ... )                grouping
//! not  length  has(k)  startswith(s)  endswith(s)  contains(x)
//! ```
//!
//! ## Examples
//!
//! ```ignore
//! let filter = Filter::compile(r#".level == "warn""#)?;
//! assert!(filter.matches(&json!({"level": "warn"}))?);
//!
//! let filter = Filter::compile(r#".user.age >= 18 and (.tags | contains(["vip"]))"#)?;
//! ```

use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use crate::error::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FilterError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("filter produced {0} instead of a boolean")]
    NotBoolean(String),
}

impl From<FilterError> for Error {
    fn from(e: FilterError) -> Self {
        Error::InvalidFilter(e.to_string())
    }
}

/// A compiled filter expression
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    /// Parse an expression. Errors here are caller mistakes and are reported
    /// before any iterator or listing is created.
    pub fn compile(source: &str) -> Result<Self, FilterError> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_pipe()?;
        if let Some(tok) = parser.peek() {
            return Err(FilterError::Parse {
                position: tok.position,
                message: format!("unexpected {:?}", tok.kind),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Expression text as given to [`Filter::compile`].
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to an arbitrary JSON value.
    pub fn evaluate(&self, input: &Value) -> Result<Value, FilterError> {
        eval(&self.expr, input)
    }

    /// Evaluate and require a boolean outcome.
    pub fn matches(&self, input: &Value) -> Result<bool, FilterError> {
        match self.evaluate(input)? {
            Value::Bool(b) => Ok(b),
            other => Err(FilterError::NotBoolean(type_name(&other).to_string())),
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Dot,
    Ident(String),
    Str(String),
    Num(f64),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Pipe,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

struct Lexer {
    chars: Vec<(usize, char)>,
    idx: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.char_indices().collect(),
            idx: 0,
        }
    }

    fn peek_char(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.idx + ahead).map(|(_, c)| *c)
    }

    fn position(&self) -> usize {
        self.chars
            .get(self.idx)
            .map(|(p, _)| *p)
            .unwrap_or_else(|| self.chars.last().map(|(p, c)| p + c.len_utf8()).unwrap_or(0))
    }

    fn tokenize(mut self) -> Result<Vec<Token>, FilterError> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek_char(0) {
            let position = self.position();
            let kind = match c {
                c if c.is_whitespace() => {
                    self.idx += 1;
                    continue;
                }
                '.' => {
                    self.idx += 1;
                    TokenKind::Dot
                }
                '[' => {
                    self.idx += 1;
                    TokenKind::LBracket
                }
                ']' => {
                    self.idx += 1;
                    TokenKind::RBracket
                }
                '(' => {
                    self.idx += 1;
                    TokenKind::LParen
                }
                ')' => {
                    self.idx += 1;
                    TokenKind::RParen
                }
                '|' => {
                    self.idx += 1;
                    TokenKind::Pipe
                }
                ',' => {
                    self.idx += 1;
                    TokenKind::Comma
                }
                '=' if self.peek_char(1) == Some('=') => {
                    self.idx += 2;
                    TokenKind::Eq
                }
                '!' if self.peek_char(1) == Some('=') => {
                    self.idx += 2;
                    TokenKind::Ne
                }
                '<' if self.peek_char(1) == Some('=') => {
                    self.idx += 2;
                    TokenKind::Le
                }
                '<' => {
                    self.idx += 1;
                    TokenKind::Lt
                }
                '>' if self.peek_char(1) == Some('=') => {
                    self.idx += 2;
                    TokenKind::Ge
                }
                '>' => {
                    self.idx += 1;
                    TokenKind::Gt
                }
                '"' => self.read_string(position)?,
                c if c.is_ascii_digit()
                    || (c == '-' && self.peek_char(1).is_some_and(|d| d.is_ascii_digit())) =>
                {
                    self.read_number(position)?
                }
                c if c.is_alphabetic() || c == '_' => self.read_ident(),
                other => {
                    return Err(FilterError::Parse {
                        position,
                        message: format!("unexpected character '{}'", other),
                    })
                }
            };
            tokens.push(Token { kind, position });
        }

        Ok(tokens)
    }

    fn read_string(&mut self, start: usize) -> Result<TokenKind, FilterError> {
        self.idx += 1; // opening quote
        let mut out = String::new();
        loop {
            let c = self.peek_char(0).ok_or(FilterError::Parse {
                position: start,
                message: "unterminated string".to_string(),
            })?;
            self.idx += 1;
            match c {
                '"' => return Ok(TokenKind::Str(out)),
                '\\' => {
                    let escaped = self.peek_char(0).ok_or(FilterError::Parse {
                        position: start,
                        message: "unterminated escape".to_string(),
                    })?;
                    self.idx += 1;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '"' => '"',
                        '\\' => '\\',
                        '/' => '/',
                        other => {
                            return Err(FilterError::Parse {
                                position: self.position(),
                                message: format!("unsupported escape '\\{}'", other),
                            })
                        }
                    });
                }
                other => out.push(other),
            }
        }
    }

    fn read_number(&mut self, start: usize) -> Result<TokenKind, FilterError> {
        let mut text = String::new();
        if self.peek_char(0) == Some('-') {
            text.push('-');
            self.idx += 1;
        }
        while let Some(c) = self.peek_char(0) {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                text.push(c);
                self.idx += 1;
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(TokenKind::Num)
            .map_err(|_| FilterError::Parse {
                position: start,
                message: format!("invalid number '{}'", text),
            })
    }

    fn read_ident(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek_char(0) {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.idx += 1;
            } else {
                break;
            }
        }
        TokenKind::Ident(text)
    }
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    Path(Vec<Step>),
    Literal(Value),
    Pipe(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn error_here(&self, message: impl Into<String>) -> FilterError {
        let position = self
            .peek()
            .map(|t| t.position)
            .or_else(|| self.tokens.last().map(|t| t.position + 1))
            .unwrap_or(0);
        FilterError::Parse {
            position,
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), FilterError> {
        match self.peek_kind() {
            Some(k) if *k == kind => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error_here(format!("expected {:?}", kind))),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Ident(w)) if w == word)
    }

    fn parse_pipe(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_or()?;
        while matches!(self.peek_kind(), Some(TokenKind::Pipe)) {
            self.pos += 1;
            let right = self.parse_or()?;
            left = Expr::Pipe(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_compare()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.parse_compare()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_compare(&mut self) -> Result<Expr, FilterError> {
        let left = self.parse_primary()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Eq) => CmpOp::Eq,
            Some(TokenKind::Ne) => CmpOp::Ne,
            Some(TokenKind::Lt) => CmpOp::Lt,
            Some(TokenKind::Le) => CmpOp::Le,
            Some(TokenKind::Gt) => CmpOp::Gt,
            Some(TokenKind::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        let tok = self
            .next()
            .ok_or_else(|| self.error_here("unexpected end of expression"))?;

        match tok.kind {
            TokenKind::Dot => self.parse_path(),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Num(n) => Ok(Expr::Literal(number(n))),
            TokenKind::LParen => {
                let inner = self.parse_pipe()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                // Array literal of constants, e.g. ["vip", "eu"]
                let mut items = Vec::new();
                if !matches!(self.peek_kind(), Some(TokenKind::RBracket)) {
                    loop {
                        items.push(self.parse_literal_item()?);
                        if matches!(self.peek_kind(), Some(TokenKind::Comma)) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::Literal(Value::Array(items)))
            }
            TokenKind::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_call(word, tok.position),
            },
            other => Err(FilterError::Parse {
                position: tok.position,
                message: format!("unexpected {:?}", other),
            }),
        }
    }

    fn parse_literal_item(&mut self) -> Result<Value, FilterError> {
        match self.parse_primary()? {
            Expr::Literal(v) => Ok(v),
            _ => Err(self.error_here("array literals may only contain literals")),
        }
    }

    fn parse_call(&mut self, name: String, position: usize) -> Result<Expr, FilterError> {
        let arity = match name.as_str() {
            "not" | "length" => 0,
            "has" | "startswith" | "endswith" | "contains" => 1,
            _ => {
                return Err(FilterError::Parse {
                    position,
                    message: format!("unknown function '{}'", name),
                })
            }
        };

        let mut args = Vec::new();
        if arity > 0 {
            self.expect(TokenKind::LParen)?;
            args.push(self.parse_pipe()?);
            self.expect(TokenKind::RParen)?;
        }
        Ok(Expr::Call(name, args))
    }

    /// Parses the remainder of a path after its leading dot.
    fn parse_path(&mut self) -> Result<Expr, FilterError> {
        let mut steps = Vec::new();

        // First segment directly after the leading dot (may be absent: identity)
        match self.peek_kind() {
            Some(TokenKind::Ident(_)) => {
                if let Some(Token {
                    kind: TokenKind::Ident(key),
                    ..
                }) = self.next()
                {
                    steps.push(Step::Key(key));
                }
            }
            Some(TokenKind::Str(_)) => {
                if let Some(Token {
                    kind: TokenKind::Str(key),
                    ..
                }) = self.next()
                {
                    steps.push(Step::Key(key));
                }
            }
            Some(TokenKind::LBracket) => steps.push(self.parse_bracket()?),
            _ => return Ok(Expr::Path(steps)),
        }

        loop {
            match self.peek_kind() {
                Some(TokenKind::Dot) => {
                    self.pos += 1;
                    match self.next().map(|t| t.kind) {
                        Some(TokenKind::Ident(key)) | Some(TokenKind::Str(key)) => {
                            steps.push(Step::Key(key))
                        }
                        Some(TokenKind::LBracket) => {
                            self.pos -= 1;
                            steps.push(self.parse_bracket()?);
                        }
                        _ => return Err(self.error_here("expected key after '.'")),
                    }
                }
                Some(TokenKind::LBracket) => steps.push(self.parse_bracket()?),
                _ => break,
            }
        }

        Ok(Expr::Path(steps))
    }

    fn parse_bracket(&mut self) -> Result<Step, FilterError> {
        self.expect(TokenKind::LBracket)?;
        let step = match self.next().map(|t| t.kind) {
            Some(TokenKind::Str(key)) => Step::Key(key),
            Some(TokenKind::Num(n)) if n.fract() == 0.0 => Step::Index(n as i64),
            _ => return Err(self.error_here("expected string key or integer index")),
        };
        self.expect(TokenKind::RBracket)?;
        Ok(step)
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval(expr: &Expr, input: &Value) -> Result<Value, FilterError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(steps) => {
            let mut current = input.clone();
            for step in steps {
                current = index(&current, step)?;
            }
            Ok(current)
        }
        Expr::Pipe(left, right) => {
            let intermediate = eval(left, input)?;
            eval(right, &intermediate)
        }
        Expr::And(left, right) => {
            if !truthy(&eval(left, input)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(right, input)?)))
        }
        Expr::Or(left, right) => {
            if truthy(&eval(left, input)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(right, input)?)))
        }
        Expr::Compare(op, left, right) => {
            let l = eval(left, input)?;
            let r = eval(right, input)?;
            let ord = compare(&l, &r);
            let result = match op {
                CmpOp::Eq => ord == Ordering::Equal,
                CmpOp::Ne => ord != Ordering::Equal,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        Expr::Call(name, args) => call(name, args, input),
    }
}

fn index(value: &Value, step: &Step) -> Result<Value, FilterError> {
    match (value, step) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Object(map), Step::Key(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Step::Index(i)) => {
            let idx = if *i < 0 { items.len() as i64 + i } else { *i };
            Ok(usize::try_from(idx)
                .ok()
                .and_then(|idx| items.get(idx).cloned())
                .unwrap_or(Value::Null))
        }
        (other, Step::Key(key)) => Err(FilterError::Eval(format!(
            "cannot index {} with \"{}\"",
            type_name(other),
            key
        ))),
        (other, Step::Index(_)) => Err(FilterError::Eval(format!(
            "cannot index {} with number",
            type_name(other)
        ))),
    }
}

fn call(name: &str, args: &[Expr], input: &Value) -> Result<Value, FilterError> {
    let arg = |i: usize| -> Result<Value, FilterError> {
        args.get(i)
            .ok_or_else(|| FilterError::Eval(format!("{} expects an argument", name)))
            .and_then(|e| eval(e, input))
    };

    match name {
        "not" => Ok(Value::Bool(!truthy(input))),
        "length" => match input {
            Value::Null => Ok(Value::from(0)),
            Value::Bool(_) => Err(FilterError::Eval("boolean has no length".to_string())),
            Value::Number(n) => Ok(number(n.as_f64().unwrap_or_default().abs())),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
        },
        "has" => match (input, arg(0)?) {
            (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(&key))),
            (Value::Array(items), Value::Number(n)) => Ok(Value::Bool(
                n.as_u64().is_some_and(|i| (i as usize) < items.len()),
            )),
            (other, _) => Err(FilterError::Eval(format!(
                "cannot check whether {} has a key",
                type_name(other)
            ))),
        },
        "startswith" | "endswith" => match (input, arg(0)?) {
            (Value::String(s), Value::String(affix)) => Ok(Value::Bool(if name == "startswith" {
                s.starts_with(&affix)
            } else {
                s.ends_with(&affix)
            })),
            _ => Err(FilterError::Eval(format!(
                "{}() requires string inputs",
                name
            ))),
        },
        "contains" => {
            let needle = arg(0)?;
            contains(input, &needle).map(Value::Bool)
        }
        other => Err(FilterError::Eval(format!("unknown function '{}'", other))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, FilterError> {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => Ok(h.contains(n.as_str())),
        (Value::Array(h), Value::Array(n)) => {
            for item in n {
                let mut found = false;
                for candidate in h {
                    if contains(candidate, item).unwrap_or(false) {
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Object(h), Value::Object(n)) => {
            for (key, value) in n {
                match h.get(key) {
                    Some(candidate) if contains(candidate, value)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (h, n) if type_name(h) == type_name(n) => Ok(compare(h, n) == Ordering::Equal),
        (h, n) => Err(FilterError::Eval(format!(
            "{} and {} cannot have their containment checked",
            type_name(h),
            type_name(n)
        ))),
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order over JSON values following jq's rules.
fn compare(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut xk: Vec<_> = x.keys().collect();
            let mut yk: Vec<_> = y.keys().collect();
            xk.sort();
            yk.sort();
            let keys = xk.cmp(&yk);
            if keys != Ordering::Equal {
                return keys;
            }
            for key in xk {
                let ord = compare(&x[key], &y[key]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(expr: &str, input: Value) -> bool {
        Filter::compile(expr).unwrap().matches(&input).unwrap()
    }

    #[test]
    fn test_equality_on_field() {
        assert!(matches(r#".level == "warn""#, json!({"level": "warn"})));
        assert!(!matches(r#".level == "warn""#, json!({"level": "info"})));
        assert!(!matches(r#".level == "warn""#, json!({})));
    }

    #[test]
    fn test_nested_paths_and_indexes() {
        let input = json!({"a": {"b": [10, 20, 30]}, "odd key": 1});
        assert!(matches(".a.b[1] == 20", input.clone()));
        assert!(matches(".a.b[-1] == 30", input.clone()));
        assert!(matches(r#".["odd key"] == 1"#, input.clone()));
        assert!(matches(".a.b[7] == null", input));
    }

    #[test]
    fn test_numeric_comparisons() {
        let input = json!({"n": 5, "f": 2.5});
        assert!(matches(".n > 4", input.clone()));
        assert!(matches(".n >= 5", input.clone()));
        assert!(matches(".f < 3", input.clone()));
        assert!(matches(".n != 6", input.clone()));
        assert!(matches(".n == 5.0", input));
    }

    #[test]
    fn test_boolean_connectives_and_grouping() {
        let input = json!({"a": 1, "b": "x"});
        assert!(matches(r#".a == 1 and .b == "x""#, input.clone()));
        assert!(matches(r#".a == 2 or .b == "x""#, input.clone()));
        assert!(!matches(r#"(.a == 2 or .b == "y") and true"#, input.clone()));
        assert!(matches(".a == 2 | not", input));
    }

    #[test]
    fn test_builtins() {
        let input = json!({"tags": ["vip", "eu"], "name": "alice", "meta": {"k": 1}});
        assert!(matches(r#".tags | contains(["vip"])"#, input.clone()));
        assert!(matches(r#".name | startswith("al")"#, input.clone()));
        assert!(matches(r#".name | endswith("ce")"#, input.clone()));
        assert!(matches(r#".meta | has("k")"#, input.clone()));
        assert!(matches(".tags | length == 2", input));
    }

    #[test]
    fn test_cross_type_ordering() {
        assert!(matches(r#"null < false"#, json!(null)));
        assert!(matches(r#"1 < "a""#, json!(null)));
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        let filter = Filter::compile(".level").unwrap();
        let err = filter.matches(&json!({"level": "warn"})).unwrap_err();
        assert!(matches!(err, FilterError::NotBoolean(_)));
    }

    #[test]
    fn test_index_error_on_scalar() {
        let filter = Filter::compile(".a.b == 1").unwrap();
        assert!(matches!(
            filter.matches(&json!({"a": "text"})),
            Err(FilterError::Eval(_))
        ));
    }

    #[test]
    fn test_compile_errors() {
        assert!(Filter::compile(".level ==").is_err());
        assert!(Filter::compile(r#".level == "warn"#).is_err());
        assert!(Filter::compile("frobnicate").is_err());
        assert!(Filter::compile(".a )").is_err());
        assert!(Filter::compile("#").is_err());
    }

    #[test]
    fn test_identity_on_properties_object() {
        assert!(matches(r#".env == "prod""#, json!({"env": "prod"})));
        assert!(matches(r#". | has("env")"#, json!({"env": "prod"})));
    }
}
