//! Selector expressions for queues and consumers.
//!
//! A small SQL-92 style predicate language over message headers:
//!
//! ```text
//! color = 'red' AND (weight > 10 OR priority >= 7)
//! region IN ('eu', 'us') AND sku LIKE 'A-%' AND discount IS NULL
//! ```
//!
//! `priority`, `durable`, `timestamp`, `expiration` and `message_id` name the
//! message's own fields; any other identifier is a header lookup. Comparisons
//! involving a missing header are unknown, and an unknown result never matches.

use std::fmt;

use crate::message::{Message, TypedValue};
use crate::{Error, Result};

#[derive(Clone)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.source).finish()
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Filter {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!("unexpected trailing input in '{source}'")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// `None` and blank strings mean "no filter".
    pub fn parse_optional(source: Option<&str>) -> Result<Option<Self>> {
        match source.map(str::trim) {
            None | Some("") => Ok(None),
            Some(source) => Self::parse(source).map(Some),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, message: &Message) -> bool {
        matches!(self.expr.eval(message), Value::Bool(true))
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidFilter(message.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let op = match (c, next) {
                    ('<', Some('>')) => "<>",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    _ => ">",
                };
                i += op.len();
                tokens.push(Token::Op(op));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                }));
                i += 1;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string literal")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.contains('.') {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| invalid(format!("bad number '{text}'")))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| invalid(format!("bad number '{text}'")))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn from_typed(value: &TypedValue) -> Self {
        match value {
            TypedValue::Bool(v) => Value::Bool(*v),
            TypedValue::Float(v) => Value::Float(*v as f64),
            TypedValue::Double(v) => Value::Float(*v),
            TypedValue::String(v) => Value::Str(v.clone()),
            TypedValue::Bytes(_) => Value::Null,
            other => other.as_i64().map_or(Value::Null, Value::Int),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Field(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(&'static str, Box<Expr>, Box<Expr>),
    Arith(&'static str, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    IsNull(Box<Expr>, bool),
    In(Box<Expr>, Vec<Value>, bool),
    Like(Box<Expr>, String, Option<char>, bool),
    Between(Box<Expr>, Box<Expr>, Box<Expr>, bool),
}

fn not3(v: Value) -> Value {
    match v {
        Value::Bool(b) => Value::Bool(!b),
        _ => Value::Null,
    }
}

impl Expr {
    fn eval(&self, message: &Message) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Field(name) => field(message, name),
            Expr::Not(inner) => not3(inner.eval(message)),
            Expr::And(a, b) => match (a.eval(message), b.eval(message)) {
                (Value::Bool(false), _) | (_, Value::Bool(false)) => Value::Bool(false),
                (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
                _ => Value::Null,
            },
            Expr::Or(a, b) => match (a.eval(message), b.eval(message)) {
                (Value::Bool(true), _) | (_, Value::Bool(true)) => Value::Bool(true),
                (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
                _ => Value::Null,
            },
            Expr::Compare(op, a, b) => compare(op, &a.eval(message), &b.eval(message)),
            Expr::Arith(op, a, b) => arith(op, &a.eval(message), &b.eval(message)),
            Expr::Negate(inner) => match inner.eval(message) {
                Value::Int(v) => Value::Int(-v),
                Value::Float(v) => Value::Float(-v),
                _ => Value::Null,
            },
            Expr::IsNull(inner, negated) => {
                let is_null = inner.eval(message) == Value::Null;
                Value::Bool(is_null != *negated)
            }
            Expr::In(inner, list, negated) => match inner.eval(message) {
                Value::Null => Value::Null,
                value => {
                    let found = list
                        .iter()
                        .any(|item| compare("=", &value, item) == Value::Bool(true));
                    Value::Bool(found != *negated)
                }
            },
            Expr::Like(inner, pattern, escape, negated) => match inner.eval(message) {
                Value::Str(s) => Value::Bool(like(&s, pattern, *escape) != *negated),
                _ => Value::Null,
            },
            Expr::Between(inner, low, high, negated) => {
                let value = inner.eval(message);
                let above = compare(">=", &value, &low.eval(message));
                let below = compare("<=", &value, &high.eval(message));
                match (above, below) {
                    (Value::Bool(a), Value::Bool(b)) => Value::Bool((a && b) != *negated),
                    _ => Value::Null,
                }
            }
        }
    }
}

fn field(message: &Message, name: &str) -> Value {
    match name {
        "priority" => Value::Int(message.priority as i64),
        "durable" => Value::Bool(message.durable),
        "timestamp" => Value::Int(message.timestamp as i64),
        "expiration" => Value::Int(message.expiration as i64),
        "message_id" => Value::Int(message.id as i64),
        _ => message.header(name).map_or(Value::Null, Value::from_typed),
    }
}

fn compare(op: &str, a: &Value, b: &Value) -> Value {
    use std::cmp::Ordering;
    let ordering = match (a, b) {
        (Value::Null, _) | (_, Value::Null) => return Value::Null,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => {
            return match op {
                "=" => Value::Bool(x == y),
                "<>" => Value::Bool(x != y),
                _ => Value::Null,
            }
        }
        (Value::Bool(x), Value::Bool(y)) => {
            return match op {
                "=" => Value::Bool(x == y),
                "<>" => Value::Bool(x != y),
                _ => Value::Null,
            }
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => match x.partial_cmp(&y) {
                Some(o) => o,
                None => return Value::Null,
            },
            _ => return Value::Null,
        },
    };
    Value::Bool(match op {
        "=" => ordering == Ordering::Equal,
        "<>" => ordering != Ordering::Equal,
        "<" => ordering == Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

fn arith(op: &str, a: &Value, b: &Value) -> Value {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return match op {
            "+" => x.checked_add(*y).map_or(Value::Null, Value::Int),
            "-" => x.checked_sub(*y).map_or(Value::Null, Value::Int),
            "*" => x.checked_mul(*y).map_or(Value::Null, Value::Int),
            _ => x.checked_div(*y).map_or(Value::Null, Value::Int),
        };
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Value::Float(match op {
            "+" => x + y,
            "-" => x - y,
            "*" => x * y,
            _ => x / y,
        }),
        _ => Value::Null,
    }
}

/// `%` matches any run of characters, `_` exactly one.
fn like(value: &str, pattern: &str, escape: Option<char>) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Piece {
        Any,
        One,
        Char(char),
    }
    let mut pieces = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(next) = chars.next() {
                pieces.push(Piece::Char(next));
            }
            continue;
        }
        pieces.push(match c {
            '%' => Piece::Any,
            '_' => Piece::One,
            c => Piece::Char(c),
        });
    }
    let text: Vec<char> = value.chars().collect();
    // matched[j]: text[..i] matches pieces[..j]
    let mut matched = vec![false; pieces.len() + 1];
    matched[0] = true;
    for j in 0..pieces.len() {
        matched[j + 1] = matched[j] && pieces[j] == Piece::Any;
    }
    for &ch in &text {
        let mut next = vec![false; pieces.len() + 1];
        for j in 0..pieces.len() {
            next[j + 1] = match pieces[j] {
                Piece::Any => next[j] || matched[j + 1],
                Piece::One => matched[j],
                Piece::Char(p) => matched[j] && p == ch,
            };
        }
        matched = next;
    }
    matched[pieces.len()]
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(id)) if id.eq_ignore_ascii_case(word))
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(invalid(format!("expected {token:?}, found {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("AND") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if matches!(op, "=" | "<>" | "<" | "<=" | ">" | ">=") {
                self.pos += 1;
                let right = self.parse_additive()?;
                return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
            }
        }
        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            if !self.eat_keyword("NULL") {
                return Err(invalid("expected NULL after IS"));
            }
            return Ok(Expr::IsNull(Box::new(left), negated));
        }
        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut values = Vec::new();
            loop {
                values.push(self.parse_literal()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => return Err(invalid(format!("expected ',' or ')', found {other:?}"))),
                }
            }
            return Ok(Expr::In(Box::new(left), values, negated));
        }
        if self.eat_keyword("LIKE") {
            let pattern = match self.next() {
                Some(Token::Str(s)) => s,
                other => return Err(invalid(format!("LIKE needs a string pattern, found {other:?}"))),
            };
            let escape = if self.eat_keyword("ESCAPE") {
                match self.next() {
                    Some(Token::Str(s)) if s.chars().count() == 1 => s.chars().next(),
                    _ => return Err(invalid("ESCAPE needs a single character")),
                }
            } else {
                None
            };
            return Ok(Expr::Like(Box::new(left), pattern, escape, negated));
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.parse_additive()?;
            if !self.eat_keyword("AND") {
                return Err(invalid("expected AND in BETWEEN"));
            }
            let high = self.parse_additive()?;
            return Ok(Expr::Between(Box::new(left), Box::new(low), Box::new(high), negated));
        }
        if negated {
            return Err(invalid("NOT must be followed by IN, LIKE or BETWEEN here"));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        while let Some(Token::Op(op @ ("+" | "-"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ ("*" | "/"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Op("-")) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(id))
                if !["TRUE", "FALSE", "NULL"]
                    .iter()
                    .any(|k| id.eq_ignore_ascii_case(k)) =>
            {
                let name = id.clone();
                self.pos += 1;
                Ok(Expr::Field(name))
            }
            _ => self.parse_literal().map(Expr::Literal),
        }
    }

    fn parse_literal(&mut self) -> Result<Value> {
        let negative = matches!(self.peek(), Some(Token::Op("-")));
        if negative {
            self.pos += 1;
        }
        let value = match self.next() {
            Some(Token::Str(s)) if !negative => Value::Str(s),
            Some(Token::Int(v)) => Value::Int(if negative { -v } else { v }),
            Some(Token::Float(v)) => Value::Float(if negative { -v } else { v }),
            Some(Token::Ident(id)) if !negative && id.eq_ignore_ascii_case("TRUE") => Value::Bool(true),
            Some(Token::Ident(id)) if !negative && id.eq_ignore_ascii_case("FALSE") => Value::Bool(false),
            Some(Token::Ident(id)) if !negative && id.eq_ignore_ascii_case("NULL") => Value::Null,
            other => return Err(invalid(format!("expected a literal, found {other:?}"))),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message() -> Message {
        Message::new("orders", Bytes::new())
            .with_priority(7)
            .with_header("color", "red")
            .with_header("weight", 12i32)
            .with_header("price", TypedValue::Double(9.5))
            .with_header("sku", "A-100_x")
    }

    fn check(source: &str) -> bool {
        Filter::parse(source).expect(source).matches(&message())
    }

    #[test]
    fn comparisons_and_logic() {
        assert!(check("color = 'red'"));
        assert!(!check("color <> 'red'"));
        assert!(check("weight > 10 AND price < 10"));
        assert!(check("weight > 100 OR priority >= 7"));
        assert!(check("NOT (weight < 5)"));
        assert!(check("weight * 2 = 24"));
        assert!(check("price BETWEEN 9 AND 10"));
        assert!(check("weight NOT BETWEEN 1 AND 5"));
    }

    #[test]
    fn missing_headers_are_unknown() {
        assert!(!check("missing = 1"));
        assert!(!check("NOT (missing = 1)"));
        assert!(check("missing IS NULL"));
        assert!(check("color IS NOT NULL"));
        assert!(check("missing = 1 OR color = 'red'"));
    }

    #[test]
    fn in_and_like() {
        assert!(check("color IN ('blue', 'red')"));
        assert!(check("color NOT IN ('blue')"));
        assert!(check("sku LIKE 'A-%'"));
        assert!(check("sku LIKE 'A-1_0%'"));
        assert!(!check("sku LIKE 'B%'"));
        assert!(check(r"sku LIKE 'A-100\_x' ESCAPE '\'"));
        assert!(!check(r"sku LIKE 'A-1000\_' ESCAPE '\'"));
    }

    #[test]
    fn string_literals_escape_quotes() {
        let m = Message::new("a", Bytes::new()).with_header("name", "O'Brien");
        assert!(Filter::parse("name = 'O''Brien'").unwrap().matches(&m));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for bad in ["color = ", "color = 'red", "(a = 1", "a = 1 b", "a LIKE 5", "a IS 3"] {
            assert!(
                matches!(Filter::parse(bad), Err(Error::InvalidFilter(_))),
                "{bad} should be rejected"
            );
        }
        assert!(Filter::parse_optional(Some("  ")).unwrap().is_none());
        assert!(Filter::parse_optional(None).unwrap().is_none());
    }
}
