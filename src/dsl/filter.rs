//! Textual filter expressions compiled into a predicate tree.
//!
//! Grammar (conventional precedence, `not` > `and` > `or`):
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ( "or" and_expr )*
//! and_expr   := unary ( "and" unary )*
//! unary      := "not" unary | "(" expr ")" | comparison
//! comparison := field ( "=" | "!=" | "<" | "<=" | ">" | ">=" | "contains" ) literal
//!             | field "in" "[" literal ( "," literal )* "]"
//! ```
//!
//! Field references are resolved against the entity metadata at parse time;
//! an unknown name is a hard `ParseError`, never a silent no-op. Only
//! whitelisted fields and the operators above are representable, so a
//! compiled tree can be lowered to storage safely.

use crate::error::ApiError;
use crate::metadata::EntityMeta;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// List membership.
    In,
    /// Substring match on text columns.
    Contains,
}

/// Compiled boolean filter expression. Created per request, discarded after.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluate against one row. Mirrors the SQL lowering; used for
    /// client-side checks and tests.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        match self {
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
            Predicate::Not(inner) => !inner.matches(row),
            Predicate::Compare { field, op, value } => {
                let cell = row.get(field).unwrap_or(&Value::Null);
                match op {
                    CompareOp::Eq => cell == value,
                    CompareOp::Ne => cell != value,
                    CompareOp::Lt => compare(cell, value).map_or(false, |o| o.is_lt()),
                    CompareOp::Le => compare(cell, value).map_or(false, |o| o.is_le()),
                    CompareOp::Gt => compare(cell, value).map_or(false, |o| o.is_gt()),
                    CompareOp::Ge => compare(cell, value).map_or(false, |o| o.is_ge()),
                    CompareOp::In => value
                        .as_array()
                        .map_or(false, |list| list.iter().any(|v| v == cell)),
                    CompareOp::Contains => match (cell.as_str(), value.as_str()) {
                        (Some(haystack), Some(needle)) => haystack.contains(needle),
                        _ => false,
                    },
                }
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(CompareOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ApiError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op(CompareOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(ApiError::Parse("expected '=' after '!'".into()));
                }
                tokens.push(Token::Op(CompareOp::Ne));
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Op(CompareOp::Le));
                } else {
                    tokens.push(Token::Op(CompareOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Op(CompareOp::Ge));
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                }
            }
            quote @ ('\'' | '"') => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => {
                            // Doubled quote is an escaped literal quote.
                            if chars.next_if_eq(&quote).is_some() {
                                s.push(quote);
                            } else {
                                break;
                            }
                        }
                        Some(c) => s.push(c),
                        None => {
                            return Err(ApiError::Parse("unterminated string literal".into()))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if num.contains('.') {
                    let f: f64 = num
                        .parse()
                        .map_err(|_| ApiError::Parse(format!("bad number literal '{}'", num)))?;
                    tokens.push(Token::Float(f));
                } else {
                    let i: i64 = num
                        .parse()
                        .map_err(|_| ApiError::Parse(format!("bad number literal '{}'", num)))?;
                    tokens.push(Token::Int(i));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ApiError::Parse(format!(
                    "unexpected character '{}' in filter",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

/// Compile a filter string against an entity's metadata.
pub fn parse_filter(input: &str, meta: &EntityMeta) -> Result<Predicate, ApiError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        meta,
    };
    let tree = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ApiError::Parse(format!(
            "trailing input after position {} in filter",
            parser.pos
        )));
    }
    Ok(tree)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    meta: &'a EntityMeta,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn keyword(&mut self, word: &str) -> bool {
        if let Some(Token::Ident(ident)) = self.peek() {
            if ident.eq_ignore_ascii_case(word) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn or_expr(&mut self) -> Result<Predicate, ApiError> {
        let mut parts = vec![self.and_expr()?];
        while self.keyword("or") {
            parts.push(self.and_expr()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Predicate::Or(parts)
        })
    }

    fn and_expr(&mut self) -> Result<Predicate, ApiError> {
        let mut parts = vec![self.unary()?];
        while self.keyword("and") {
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Predicate::And(parts)
        })
    }

    fn unary(&mut self) -> Result<Predicate, ApiError> {
        if self.keyword("not") {
            return Ok(Predicate::Not(Box::new(self.unary()?)));
        }
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let inner = self.or_expr()?;
            match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(ApiError::Parse("expected ')'".into())),
            }
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Result<Predicate, ApiError> {
        let field = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(ApiError::Parse(format!(
                    "expected a field name, got {:?}",
                    other
                )))
            }
        };
        if self.meta.field_meta(&field).is_none() {
            return Err(ApiError::Parse(format!(
                "entity '{}' has no field '{}'",
                self.meta.id, field
            )));
        }
        if self.keyword("in") {
            let values = self.list_literal()?;
            return Ok(Predicate::Compare {
                field,
                op: CompareOp::In,
                value: Value::Array(values),
            });
        }
        if self.keyword("contains") {
            let value = self.literal()?;
            return Ok(Predicate::Compare {
                field,
                op: CompareOp::Contains,
                value,
            });
        }
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(ApiError::Parse(format!(
                    "expected a comparison operator after '{}', got {:?}",
                    field, other
                )))
            }
        };
        let value = self.literal()?;
        Ok(Predicate::Compare { field, op, value })
    }

    fn list_literal(&mut self) -> Result<Vec<Value>, ApiError> {
        match self.next() {
            Some(Token::LBracket) => {}
            other => {
                return Err(ApiError::Parse(format!(
                    "expected '[' after 'in', got {:?}",
                    other
                )))
            }
        }
        let mut values = Vec::new();
        if matches!(self.peek(), Some(Token::RBracket)) {
            self.pos += 1;
            return Ok(values);
        }
        loop {
            values.push(self.literal()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                other => {
                    return Err(ApiError::Parse(format!(
                        "expected ',' or ']' in list, got {:?}",
                        other
                    )))
                }
            }
        }
        Ok(values)
    }

    fn literal(&mut self) -> Result<Value, ApiError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Int(i)) => Ok(Value::Number(i.into())),
            Some(Token::Float(f)) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| ApiError::Parse("non-finite number literal".into())),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
                Ok(Value::Bool(true))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Ok(Value::Null),
            other => Err(ApiError::Parse(format!(
                "expected a literal, got {:?}",
                other
            ))),
        }
    }
}
