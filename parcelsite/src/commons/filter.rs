//! Attribute filter expressions.
//!
//! A small boolean language over feature properties, used wherever a layer or
//! table is subset by attribute value:
//!
//! ```text
//! WD24NM != 'Loddon & Chedgrave'
//! County != 'SURREY' & District in ['EAST SUFFOLK', 'SOUTH NORFOLK']
//! dom_Tenure == 'Freehold' | for_Tenure == 'Freehold'
//! category = 'Demand Headroom'
//! ```
//!
//! Both the SQL flavour (`=`, `<>`, `and`, `or`, `is null`) and the
//! dataframe-query flavour (`==`, `!=`, `&`, `|`, `~`) are accepted.
//! Columns with spaces are written in back-quotes: `` `Title Number` ``.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::commons::basic_functions::value_as_text;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Null,
}

/// Parsed attribute expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        column: String,
        op: CmpOp,
        value: Literal,
    },
    In {
        column: String,
        values: Vec<Literal>,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: input.len(),
        };
        let expr = parser.parse_or()?;
        if let Some((offset, tok)) = parser.tokens.get(parser.pos) {
            return Err(Error::Expr {
                offset: *offset,
                message: format!("unexpected token {:?}", tok),
            });
        }
        Ok(expr)
    }

    /// Evaluate against a row of properties.
    /// Missing or null values only satisfy `!=` and `not in`.
    pub fn eval(&self, row: &Map<String, Value>) -> bool {
        match self {
            Expr::Compare { column, op, value } => compare(row.get(column), *op, value),
            Expr::In {
                column,
                values,
                negated,
            } => {
                let found = values
                    .iter()
                    .any(|v| compare(row.get(column), CmpOp::Eq, v));
                found != *negated
            }
            Expr::And(a, b) => a.eval(row) && b.eval(row),
            Expr::Or(a, b) => a.eval(row) || b.eval(row),
            Expr::Not(e) => !e.eval(row),
        }
    }

    /// Column names referenced by the expression, in order of appearance
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Compare { column, .. } | Expr::In { column, .. } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Not(e) => e.collect_columns(out),
        }
    }
}

impl FromStr for Expr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Expr::parse(s)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Literal::Num(n) => write!(f, "{}", n),
            Literal::Null => write!(f, "null"),
        }
    }
}

fn compare(actual: Option<&Value>, op: CmpOp, expected: &Literal) -> bool {
    let actual = actual.filter(|v| !v.is_null());

    if let Literal::Null = expected {
        return match op {
            CmpOp::Eq => actual.is_none(),
            CmpOp::Ne => actual.is_some(),
            _ => false,
        };
    }

    let Some(actual) = actual else {
        return op == CmpOp::Ne;
    };

    let ordering = match expected {
        Literal::Num(n) => match value_as_number(actual) {
            Some(a) => a.partial_cmp(n),
            None => return op == CmpOp::Ne,
        },
        Literal::Str(s) => {
            let text = value_as_text(actual);
            match (text_as_number(&text), text_as_number(s)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(text.as_str().cmp(s.as_str())),
            }
        }
        Literal::Null => None,
    };

    match (ordering, op) {
        (None, CmpOp::Ne) => true,
        (None, _) => false,
        (Some(o), CmpOp::Eq) => o == Ordering::Equal,
        (Some(o), CmpOp::Ne) => o != Ordering::Equal,
        (Some(o), CmpOp::Lt) => o == Ordering::Less,
        (Some(o), CmpOp::Le) => o != Ordering::Greater,
        (Some(o), CmpOp::Gt) => o == Ordering::Greater,
        (Some(o), CmpOp::Ge) => o != Ordering::Less,
    }
}

/// Finite number spelled by the text, so that words such as `inf` stay text
fn text_as_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn value_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    In,
    Is,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |offset: usize, message: &str| Error::Expr {
        offset,
        message: message.to_string(),
    };

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
            }
            b'(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            b'[' => {
                tokens.push((start, Token::LBracket));
                i += 1;
            }
            b']' => {
                tokens.push((start, Token::RBracket));
                i += 1;
            }
            b',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            b'&' => {
                i += if bytes.get(i + 1) == Some(&b'&') { 2 } else { 1 };
                tokens.push((start, Token::And));
            }
            b'|' => {
                i += if bytes.get(i + 1) == Some(&b'|') { 2 } else { 1 };
                tokens.push((start, Token::Or));
            }
            b'~' => {
                tokens.push((start, Token::Not));
                i += 1;
            }
            b'=' => {
                i += if bytes.get(i + 1) == Some(&b'=') { 2 } else { 1 };
                tokens.push((start, Token::Op(CmpOp::Eq)));
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((start, Token::Op(CmpOp::Ne)));
                    i += 2;
                } else {
                    return Err(err(start, "expected '!='"));
                }
            }
            b'<' => match bytes.get(i + 1) {
                Some(b'=') => {
                    tokens.push((start, Token::Op(CmpOp::Le)));
                    i += 2;
                }
                Some(b'>') => {
                    tokens.push((start, Token::Op(CmpOp::Ne)));
                    i += 2;
                }
                _ => {
                    tokens.push((start, Token::Op(CmpOp::Lt)));
                    i += 1;
                }
            },
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((start, Token::Op(CmpOp::Ge)));
                    i += 2;
                } else {
                    tokens.push((start, Token::Op(CmpOp::Gt)));
                    i += 1;
                }
            }
            b'\'' | b'"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                let mut closed = false;
                while i < bytes.len() {
                    let ch = input[i..].chars().next().unwrap_or('\0');
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        let escaped = input[i + 1..].chars().next().unwrap_or('\0');
                        value.push(escaped);
                        i += 1 + escaped.len_utf8();
                        continue;
                    }
                    if bytes[i] == quote {
                        // SQL style doubled quote
                        if bytes.get(i + 1) == Some(&quote) {
                            value.push(quote as char);
                            i += 2;
                            continue;
                        }
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(ch);
                    i += ch.len_utf8();
                }
                if !closed {
                    return Err(err(start, "unterminated string literal"));
                }
                tokens.push((start, Token::Str(value)));
            }
            b'`' => {
                let end = input[i + 1..]
                    .find('`')
                    .ok_or_else(|| err(start, "unterminated quoted column"))?;
                let name = &input[i + 1..i + 1 + end];
                tokens.push((start, Token::Ident(name.to_string())));
                i += end + 2;
            }
            b'0'..=b'9' | b'-' | b'.' => {
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if matches!(bytes.get(i), Some(b'e' | b'E')) {
                    let mut j = i + 1;
                    if matches!(bytes.get(j), Some(b'+' | b'-')) {
                        j += 1;
                    }
                    if bytes.get(j).is_some_and(u8::is_ascii_digit) {
                        i = j;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text = &input[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| err(start, &format!("invalid number '{}'", text)))?;
                tokens.push((start, Token::Num(n)));
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "is" => Token::Is,
                    "null" | "none" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            _ => {
                return Err(err(start, &format!("unexpected character '{}'", c as char)));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.len)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Expr {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.peek() {
            Some(t) if *t == expected => {
                self.pos += 1;
                Ok(())
            }
            other => Err(self.error(format!("expected {:?}, found {:?}", expected, other))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(column)) => self.parse_predicate(column),
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("expected column name, found {:?}", other)))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_predicate(&mut self, column: String) -> Result<Expr> {
        match self.next() {
            Some(Token::Op(op)) => {
                let value = self.parse_literal()?;
                Ok(Expr::Compare { column, op, value })
            }
            Some(Token::In) => {
                let values = self.parse_list()?;
                Ok(Expr::In {
                    column,
                    values,
                    negated: false,
                })
            }
            Some(Token::Not) => {
                self.expect(Token::In)?;
                let values = self.parse_list()?;
                Ok(Expr::In {
                    column,
                    values,
                    negated: true,
                })
            }
            Some(Token::Is) => {
                let op = if self.peek() == Some(&Token::Not) {
                    self.pos += 1;
                    CmpOp::Ne
                } else {
                    CmpOp::Eq
                };
                self.expect(Token::Null)?;
                Ok(Expr::Compare {
                    column,
                    op,
                    value: Literal::Null,
                })
            }
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("expected operator after '{}', found {:?}", column, other)))
            }
            None => Err(self.error(format!("expected operator after '{}'", column))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            Some(Token::Null) => Ok(Literal::Null),
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("expected literal, found {:?}", other)))
            }
            None => Err(self.error("expected literal")),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Literal>> {
        let close = match self.next() {
            Some(Token::LBracket) => Token::RBracket,
            Some(Token::LParen) => Token::RParen,
            _ => {
                if self.pos > 0 {
                    self.pos -= 1;
                }
                return Err(self.error("expected '[' or '(' to start a list"));
            }
        };

        let mut values = Vec::new();
        loop {
            if self.peek() == Some(&close) {
                self.pos += 1;
                break;
            }
            values.push(self.parse_literal()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(t) if t == close => break,
                _ => {
                    if self.pos > 0 {
                        self.pos -= 1;
                    }
                    return Err(self.error("expected ',' or end of list"));
                }
            }
        }
        Ok(values)
    }
}
