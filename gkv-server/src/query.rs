//! # Query Evaluation
//!
//! Purpose: Parse and run the small OQL subset the node understands.
//!
//! ```text
//! SELECT <projection> FROM /<region> [[AS] <alias>] [WHERE <term> [AND <term>]*]
//! projection: *  |  <alias>.toString()  |  <alias>.<field>
//! term:       <path> (= | <> | !=) <literal>
//! path:       <alias>  |  <alias>.<field>  |  <alias>.toString()  |  <field>
//! literal:    'text' | "text" | integer | float | true | false | null
//! ```
//!
//! Keywords are case-insensitive. Values are evaluated in wire form:
//! built-in tags decode to scalars and any other tag is read as an object
//! field stream.

use std::fmt;

use gkv_common::{is_builtin_tag, FieldValue, ObjectInstance, WireValue};

use crate::error::{ServerError, ServerResult};

/// What each matching entry contributes to the result.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    ToString,
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Path {
    Value,
    ToString,
    Field(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    path: Path,
    op: CompareOp,
    literal: Literal,
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    region: String,
    projection: Projection,
    terms: Vec<Term>,
}

impl Query {
    pub fn parse(text: &str) -> ServerResult<Self> {
        let tokens = tokenize(text)?;
        Parser { tokens, pos: 0 }.query()
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// True when the query has a `WHERE` clause.
    pub fn has_predicate(&self) -> bool {
        !self.terms.is_empty()
    }

    /// Whether `value` satisfies every `WHERE` term.
    pub fn matches(&self, value: &WireValue) -> ServerResult<bool> {
        if self.terms.is_empty() {
            return Ok(true);
        }
        let value = Evaluated::from_wire(value)?;
        Ok(self.terms.iter().all(|term| term.holds(&value)))
    }

    /// Projects a matching value into a result row; `None` is a null row.
    pub fn project(&self, value: &WireValue) -> ServerResult<Option<WireValue>> {
        match &self.projection {
            Projection::All => Ok(Some(value.clone())),
            Projection::ToString => {
                let value = Evaluated::from_wire(value)?;
                Ok(Some(WireValue::string(&value.render())))
            }
            Projection::Field(name) => match Evaluated::from_wire(value)? {
                Evaluated::Object(object) => Ok(object.field(name).and_then(FieldValue::to_wire)),
                Evaluated::Scalar(_) => Ok(None),
            },
        }
    }
}

impl Term {
    fn holds(&self, value: &Evaluated) -> bool {
        let resolved = match (&self.path, value) {
            (Path::Value, Evaluated::Scalar(scalar)) => Some(scalar.clone()),
            (Path::Value, Evaluated::Object(_)) => None,
            (Path::ToString, value) => Some(FieldValue::String(value.render())),
            (Path::Field(name), Evaluated::Object(object)) => object.field(name).cloned(),
            (Path::Field(_), Evaluated::Scalar(_)) => None,
        };
        // An undefined path satisfies neither `=` nor `<>`.
        let Some(resolved) = resolved else {
            return false;
        };
        let equal = literal_eq(&resolved, &self.literal);
        match self.op {
            CompareOp::Eq => equal,
            CompareOp::Ne => !equal,
        }
    }
}

fn literal_eq(value: &FieldValue, literal: &Literal) -> bool {
    match (value, literal) {
        (FieldValue::Null, Literal::Null) => true,
        (FieldValue::String(value), Literal::String(literal)) => value == literal,
        (FieldValue::Int(value), Literal::Int(literal)) => i64::from(*value) == *literal,
        (FieldValue::Long(value), Literal::Int(literal)) => value == literal,
        (FieldValue::Int(value), Literal::Float(literal)) => f64::from(*value) == *literal,
        (FieldValue::Long(value), Literal::Float(literal)) => *value as f64 == *literal,
        (FieldValue::Double(value), Literal::Float(literal)) => value == literal,
        (FieldValue::Double(value), Literal::Int(literal)) => *value == *literal as f64,
        (FieldValue::Bool(value), Literal::Bool(literal)) => value == literal,
        _ => false,
    }
}

/// A stored value decoded far enough to evaluate paths on it.
enum Evaluated {
    Scalar(FieldValue),
    Object(ObjectInstance),
}

impl Evaluated {
    fn from_wire(value: &WireValue) -> ServerResult<Self> {
        if is_builtin_tag(&value.tag) {
            let scalar = value
                .to_field()
                .map_err(|err| ServerError::query(format!("cannot evaluate value: {}", err)))?;
            return Ok(Evaluated::Scalar(scalar));
        }
        ObjectInstance::decode(&value.tag, &value.bytes)
            .map(Evaluated::Object)
            .map_err(|err| ServerError::query(format!("cannot evaluate `{}` value: {}", value.tag, err)))
    }

    /// `toString()` of the value.
    fn render(&self) -> String {
        match self {
            Evaluated::Scalar(scalar) => scalar.to_string(),
            Evaluated::Object(object) => object.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Star,
    Slash,
    Dot,
    LParen,
    RParen,
    Eq,
    Ne,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(ident) => write!(f, "{}", ident),
            Token::Str(text) => write!(f, "'{}'", text),
            Token::Int(value) => write!(f, "{}", value),
            Token::Float(value) => write!(f, "{}", value),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Dot => f.write_str("."),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Eq => f.write_str("="),
            Token::Ne => f.write_str("<>"),
        }
    }
}

fn tokenize(text: &str) -> ServerResult<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '\'' | '"' => {
                let (text, next) = string_literal(&chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                let (token, next) = number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ServerError::query(format!(
                    "unexpected character `{}` at offset {}",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).is_some_and(char::is_ascii_digit)
}

/// Reads a quoted literal; a doubled quote stands for itself.
fn string_literal(chars: &[char], start: usize) -> ServerResult<(String, usize)> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return Ok((text, i + 1));
        }
        text.push(chars[i]);
        i += 1;
    }
    Err(ServerError::query("unterminated string literal"))
}

fn number(chars: &[char], start: usize) -> ServerResult<(Token, usize)> {
    let mut i = start + 1;
    let mut is_float = false;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' && !is_float && next_is_digit(chars, i) {
            is_float = true;
            i += 1;
        } else {
            break;
        }
    }
    let raw: String = chars[start..i].iter().collect();
    let token = if is_float {
        raw.parse().map(Token::Float).ok()
    } else {
        raw.parse().map(Token::Int).ok()
    };
    token
        .map(|token| (token, i))
        .ok_or_else(|| ServerError::query(format!("invalid number `{}`", raw)))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn query(mut self) -> ServerResult<Query> {
        self.keyword("SELECT")?;
        let projection = self.projection()?;
        self.keyword("FROM")?;
        self.expect(&Token::Slash)?;
        let region = self.ident()?;

        let mut alias = None;
        if self.peek_keyword("AS") {
            self.pos += 1;
            alias = Some(self.ident()?);
        } else if matches!(self.peek(), Some(Token::Ident(_))) && !self.peek_keyword("WHERE") {
            alias = Some(self.ident()?);
        }

        let mut terms = Vec::new();
        if self.peek_keyword("WHERE") {
            self.pos += 1;
            terms.push(self.term(alias.as_deref())?);
            while self.peek_keyword("AND") {
                self.pos += 1;
                terms.push(self.term(alias.as_deref())?);
            }
        }

        if let Some(token) = self.peek() {
            return Err(ServerError::query(format!("unexpected `{}`", token)));
        }

        let projection = match projection {
            RawProjection::All => Projection::All,
            RawProjection::Path(owner, path) => {
                if alias.as_deref() != Some(owner.as_str()) {
                    return Err(ServerError::query(format!("unknown alias `{}`", owner)));
                }
                match path {
                    Path::ToString => Projection::ToString,
                    Path::Field(name) => Projection::Field(name),
                    Path::Value => {
                        return Err(ServerError::query("bare alias projection is not supported"))
                    }
                }
            }
        };

        Ok(Query {
            region,
            projection,
            terms,
        })
    }

    fn projection(&mut self) -> ServerResult<RawProjection> {
        if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            return Ok(RawProjection::All);
        }
        let owner = self.ident()?;
        self.expect(&Token::Dot)?;
        let path = self.member()?;
        Ok(RawProjection::Path(owner, path))
    }

    fn term(&mut self, alias: Option<&str>) -> ServerResult<Term> {
        let head = self.ident()?;
        let path = if Some(head.as_str()) == alias {
            if self.peek() == Some(&Token::Dot) {
                self.pos += 1;
                self.member()?
            } else {
                Path::Value
            }
        } else if self.peek() == Some(&Token::Dot) {
            return Err(ServerError::query(format!("unknown alias `{}`", head)));
        } else {
            Path::Field(head)
        };

        let op = match self.next() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(other) => {
                return Err(ServerError::query(format!(
                    "unsupported operator `{}`",
                    other
                )))
            }
            None => return Err(ServerError::query("incomplete condition")),
        };

        let literal = match self.next() {
            Some(Token::Str(text)) => Literal::String(text),
            Some(Token::Int(value)) => Literal::Int(value),
            Some(Token::Float(value)) => Literal::Float(value),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => Literal::Bool(true),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => Literal::Bool(false),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Literal::Null,
            Some(other) => return Err(ServerError::query(format!("expected a literal, found `{}`", other))),
            None => return Err(ServerError::query("expected a literal")),
        };

        Ok(Term { path, op, literal })
    }

    /// After `alias.`: either `toString()` or a field name.
    fn member(&mut self) -> ServerResult<Path> {
        let name = self.ident()?;
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            self.expect(&Token::RParen)?;
            if name == "toString" {
                return Ok(Path::ToString);
            }
            return Err(ServerError::query(format!("unsupported method `{}()`", name)));
        }
        Ok(Path::Field(name))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> ServerResult<()> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            return Ok(());
        }
        Err(self.unexpected(keyword))
    }

    fn expect(&mut self, token: &Token) -> ServerResult<()> {
        if self.peek() == Some(token) {
            self.pos += 1;
            return Ok(());
        }
        Err(self.unexpected(&token.to_string()))
    }

    fn ident(&mut self) -> ServerResult<String> {
        match self.peek() {
            Some(Token::Ident(ident)) => {
                let ident = ident.clone();
                self.pos += 1;
                Ok(ident)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn unexpected(&self, wanted: &str) -> ServerError {
        match self.peek() {
            Some(token) => ServerError::query(format!("expected {}, found `{}`", wanted, token)),
            None => ServerError::query(format!("expected {}, found end of query", wanted)),
        }
    }
}

enum RawProjection {
    All,
    Path(String, Path),
}
