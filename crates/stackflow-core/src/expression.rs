//! `${...}` expressions
//!
//! String attribute values are templates. A value that is exactly one
//! `${...}` keeps the type of the expression inside it; anything else becomes
//! a `concat` call over its literal and interpolated parts. `$${` writes a
//! literal `${`.
//!
//! Inside `${...}`:
//!
//! ```text
//! local_file.config.path          resource attribute
//! local_file.page[0].path         one instance of a counted resource
//! local_file.env["prod"].path     one instance of a for_each resource
//! data.local_file.seed.content    data lookup
//! count.index / each.key / each.value
//! var.prefix                      stack variable, substituted while parsing
//! upper(var.prefix) join("-", ["a", "b"])
//! "text" 42 1.5 true false null [a, b]
//! ```

use crate::error::ExpressionError;
use serde_json::{Number, Value};
use stackflow_engine::{Expr, Function, InstanceKey, IterationRef, Reference};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stack variables available as `var.<name>`
pub type Variables = BTreeMap<String, Value>;

type ParseResult<T> = std::result::Result<T, ExpressionError>;

/// Parse a string attribute value.
pub fn parse_template(input: &str, variables: &Variables) -> ParseResult<Expr> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < input.len() {
        let tail = &input[i..];
        if tail.starts_with("$${") {
            text.push_str("${");
            i += 3;
        } else if tail.starts_with("${") {
            let start = i + 2;
            let end = find_closing(input, start)?;
            if !text.is_empty() {
                parts.push(Expr::Literal(Value::String(std::mem::take(&mut text))));
            }
            parts.push(parse_expression_at(&input[start..end], start, variables)?);
            i = end + 1;
        } else if let Some(c) = tail.chars().next() {
            text.push(c);
            i += c.len_utf8();
        }
    }
    if !text.is_empty() {
        parts.push(Expr::Literal(Value::String(text)));
    }

    Ok(match parts.len() {
        0 => Expr::Literal(Value::String(String::new())),
        1 => parts.remove(0),
        _ => Expr::call(Function::Concat, parts),
    })
}

/// Parse the inside of one `${...}`.
pub fn parse_expression(input: &str, variables: &Variables) -> ParseResult<Expr> {
    parse_expression_at(input, 0, variables)
}

fn parse_expression_at(input: &str, base: usize, variables: &Variables) -> ParseResult<Expr> {
    let tokens = tokenize(input, base)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: base + input.len(),
        variables,
    };
    let expr = parser.expression()?;
    if let Some((at, token)) = parser.next() {
        return Err(ExpressionError::new(at, format!("unexpected {} after expression", token)));
    }
    Ok(expr)
}

/// Offset of the `}` closing the `${` whose body starts at `start`
fn find_closing(input: &str, start: usize) -> ParseResult<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in input[start..].char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '}' if !in_string => return Ok(start + i),
            _ => {}
        }
    }
    Err(ExpressionError::new(start - 2, "unterminated '${'"))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(Number),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "'{}'", name),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Dot => write!(f, "'.'"),
            Token::Comma => write!(f, "','"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(src: &str, base: usize) -> ParseResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(c) = src[i..].chars().next() {
        let at = base + i;
        let punct = match c {
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            _ => None,
        };
        if let Some(token) = punct {
            tokens.push((at, token));
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }

        if c == '"' {
            let mut value = String::new();
            let mut chars = src[i + 1..].char_indices();
            let mut closed = None;
            while let Some((j, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, other)) => value.push(other),
                        None => break,
                    },
                    '"' => {
                        closed = Some(j);
                        break;
                    }
                    c => value.push(c),
                }
            }
            let Some(j) = closed else {
                return Err(ExpressionError::new(at, "unterminated string"));
            };
            tokens.push((at, Token::Str(value)));
            i += j + 2;
            continue;
        }

        let rest = &src[i..];
        let starts_number = c.is_ascii_digit()
            || (c == '-' && rest[1..].starts_with(|d: char| d.is_ascii_digit()));
        if starts_number {
            let mut len = c.len_utf8();
            len += rest[len..].len() - rest[len..].trim_start_matches(|d: char| d.is_ascii_digit()).len();
            let fraction = rest[len..]
                .strip_prefix('.')
                .filter(|f| f.starts_with(|d: char| d.is_ascii_digit()));
            if let Some(fraction) = fraction {
                len += 1 + fraction.len()
                    - fraction.trim_start_matches(|d: char| d.is_ascii_digit()).len();
            }
            let literal = &rest[..len];
            let number = if literal.contains('.') {
                literal.parse::<f64>().ok().and_then(Number::from_f64)
            } else {
                literal.parse::<i64>().ok().map(Number::from)
            };
            let number = number
                .ok_or_else(|| ExpressionError::new(at, format!("invalid number '{}'", literal)))?;
            tokens.push((at, Token::Number(number)));
            i += len;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let len = rest.len() - rest.trim_start_matches(is_ident_char).len();
            tokens.push((at, Token::Ident(rest[..len].to_string())));
            i += len;
            continue;
        }

        return Err(ExpressionError::new(at, format!("unexpected character '{}'", c)));
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Name(String),
    Index(usize),
    Key(String),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name(name) => write!(f, ".{}", name),
            Segment::Index(i) => write!(f, "[{}]", i),
            Segment::Key(k) => write!(f, "[\"{}\"]", k),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    variables: &'a Variables,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(at, _)| *at).unwrap_or(self.end)
    }

    fn expect(&mut self, expected: Token) -> ParseResult<()> {
        let at = self.offset();
        match self.next() {
            Some((_, token)) if token == expected => Ok(()),
            Some((_, token)) => Err(ExpressionError::new(
                at,
                format!("expected {}, found {}", expected, token),
            )),
            None => Err(ExpressionError::new(at, format!("expected {}", expected))),
        }
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        let at = self.offset();
        match self.next() {
            Some((_, Token::Str(s))) => Ok(Expr::Literal(Value::String(s))),
            Some((_, Token::Number(n))) => Ok(Expr::Literal(Value::Number(n))),
            Some((_, Token::LBracket)) => Ok(Expr::List(self.sequence(Token::RBracket)?)),
            Some((_, Token::Ident(name))) => match name.as_str() {
                "true" => Ok(Expr::literal(true)),
                "false" => Ok(Expr::literal(false)),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    let function =
                        Function::from_str(&name).map_err(|m| ExpressionError::new(at, m))?;
                    self.next();
                    Ok(Expr::call(function, self.sequence(Token::RParen)?))
                }
                _ => self.path(at, name),
            },
            Some((at, token)) => Err(ExpressionError::new(at, format!("unexpected {}", token))),
            None => Err(ExpressionError::new(at, "expected an expression")),
        }
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed.
    fn sequence(&mut self, close: Token) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&close) {
                self.next();
                return Ok(items);
            }
            items.push(self.expression()?);
            let at = self.offset();
            match self.next() {
                Some((_, Token::Comma)) => {}
                Some((_, token)) if token == close => return Ok(items),
                _ => {
                    return Err(ExpressionError::new(at, format!("expected ',' or {}", close)));
                }
            }
        }
    }

    fn path(&mut self, at: usize, first: String) -> ParseResult<Expr> {
        let mut segments = vec![Segment::Name(first)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name_at = self.offset();
                    match self.next() {
                        Some((_, Token::Ident(name))) => segments.push(Segment::Name(name)),
                        _ => return Err(ExpressionError::new(name_at, "expected a name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let key_at = self.offset();
                    let segment = match self.next() {
                        Some((_, Token::Number(n))) => n
                            .as_u64()
                            .map(|i| Segment::Index(i as usize))
                            .ok_or_else(|| {
                                ExpressionError::new(key_at, "instance index must be a non-negative integer")
                            })?,
                        Some((_, Token::Str(key))) => Segment::Key(key),
                        _ => {
                            return Err(ExpressionError::new(
                                key_at,
                                "expected an index or a quoted key",
                            ));
                        }
                    };
                    self.expect(Token::RBracket)?;
                    segments.push(segment);
                }
                _ => break,
            }
        }
        resolve_path(at, &segments, self.variables)
    }
}

fn resolve_path(at: usize, segments: &[Segment], variables: &Variables) -> ParseResult<Expr> {
    use Segment::{Index, Key, Name};

    let reference = match segments {
        [Name(a), Name(b)] if a == "count" && b == "index" => {
            return Ok(Expr::Iteration(IterationRef::CountIndex));
        }
        [Name(a), Name(b)] if a == "each" && b == "key" => {
            return Ok(Expr::Iteration(IterationRef::EachKey));
        }
        [Name(a), Name(b)] if a == "each" && b == "value" => {
            return Ok(Expr::Iteration(IterationRef::EachValue));
        }
        [Name(a), Name(name)] if a == "var" => {
            return variables
                .get(name)
                .cloned()
                .map(Expr::Literal)
                .ok_or_else(|| ExpressionError::new(at, format!("undefined variable '{}'", name)));
        }
        [Name(d), Name(t), Name(n), Name(attr)] if d == "data" => Reference::data(t, n, attr),
        [Name(t), Name(n), Name(attr)] => Reference::to(t, n, attr),
        [Name(t), Name(n), Index(i), Name(attr)] => {
            Reference::to(t, n, attr).with_key(InstanceKey::Index(*i))
        }
        [Name(t), Name(n), Key(k), Name(attr)] => {
            Reference::to(t, n, attr).with_key(InstanceKey::Key(k.clone()))
        }
        _ => {
            let rendered: String = segments.iter().map(|s| s.to_string()).collect();
            return Err(ExpressionError::new(
                at,
                format!("'{}' is not a valid reference", rendered.trim_start_matches('.')),
            ));
        }
    };
    Ok(Expr::Reference(reference))
}
