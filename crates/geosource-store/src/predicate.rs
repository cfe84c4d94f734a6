//! Attribute predicates evaluated in-process.
//!
//! Backends with no query engine of their own (memory, Shapefile, remote
//! client-side filtering) accept a conjunction of simple comparisons:
//!
//! ```text
//! NAME = 'A' AND POP >= :min AND CODE IS NOT NULL AND TITLE LIKE 'Jl.%'
//! ```
//!
//! Operands are literals or `:name` / `@name` parameters bound from the filter.

use chrono::{NaiveDate, NaiveDateTime};
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{AttributeFilter, AttributeTable, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare { field: String, op: CompareOp, value: Value },
    IsNull { field: String, negated: bool },
}

/// Parsed conjunction of conditions
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    QuotedIdent(String),
    Str(String),
    Int(i64),
    Float(f64),
    Param(String),
    Op(CompareOp),
}

fn invalid(reason: impl Into<String>) -> GeosourceError {
    GeosourceError::InvalidFilter { reason: reason.into() }
}

fn read_quoted(chars: &[char], start: usize, close: char) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            // Doubled delimiter escapes itself
            if chars.get(i + 1) == Some(&close) {
                out.push(close);
                i += 2;
                continue;
            }
            return Ok((out, i + 1));
        }
        out.push(chars[i]);
        i += 1;
    }
    Err(invalid(format!("unterminated quote starting at offset {start}")))
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let number_allowed = !matches!(
            tokens.last(),
            Some(Token::Word(_) | Token::QuotedIdent(_) | Token::Int(_) | Token::Float(_))
        );
        match c {
            '\'' => {
                let (s, next) = read_quoted(&chars, i, '\'')?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '"' | '`' => {
                let (s, next) = read_quoted(&chars, i, c)?;
                tokens.push(Token::QuotedIdent(s));
                i = next;
            }
            '[' => {
                let (s, next) = read_quoted(&chars, i, ']')?;
                tokens.push(Token::QuotedIdent(s));
                i = next;
            }
            ':' | '@' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                if end == start {
                    return Err(invalid(format!("empty parameter name at offset {i}")));
                }
                tokens.push(Token::Param(chars[start..end].iter().collect()));
                i = end;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '<' => {
                let (op, len) = match chars.get(i + 1) {
                    Some('=') => (CompareOp::Le, 2),
                    Some('>') => (CompareOp::Ne, 2),
                    _ => (CompareOp::Lt, 1),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            '>' => {
                let (op, len) = match chars.get(i + 1) {
                    Some('=') => (CompareOp::Ge, 2),
                    _ => (CompareOp::Gt, 1),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            c if c.is_ascii_digit()
                || (number_allowed
                    && (c == '-' || c == '.')
                    && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let token = match literal.parse::<i64>() {
                    Ok(n) => Token::Int(n),
                    Err(_) => Token::Float(
                        literal.parse().map_err(|_| invalid(format!("bad number '{literal}'")))?,
                    ),
                };
                tokens.push(token);
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{other}' at offset {i}"))),
        }
    }
    Ok(tokens)
}

fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    filter: &'a AttributeFilter,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if is_keyword(self.peek(), keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid(format!("expected {keyword}")))
        }
    }

    fn field(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            Some(Token::QuotedIdent(w)) => Ok(w),
            other => Err(invalid(format!("expected a field name, found {other:?}"))),
        }
    }

    fn operand(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Text(s)),
            Some(Token::Int(n)) => Ok(Value::Integer(n)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::Param(name)) => self
                .filter
                .parameter(&name)
                .cloned()
                .ok_or_else(|| invalid(format!("parameter :{name} is not bound"))),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => Ok(Value::Boolean(true)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => Ok(Value::Boolean(false)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("null") => Ok(Value::Null),
            other => Err(invalid(format!("expected a literal or parameter, found {other:?}"))),
        }
    }

    fn condition(&mut self) -> Result<Condition> {
        let field = self.field()?;
        if is_keyword(self.peek(), "is") {
            self.pos += 1;
            let negated = is_keyword(self.peek(), "not");
            if negated {
                self.pos += 1;
            }
            self.expect_keyword("null")?;
            return Ok(Condition::IsNull { field, negated });
        }
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("like") => CompareOp::Like,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("not") => {
                self.expect_keyword("like")?;
                CompareOp::NotLike
            }
            other => return Err(invalid(format!("expected a comparison operator after {field}, found {other:?}"))),
        };
        let value = self.operand()?;
        Ok(Condition::Compare { field, op, value })
    }
}

impl Predicate {
    /// Parse the fragment of an attribute filter, binding its parameters
    pub fn parse(filter: &AttributeFilter) -> Result<Self> {
        let tokens = tokenize(&filter.predicate)?;
        if tokens.is_empty() {
            return Err(invalid("attribute predicate is empty"));
        }
        let mut parser = Parser { tokens, pos: 0, filter };
        let mut conditions = vec![parser.condition()?];
        while parser.peek().is_some() {
            parser.expect_keyword("and")?;
            conditions.push(parser.condition()?);
        }
        Ok(Self { conditions })
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Field names the predicate reads
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|c| match c {
            Condition::Compare { field, .. } | Condition::IsNull { field, .. } => field.as_str(),
        })
    }

    pub fn matches(&self, attributes: &AttributeTable) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::IsNull { field, negated } => {
                let is_null = attributes.get(field).map_or(true, Value::is_null);
                is_null != *negated
            }
            Condition::Compare { field, op, value } => {
                let actual = attributes.get(field).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
        })
    }
}

/// Date or timestamp text as stored by SQLite-hosted formats and typed into predicates
pub(crate) fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn ordering(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_))
        | (Value::Text(_), Value::Integer(_) | Value::Float(_))
        | (Value::Integer(_) | Value::Float(_), Value::Text(_)) => {
            Some(actual.as_f64()?.total_cmp(&expected.as_f64()?))
        }
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), other) => Some(i64::from(*a).cmp(&other.as_i64()?)),
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::Text(b)) => Some(a.cmp(&parse_datetime(b)?)),
        (Value::Text(a), Value::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        (a, b) => Some(a.to_string().cmp(&b.to_string())),
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Like | CompareOp::NotLike => {
            if actual.is_null() || expected.is_null() {
                return false;
            }
            let matched = like(&actual.to_string(), &expected.to_string());
            matched == (op == CompareOp::Like)
        }
        _ => match ordering(actual, expected) {
            None => false,
            Some(ord) => match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Like | CompareOp::NotLike => false,
            },
        },
    }
}

/// Case-insensitive SQL LIKE: `%` matches any run, `_` one character
pub fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> AttributeTable {
        AttributeTable::new()
            .with("NAME", "Jalan Sudirman")
            .with("POP", 1200i64)
            .with("AREA", 12.5)
            .with("CODE", Value::Null)
            .with("ACTIVE", true)
    }

    fn eval(text: &str) -> bool {
        Predicate::parse(&AttributeFilter::new(text)).unwrap().matches(&row())
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("POP = 1200"));
        assert!(eval("pop >= 1000 AND pop < 2000"));
        assert!(eval("AREA > 12"));
        assert!(eval("AREA <> 3"));
        assert!(!eval("POP != 1200"));
        assert!(eval("NAME = 'Jalan Sudirman'"));
        assert!(eval("ACTIVE = TRUE"));
        assert!(eval("POP > -5"));
    }

    #[test]
    fn test_null_handling() {
        assert!(eval("CODE IS NULL"));
        assert!(eval("MISSING IS NULL"));
        assert!(eval("NAME IS NOT NULL"));
        // Comparisons against null never match
        assert!(!eval("CODE = 1"));
        assert!(!eval("CODE != 1"));
    }

    #[test]
    fn test_like() {
        assert!(eval("NAME LIKE 'jalan%'"));
        assert!(eval("NAME LIKE '%sud_rman'"));
        assert!(eval("NAME NOT LIKE 'Gang%'"));
        assert!(like("abc", "a%c"));
        assert!(like("", "%"));
        assert!(!like("abc", "a_"));
    }

    #[test]
    fn test_parameters() {
        let filter = AttributeFilter::new("POP >= :min AND NAME = @name")
            .param("min", 1000i64)
            .param("name", "Jalan Sudirman");
        assert!(Predicate::parse(&filter).unwrap().matches(&row()));

        let unbound = AttributeFilter::new("POP = :missing");
        assert!(matches!(Predicate::parse(&unbound), Err(GeosourceError::InvalidFilter { .. })));
    }

    #[test]
    fn test_quoted_identifiers_and_escapes() {
        let table = AttributeTable::new().with("my field", "it's");
        let predicate = Predicate::parse(&AttributeFilter::new("\"my field\" = 'it''s'")).unwrap();
        assert!(predicate.matches(&table));
        let predicate = Predicate::parse(&AttributeFilter::new("[my field] LIKE 'IT%'")).unwrap();
        assert!(predicate.matches(&table));
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        for text in ["POP = 1 OR POP = 2", "(POP = 1)", "POP", "POP = 'open", "POP IN (1, 2)"] {
            assert!(Predicate::parse(&AttributeFilter::new(text)).is_err(), "{text}");
        }
    }

    #[test]
    fn test_fields() {
        let predicate = Predicate::parse(&AttributeFilter::new("a = 1 AND b IS NULL")).unwrap();
        assert_eq!(predicate.fields().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
