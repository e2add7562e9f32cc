//! A strict parser and printer for the legacy wire shape: Python literal
//! tuples, lists, dicts, strings, and integers.
//!
//! The original servers speak `repr()`-formatted payloads. This module
//! parses exactly that grammar into a small value tree and renders requests
//! back into it. It is a real recursive-descent parser; nothing is ever
//! evaluated.

use std::fmt::Write as _;

use thiserror::Error;

/// A parse error, with the byte offset where parsing failed.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("literal parse error at byte {offset}: {message}")]
pub struct LiteralError {
    /// Offset into the input where the error was detected.
    pub offset: usize,
    /// What went wrong.
    pub message: &'static str,
}

/// A parsed Python literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `None`
    None,
    /// `True` or `False`
    Bool(bool),
    /// A (possibly negative) integer.
    Int(i64),
    /// A single- or double-quoted string.
    Str(String),
    /// A `[...]` list.
    List(Vec<Literal>),
    /// A `(...)` tuple.
    Tuple(Vec<Literal>),
    /// A `{...}` dict, in source order.
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    /// Parse a complete literal; trailing bytes are an error.
    pub fn parse(input: &str) -> Result<Literal, LiteralError> {
        let mut parser = Parser {
            bytes: input.as_bytes(),
            pos: 0,
        };
        parser.skip_whitespace();
        let value = parser.parse_value()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing bytes after literal"));
        }
        Ok(value)
    }

    /// Render this literal the way Python's `repr()` would.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Literal::None => out.push_str("None"),
            Literal::Bool(true) => out.push_str("True"),
            Literal::Bool(false) => out.push_str("False"),
            Literal::Int(n) => {
                let _ = write!(out, "{}", n);
            }
            Literal::Str(s) => {
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
            }
            Literal::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(out);
                }
                out.push(']');
            }
            Literal::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(out);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Literal::Dict(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.render_into(out);
                    out.push_str(": ");
                    value.render_into(out);
                }
                out.push('}');
            }
        }
    }

    /// Convert to JSON so the rest of the client handles one value shape.
    ///
    /// Tuples become arrays; dict keys must be strings.
    pub fn to_json(&self) -> Result<serde_json::Value, LiteralError> {
        use serde_json::Value;
        Ok(match self {
            Literal::None => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(n) => Value::from(*n),
            Literal::Str(s) => Value::String(s.clone()),
            Literal::List(items) | Literal::Tuple(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json())
                    .collect::<Result<_, _>>()?,
            ),
            Literal::Dict(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    match key {
                        Literal::Str(key) => {
                            map.insert(key.clone(), value.to_json()?);
                        }
                        _ => {
                            return Err(LiteralError {
                                offset: 0,
                                message: "dict key is not a string",
                            })
                        }
                    }
                }
                Value::Object(map)
            }
        })
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &'static str) -> LiteralError {
        LiteralError {
            offset: self.pos,
            message,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn starts_with(&self, word: &str) -> bool {
        self.bytes[self.pos..].starts_with(word.as_bytes())
    }

    fn parse_value(&mut self) -> Result<Literal, LiteralError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'\'') | Some(b'"') => self.parse_string(),
            Some(b'[') => self.parse_sequence(b'[', b']').map(Literal::List),
            Some(b'(') => self.parse_sequence(b'(', b')').map(Literal::Tuple),
            Some(b'{') => self.parse_dict(),
            Some(b'-') | Some(b'0'..=b'9') => self.parse_int(),
            Some(_) if self.starts_with("None") => {
                self.pos += 4;
                Ok(Literal::None)
            }
            Some(_) if self.starts_with("True") => {
                self.pos += 4;
                Ok(Literal::Bool(true))
            }
            Some(_) if self.starts_with("False") => {
                self.pos += 5;
                Ok(Literal::Bool(false))
            }
            Some(_) => Err(self.error("unexpected byte")),
        }
    }

    fn parse_string(&mut self) -> Result<Literal, LiteralError> {
        let quote = self.bump().expect("caller checked for a quote");
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b) if b == quote => return Ok(Literal::Str(out)),
                Some(b'\\') => match self.bump() {
                    None => return Err(self.error("unterminated escape")),
                    Some(b'\'') => out.push('\''),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'x') => {
                        let hi = self.bump().ok_or_else(|| self.error("bad \\x escape"))?;
                        let lo = self.bump().ok_or_else(|| self.error("bad \\x escape"))?;
                        let byte = u8::from_str_radix(
                            std::str::from_utf8(&[hi, lo])
                                .map_err(|_| self.error("bad \\x escape"))?,
                            16,
                        )
                        .map_err(|_| self.error("bad \\x escape"))?;
                        out.push(byte as char);
                    }
                    Some(_) => return Err(self.error("unsupported escape")),
                },
                Some(b) if b < 0x80 => out.push(b as char),
                Some(_) => {
                    // Re-decode a multi-byte UTF-8 sequence from the input.
                    let start = self.pos - 1;
                    let rest = std::str::from_utf8(&self.bytes[start..])
                        .map_err(|_| self.error("invalid utf-8 in string"))?;
                    let c = rest.chars().next().ok_or_else(|| self.error("invalid utf-8"))?;
                    self.pos = start + c.len_utf8();
                    out.push(c);
                }
            }
        }
    }

    fn parse_int(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .expect("digits and minus are valid utf-8");
        // Python longs may carry a trailing L marker.
        if matches!(self.peek(), Some(b'L' | b'l')) {
            self.pos += 1;
        }
        text.parse()
            .map(Literal::Int)
            .map_err(|_| self.error("invalid integer"))
    }

    fn parse_sequence(&mut self, open: u8, close: u8) -> Result<Vec<Literal>, LiteralError> {
        assert!(self.eat(open));
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.eat(close) {
                return Ok(items);
            }
            if !items.is_empty() && !self.eat(b',') {
                return Err(self.error("expected ',' or close bracket"));
            }
            self.skip_whitespace();
            // Allow a trailing comma before the close bracket.
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.parse_value()?);
        }
    }

    fn parse_dict(&mut self) -> Result<Literal, LiteralError> {
        assert!(self.eat(b'{'));
        let mut entries = Vec::new();
        loop {
            self.skip_whitespace();
            if self.eat(b'}') {
                return Ok(Literal::Dict(entries));
            }
            if !entries.is_empty() && !self.eat(b',') {
                return Err(self.error("expected ',' or '}'"));
            }
            self.skip_whitespace();
            if self.eat(b'}') {
                return Ok(Literal::Dict(entries));
            }
            let key = self.parse_value()?;
            self.skip_whitespace();
            if !self.eat(b':') {
                return Err(self.error("expected ':' after dict key"));
            }
            let value = self.parse_value()?;
            entries.push((key, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_poll_response() {
        let parsed = Literal::parse("(1234, {'1abc': 'deadbeef', '1def': None})").unwrap();
        match parsed {
            Literal::Tuple(items) => {
                assert_eq!(items[0], Literal::Int(1234));
                match &items[1] {
                    Literal::Dict(entries) => {
                        assert_eq!(entries.len(), 2);
                        assert_eq!(entries[1].1, Literal::None);
                    }
                    other => panic!("expected dict, got {:?}", other),
                }
            }
            other => panic!("expected tuple, got {:?}", other),
        }
    }

    #[test]
    fn parses_history_rows() {
        let input = "[{'tx_hash': 'ab', 'height': 5, 'is_in': 0, 'value': -100, 'pos': 1}]";
        let json = Literal::parse(input).unwrap().to_json().unwrap();
        assert_eq!(json[0]["height"], 5);
        assert_eq!(json[0]["value"], -100);
    }

    #[test]
    fn render_matches_python_repr() {
        let request = Literal::Tuple(vec![
            Literal::Str("h".into()),
            Literal::Str("1abc".into()),
        ]);
        assert_eq!(request.render(), "('h', '1abc')");

        let one = Literal::Tuple(vec![Literal::Int(3)]);
        assert_eq!(one.render(), "(3,)");

        assert_eq!(
            Literal::Str("it's".into()).render(),
            "'it\\'s'"
        );
    }

    #[test]
    fn roundtrips_rendered_values() {
        let value = Literal::Dict(vec![
            (Literal::Str("a".into()), Literal::List(vec![Literal::Int(1), Literal::None])),
            (Literal::Str("b".into()), Literal::Bool(true)),
        ]);
        assert_eq!(Literal::parse(&value.render()).unwrap(), value);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Literal::parse("__import__('os')").is_err());
        assert!(Literal::parse("(1,").is_err());
        assert!(Literal::parse("{1: 2} extra").is_err());
        assert!(Literal::parse("'unterminated").is_err());
    }

    #[test]
    fn long_integers_drop_their_marker() {
        assert_eq!(Literal::parse("12L").unwrap(), Literal::Int(12));
    }
}
