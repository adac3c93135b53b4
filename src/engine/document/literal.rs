//! Shell literal parser
//!
//! Parses the relaxed JSON accepted by the mongo shell into BSON: unquoted
//! and dotted keys, single-quoted strings, trailing commas, regex literals and
//! the usual wrapper constructors (`ObjectId(..)`, `ISODate(..)`,
//! `NumberLong(..)`, ...). Extended JSON wrappers such as `{"$oid": ".."}`
//! are decoded as well. Key order is preserved.

use chrono::{DateTime as ChronoDateTime, NaiveDate, NaiveDateTime};
use mongodb::bson::{doc, oid::ObjectId, Bson, DateTime, Document, Regex};

use crate::engine::error::{EngineError, EngineResult};

/// Extended JSON keys that turn a single-key document into a scalar.
const EXTJSON_WRAPPERS: &[&str] = &[
    "$oid",
    "$date",
    "$numberLong",
    "$numberInt",
    "$numberDouble",
    "$numberDecimal",
    "$binary",
    "$regularExpression",
    "$timestamp",
    "$uuid",
    "$symbol",
    "$minKey",
    "$maxKey",
];

/// Parses a complete literal; trailing input other than whitespace is an
/// error.
pub fn parse_literal(text: &str) -> EngineResult<Bson> {
    let mut scanner = Scanner::new(text);
    let value = scanner.value()?;
    scanner.skip_ws();
    if !scanner.is_eof() {
        return Err(scanner.error("Unexpected trailing input"));
    }
    Ok(value)
}

/// Parses a complete literal that must be a document.
pub fn parse_document(text: &str) -> EngineResult<Document> {
    match parse_literal(text)? {
        Bson::Document(document) => Ok(document),
        other => Err(EngineError::syntax_error(format!(
            "Expected a document, found {:?}",
            other.element_type()
        ))),
    }
}

/// Cursor over shell text, shared with the query translator.
pub(crate) struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub(crate) fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub(crate) fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    pub(crate) fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    /// Skips whitespace, then consumes `expected` if it is next.
    pub(crate) fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, expected: char) -> EngineResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("Expected '{}'", expected)))
        }
    }

    pub(crate) fn error(&self, message: &str) -> EngineError {
        let found = match self.peek() {
            Some(c) => format!("'{}'", c),
            None => "end of input".to_string(),
        };
        EngineError::syntax_error(format!(
            "{} at position {} (found {})",
            message, self.pos, found
        ))
    }

    /// Identifier made of letters, digits, `_` and `$`; `.` too when
    /// `dotted`. Returns `None` without consuming anything otherwise.
    pub(crate) fn word(&mut self, dotted: bool) -> Option<&'a str> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' || (dotted && c == '.') {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if self.pos == start {
            None
        } else {
            Some(&self.src[start..self.pos])
        }
    }

    /// Any literal value.
    pub(crate) fn value(&mut self) -> EngineResult<Bson> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.document().and_then(unwrap_extjson),
            Some('[') => self.array().map(Bson::Array),
            Some('"') | Some('\'') => self.string().map(Bson::String),
            Some('/') => self.regex(),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => self.keyword(),
            _ => Err(self.error("Expected a value")),
        }
    }

    /// `{ key: value, ... }` without extended JSON decoding.
    pub(crate) fn document(&mut self) -> EngineResult<Document> {
        self.expect('{')?;
        let mut document = Document::new();
        if self.eat('}') {
            return Ok(document);
        }
        loop {
            let key = self.key()?;
            self.expect(':')?;
            let value = self.value()?;
            document.insert(key, value);

            if self.eat(',') {
                if self.eat('}') {
                    return Ok(document);
                }
                continue;
            }
            self.expect('}')?;
            return Ok(document);
        }
    }

    /// `[ value, ... ]`
    pub(crate) fn array(&mut self) -> EngineResult<Vec<Bson>> {
        self.expect('[')?;
        let mut items = Vec::new();
        if self.eat(']') {
            return Ok(items);
        }
        loop {
            items.push(self.value()?);
            if self.eat(',') {
                if self.eat(']') {
                    return Ok(items);
                }
                continue;
            }
            self.expect(']')?;
            return Ok(items);
        }
    }

    fn key(&mut self) -> EngineResult<String> {
        self.skip_ws();
        match self.peek() {
            Some('"') | Some('\'') => self.string(),
            _ => self
                .word(true)
                .map(str::to_string)
                .ok_or_else(|| self.error("Expected a field name")),
        }
    }

    /// Single- or double-quoted string with JSON escapes.
    pub(crate) fn string(&mut self) -> EngineResult<String> {
        self.skip_ws();
        let quote = match self.bump() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("Expected a string")),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("Unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.error("Unterminated escape"))?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        'u' => out.push(self.unicode_escape()?),
                        other => out.push(other),
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn hex4(&mut self) -> EngineResult<u32> {
        let digits = self.rest().get(..4).unwrap_or("");
        if digits.len() != 4 {
            return Err(self.error("Invalid unicode escape"));
        }
        let code =
            u32::from_str_radix(digits, 16).map_err(|_| self.error("Invalid unicode escape"))?;
        self.pos += 4;
        Ok(code)
    }

    fn unicode_escape(&mut self) -> EngineResult<char> {
        let high = self.hex4()?;
        if (0xD800..0xDC00).contains(&high) && self.rest().starts_with("\\u") {
            self.pos += 2;
            let low = self.hex4()?;
            let combined = 0x10000 + ((high - 0xD800) << 10) + (low.wrapping_sub(0xDC00) & 0x3FF);
            return char::from_u32(combined).ok_or_else(|| self.error("Invalid surrogate pair"));
        }
        char::from_u32(high).ok_or_else(|| self.error("Invalid unicode escape"))
    }

    fn number(&mut self) -> EngineResult<Bson> {
        self.skip_ws();
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        if self.rest().starts_with("Infinity") {
            self.pos += "Infinity".len();
            let negative = self.src[start..].starts_with('-');
            return Ok(Bson::Double(if negative {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }));
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {}
                '.' | 'e' | 'E' => is_float = true,
                '-' | '+' if matches!(self.src[..self.pos].chars().last(), Some('e' | 'E')) => {}
                _ => break,
            }
            self.pos += 1;
        }

        let text = self.src[start..self.pos].trim_start_matches('+');
        if !is_float {
            if let Ok(value) = text.parse::<i64>() {
                return Ok(match i32::try_from(value) {
                    Ok(small) => Bson::Int32(small),
                    Err(_) => Bson::Int64(value),
                });
            }
        }
        text.parse::<f64>()
            .map(Bson::Double)
            .map_err(|_| EngineError::syntax_error(format!("Invalid number '{}'", text)))
    }

    /// `/pattern/flags`
    fn regex(&mut self) -> EngineResult<Bson> {
        self.expect('/')?;
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.bump() {
                None => return Err(self.error("Unterminated regular expression")),
                Some('\\') => {
                    pattern.push('\\');
                    if let Some(c) = self.bump() {
                        pattern.push(c);
                    }
                }
                Some('[') => {
                    in_class = true;
                    pattern.push('[');
                }
                Some(']') => {
                    in_class = false;
                    pattern.push(']');
                }
                Some('/') if !in_class => break,
                Some(c) => pattern.push(c),
            }
        }
        let mut options: Vec<char> = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                options.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        options.sort_unstable();
        Ok(Bson::RegularExpression(Regex {
            pattern,
            options: options.into_iter().collect(),
        }))
    }

    fn keyword(&mut self) -> EngineResult<Bson> {
        let start = self.pos;
        let word = self.word(false).unwrap_or_default();
        match word {
            "true" => Ok(Bson::Boolean(true)),
            "false" => Ok(Bson::Boolean(false)),
            "null" | "undefined" => Ok(Bson::Null),
            "NaN" => Ok(Bson::Double(f64::NAN)),
            "Infinity" => Ok(Bson::Double(f64::INFINITY)),
            "new" => {
                let constructor = self
                    .word(false)
                    .ok_or_else(|| self.error("Expected a constructor after 'new'"))?;
                self.constructor(constructor)
            }
            _ if self.rest().trim_start().starts_with('(') => self.constructor(word),
            _ => {
                self.pos = start;
                Err(self.error(&format!("Unknown identifier '{}'", word)))
            }
        }
    }

    /// Arguments of a wrapper constructor: zero or one literal.
    fn constructor_argument(&mut self) -> EngineResult<Option<Bson>> {
        self.expect('(')?;
        if self.eat(')') {
            return Ok(None);
        }
        let argument = self.value()?;
        self.expect(')')?;
        Ok(Some(argument))
    }

    fn constructor(&mut self, name: &str) -> EngineResult<Bson> {
        let argument = self.constructor_argument()?;
        match (name, argument) {
            ("ObjectId", None) => Ok(Bson::ObjectId(ObjectId::new())),
            ("ObjectId", Some(Bson::String(hex))) => ObjectId::parse_str(&hex)
                .map(Bson::ObjectId)
                .map_err(|e| EngineError::syntax_error(format!("Invalid ObjectId '{}': {}", hex, e))),
            ("ISODate" | "Date", None) => Ok(Bson::DateTime(DateTime::now())),
            ("ISODate" | "Date", Some(Bson::String(text))) => parse_date(&text).map(Bson::DateTime),
            ("Date", Some(Bson::Int32(millis))) => {
                Ok(Bson::DateTime(DateTime::from_millis(i64::from(millis))))
            }
            ("Date", Some(Bson::Int64(millis))) => Ok(Bson::DateTime(DateTime::from_millis(millis))),
            ("NumberLong", Some(value)) => integer_argument(name, &value).map(Bson::Int64),
            ("NumberInt", Some(value)) => integer_argument(name, &value)
                .and_then(|v| {
                    i32::try_from(v)
                        .map_err(|_| EngineError::syntax_error(format!("NumberInt out of range: {}", v)))
                })
                .map(Bson::Int32),
            ("NumberDecimal", Some(value)) => {
                let text = match value {
                    Bson::String(text) => text,
                    Bson::Int32(v) => v.to_string(),
                    Bson::Int64(v) => v.to_string(),
                    Bson::Double(v) => v.to_string(),
                    other => {
                        return Err(EngineError::syntax_error(format!(
                            "Invalid NumberDecimal argument {:?}",
                            other.element_type()
                        )))
                    }
                };
                decode_extjson(doc! { "$numberDecimal": text })
            }
            (name, _) => Err(EngineError::syntax_error(format!(
                "Unsupported constructor '{}'",
                name
            ))),
        }
    }
}

fn integer_argument(name: &str, value: &Bson) -> EngineResult<i64> {
    match value {
        Bson::Int32(v) => Ok(i64::from(*v)),
        Bson::Int64(v) => Ok(*v),
        Bson::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| EngineError::syntax_error(format!("Invalid {} '{}'", name, text))),
        _ => Err(EngineError::syntax_error(format!(
            "Invalid {} argument",
            name
        ))),
    }
}

fn parse_date(text: &str) -> EngineResult<DateTime> {
    let trimmed = text.trim();
    let millis = if let Ok(parsed) = ChronoDateTime::parse_from_rfc3339(trimmed) {
        parsed.timestamp_millis()
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        naive.and_utc().timestamp_millis()
    } else if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        date.and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc().timestamp_millis())
            .unwrap_or_default()
    } else {
        return Err(EngineError::syntax_error(format!("Invalid date '{}'", text)));
    };
    Ok(DateTime::from_millis(millis))
}

/// Decodes `{"$oid": ..}`-style wrappers; other documents pass through.
fn unwrap_extjson(document: Document) -> EngineResult<Bson> {
    let is_wrapper = document.len() == 1
        && document
            .keys()
            .next()
            .is_some_and(|key| EXTJSON_WRAPPERS.contains(&key.as_str()));
    if is_wrapper {
        decode_extjson(document)
    } else {
        Ok(Bson::Document(document))
    }
}

fn decode_extjson(document: Document) -> EngineResult<Bson> {
    let json = Bson::Document(document).into_relaxed_extjson();
    Bson::try_from(json.clone())
        .map_err(|e| EngineError::syntax_error(format!("Invalid extended JSON {}: {}", json, e)))
}
