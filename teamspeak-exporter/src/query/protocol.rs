//! ServerQuery line protocol: escaping, records and status lines.
//!
//! A response is zero or more data lines followed by a status line:
//!
//! ```text
//! virtualserver_name=My\sServer virtualserver_uptime=3600
//! error id=0 msg=ok
//! ```
//!
//! Data lines hold `|`-separated records of space-separated `key=value` pairs.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::QueryError;

/// First line the server sends on connect.
pub const BANNER: &str = "TS3";

/// Escape a value for use in a command parameter.
pub fn escape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '/' => result.push_str("\\/"),
            ' ' => result.push_str("\\s"),
            '|' => result.push_str("\\p"),
            '\u{07}' => result.push_str("\\a"),
            '\u{08}' => result.push_str("\\b"),
            '\u{0C}' => result.push_str("\\f"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\u{0B}' => result.push_str("\\v"),
            _ => result.push(c),
        }
    }
    result
}

/// Reverse [`escape`]. Unknown escapes are kept verbatim.
pub fn unescape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => result.push('\\'),
            Some('/') => result.push('/'),
            Some('s') => result.push(' '),
            Some('p') => result.push('|'),
            Some('a') => result.push('\u{07}'),
            Some('b') => result.push('\u{08}'),
            Some('f') => result.push('\u{0C}'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('v') => result.push('\u{0B}'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

/// One `key=value` record of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    /// Parse a single record. Keys without `=` map to an empty value.
    pub fn from_line(line: &str) -> Self {
        let fields = line
            .split(' ')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), unescape(value)),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Required text field.
    pub fn text(&self, key: &'static str) -> Result<&str, QueryError> {
        self.get(key).ok_or(QueryError::MissingField(key))
    }

    /// Required numeric field.
    pub fn parse<T: FromStr>(&self, key: &'static str) -> Result<T, QueryError> {
        let raw = self.text(key)?;
        raw.parse().map_err(|_| QueryError::InvalidField {
            field: key,
            value: raw.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Split data lines into records.
pub fn parse_records(lines: &[String]) -> Vec<Record> {
    lines
        .iter()
        .flat_map(|line| line.split('|'))
        .filter(|chunk| !chunk.trim().is_empty())
        .map(Record::from_line)
        .collect()
}

/// Classification of one received line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `error id=<id> msg=<msg>` terminating a response.
    Status { id: u32, message: String },
    /// Asynchronous event, not part of any response.
    Notify,
    Data(String),
    Empty,
}

impl Line {
    pub fn classify(raw: &str) -> Result<Self, QueryError> {
        let line = raw.trim_matches(|c| c == '\r' || c == '\n');
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        if line.starts_with("notify") {
            return Ok(Self::Notify);
        }
        if let Some(rest) = line.strip_prefix("error ") {
            let record = Record::from_line(rest);
            let id = record.parse("id").map_err(|_| {
                QueryError::Protocol(format!("malformed status line: {}", line))
            })?;
            let message = record.get("msg").unwrap_or_default().to_string();
            return Ok(Self::Status { id, message });
        }
        Ok(Self::Data(line.to_string()))
    }
}

/// Build a command line from a name and escaped parameters.
pub fn command(name: &str, params: &[(&str, &str)]) -> String {
    let mut line = name.to_string();
    for (key, value) in params {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        line.push_str(&escape(value));
    }
    line
}
