//! Line protocol transactions
//!
//! A transaction is one line: a command followed by `KEY=value` parameters.
//! Values are either bare tokens or double-quoted strings in which `\` escapes
//! the next character. Keys may repeat.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty transaction")]
    Empty,
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("invalid parameter key at byte {0}")]
    InvalidKey(usize),
    #[error("parameter {0:?} is missing '='")]
    MissingEquals(String),
    #[error("unterminated quoted value for {0:?}")]
    UnterminatedQuote(String),
    #[error("unexpected character after value of {0:?}")]
    TrailingGarbage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub command: String,
    pub params: Vec<(String, String)>,
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl Transaction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// First value of `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `key`, in order.
    pub fn param_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        if command.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if !command.chars().all(is_token_char) {
            return Err(ProtocolError::InvalidCommand(command.to_string()));
        }

        let offset = line.len() - rest.len();
        let mut chars = rest.char_indices().peekable();
        let mut params = Vec::new();

        loop {
            while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
            let Some(&(start, _)) = chars.peek() else {
                break;
            };

            let mut key = String::new();
            while let Some((_, c)) = chars.next_if(|(_, c)| is_token_char(*c)) {
                key.push(c);
            }
            if key.is_empty() {
                return Err(ProtocolError::InvalidKey(offset + start));
            }
            if chars.next_if(|(_, c)| *c == '=').is_none() {
                return Err(ProtocolError::MissingEquals(key));
            }

            let mut value = String::new();
            if chars.next_if(|(_, c)| *c == '"').is_some() {
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => return Err(ProtocolError::UnterminatedQuote(key)),
                        },
                        Some((_, c)) => value.push(c),
                        None => return Err(ProtocolError::UnterminatedQuote(key)),
                    }
                }
                if chars.peek().is_some_and(|(_, c)| !c.is_whitespace()) {
                    return Err(ProtocolError::TrailingGarbage(key));
                }
            } else {
                while let Some((_, c)) = chars.next_if(|(_, c)| !c.is_whitespace()) {
                    if c == '"' {
                        return Err(ProtocolError::TrailingGarbage(key));
                    }
                    value.push(c);
                }
            }

            params.push((key, value));
        }

        Ok(Self {
            command: command.to_string(),
            params,
        })
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in value.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for (key, value) in &self.params {
            write!(f, " {key}=")?;
            write_quoted(f, value)?;
        }
        Ok(())
    }
}
