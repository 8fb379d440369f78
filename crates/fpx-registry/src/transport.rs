//! Transport and endpoint value types

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between the tokens of a transport spec.
pub const CHAIN_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("empty transport spec")]
    Empty,
    #[error("transport spec {0:?} contains an empty token")]
    EmptyToken(String),
    #[error("transport spec {0:?} contains whitespace")]
    Whitespace(String),
}

/// A transport: the outer transport a peer is reachable over, plus the chain of
/// pluggable transports nested inside it.
///
/// The wire form is `[<inner1>[|<inner2>...]|]<outer>`. The last token is the
/// outer transport; the tokens before it, joined with `|`, are the inner chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transport {
    inner: String,
    outer: String,
}

impl Transport {
    pub fn new(inner: impl Into<String>, outer: impl Into<String>) -> Self {
        Self {
            inner: inner.into(),
            outer: outer.into(),
        }
    }

    /// Transport with no inner chain.
    pub fn plain(outer: impl Into<String>) -> Self {
        Self::new(String::new(), outer)
    }

    pub fn inner(&self) -> &str {
        &self.inner
    }

    pub fn outer(&self) -> &str {
        &self.outer
    }

    pub fn has_inner(&self) -> bool {
        !self.inner.is_empty()
    }
}

impl FromStr for Transport {
    type Err = TransportError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        if spec.is_empty() {
            return Err(TransportError::Empty);
        }
        if spec.chars().any(char::is_whitespace) {
            return Err(TransportError::Whitespace(spec.to_string()));
        }
        if spec.split(CHAIN_SEPARATOR).any(str::is_empty) {
            return Err(TransportError::EmptyToken(spec.to_string()));
        }

        match spec.rsplit_once(CHAIN_SEPARATOR) {
            Some((inner, outer)) => Ok(Self::new(inner, outer)),
            None => Ok(Self::plain(spec)),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.is_empty() {
            f.write_str(&self.outer)
        } else {
            write!(f, "{}{}{}", self.inner, CHAIN_SEPARATOR, self.outer)
        }
    }
}

/// A registered address together with its transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: String,
    pub transport: Transport,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>, transport: Transport) -> Self {
        Self {
            addr: addr.into(),
            transport,
        }
    }
}
