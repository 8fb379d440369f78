//! Address parsing and log scrubbing

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("invalid address {0:?}")]
    Invalid(String),
    #[error("address {0:?} has no port")]
    MissingPort(String),
}

/// Parse a numeric `host:port` or `[ipv6]:port` address. Host names are not
/// resolved. When `default_port` is given the port may be omitted.
pub fn parse_addr_spec(spec: &str, default_port: Option<u16>) -> Result<SocketAddr, AddrError> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let host = spec
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(spec);
    let ip: IpAddr = host.parse().map_err(|_| AddrError::Invalid(spec.to_string()))?;

    match default_port {
        Some(port) => Ok(SocketAddr::new(ip, port)),
        None => Err(AddrError::MissingPort(spec.to_string())),
    }
}

/// Display wrapper that hides peer addresses in logs unless unsafe logging is
/// enabled.
pub struct Scrubbed<'a, T: fmt::Display + ?Sized> {
    value: &'a T,
    reveal: bool,
}

impl<T: fmt::Display + ?Sized> fmt::Display for Scrubbed<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reveal {
            fmt::Display::fmt(self.value, f)
        } else {
            f.write_str("[scrubbed]")
        }
    }
}

pub fn scrub<T: fmt::Display + ?Sized>(value: &T, unsafe_logging: bool) -> Scrubbed<'_, T> {
    Scrubbed {
        value,
        reveal: unsafe_logging,
    }
}
