//! Relay file loading
//!
//! One relay per line: `<transport> <host:port>` or `<transport> [<ipv6>]:<port>`.
//! Blank lines and `#` comments are skipped. Relays never carry an inner chain.

use std::collections::HashMap;
use std::io::BufRead;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::{info, warn};

use crate::registries::{canonical, AddressFamily, Registries};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum RelayFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected `<transport> <address>`")]
    Format { line: usize },
    #[error("line {line}: invalid relay address {addr:?}")]
    Address { line: usize, addr: String },
    #[error("line {line}: {source}")]
    Transport {
        line: usize,
        #[source]
        source: TransportError,
    },
    #[error("line {line}: relay transport {spec:?} must not have an inner chain")]
    InnerChain { line: usize, spec: String },
}

/// A parsed relay file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub addr: SocketAddr,
    pub transport: Transport,
}

/// Result of diffing a relay file against the live registries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
}

pub fn parse_relay_file(reader: impl BufRead) -> Result<Vec<RelayEntry>, RelayFileError> {
    let mut entries = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        let content = line.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }

        let mut words = content.split_whitespace();
        let (Some(spec), Some(addr), None) = (words.next(), words.next(), words.next()) else {
            return Err(RelayFileError::Format { line: line_no });
        };

        let transport: Transport = spec
            .parse()
            .map_err(|source| RelayFileError::Transport { line: line_no, source })?;
        if transport.has_inner() {
            return Err(RelayFileError::InnerChain {
                line: line_no,
                spec: spec.to_string(),
            });
        }

        let addr: SocketAddr = addr.parse().map_err(|_| RelayFileError::Address {
            line: line_no,
            addr: addr.to_string(),
        })?;

        entries.push(RelayEntry {
            addr: canonical(&addr),
            transport,
        });
    }

    Ok(entries)
}

/// Register every relay in `reader` into the registry of its address family.
/// Returns how many relays were newly registered; repeated addresses keep
/// their first transport.
pub fn load_relay_file(registries: &Registries, reader: impl BufRead) -> Result<usize, RelayFileError> {
    let entries = parse_relay_file(reader)?;
    let mut added = 0;

    for entry in entries {
        if registries
            .for_addr(&entry.addr)
            .add_endpoint(entry.addr.to_string(), entry.transport)
        {
            added += 1;
        } else {
            warn!(relay = %entry.addr, "Duplicate relay in relay file, keeping first entry");
        }
    }

    info!(relays = added, "Loaded relay file");
    Ok(added)
}

/// Bring the registries in line with `reader`: relays no longer listed are
/// removed, new ones are added and ones whose transport changed are replaced.
///
/// The file is parsed in full before anything is touched, so a malformed file
/// leaves the registries as they were.
pub fn reload_relay_file(registries: &Registries, reader: impl BufRead) -> Result<ReloadSummary, RelayFileError> {
    let entries = parse_relay_file(reader)?;
    let mut summary = ReloadSummary::default();

    for family in AddressFamily::ALL {
        let endpoints = registries.get(family);

        let mut wanted: HashMap<String, Transport> = HashMap::new();
        for entry in entries.iter().filter(|e| AddressFamily::of(&e.addr) == family) {
            wanted
                .entry(entry.addr.to_string())
                .or_insert_with(|| entry.transport.clone());
        }

        for live in endpoints.snapshot() {
            if wanted.get(&live.addr) != Some(&live.transport) && endpoints.del_endpoint(&live.addr) {
                summary.removed += 1;
            }
        }

        for (addr, transport) in wanted {
            if endpoints.add_endpoint(addr, transport) {
                summary.added += 1;
            }
        }
    }

    if summary != ReloadSummary::default() {
        info!(added = summary.added, removed = summary.removed, "Reloaded relay file");
    }
    Ok(summary)
}
