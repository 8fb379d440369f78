//! fpx-registry: endpoint registry and matching engine
//!
//! Clients, proxies and relays register short-lived endpoints tagged with a
//! transport. The registry hands them out fairly, retires them once they have
//! been served often enough, and pairs compatible endpoints across two
//! registries.

pub mod endpoints;
pub mod registries;
pub mod relay_file;
pub mod transport;

#[cfg(test)]
mod endpoints_props;

pub use endpoints::Endpoints;
pub use registries::{canonical, AddressFamily, Registries};
pub use relay_file::{load_relay_file, parse_relay_file, reload_relay_file, RelayEntry, RelayFileError, ReloadSummary};
pub use transport::{Endpoint, Transport, TransportError};
