//! fpx-facilitator: rendezvous facilitator
//!
//! Clients register themselves with `PUTREG`; proxies poll with `GETREG` and
//! receive a client paired with a relay that speaks the same inner transport
//! chain. Every connection is wrapped in a guard that bounds how long a peer may
//! take and how much it may buffer.

pub mod addr;
pub mod config;
pub mod connection;
pub mod facilitator;
pub mod guard;
pub mod metrics;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod protocol_props;

pub use config::ServerConfig;
pub use facilitator::Facilitator;
pub use server::FacilitatorServer;
