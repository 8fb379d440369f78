//! Address families and the per-family registry pair

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::endpoints::Endpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// Family of `ip`; IPv4-mapped IPv6 addresses count as IPv4.
    pub fn of_ip(ip: &IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn of(addr: &SocketAddr) -> Self {
        Self::of_ip(&addr.ip())
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("IPv4"),
            AddressFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// `addr` with an IPv4-mapped IPv6 address rewritten as plain IPv4, so each
/// endpoint has one spelling and that spelling matches its family.
pub fn canonical(addr: &SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// One registry per address family, sharing a serve limit. Registries of
/// different families never see each other's endpoints.
#[derive(Debug)]
pub struct Registries {
    v4: Endpoints,
    v6: Endpoints,
}

impl Registries {
    pub fn new(max_serve: Option<u32>) -> Self {
        Self {
            v4: Endpoints::new(AddressFamily::V4, max_serve),
            v6: Endpoints::new(AddressFamily::V6, max_serve),
        }
    }

    pub fn get(&self, family: AddressFamily) -> &Endpoints {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// Registry for the family of `addr`.
    pub fn for_addr(&self, addr: &SocketAddr) -> &Endpoints {
        self.get(AddressFamily::of(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoints> {
        [&self.v4, &self.v6].into_iter()
    }

    /// Total registrations across both families.
    pub fn len(&self) -> usize {
        self.iter().map(Endpoints::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_unserved_endpoints(&self) -> usize {
        self.iter().map(Endpoints::num_unserved_endpoints).sum()
    }
}
