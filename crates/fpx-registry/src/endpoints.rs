//! Endpoint registry for a single address family
//!
//! The registry owns three views that always move together under one lock:
//! the registration table (`address -> transport`), the index
//! (`outer -> inner -> addresses`) and the per-address serve counters.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::registries::AddressFamily;
use crate::transport::{Endpoint, Transport};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct Registration {
    transport: Transport,
    /// Insertion order; breaks ties between equally stale candidates.
    seq: u64,
    serve_count: u32,
    /// Tick of the most recent serve, 0 if never served.
    last_served: u64,
}

#[derive(Debug, Default)]
struct EndpointTable {
    entries: HashMap<String, Registration>,
    index: HashMap<String, HashMap<String, HashSet<String>>>,
    /// Inner chain -> tick of the last match that picked that group.
    group_last_matched: HashMap<String, u64>,
    next_seq: u64,
    tick: u64,
}

impl EndpointTable {
    fn insert(&mut self, addr: String, transport: Transport) -> bool {
        if self.entries.contains_key(&addr) {
            return false;
        }

        self.index
            .entry(transport.outer().to_string())
            .or_default()
            .entry(transport.inner().to_string())
            .or_default()
            .insert(addr.clone());

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            addr,
            Registration {
                transport,
                seq,
                serve_count: 0,
                last_served: 0,
            },
        );
        true
    }

    fn remove(&mut self, addr: &str) -> Option<Registration> {
        let reg = self.entries.remove(addr)?;
        let inner = reg.transport.inner();
        let outer = reg.transport.outer();

        if let Some(by_inner) = self.index.get_mut(outer) {
            if let Some(bucket) = by_inner.get_mut(inner) {
                bucket.remove(addr);
                if bucket.is_empty() {
                    by_inner.remove(inner);
                }
            }
            if by_inner.is_empty() {
                self.index.remove(outer);
            }
        }

        if !self.index.values().any(|by_inner| by_inner.contains_key(inner)) {
            self.group_last_matched.remove(inner);
        }

        Some(reg)
    }

    fn serve<I, S>(&mut self, candidates: I, max_serve: Option<u32>) -> Option<Endpoint>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let chosen = candidates
            .into_iter()
            .filter_map(|addr| self.entries.get_key_value(addr.as_ref()))
            .min_by_key(|(_, reg)| (reg.last_served, reg.seq))
            .map(|(addr, _)| addr.clone())?;

        self.tick += 1;
        let tick = self.tick;
        let reg = self.entries.get_mut(&chosen)?;
        reg.serve_count = reg.serve_count.saturating_add(1);
        reg.last_served = tick;

        let served = reg.serve_count;
        let endpoint = Endpoint::new(chosen, reg.transport.clone());

        if max_serve.is_some_and(|max| served >= max) {
            self.remove(&endpoint.addr);
            debug!(serves = served, remaining = self.entries.len(), "Endpoint exhausted");
        }

        Some(endpoint)
    }

    /// Inner chains reachable through any of `outers`.
    fn inners_for<S: AsRef<str>>(&self, outers: &[S]) -> BTreeSet<String> {
        outers
            .iter()
            .filter_map(|outer| self.index.get(outer.as_ref()))
            .flat_map(|by_inner| {
                by_inner
                    .iter()
                    .filter(|(_, addrs)| !addrs.is_empty())
                    .map(|(inner, _)| inner.clone())
            })
            .collect()
    }

    fn addrs_for<S: AsRef<str>>(&self, inner: &str, outers: &[S]) -> Vec<String> {
        outers
            .iter()
            .filter_map(|outer| self.index.get(outer.as_ref())?.get(inner))
            .flatten()
            .cloned()
            .collect()
    }

    fn group_stamp(&self, inner: &str) -> u64 {
        self.group_last_matched.get(inner).copied().unwrap_or(0)
    }

    fn stamp_group(&mut self, inner: &str) {
        self.tick += 1;
        self.group_last_matched.insert(inner.to_string(), self.tick);
    }
}

/// Thread-safe endpoint registry for one address family.
///
/// All operations are serialized through a single mutex; none of them block or
/// perform I/O while holding it.
#[derive(Debug)]
pub struct Endpoints {
    id: u64,
    family: AddressFamily,
    max_serve: Option<u32>,
    table: Mutex<EndpointTable>,
}

impl Endpoints {
    /// Create an empty registry. A `max_serve` of `None` (or zero) means
    /// endpoints are never exhausted.
    pub fn new(family: AddressFamily, max_serve: Option<u32>) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            family,
            max_serve: max_serve.filter(|&max| max > 0),
            table: Mutex::new(EndpointTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, EndpointTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `addr`. Returns false, leaving the registry untouched, if the
    /// address is already registered.
    pub fn add_endpoint(&self, addr: impl Into<String>, transport: Transport) -> bool {
        let added = self.table().insert(addr.into(), transport);
        trace!(family = %self.family, added, "add_endpoint");
        added
    }

    /// Remove `addr`. Returns whether it was registered.
    pub fn del_endpoint(&self, addr: &str) -> bool {
        self.table().remove(addr).is_some()
    }

    /// Number of registered endpoints that have never been served.
    pub fn num_unserved_endpoints(&self) -> usize {
        self.table()
            .entries
            .values()
            .filter(|reg| reg.serve_count == 0)
            .count()
    }

    /// Hand out the least recently served registered address among
    /// `candidates`, counting the serve against it.
    ///
    /// Returns `None` when none of the candidates is registered, which is an
    /// ordinary outcome once endpoints expire or are exhausted.
    pub fn serve<I, S>(&self, candidates: I) -> Option<Endpoint>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.table().serve(candidates, self.max_serve)
    }

    /// Pair an endpoint of `a` with an endpoint of `b` sharing the same inner
    /// chain, both reachable through one of `outers`.
    ///
    /// The outer transports of the two endpoints may differ. When several
    /// inner chains qualify, the one matched least recently wins. Each side is
    /// then served independently, so exhaustion applies per registry.
    pub fn match_endpoints<S: AsRef<str>>(
        a: &Endpoints,
        b: &Endpoints,
        outers: &[S],
    ) -> Option<(Endpoint, Endpoint)> {
        if a.id == b.id {
            return None;
        }

        // Fixed lock order so concurrent match(a, b) and match(b, a) cannot deadlock.
        let (mut table_a, mut table_b) = if a.id < b.id {
            let table_a = a.table();
            let table_b = b.table();
            (table_a, table_b)
        } else {
            let table_b = b.table();
            let table_a = a.table();
            (table_a, table_b)
        };

        let inners_b = table_b.inners_for(outers);
        let inner = table_a
            .inners_for(outers)
            .into_iter()
            .filter(|inner| inners_b.contains(inner))
            .min_by_key(|inner| table_a.group_stamp(inner))?;

        let addrs_a = table_a.addrs_for(&inner, outers);
        let addrs_b = table_b.addrs_for(&inner, outers);

        table_a.stamp_group(&inner);
        let served_a = table_a.serve(addrs_a, a.max_serve)?;
        let served_b = table_b.serve(addrs_b, b.max_serve)?;

        Some((served_a, served_b))
    }

    /// Transport registered for `addr`, if any.
    pub fn get(&self, addr: &str) -> Option<Transport> {
        self.table().entries.get(addr).map(|reg| reg.transport.clone())
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.table().entries.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered endpoints in registration order.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        let table = self.table();
        let mut entries: Vec<_> = table.entries.iter().collect();
        entries.sort_by_key(|(_, reg)| reg.seq);
        entries
            .into_iter()
            .map(|(addr, reg)| Endpoint::new(addr.clone(), reg.transport.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn indexed(&self, outer: &str, inner: &str) -> BTreeSet<String> {
        self.table()
            .index
            .get(outer)
            .and_then(|by_inner| by_inner.get(inner))
            .map(|addrs| addrs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Panics unless the index is exactly the inverse of the table and every
    /// counter respects the serve limit.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let table = self.table();
        for (addr, reg) in &table.entries {
            let bucket = table
                .index
                .get(reg.transport.outer())
                .and_then(|by_inner| by_inner.get(reg.transport.inner()));
            assert!(bucket.is_some_and(|b| b.contains(addr)), "{addr} missing from index");
            if let Some(max) = self.max_serve {
                assert!(reg.serve_count < max, "{addr} served past its limit");
            }
        }
        for (outer, by_inner) in &table.index {
            for (inner, addrs) in by_inner {
                assert!(!addrs.is_empty(), "empty bucket {outer}/{inner} left behind");
                for addr in addrs {
                    let reg = table.entries.get(addr).expect("indexed address not in table");
                    assert_eq!(reg.transport.outer(), outer);
                    assert_eq!(reg.transport.inner(), inner);
                }
            }
        }
    }
}
