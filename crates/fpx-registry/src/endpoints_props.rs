use proptest::prelude::*;
use std::collections::HashSet;

use crate::endpoints::Endpoints;
use crate::registries::AddressFamily;
use crate::transport::Transport;

#[derive(Debug, Clone)]
enum Op {
    Add(usize, Transport),
    Del(usize),
    Serve(Vec<usize>),
}

const LABELS: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

fn transport_strategy() -> impl Strategy<Value = Transport> {
    (prop::sample::select(vec!["", "a", "a|b"]), prop::sample::select(vec!["p", "q"]))
        .prop_map(|(inner, outer)| Transport::new(inner, outer))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..LABELS.len(), transport_strategy()).prop_map(|(i, t)| Op::Add(i, t)),
        (0..LABELS.len()).prop_map(Op::Del),
        prop::collection::vec(0..LABELS.len(), 0..LABELS.len()).prop_map(Op::Serve),
    ]
}

proptest! {
    // Index stays the exact inverse of the table, and counters stay under the
    // serve limit, whatever sequence of operations is applied.
    #[test]
    fn test_index_tracks_table(
        max_serve in prop::option::of(1u32..4),
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let pts = Endpoints::new(AddressFamily::V4, max_serve);

        for op in ops {
            match op {
                Op::Add(i, transport) => {
                    let existed = pts.get(LABELS[i]);
                    let added = pts.add_endpoint(LABELS[i], transport.clone());
                    prop_assert_eq!(added, existed.is_none());
                    if let Some(original) = existed {
                        prop_assert_eq!(pts.get(LABELS[i]), Some(original));
                    } else {
                        prop_assert!(pts.indexed(transport.outer(), transport.inner()).contains(LABELS[i]));
                    }
                }
                Op::Del(i) => {
                    let existed = pts.get(LABELS[i]);
                    prop_assert_eq!(pts.del_endpoint(LABELS[i]), existed.is_some());
                    if let Some(transport) = existed {
                        prop_assert!(!pts.indexed(transport.outer(), transport.inner()).contains(LABELS[i]));
                    }
                }
                Op::Serve(candidates) => {
                    let labels: Vec<&str> = candidates.iter().map(|&i| LABELS[i]).collect();
                    let any_registered = labels.iter().any(|l| pts.contains(l));
                    match pts.serve(&labels) {
                        Some(endpoint) => prop_assert!(labels.contains(&endpoint.addr.as_str())),
                        None => prop_assert!(!any_registered),
                    }
                }
            }
            pts.assert_consistent();
        }
    }

    // A pool of n endpoints with limit k yields exactly n * k serves.
    #[test]
    fn test_exhaustion_budget(n in 1usize..6, k in 1u32..5) {
        let pts = Endpoints::new(AddressFamily::V4, Some(k));
        let labels = &LABELS[..n];
        for label in labels {
            pts.add_endpoint(*label, Transport::plain("p"));
        }

        for _ in 0..(n * k as usize) {
            prop_assert!(pts.serve(labels).is_some());
        }
        prop_assert!(pts.serve(labels).is_none());
        prop_assert!(pts.is_empty());
        prop_assert!(pts.indexed("p", "").is_empty());
    }

    // Any k consecutive serves over a fixed k-member pool hit every member once,
    // even when a prefix of serves went to a subset of the pool.
    #[test]
    fn test_round_robin_windows(
        n in 1usize..6,
        warmup in prop::collection::vec(0..6usize, 0..10),
        windows in 1usize..5,
    ) {
        let pts = Endpoints::new(AddressFamily::V6, None);
        let labels = &LABELS[..n];
        for label in labels {
            pts.add_endpoint(*label, Transport::plain("p"));
        }
        for i in warmup {
            pts.serve([LABELS[i % n]]);
        }

        for _ in 0..windows {
            let mut seen = HashSet::new();
            for _ in 0..n {
                let endpoint = pts.serve(labels.iter().rev());
                prop_assert!(endpoint.is_some());
                seen.insert(endpoint.unwrap().addr);
            }
            prop_assert_eq!(seen.len(), n);
        }
    }
}
