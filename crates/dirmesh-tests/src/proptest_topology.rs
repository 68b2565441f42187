//! Random flat site graphs: whatever the layout, topology generation
//! must stay idempotent, local-only and rebuildable.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use dirmesh_model::ids::DsaId;
use dirmesh_model::memory::MemoryStore;
use dirmesh_model::store::DirectoryStore;

use crate::harness::{self, id, DirectoryBuilder};

/// Site count plus one optional cost per unordered site pair.
fn flat_graphs() -> impl Strategy<Value = (usize, Vec<Option<u32>>)> {
    (2usize..=5).prop_flat_map(|n| {
        let pairs = n * (n - 1) / 2;
        (Just(n), prop::collection::vec(prop::option::of(1u32..100), pairs))
    })
}

/// One full-replica server per site; site `i` gets server `i + 1`.
fn build_directory(sites: usize, costs: &[Option<u32>]) -> Arc<MemoryStore> {
    let mut builder = DirectoryBuilder::new().domain(20, "dc=corp");
    for i in 0..sites {
        builder = builder
            .site(10 + i as u128, &format!("site-{i}"))
            .full_dc(1 + i as u128, 10 + i as u128);
    }
    let mut pair = 0;
    for a in 0..sites {
        for b in (a + 1)..sites {
            if let Some(cost) = costs[pair] {
                builder = builder.link(1000 + pair as u128, cost, &[10 + a as u128, 10 + b as u128]);
            }
            pair += 1;
        }
    }
    builder.build()
}

fn connection_pairs(store: &MemoryStore) -> BTreeSet<(DsaId, DsaId)> {
    store
        .connections()
        .expect("connections")
        .iter()
        .map(|c| (c.from_dsa, c.to_dsa))
        .collect()
}

proptest! {
    #[test]
    fn prop_periods_are_idempotent((sites, costs) in flat_graphs()) {
        harness::init_tracing();
        let store = build_directory(sites, &costs);
        let sched = harness::scheduler_at(&store, 1, 10);

        sched.run_period().unwrap();
        let first = connection_pairs(&store);
        let created = store.stats().unwrap().connections_created;

        sched.run_period().unwrap();
        prop_assert_eq!(connection_pairs(&store), first);
        prop_assert_eq!(store.stats().unwrap().connections_created, created);
    }

    #[test]
    fn prop_connections_point_into_the_local_server((sites, costs) in flat_graphs()) {
        harness::init_tracing();
        let store = build_directory(sites, &costs);
        harness::scheduler_at(&store, 1, 10).run_period().unwrap();

        for (from, to) in connection_pairs(&store) {
            prop_assert_eq!(to, id(1));
            prop_assert_ne!(from, id(1));
        }
    }

    #[test]
    fn prop_rebuild_from_scratch_matches((sites, costs) in flat_graphs()) {
        harness::init_tracing();
        let store = build_directory(sites, &costs);
        let sched = harness::scheduler_at(&store, 1, 10);
        sched.run_period().unwrap();
        let first = connection_pairs(&store);

        for conn in store.connections().unwrap() {
            store.delete_connection(conn.id).unwrap();
        }
        sched.run_period().unwrap();
        prop_assert_eq!(connection_pairs(&store), first);
    }
}
