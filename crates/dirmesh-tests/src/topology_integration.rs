//! Topology periods over builder-assembled directories: site layouts
//! in, connection objects and source records out.

use std::collections::HashSet;
use std::sync::Arc;

use dirmesh_model::ids::DsaId;
use dirmesh_model::objects::NcKind;
use dirmesh_model::store::DirectoryStore;
use dirmesh_topology::bridgehead::StaleLinkList;
use dirmesh_topology::scheduler::{TopologyConfig, TopologyScheduler};

use crate::harness::{self, id, DirectoryBuilder};

#[test]
fn one_link_yields_one_inbound_connection() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .full_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build();

    let summary = harness::scheduler_at(&store, 2, 11).run_period().unwrap();

    assert_eq!(summary.passes.len(), 1);
    assert!(summary.passes[0].connected);
    assert!(summary.swept);
    let conns = store.connections().unwrap();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].from_dsa, id(1));
    assert_eq!(conns[0].to_dsa, id(2));
    assert!(conns[0].generated);
    let sources = store.reps_from(id(20)).unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].source_dns, "dc1.example.com");
}

#[test]
fn reruns_change_nothing() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .full_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build();
    let sched = harness::scheduler_at(&store, 2, 11);

    sched.run_period().unwrap();
    let before = store.stats().unwrap();
    let second = sched.run_period().unwrap();

    assert_eq!(second.passes[0].stats.created, 0);
    assert_eq!(second.passes[0].stats.kept, 1);
    assert_eq!(second.removed, 0);
    assert_eq!(store.stats().unwrap(), before);
    assert_eq!(store.connections().unwrap().len(), 1);
}

#[test]
fn a_partial_site_is_fed_from_the_full_replica() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .partial_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build();

    let summary = harness::scheduler_at(&store, 2, 11).run_period().unwrap();

    assert!(summary.passes[0].connected);
    let conns = store.connections().unwrap();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].from_dsa, id(1));
    assert_eq!(conns[0].to_dsa, id(2));
    assert_eq!(store.reps_from(id(20)).unwrap().len(), 1);
}

#[test]
fn a_triangle_leaves_the_dearest_link_unused() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "east")
        .site(11, "hub")
        .site(12, "west")
        .full_dc(1, 10)
        .full_dc(2, 11)
        .full_dc(3, 12)
        .link(1000, 10, &[10, 11])
        .link(1001, 20, &[11, 12])
        .link(1002, 30, &[10, 12])
        .build();

    // Every server generates its own inbound edges.
    for (dsa, site) in [(1, 10), (2, 11), (3, 12)] {
        let summary = harness::scheduler_at(&store, dsa, site).run_period().unwrap();
        assert!(summary.passes[0].connected);
    }

    let conns = store.connections().unwrap();
    assert_eq!(conns.len(), 4);
    let pairs: HashSet<(DsaId, DsaId)> = conns.iter().map(|c| (c.from_dsa, c.to_dsa)).collect();
    assert!(pairs.contains(&(id(1), id(2))));
    assert!(pairs.contains(&(id(2), id(1))));
    assert!(pairs.contains(&(id(2), id(3))));
    assert!(pairs.contains(&(id(3), id(2))));
    // The cost-30 link between east and west carries nothing.
    assert!(!pairs.contains(&(id(1), id(3))));
    assert!(!pairs.contains(&(id(3), id(1))));
}

#[test]
fn unlinked_sites_are_reported_disconnected() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "island")
        .full_dc(1, 10)
        .full_dc(2, 11)
        .build();

    let summary = harness::scheduler_at(&store, 2, 11).run_period().unwrap();

    let pass = &summary.passes[0];
    assert!(!pass.connected);
    assert_eq!(pass.component_count, 2);
    assert!(store.connections().unwrap().is_empty());
}

#[test]
fn a_failed_bridgehead_hands_over_to_the_survivor() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .full_dc(4, 10)
        .full_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build();
    let detector = StaleLinkList::new();
    detector.mark_failed(id(1));
    let sched = TopologyScheduler::with_detector(
        store.clone(),
        TopologyConfig::new(id(11), id(2)),
        Arc::new(detector),
    );

    let summary = sched.run_period().unwrap();

    let pass = &summary.passes[0];
    assert!(pass.connected);
    assert!(!pass.retried_relaxed);
    let conns = store.connections().unwrap();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].from_dsa, id(4));
}

#[test]
fn losing_every_bridgehead_relaxes_detection() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .full_dc(4, 10)
        .full_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build();
    let detector = StaleLinkList::new();
    detector.mark_failed(id(1));
    detector.mark_failed(id(4));
    let sched = TopologyScheduler::with_detector(
        store.clone(),
        TopologyConfig::new(id(11), id(2)),
        Arc::new(detector),
    );

    let summary = sched.run_period().unwrap();

    let pass = &summary.passes[0];
    assert!(pass.retried_relaxed);
    assert!(pass.connected);
    let conns = store.connections().unwrap();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].from_dsa, id(1));
}

#[test]
fn two_partitions_share_one_connection() {
    harness::init_tracing();
    let store = DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .nc(21, "cn=config", NcKind::Config, true)
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .full_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build();

    let summary = harness::scheduler_at(&store, 2, 11).run_period().unwrap();

    assert_eq!(summary.passes.len(), 2);
    assert_eq!(store.connections().unwrap().len(), 1);
    assert_eq!(store.stats().unwrap().connections_created, 1);
    for nc in [20, 21] {
        let sources = store.reps_from(id(nc)).unwrap();
        assert_eq!(sources.len(), 1, "nc {nc}");
        assert_eq!(sources[0].source_guid, id(1));
    }
}
