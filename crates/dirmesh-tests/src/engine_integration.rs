//! Engine scenarios over the scripted transport: cursor movement,
//! health counters and notify fan-out across whole periods.

use std::sync::Arc;

use bytes::Bytes;

use dirmesh_engine::testing::ScriptedTransport;
use dirmesh_model::memory::MemoryStore;
use dirmesh_model::metadata::{ReplSource, ReplTarget};
use dirmesh_model::objects::options;
use dirmesh_model::schedule::Schedule;
use dirmesh_model::store::DirectoryStore;
use dirmesh_model::wire::{PullReply, RefsRequest, ReplAttr, ReplObject, DRS_OK};
use dirmesh_model::SyncError;

use crate::harness::{self, id, DirectoryBuilder};

fn two_site_directory() -> Arc<MemoryStore> {
    DirectoryBuilder::new()
        .domain(20, "dc=corp")
        .site(10, "hq")
        .site(11, "branch")
        .full_dc(1, 10)
        .full_dc(2, 11)
        .link(1000, 10, &[10, 11])
        .build()
}

/// A source record outside any polling window, so only forced syncs
/// reach it.
fn quiet_source() -> ReplSource {
    ReplSource::new(id(1), "dc1.example.com", id(100), 0, Schedule::never())
}

#[tokio::test]
async fn each_server_pulls_from_the_other() {
    harness::init_tracing();
    let transport = Arc::new(ScriptedTransport::new());
    let mut stores = Vec::new();
    let mut engines = Vec::new();
    // One store per server: each holds its own copy of the directory.
    for (dsa, site) in [(1, 10), (2, 11)] {
        let store = two_site_directory();
        let engine = harness::engine_at(&store, &transport, dsa, site);
        engine.init().await.unwrap();
        stores.push(store);
        engines.push(engine);
    }

    for engine in &engines {
        engine.run_topology_period().await;
    }

    assert_eq!(stores[0].connections().unwrap().len(), 1);
    assert_eq!(stores[1].connections().unwrap().len(), 1);
    assert_eq!(stores[0].reps_from(id(20)).unwrap()[0].source_guid, id(2));
    assert_eq!(stores[1].reps_from(id(20)).unwrap()[0].source_guid, id(1));
    assert_eq!(transport.session("dc1.example.com").pull_requests().len(), 1);
    assert_eq!(transport.session("dc2.example.com").pull_requests().len(), 1);
}

#[tokio::test]
async fn five_failures_then_one_success_clears_the_health_counter() {
    harness::init_tracing();
    let store = two_site_directory();
    let mut source = quiet_source();
    source.consecutive_failures = 5;
    source.last_result = 5;
    store.seed_source(id(20), &source).unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let engine = harness::engine_at(&store, &transport, 2, 11);
    engine.init().await.unwrap();

    engine.replica_sync(id(20), id(1), 0).await.unwrap();
    engine.run_pending().await;

    let record = &store.reps_from(id(20)).unwrap()[0];
    assert_eq!(record.consecutive_failures, 0);
    assert!(record.last_success_us > 0);
    assert_eq!(record.last_result, 0);
}

#[tokio::test]
async fn a_failed_pull_leaves_the_cursor_in_place() {
    harness::init_tracing();
    let store = two_site_directory();
    let mut source = quiet_source();
    source.high_watermark = 777;
    store.seed_source(id(20), &source).unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let session = transport.session("dc1.example.com");
    session.queue_error(SyncError::remote("dc1.example.com", "partner rebooting"));
    let engine = harness::engine_at(&store, &transport, 2, 11);
    engine.init().await.unwrap();

    engine.replica_sync(id(20), id(1), 0).await.unwrap();
    engine.run_pending().await;

    let record = &store.reps_from(id(20)).unwrap()[0];
    assert_eq!(record.high_watermark, 777);
    assert_eq!(record.consecutive_failures, 1);
    assert_ne!(record.last_result, 0);
    assert_eq!(engine.stats().await.source(id(20), id(1)).pulls_failed, 1);
}

#[tokio::test]
async fn periods_resume_from_the_advanced_cursor() {
    harness::init_tracing();
    let store = two_site_directory();
    let transport = Arc::new(ScriptedTransport::new());
    let session = transport.session("dc1.example.com");
    session.queue_reply(PullReply {
        objects: vec![ReplObject {
            guid: id(7),
            dn: "cn=obj7".into(),
            class_id: 1,
            is_deleted: false,
            attrs: vec![ReplAttr {
                attr_id: 42,
                version: 1,
                originating_invocation: id(50),
                originating_usn: 40,
                values: vec![Bytes::from_static(b"v")],
            }],
        }],
        linked_values: vec![],
        new_cursor: 40,
        new_utd: None,
        more_data: false,
        remote_status: DRS_OK,
    });
    let engine = harness::engine_at(&store, &transport, 2, 11);
    engine.init().await.unwrap();

    engine.run_topology_period().await;
    engine.run_topology_period().await;

    let requests = session.pull_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].cursor, 0);
    assert_eq!(requests[1].cursor, 40);
    assert_eq!(store.attribute_metadata(id(20)).unwrap().len(), 1);
}

#[tokio::test]
async fn local_changes_coalesce_into_one_notify() {
    harness::init_tracing();
    let store = two_site_directory();
    store
        .seed_target(
            id(20),
            &ReplTarget::new(id(3), "dc3.example.com", options::NOTIFY),
        )
        .unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let session = transport.session("dc3.example.com");
    let engine = harness::engine_at(&store, &transport, 2, 11);
    engine.init().await.unwrap();

    store.advance_local_usn(id(20), 50).unwrap();
    engine.on_local_change(id(20), false).await.unwrap();
    store.advance_local_usn(id(20), 30).unwrap();
    engine.on_local_change(id(20), false).await.unwrap();
    engine.run_pending().await;

    assert_eq!(session.sync_requests().len(), 1);
    assert_eq!(store.reps_to(id(20)).unwrap()[0].notified_usn, 80);
}

#[tokio::test]
async fn a_new_partner_reference_receives_future_notifies() {
    harness::init_tracing();
    let store = two_site_directory();
    let transport = Arc::new(ScriptedTransport::new());
    let session = transport.session("dc9.example.com");
    let engine = harness::engine_at(&store, &transport, 2, 11);
    engine.init().await.unwrap();

    engine
        .apply_update_refs(&RefsRequest {
            nc: id(20),
            dest_guid: id(9),
            dest_dns: "dc9.example.com".into(),
            options: options::REF_ADD | options::NOTIFY,
        })
        .await
        .unwrap();
    store.advance_local_usn(id(20), 5).unwrap();
    engine.on_local_change(id(20), false).await.unwrap();
    engine.run_pending().await;

    let requests = session.sync_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].nc, id(20));
    assert_eq!(requests[0].source_guid, id(2));
    assert_eq!(store.reps_to(id(20)).unwrap()[0].notified_usn, 5);
}
