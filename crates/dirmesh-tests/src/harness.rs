//! Fixture builders shared by the integration and property suites.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use dirmesh_engine::engine::{EngineConfig, SyncEngine};
use dirmesh_engine::testing::ScriptedTransport;
use dirmesh_model::ids::NcId;
use dirmesh_model::memory::MemoryStore;
use dirmesh_model::objects::{
    options, DcDef, LocalDsa, NamingContext, NcKind, SiteDef, SiteLinkDef,
};
use dirmesh_model::replinfo::ReplInfo;
use dirmesh_model::schedule::Schedule;
use dirmesh_topology::scheduler::{TopologyConfig, TopologyScheduler};

/// Installs a fmt subscriber honoring `RUST_LOG`. Safe to call from
/// every test; the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Uuid from a small number, for readable fixture identities.
pub fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

/// DNS name convention used across the fixtures.
pub fn dns(guid: u128) -> String {
    format!("dc{guid}.example.com")
}

/// Chainable in-memory directory builder.
///
/// Servers replicate every partition declared before them, so declare
/// partitions first. All servers and links use transport `id(100)`.
pub struct DirectoryBuilder {
    store: Arc<MemoryStore>,
    ncs: Vec<NcId>,
}

impl DirectoryBuilder {
    /// An empty directory.
    pub fn new() -> Self {
        DirectoryBuilder {
            store: Arc::new(MemoryStore::new()),
            ncs: Vec::new(),
        }
    }

    /// Declares a writable domain partition.
    pub fn domain(self, n: u128, dn: &str) -> Self {
        self.nc(n, dn, NcKind::Domain, true)
    }

    /// Declares a partition.
    pub fn nc(self, n: u128, dn: &str, kind: NcKind, writable: bool) -> Self {
        self.store
            .add_nc(NamingContext {
                id: id(n),
                dn: dn.into(),
                kind,
                writable,
            })
            .expect("add nc");
        let mut this = self;
        this.ncs.push(id(n));
        this
    }

    /// Declares a site.
    pub fn site(self, n: u128, name: &str) -> Self {
        self.store
            .add_site(SiteDef {
                id: id(n),
                name: name.into(),
            })
            .expect("add site");
        self
    }

    /// A server holding full replicas of every declared partition.
    pub fn full_dc(self, guid: u128, site: u128) -> Self {
        self.dc(guid, site, false, true)
    }

    /// A server holding partial replicas only.
    pub fn partial_dc(self, guid: u128, site: u128) -> Self {
        self.dc(guid, site, false, false)
    }

    /// A global-catalog server with full replicas.
    pub fn gc_dc(self, guid: u128, site: u128) -> Self {
        self.dc(guid, site, true, true)
    }

    fn dc(self, guid: u128, site: u128, is_gc: bool, full: bool) -> Self {
        let (full_ncs, partial_ncs) = if full {
            (self.ncs.clone(), Vec::new())
        } else {
            (Vec::new(), self.ncs.clone())
        };
        self.store
            .add_dc(DcDef {
                guid: id(guid),
                site: id(site),
                dns: dns(guid),
                is_gc,
                transports: vec![id(100)],
                full_ncs,
                partial_ncs,
            })
            .expect("add dc");
        self
    }

    /// A site link with `cost`, a 15 minute interval, change
    /// notification, and a full-week schedule.
    pub fn link(self, n: u128, cost: u32, sites: &[u128]) -> Self {
        self.link_with(
            n,
            ReplInfo::new(cost, 15, options::NOTIFY, Schedule::always()),
            sites,
        )
    }

    /// A site link with explicit replication parameters.
    pub fn link_with(self, n: u128, info: ReplInfo, sites: &[u128]) -> Self {
        self.store
            .add_link(SiteLinkDef {
                id: id(n),
                name: format!("link-{n}"),
                transport: id(100),
                sites: sites.iter().map(|&s| id(s)).collect(),
                info,
            })
            .expect("add link");
        self
    }

    /// The finished directory.
    pub fn build(self) -> Arc<MemoryStore> {
        self.store
    }
}

impl Default for DirectoryBuilder {
    fn default() -> Self {
        DirectoryBuilder::new()
    }
}

/// Local identity for server `guid` in `site`.
pub fn local_dsa(guid: u128, site: u128) -> LocalDsa {
    LocalDsa::new(id(guid), id(site), dns(guid))
}

/// Topology scheduler running as server `guid` in `site`.
pub fn scheduler_at(store: &Arc<MemoryStore>, guid: u128, site: u128) -> TopologyScheduler {
    TopologyScheduler::new(store.clone(), TopologyConfig::new(id(site), id(guid)))
}

/// Replication engine running as server `guid` in `site` over a
/// scripted transport, with the default configuration.
pub fn engine_at(
    store: &Arc<MemoryStore>,
    transport: &Arc<ScriptedTransport>,
    guid: u128,
    site: u128,
) -> Arc<SyncEngine> {
    SyncEngine::new(
        store.clone(),
        transport.clone(),
        local_dsa(guid, site),
        EngineConfig::default(),
    )
}
