//! In-memory mirror of replication state: partitions, their inbound
//! sources and outbound notify targets, and cached partner sessions.
//!
//! The directory store stays authoritative. Drivers write the store
//! first and the engine mirrors the result here, so lookups during
//! scheduling never touch the database. A partition whose persisted
//! records fail validation keeps its previous mirror until the records
//! are repaired.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use dirmesh_model::ids::{DsaId, NcId, Usn};
use dirmesh_model::metadata::{merge_utd, ReplSource, ReplTarget, UtdEntry};
use dirmesh_model::objects::NamingContext;
use dirmesh_model::store::DirectoryStore;
use dirmesh_model::time::now_us;
use dirmesh_model::transport::{BoundDrs, DrsTransport};
use dirmesh_model::SyncError;

/// A bound session to one remote server, shared by every source that
/// replicates from that host.
pub struct Connection {
    /// Host the session is bound to.
    pub dns: String,
    /// The live session.
    pub session: Arc<dyn BoundDrs>,
    /// When the session was established, microseconds.
    pub established_us: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dns", &self.dns)
            .field("established_us", &self.established_us)
            .finish()
    }
}

/// One inbound replication partner of a partition.
#[derive(Debug)]
pub struct SourceDsa {
    /// Mirror of the persisted source record. The record's watermark
    /// tracks committed batches; mid-cycle progress is read from the
    /// store, which persists the cursor per batch.
    pub record: ReplSource,
    /// Session to the partner, once attached.
    pub connection: Option<Arc<Connection>>,
}

impl SourceDsa {
    fn new(record: ReplSource) -> Self {
        SourceDsa {
            record,
            connection: None,
        }
    }

    /// Partner GUID.
    pub fn guid(&self) -> DsaId {
        self.record.source_guid
    }

    /// Partner host name.
    pub fn dns(&self) -> &str {
        &self.record.source_dns
    }
}

/// One partition this server replicates, with its mirrored state.
#[derive(Debug)]
pub struct Partition {
    /// The naming context.
    pub nc: NamingContext,
    /// Local up-to-dateness vector.
    pub utd: Vec<UtdEntry>,
    /// Inbound partners.
    pub sources: Vec<SourceDsa>,
    /// Outbound notify targets.
    pub notify_targets: Vec<ReplTarget>,
}

/// Counts from a registry load or refresh.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Partitions whose mirror was rebuilt.
    pub refreshed: usize,
    /// Partitions left on their previous mirror because their records
    /// failed to load.
    pub failed: usize,
}

/// The partition and source registry. Callers serialize access; the
/// engine keeps it behind one async lock.
pub struct Registry {
    store: Arc<dyn DirectoryStore>,
    transport: Arc<dyn DrsTransport>,
    partitions: HashMap<NcId, Partition>,
    sessions: HashMap<String, Arc<Connection>>,
}

impl Registry {
    /// An empty registry over the given store and transport.
    pub fn new(store: Arc<dyn DirectoryStore>, transport: Arc<dyn DrsTransport>) -> Self {
        Registry {
            store,
            transport,
            partitions: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Reads the replicated naming contexts and builds a mirror for each.
    /// Called once at startup; partitions whose records fail to load
    /// start with an empty source list and heal on a later refresh.
    pub fn load_partitions(&mut self) -> Result<RefreshSummary, SyncError> {
        let ncs = self.store.naming_contexts()?;
        let mut summary = RefreshSummary::default();
        for nc in ncs {
            let id = nc.id;
            self.partitions.entry(id).or_insert_with(|| Partition {
                nc,
                utd: Vec::new(),
                sources: Vec::new(),
                notify_targets: Vec::new(),
            });
            match self.refresh_partition(id) {
                Ok(()) => summary.refreshed += 1,
                Err(err) => {
                    warn!(nc = %id, error = %err, "partition records failed to load");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Rebuilds one partition's mirror from the store.
    ///
    /// All records are decoded and validated before anything is applied,
    /// so a version mismatch fails the whole refresh and the previous
    /// mirror stays. The attached session carries over for sources that
    /// survive.
    pub fn refresh_partition(&mut self, nc: NcId) -> Result<(), SyncError> {
        let records = self.store.reps_from(nc)?;
        let targets = self.store.reps_to(nc)?;
        let utd = self.store.utd_vector(nc)?;

        let part = self
            .partitions
            .get_mut(&nc)
            .ok_or_else(|| SyncError::not_found("partition", nc))?;

        let mut prior: HashMap<DsaId, SourceDsa> = part
            .sources
            .drain(..)
            .map(|s| (s.record.source_guid, s))
            .collect();
        for record in records {
            let source = match prior.remove(&record.source_guid) {
                Some(mut live) => {
                    live.record = record;
                    live
                }
                None => SourceDsa::new(record),
            };
            part.sources.push(source);
        }
        for (guid, _) in prior {
            debug!(nc = %nc, source = %guid, "source dropped from partition");
        }
        part.notify_targets = targets;
        part.utd = utd;
        Ok(())
    }

    /// Re-reads the naming-context list, registers new partitions, drops
    /// vanished ones, and refreshes every mirror. Failures are per
    /// partition.
    pub fn refresh_all(&mut self) -> Result<RefreshSummary, SyncError> {
        let ncs = self.store.naming_contexts()?;
        let mut summary = RefreshSummary::default();

        let current: Vec<NcId> = ncs.iter().map(|nc| nc.id).collect();
        self.partitions.retain(|id, _| current.contains(id));
        for nc in ncs {
            let id = nc.id;
            self.partitions.entry(id).or_insert_with(|| Partition {
                nc,
                utd: Vec::new(),
                sources: Vec::new(),
                notify_targets: Vec::new(),
            });
            match self.refresh_partition(id) {
                Ok(()) => summary.refreshed += 1,
                Err(err) => {
                    warn!(nc = %id, error = %err, "partition refresh failed, keeping previous mirror");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// The mirror for `nc`, if registered.
    pub fn partition(&self, nc: NcId) -> Option<&Partition> {
        self.partitions.get(&nc)
    }

    /// All registered mirrors.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Finds a source by partner GUID.
    pub fn find_source_by_guid(&self, nc: NcId, guid: DsaId) -> Option<&SourceDsa> {
        self.partitions
            .get(&nc)
            .and_then(|p| p.sources.iter().find(|s| s.record.source_guid == guid))
    }

    /// Finds a source by partner host name.
    pub fn find_source_by_dns(&self, nc: NcId, dns: &str) -> Option<&SourceDsa> {
        self.partitions
            .get(&nc)
            .and_then(|p| p.sources.iter().find(|s| s.record.source_dns == dns))
    }

    /// Binds a session to `dns`, reusing the cached one for the host
    /// unless its transport reports it dead, in which case the stale
    /// session is discarded and a fresh bind happens.
    pub async fn connect(&mut self, dns: &str) -> Result<Arc<Connection>, SyncError> {
        let cached = self.sessions.get(dns).cloned();
        match cached {
            Some(live) if live.session.is_alive() => Ok(live),
            stale => {
                if stale.is_some() {
                    debug!(%dns, "cached session dead, rebinding");
                }
                let session = self.transport.bind(dns).await?;
                let fresh = Arc::new(Connection {
                    dns: dns.to_string(),
                    session,
                    established_us: now_us(),
                });
                self.sessions.insert(dns.to_string(), fresh.clone());
                Ok(fresh)
            }
        }
    }

    /// Attaches a session to the named source and remembers it on the
    /// source's mirror entry.
    pub async fn attach_connection(
        &mut self,
        nc: NcId,
        source: DsaId,
    ) -> Result<Arc<Connection>, SyncError> {
        let dns = self
            .find_source_by_guid(nc, source)
            .map(|s| s.record.source_dns.clone())
            .ok_or_else(|| SyncError::not_found("source", source))?;
        let conn = self.connect(&dns).await?;

        if let Some(part) = self.partitions.get_mut(&nc) {
            if let Some(src) = part
                .sources
                .iter_mut()
                .find(|s| s.record.source_guid == source)
            {
                src.connection = Some(conn.clone());
            }
        }
        Ok(conn)
    }

    /// Mirrors a committed pull: new watermark, clean health, folded
    /// up-to-dateness entries.
    pub fn mirror_success(
        &mut self,
        nc: NcId,
        source: DsaId,
        cursor: Usn,
        utd: Option<&[UtdEntry]>,
        now: u64,
    ) {
        if let Some(part) = self.partitions.get_mut(&nc) {
            if let Some(entries) = utd {
                for &entry in entries {
                    merge_utd(&mut part.utd, entry);
                }
            }
            if let Some(src) = part
                .sources
                .iter_mut()
                .find(|s| s.record.source_guid == source)
            {
                src.record.high_watermark = cursor;
                src.record.consecutive_failures = 0;
                src.record.last_attempt_us = now;
                src.record.last_success_us = now;
                src.record.last_result = 0;
            }
        }
    }

    /// Mirrors a failed pull: bumped failure count, stamped attempt and
    /// result. The watermark stays.
    pub fn mirror_failure(&mut self, nc: NcId, source: DsaId, result_code: u32, now: u64) {
        if let Some(src) = self.partitions.get_mut(&nc).and_then(|p| {
            p.sources
                .iter_mut()
                .find(|s| s.record.source_guid == source)
        }) {
            src.record.consecutive_failures += 1;
            src.record.last_attempt_us = now;
            src.record.last_result = result_code;
        }
    }

    /// Mirrors a delivered notify: the target has acknowledged changes
    /// up to `usn`.
    pub fn mirror_notified(&mut self, nc: NcId, target: DsaId, usn: Usn) {
        if let Some(tgt) = self.partitions.get_mut(&nc).and_then(|p| {
            p.notify_targets
                .iter_mut()
                .find(|t| t.target_guid == target)
        }) {
            if usn > tgt.notified_usn {
                tgt.notified_usn = usn;
            }
        }
    }

    /// Number of cached sessions, one per bound host.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
