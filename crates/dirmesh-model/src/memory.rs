//! In-memory reference implementation of [`DirectoryStore`].
//!
//! Backs every test in the workspace and documents the store contract.
//! Source and target records are held in their encoded blob form so that
//! reads exercise the same decode-and-validate path a database-backed
//! store would.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use uuid::Uuid;

use crate::error::SyncError;
use crate::ids::{BridgeId, ConnId, DsaId, LinkId, NcId, SiteId, TransportId, Usn};
use crate::metadata::{merge_utd, ReplSource, ReplTarget, UtdEntry};
use crate::objects::{
    ConnectionObject, DcDef, LinkBridgeDef, NamingContext, NcKind, SiteDef, SiteLinkDef,
};
use crate::store::{
    AttrMetaEntry, ConnectionPatch, DirectoryStore, ReplicaPresence, RidPoolStatus,
};
use crate::wire::{FsmoRole, PullReply, WorkingSchema};

/// Counters of store mutations, used by tests to assert idempotence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Connection objects created.
    pub connections_created: u64,
    /// Corrective writes applied to connection objects.
    pub connections_updated: u64,
    /// Connection objects deleted.
    pub connections_deleted: u64,
    /// Pull batches committed.
    pub batches_committed: u64,
    /// Failed pull attempts recorded.
    pub failures_recorded: u64,
}

/// Record of one committed pull batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBatch {
    /// Partition the batch belonged to.
    pub nc: NcId,
    /// Source the batch came from.
    pub source: DsaId,
    /// Objects applied.
    pub objects: usize,
    /// Linked values applied.
    pub linked_values: usize,
    /// True if a working schema was threaded through the commit.
    pub schema_threaded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    guid: Uuid,
    deleted_us: u64,
}

#[derive(Default)]
struct Inner {
    sites: BTreeMap<SiteId, SiteDef>,
    dcs: BTreeMap<DsaId, DcDef>,
    links: BTreeMap<LinkId, SiteLinkDef>,
    bridges: BTreeMap<BridgeId, LinkBridgeDef>,
    ncs: BTreeMap<NcId, NamingContext>,
    connections: BTreeMap<ConnId, ConnectionObject>,
    reps_from: HashMap<NcId, Vec<Vec<u8>>>,
    reps_to: HashMap<NcId, Vec<Vec<u8>>>,
    utd: HashMap<NcId, Vec<UtdEntry>>,
    local_usn: HashMap<NcId, Usn>,
    fsmo: HashMap<(NcId, FsmoRole), DsaId>,
    rid: RidPoolStatus,
    attr_meta: HashMap<NcId, Vec<AttrMetaEntry>>,
    tombstones: Vec<Tombstone>,
    committed: Vec<CommittedBatch>,
    stats: StoreStats,
}

/// In-memory directory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_ops: Mutex<HashSet<String>>,
}

fn decode_sources(blobs: &[Vec<u8>]) -> Result<Vec<ReplSource>, SyncError> {
    blobs.iter().map(|b| ReplSource::decode(b)).collect()
}

fn decode_targets(blobs: &[Vec<u8>]) -> Result<Vec<ReplTarget>, SyncError> {
    blobs.iter().map(|b| ReplTarget::decode(b)).collect()
}

fn encode_sources(records: &[ReplSource]) -> Result<Vec<Vec<u8>>, SyncError> {
    records.iter().map(|r| r.encode()).collect()
}

fn encode_targets(records: &[ReplTarget]) -> Result<Vec<Vec<u8>>, SyncError> {
    records.iter().map(|r| r.encode()).collect()
}

fn bump_usn(counter: &mut Usn) -> Result<Usn, SyncError> {
    *counter = counter
        .checked_add(1)
        .ok_or_else(|| SyncError::exhausted("local USN counter wrapped"))?;
    Ok(*counter)
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, SyncError> {
        self.inner
            .read()
            .map_err(|_| SyncError::inconsistent("store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, SyncError> {
        self.inner
            .write()
            .map_err(|_| SyncError::inconsistent("store lock poisoned"))
    }

    fn take_injected(&self, op: &str) -> Result<(), SyncError> {
        let mut g = self
            .fail_ops
            .lock()
            .map_err(|_| SyncError::inconsistent("store lock poisoned"))?;
        if g.remove(op) {
            return Err(SyncError::inconsistent(format!("injected {op} failure")));
        }
        Ok(())
    }

    /// Makes the next call of the named store operation fail.
    pub fn inject_failure(&self, op: &str) {
        if let Ok(mut g) = self.fail_ops.lock() {
            g.insert(op.to_string());
        }
    }

    /// Adds a site definition.
    pub fn add_site(&self, site: SiteDef) -> Result<(), SyncError> {
        self.write()?.sites.insert(site.id, site);
        Ok(())
    }

    /// Adds a server definition.
    pub fn add_dc(&self, dc: DcDef) -> Result<(), SyncError> {
        self.write()?.dcs.insert(dc.guid, dc);
        Ok(())
    }

    /// Adds a site link.
    pub fn add_link(&self, link: SiteLinkDef) -> Result<(), SyncError> {
        self.write()?.links.insert(link.id, link);
        Ok(())
    }

    /// Adds a site link bridge.
    pub fn add_bridge(&self, bridge: LinkBridgeDef) -> Result<(), SyncError> {
        self.write()?.bridges.insert(bridge.id, bridge);
        Ok(())
    }

    /// Adds a naming context.
    pub fn add_nc(&self, nc: NamingContext) -> Result<(), SyncError> {
        self.write()?.ncs.insert(nc.id, nc);
        Ok(())
    }

    /// Sets the owner of an operations master role.
    pub fn set_fsmo_owner(&self, nc: NcId, role: FsmoRole, owner: DsaId) -> Result<(), SyncError> {
        self.write()?.fsmo.insert((nc, role), owner);
        Ok(())
    }

    /// Sets the identifier-pool state.
    pub fn set_rid_pool(&self, status: RidPoolStatus) -> Result<(), SyncError> {
        self.write()?.rid = status;
        Ok(())
    }

    /// Inserts a connection object without counting it as a topology
    /// mutation.
    pub fn seed_connection(&self, conn: ConnectionObject) -> Result<(), SyncError> {
        self.write()?.connections.insert(conn.id, conn);
        Ok(())
    }

    /// Appends an encoded source record for `nc`.
    pub fn seed_source(&self, nc: NcId, record: &ReplSource) -> Result<(), SyncError> {
        let blob = record.encode()?;
        self.write()?.reps_from.entry(nc).or_default().push(blob);
        Ok(())
    }

    /// Appends an encoded notify-target record for `nc`.
    pub fn seed_target(&self, nc: NcId, record: &ReplTarget) -> Result<(), SyncError> {
        let blob = record.encode()?;
        self.write()?.reps_to.entry(nc).or_default().push(blob);
        Ok(())
    }

    /// Appends a raw source blob, bypassing encoding. Lets tests plant
    /// records with unknown version tags or garbage bytes.
    pub fn seed_raw_source_blob(&self, nc: NcId, blob: Vec<u8>) -> Result<(), SyncError> {
        self.write()?.reps_from.entry(nc).or_default().push(blob);
        Ok(())
    }

    /// Simulates local originating writes by advancing the USN counter.
    pub fn advance_local_usn(&self, nc: NcId, delta: Usn) -> Result<Usn, SyncError> {
        let mut g = self.write()?;
        let usn = g.local_usn.entry(nc).or_insert(0);
        *usn += delta;
        Ok(*usn)
    }

    /// Plants a tombstone deleted at `deleted_us`.
    pub fn add_tombstone(&self, guid: Uuid, deleted_us: u64) -> Result<(), SyncError> {
        self.write()?.tombstones.push(Tombstone { guid, deleted_us });
        Ok(())
    }

    /// Snapshot of the mutation counters.
    pub fn stats(&self) -> Result<StoreStats, SyncError> {
        Ok(self.read()?.stats)
    }

    /// All committed pull batches, in commit order.
    pub fn committed(&self) -> Result<Vec<CommittedBatch>, SyncError> {
        Ok(self.read()?.committed.clone())
    }

    /// All connection objects, in id order.
    pub fn connections(&self) -> Result<Vec<ConnectionObject>, SyncError> {
        Ok(self.read()?.connections.values().cloned().collect())
    }

    /// Number of live tombstones.
    pub fn tombstone_count(&self) -> Result<usize, SyncError> {
        Ok(self.read()?.tombstones.len())
    }
}

impl DirectoryStore for MemoryStore {
    fn naming_contexts(&self) -> Result<Vec<NamingContext>, SyncError> {
        self.take_injected("naming_contexts")?;
        Ok(self.read()?.ncs.values().cloned().collect())
    }

    fn naming_context(&self, nc: NcId) -> Result<NamingContext, SyncError> {
        self.read()?
            .ncs
            .get(&nc)
            .cloned()
            .ok_or_else(|| SyncError::not_found("naming context", nc))
    }

    fn sites(&self) -> Result<Vec<SiteDef>, SyncError> {
        self.take_injected("sites")?;
        Ok(self.read()?.sites.values().cloned().collect())
    }

    fn site_links(&self) -> Result<Vec<SiteLinkDef>, SyncError> {
        self.take_injected("site_links")?;
        Ok(self.read()?.links.values().cloned().collect())
    }

    fn link_bridges(&self) -> Result<Vec<LinkBridgeDef>, SyncError> {
        self.take_injected("link_bridges")?;
        Ok(self.read()?.bridges.values().cloned().collect())
    }

    fn dc(&self, guid: DsaId) -> Result<DcDef, SyncError> {
        self.read()?
            .dcs
            .get(&guid)
            .cloned()
            .ok_or_else(|| SyncError::not_found("dc", guid))
    }

    fn replica_presence(&self, site: SiteId, nc: NcId) -> Result<ReplicaPresence, SyncError> {
        let g = self.read()?;
        let kind = g.ncs.get(&nc).map(|n| n.kind);
        let mut presence = ReplicaPresence::Absent;
        for dc in g.dcs.values().filter(|d| d.site == site) {
            if dc.holds_full(nc) {
                return Ok(ReplicaPresence::Full);
            }
            if dc.holds_any(nc) || (dc.is_gc && kind == Some(NcKind::Domain)) {
                presence = ReplicaPresence::Partial;
            }
        }
        Ok(presence)
    }

    fn eligible_bridgeheads(
        &self,
        site: SiteId,
        nc: NcId,
        transport: TransportId,
        need_full: bool,
    ) -> Result<Vec<DcDef>, SyncError> {
        self.take_injected("eligible_bridgeheads")?;
        let g = self.read()?;
        let kind = g.ncs.get(&nc).map(|n| n.kind);
        let eligible = g
            .dcs
            .values()
            .filter(|dc| dc.site == site && dc.transports.contains(&transport))
            .filter(|dc| {
                if need_full {
                    dc.holds_full(nc)
                } else {
                    // Global-catalog servers carry partial replicas of
                    // every domain partition.
                    dc.holds_any(nc) || (dc.is_gc && kind == Some(NcKind::Domain))
                }
            })
            .cloned()
            .collect();
        Ok(eligible)
    }

    fn fsmo_owner(&self, nc: NcId, role: FsmoRole) -> Result<Option<DsaId>, SyncError> {
        Ok(self.read()?.fsmo.get(&(nc, role)).copied())
    }

    fn connections_into_site(&self, site: SiteId) -> Result<Vec<ConnectionObject>, SyncError> {
        let g = self.read()?;
        let conns = g
            .connections
            .values()
            .filter(|c| g.dcs.get(&c.to_dsa).map(|d| d.site) == Some(site))
            .cloned()
            .collect();
        Ok(conns)
    }

    fn create_connection(&self, conn: ConnectionObject) -> Result<(), SyncError> {
        self.take_injected("create_connection")?;
        let mut g = self.write()?;
        debug!(conn = %conn.id, from = %conn.from_dsa, to = %conn.to_dsa, "creating connection");
        g.connections.insert(conn.id, conn);
        g.stats.connections_created += 1;
        Ok(())
    }

    fn update_connection(&self, id: ConnId, patch: ConnectionPatch) -> Result<(), SyncError> {
        use crate::objects::options;
        let mut g = self.write()?;
        let conn = g
            .connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::not_found("connection", id))?;
        let set_bit = |opts: &mut u32, bit: u32, on: bool| {
            if on {
                *opts |= bit;
            } else {
                *opts &= !bit;
            }
        };
        match patch {
            ConnectionPatch::Schedule(s) => conn.schedule = s,
            ConnectionPatch::Notify(on) => set_bit(&mut conn.options, options::NOTIFY, on),
            ConnectionPatch::TwoWay(on) => set_bit(&mut conn.options, options::TWO_WAY, on),
            ConnectionPatch::Compress(on) => set_bit(&mut conn.options, options::COMPRESS, on),
        }
        g.stats.connections_updated += 1;
        Ok(())
    }

    fn delete_connection(&self, id: ConnId) -> Result<(), SyncError> {
        let mut g = self.write()?;
        g.connections
            .remove(&id)
            .ok_or_else(|| SyncError::not_found("connection", id))?;
        debug!(conn = %id, "deleted connection");
        g.stats.connections_deleted += 1;
        Ok(())
    }

    fn reps_from(&self, nc: NcId) -> Result<Vec<ReplSource>, SyncError> {
        self.take_injected("reps_from")?;
        let g = self.read()?;
        decode_sources(g.reps_from.get(&nc).map(Vec::as_slice).unwrap_or(&[]))
    }

    fn write_reps_from(&self, nc: NcId, sources: &[ReplSource]) -> Result<(), SyncError> {
        let blobs = encode_sources(sources)?;
        self.write()?.reps_from.insert(nc, blobs);
        Ok(())
    }

    fn reps_to(&self, nc: NcId) -> Result<Vec<ReplTarget>, SyncError> {
        self.take_injected("reps_to")?;
        let g = self.read()?;
        decode_targets(g.reps_to.get(&nc).map(Vec::as_slice).unwrap_or(&[]))
    }

    fn write_reps_to(&self, nc: NcId, targets: &[ReplTarget]) -> Result<(), SyncError> {
        let blobs = encode_targets(targets)?;
        self.write()?.reps_to.insert(nc, blobs);
        Ok(())
    }

    fn utd_vector(&self, nc: NcId) -> Result<Vec<UtdEntry>, SyncError> {
        Ok(self.read()?.utd.get(&nc).cloned().unwrap_or_default())
    }

    fn local_usn(&self, nc: NcId) -> Result<Usn, SyncError> {
        Ok(self.read()?.local_usn.get(&nc).copied().unwrap_or(0))
    }

    fn commit_batch(
        &self,
        nc: NcId,
        source: DsaId,
        reply: &PullReply,
        schema: Option<&WorkingSchema>,
        now_us: u64,
    ) -> Result<(), SyncError> {
        self.take_injected("commit_batch")?;
        let mut g = self.write()?;

        let blobs = g.reps_from.get(&nc).map(Vec::as_slice).unwrap_or(&[]);
        let mut records = decode_sources(blobs)?;
        let record = records
            .iter_mut()
            .find(|r| r.source_guid == source)
            .ok_or_else(|| SyncError::not_found("source record", source))?;

        record.high_watermark = reply.new_cursor;
        record.consecutive_failures = 0;
        record.last_attempt_us = now_us;
        record.last_success_us = now_us;
        record.last_result = 0;
        let blobs = encode_sources(&records)?;

        // Staged first: the store changes only once every USN
        // allocation in the batch has cleared.
        let mut next_usn = g.local_usn.get(&nc).copied().unwrap_or(0);
        let mut tombstones = Vec::new();
        let mut staged_meta = Vec::new();
        for obj in &reply.objects {
            if obj.is_deleted {
                tombstones.push(Tombstone {
                    guid: obj.guid,
                    deleted_us: now_us,
                });
            }
            for attr in &obj.attrs {
                let local_usn = bump_usn(&mut next_usn)?;
                staged_meta.push(AttrMetaEntry {
                    object: obj.guid,
                    attr_id: attr.attr_id,
                    version: attr.version,
                    originating_invocation: attr.originating_invocation,
                    originating_usn: attr.originating_usn,
                    local_usn,
                });
            }
        }
        for _ in &reply.linked_values {
            bump_usn(&mut next_usn)?;
        }

        g.reps_from.insert(nc, blobs);
        g.local_usn.insert(nc, next_usn);
        g.tombstones.extend(tombstones);
        let meta = g.attr_meta.entry(nc).or_default();
        for entry in staged_meta {
            match meta
                .iter_mut()
                .find(|m| m.object == entry.object && m.attr_id == entry.attr_id)
            {
                Some(existing) if existing.version <= entry.version => *existing = entry,
                Some(_) => {}
                None => meta.push(entry),
            }
        }

        if let Some(vector) = &reply.new_utd {
            let local = g.utd.entry(nc).or_default();
            for entry in vector {
                merge_utd(local, *entry);
            }
        }

        g.committed.push(CommittedBatch {
            nc,
            source,
            objects: reply.objects.len(),
            linked_values: reply.linked_values.len(),
            schema_threaded: schema.is_some(),
        });
        g.stats.batches_committed += 1;
        debug!(
            nc = %nc,
            source = %source,
            objects = reply.objects.len(),
            cursor = reply.new_cursor,
            "committed pull batch"
        );
        Ok(())
    }

    fn record_pull_failure(
        &self,
        nc: NcId,
        source: DsaId,
        result_code: u32,
        now_us: u64,
    ) -> Result<(), SyncError> {
        let mut g = self.write()?;
        let blobs = g.reps_from.get(&nc).map(Vec::as_slice).unwrap_or(&[]);
        let mut records = decode_sources(blobs)?;
        let record = records
            .iter_mut()
            .find(|r| r.source_guid == source)
            .ok_or_else(|| SyncError::not_found("source record", source))?;
        record.consecutive_failures += 1;
        record.last_attempt_us = now_us;
        record.last_result = result_code;
        let blobs = encode_sources(&records)?;
        g.reps_from.insert(nc, blobs);
        g.stats.failures_recorded += 1;
        Ok(())
    }

    fn attribute_metadata(&self, nc: NcId) -> Result<Vec<AttrMetaEntry>, SyncError> {
        Ok(self.read()?.attr_meta.get(&nc).cloned().unwrap_or_default())
    }

    fn rid_pool(&self) -> Result<RidPoolStatus, SyncError> {
        Ok(self.read()?.rid)
    }

    fn remove_expired_tombstones(
        &self,
        retention_us: u64,
        now_us: u64,
    ) -> Result<usize, SyncError> {
        let mut g = self.write()?;
        let before = g.tombstones.len();
        g.tombstones
            .retain(|t| t.deleted_us.saturating_add(retention_us) > now_us);
        Ok(before - g.tombstones.len())
    }
}
