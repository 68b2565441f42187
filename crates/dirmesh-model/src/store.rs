//! The directory-store surface consumed by the control plane.
//!
//! Topology passes read configuration and write connection objects;
//! protocol drivers commit change batches and update health counters.
//! Everything behind this trait is a local database call.

use crate::error::SyncError;
use crate::ids::{ConnId, DsaId, NcId, SiteId, TransportId, Usn};
use crate::metadata::{ReplSource, ReplTarget, UtdEntry};
use crate::objects::{ConnectionObject, DcDef, LinkBridgeDef, NamingContext, SiteDef, SiteLinkDef};
use crate::schedule::Schedule;
use crate::wire::{FsmoRole, PullReply, WorkingSchema};

/// Whether a site holds a replica of a naming context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPresence {
    /// Some server in the site holds (or should hold) a full replica.
    Full,
    /// Only partial replicas are present.
    Partial,
    /// No server in the site replicates the partition.
    Absent,
}

/// One corrective write to an existing connection object. Each patch is
/// idempotent; the topology pass only issues patches for fields that
/// actually differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPatch {
    /// Replace the polling schedule.
    Schedule(Schedule),
    /// Set or clear change notification.
    Notify(bool),
    /// Set or clear two-way replication.
    TwoWay(bool),
    /// Set or clear traffic compression.
    Compress(bool),
}

/// State of the local relative-identifier pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RidPoolStatus {
    /// Identifiers left in the local pool.
    pub remaining: u64,
    /// Request a new pool once `remaining` drops below this.
    pub threshold: u64,
}

impl RidPoolStatus {
    /// True if a pool allocation should be requested.
    pub fn needs_allocation(&self) -> bool {
        self.remaining < self.threshold
    }
}

impl Default for RidPoolStatus {
    fn default() -> Self {
        RidPoolStatus {
            remaining: u64::MAX,
            threshold: 0,
        }
    }
}

/// Per-attribute replication metadata of one committed object, exposed
/// for the introspection surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrMetaEntry {
    /// Object the attribute belongs to.
    pub object: uuid::Uuid,
    /// Attribute identifier.
    pub attr_id: u32,
    /// Per-attribute version.
    pub version: u32,
    /// Originating epoch of the newest write.
    pub originating_invocation: uuid::Uuid,
    /// Originating USN of the newest write.
    pub originating_usn: Usn,
    /// Local USN assigned when the write was applied here.
    pub local_usn: Usn,
}

/// Local directory database operations used by topology computation and
/// replication. Implementations must be safe to call from several tasks.
pub trait DirectoryStore: Send + Sync {
    /// All naming contexts this server replicates.
    fn naming_contexts(&self) -> Result<Vec<NamingContext>, SyncError>;

    /// One naming context by id.
    fn naming_context(&self, nc: NcId) -> Result<NamingContext, SyncError>;

    /// All sites in the directory.
    fn sites(&self) -> Result<Vec<SiteDef>, SyncError>;

    /// All site links.
    fn site_links(&self) -> Result<Vec<SiteLinkDef>, SyncError>;

    /// All site link bridges.
    fn link_bridges(&self) -> Result<Vec<LinkBridgeDef>, SyncError>;

    /// One server by GUID.
    fn dc(&self, guid: DsaId) -> Result<DcDef, SyncError>;

    /// Whether `site` holds a replica of `nc`.
    fn replica_presence(&self, site: SiteId, nc: NcId) -> Result<ReplicaPresence, SyncError>;

    /// Servers in `site` able to act as a bridgehead for `nc` over
    /// `transport`. With `need_full`, only servers carrying a full
    /// replica qualify. Order is unspecified; callers rank candidates.
    fn eligible_bridgeheads(
        &self,
        site: SiteId,
        nc: NcId,
        transport: TransportId,
        need_full: bool,
    ) -> Result<Vec<DcDef>, SyncError>;

    /// The server owning `role` for `nc`, if any.
    fn fsmo_owner(&self, nc: NcId, role: FsmoRole) -> Result<Option<DsaId>, SyncError>;

    /// Connection objects whose destination server lives in `site`.
    fn connections_into_site(&self, site: SiteId) -> Result<Vec<ConnectionObject>, SyncError>;

    /// Persists a new connection object.
    fn create_connection(&self, conn: ConnectionObject) -> Result<(), SyncError>;

    /// Applies one corrective write to a connection object.
    fn update_connection(&self, id: ConnId, patch: ConnectionPatch) -> Result<(), SyncError>;

    /// Deletes a connection object.
    fn delete_connection(&self, id: ConnId) -> Result<(), SyncError>;

    /// Decoded inbound source records for `nc`.
    fn reps_from(&self, nc: NcId) -> Result<Vec<ReplSource>, SyncError>;

    /// Replaces the inbound source records for `nc`.
    fn write_reps_from(&self, nc: NcId, sources: &[ReplSource]) -> Result<(), SyncError>;

    /// Decoded outbound notify-target records for `nc`.
    fn reps_to(&self, nc: NcId) -> Result<Vec<ReplTarget>, SyncError>;

    /// Replaces the outbound notify-target records for `nc`.
    fn write_reps_to(&self, nc: NcId, targets: &[ReplTarget]) -> Result<(), SyncError>;

    /// The local up-to-dateness vector for `nc`.
    fn utd_vector(&self, nc: NcId) -> Result<Vec<UtdEntry>, SyncError>;

    /// Highest local USN assigned in `nc`.
    fn local_usn(&self, nc: NcId) -> Result<Usn, SyncError>;

    /// Commits one pull batch: applies the objects and linked values,
    /// advances the source's watermark to `reply.new_cursor`, folds in
    /// `reply.new_utd`, resets the source's failure counters, and stamps
    /// a success. All of it commits atomically or not at all. When
    /// `schema` is given, the batch is interpreted with those attribute
    /// definitions instead of the persisted ones.
    fn commit_batch(
        &self,
        nc: NcId,
        source: DsaId,
        reply: &PullReply,
        schema: Option<&WorkingSchema>,
        now_us: u64,
    ) -> Result<(), SyncError>;

    /// Records a failed pull attempt from `source`: increments the
    /// failure count, stamps the attempt, and stores `result_code`.
    /// The watermark is untouched.
    fn record_pull_failure(
        &self,
        nc: NcId,
        source: DsaId,
        result_code: u32,
        now_us: u64,
    ) -> Result<(), SyncError>;

    /// Per-attribute metadata of committed objects in `nc`.
    fn attribute_metadata(&self, nc: NcId) -> Result<Vec<AttrMetaEntry>, SyncError>;

    /// State of the local identifier pool.
    fn rid_pool(&self) -> Result<RidPoolStatus, SyncError>;

    /// Removes tombstones older than `retention_us`, returning how many
    /// were removed.
    fn remove_expired_tombstones(&self, retention_us: u64, now_us: u64)
        -> Result<usize, SyncError>;
}
