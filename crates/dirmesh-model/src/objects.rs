//! Directory configuration objects read by the topology pass.
//!
//! These mirror the objects an administrator edits: sites, servers,
//! site links, link bridges, naming contexts, and connection objects.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{BridgeId, ConnId, DsaId, InvocationId, LinkId, NcId, SiteId, TransportId};
use crate::replinfo::ReplInfo;
use crate::schedule::Schedule;

/// Option bits shared by site links, connection objects, source records,
/// and sync requests. A path's options are the intersection of its link
/// options, so permissive bits must be set on every link to survive.
pub mod options {
    /// Change notification is allowed; the source notifies this partner
    /// instead of waiting for the next polling slot.
    pub const NOTIFY: u32 = 1 << 0;
    /// Replication flows both ways across the agreement.
    pub const TWO_WAY: u32 = 1 << 1;
    /// Replication traffic is compressed.
    pub const COMPRESS: u32 = 1 << 2;
    /// The replica on the requesting side is read-only.
    pub const READ_ONLY: u32 = 1 << 3;
    /// The operation should run ahead of routine work.
    pub const URGENT: u32 = 1 << 4;
    /// Partner notification may be handled asynchronously.
    pub const ASYNC_NOTIFY: u32 = 1 << 5;
    /// The notifying side holds a writable replica.
    pub const WRITABLE: u32 = 1 << 6;
    /// Reference update: register the destination on the source.
    pub const REF_ADD: u32 = 1 << 7;
    /// Reference update: remove the destination from the source.
    pub const REF_DELETE: u32 = 1 << 8;
}

/// A site: a location grouping directory servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDef {
    /// Site identifier.
    pub id: SiteId,
    /// Administrative name, e.g. `"eu-west"`.
    pub name: String,
}

/// A directory server and the replicas it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcDef {
    /// Server identifier (DSA GUID).
    pub guid: DsaId,
    /// Site the server lives in.
    pub site: SiteId,
    /// DNS name used to reach the server.
    pub dns: String,
    /// True if the server carries partial replicas of every domain
    /// partition for global lookups.
    pub is_gc: bool,
    /// Transports the server can terminate.
    pub transports: Vec<TransportId>,
    /// Naming contexts held (or configured to be held) as full replicas.
    pub full_ncs: Vec<NcId>,
    /// Naming contexts held as partial replicas.
    pub partial_ncs: Vec<NcId>,
}

impl DcDef {
    /// True if the server holds or should hold a full replica of `nc`.
    pub fn holds_full(&self, nc: NcId) -> bool {
        self.full_ncs.contains(&nc)
    }

    /// True if the server holds at least a partial replica of `nc`.
    pub fn holds_any(&self, nc: NcId) -> bool {
        self.full_ncs.contains(&nc) || self.partial_ncs.contains(&nc)
    }
}

/// A site link: a multi-edge joining two or more sites over one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteLinkDef {
    /// Link identifier.
    pub id: LinkId,
    /// Administrative name.
    pub name: String,
    /// Transport the link uses.
    pub transport: TransportId,
    /// Sites joined by the link.
    pub sites: Vec<SiteId>,
    /// Cost, interval, options, and schedule of the link.
    pub info: ReplInfo,
}

/// A site link bridge: links of one transport that route transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBridgeDef {
    /// Bridge identifier.
    pub id: BridgeId,
    /// Transport all member links share.
    pub transport: TransportId,
    /// Member links.
    pub links: Vec<LinkId>,
}

/// What a naming context contains, which decides who replicates it and
/// how its contents are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NcKind {
    /// A domain partition.
    Domain,
    /// The configuration partition replicated to every server.
    Config,
    /// The schema partition; its objects define attribute encodings.
    Schema,
    /// An application partition with an explicit replica set.
    App,
}

/// A naming context: one replicated directory partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingContext {
    /// Partition identifier.
    pub id: NcId,
    /// Distinguished name of the partition head.
    pub dn: String,
    /// Partition kind.
    pub kind: NcKind,
    /// True if the local replica is writable.
    pub writable: bool,
}

/// An inbound replication agreement between two servers.
///
/// Connection objects are created by the topology pass (`generated`) or
/// by administrators. The destination server pulls from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionObject {
    /// Connection identifier.
    pub id: ConnId,
    /// Source server replication pulls from.
    pub from_dsa: DsaId,
    /// Destination server the connection belongs to.
    pub to_dsa: DsaId,
    /// Transport the connection uses.
    pub transport: TransportId,
    /// Polling schedule derived from the path schedule and interval.
    pub schedule: Schedule,
    /// Option bits; see [`options`].
    pub options: u32,
    /// True if an administrator pinned the schedule; the topology pass
    /// then leaves the schedule alone.
    pub user_owned_schedule: bool,
    /// True if the topology pass created this connection and may delete
    /// it once it stops being needed.
    pub generated: bool,
}

/// Identity of the local server, threaded through drivers so requests
/// carry the right destination GUID and DNS name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDsa {
    /// The local server's DSA GUID.
    pub guid: DsaId,
    /// The local database epoch.
    pub invocation_id: InvocationId,
    /// DNS name remote partners use to reach this server.
    pub dns: String,
    /// Site the local server lives in.
    pub site: SiteId,
}

impl LocalDsa {
    /// Builds a local identity with a fresh invocation id.
    pub fn new(guid: DsaId, site: SiteId, dns: impl Into<String>) -> Self {
        LocalDsa {
            guid,
            invocation_id: Uuid::new_v4(),
            dns: dns.into(),
            site,
        }
    }
}
