//! Identifier aliases shared across the replication control plane.
//!
//! All directory objects are addressed by GUID. The aliases exist so that
//! signatures say which kind of object they expect, not to provide type
//! safety; a `SiteId` and a `DsaId` are both [`Uuid`] underneath.

use uuid::Uuid;

/// Identifies a site (a location grouping directory servers).
pub type SiteId = Uuid;

/// Identifies a directory server instance (DSA).
pub type DsaId = Uuid;

/// Identifies one database epoch of a DSA. Changes when a server is
/// restored from backup, so update sequence numbers are only comparable
/// within one invocation.
pub type InvocationId = Uuid;

/// Identifies a naming context (a replicated directory partition).
pub type NcId = Uuid;

/// Identifies an inter-site transport.
pub type TransportId = Uuid;

/// Identifies a site link (a multi-edge connecting two or more sites).
pub type LinkId = Uuid;

/// Identifies a site link bridge (a transitively-routable set of links).
pub type BridgeId = Uuid;

/// Identifies a connection object (inbound replication agreement).
pub type ConnId = Uuid;

/// Update sequence number: a per-DSA monotonically increasing counter
/// stamped on every originating or applied change.
pub type Usn = u64;
