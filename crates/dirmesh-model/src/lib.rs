#![warn(missing_docs)]

//! DirMesh core model: identifiers, weekly schedules, replication metadata,
//! wire messages, and the store/transport seams shared by the topology and
//! engine crates.

pub mod error;
pub mod ids;
pub mod memory;
pub mod metadata;
pub mod objects;
pub mod replinfo;
pub mod schedule;
pub mod store;
pub mod time;
pub mod transport;
pub mod wire;

pub use error::SyncError;
pub use ids::{BridgeId, ConnId, DsaId, InvocationId, LinkId, NcId, SiteId, TransportId, Usn};
