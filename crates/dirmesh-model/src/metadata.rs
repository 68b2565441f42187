//! Persisted replication metadata: source records, notify-target records,
//! and up-to-dateness vectors.
//!
//! Source and target records are stored as versioned binary blobs on the
//! partition head. Decoding validates the version tag; an unknown tag
//! makes the whole record set unusable and the caller aborts its refresh.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ids::{DsaId, InvocationId, TransportId, Usn};
use crate::schedule::Schedule;

/// Version tag written into every [`ReplSource`] record.
pub const REPL_SOURCE_VERSION: u32 = 1;

/// Version tag written into every [`ReplTarget`] record.
pub const REPL_TARGET_VERSION: u32 = 1;

/// One inbound replication partner for one partition: who we pull from,
/// how far we have pulled, and how the last attempts went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplSource {
    /// Record format version; see [`REPL_SOURCE_VERSION`].
    pub version: u32,
    /// Source server GUID.
    pub source_guid: DsaId,
    /// Database epoch of the source the watermark is valid against.
    pub invocation_id: InvocationId,
    /// DNS name of the source.
    pub source_dns: String,
    /// Transport used to reach the source.
    pub transport: TransportId,
    /// Option bits; see [`crate::objects::options`].
    pub options: u32,
    /// Polling schedule copied from the connection object.
    pub schedule: Schedule,
    /// Highest source USN already applied locally.
    pub high_watermark: Usn,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// When a pull from this source last started, microseconds.
    pub last_attempt_us: u64,
    /// When a pull from this source last succeeded, microseconds.
    pub last_success_us: u64,
    /// Result code of the last attempt; zero is success.
    pub last_result: u32,
}

impl ReplSource {
    /// Builds a fresh record for a newly materialized partner with an
    /// empty watermark and clean health counters.
    pub fn new(
        source_guid: DsaId,
        source_dns: impl Into<String>,
        transport: TransportId,
        options: u32,
        schedule: Schedule,
    ) -> Self {
        ReplSource {
            version: REPL_SOURCE_VERSION,
            source_guid,
            // Refined to the source's real invocation id once replies
            // start carrying it.
            invocation_id: source_guid,
            source_dns: source_dns.into(),
            transport,
            options,
            schedule,
            high_watermark: 0,
            consecutive_failures: 0,
            last_attempt_us: 0,
            last_success_us: 0,
            last_result: 0,
        }
    }

    /// Checks the version tag.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.version != REPL_SOURCE_VERSION {
            return Err(SyncError::inconsistent(format!(
                "source record version {} (expected {})",
                self.version, REPL_SOURCE_VERSION
            )));
        }
        Ok(())
    }

    /// Serializes the record to its stored blob form.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes and validates a stored blob.
    pub fn decode(bytes: &[u8]) -> Result<ReplSource, SyncError> {
        let record: ReplSource = bincode::deserialize(bytes)?;
        record.validate()?;
        Ok(record)
    }
}

/// One outbound notify target for one partition: who we tell about new
/// local changes and how far we have told them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplTarget {
    /// Record format version; see [`REPL_TARGET_VERSION`].
    pub version: u32,
    /// Target server GUID.
    pub target_guid: DsaId,
    /// DNS name of the target.
    pub target_dns: String,
    /// Option bits; see [`crate::objects::options`].
    pub options: u32,
    /// Highest local USN the target has been notified up to.
    pub notified_usn: Usn,
}

impl ReplTarget {
    /// Builds a fresh record for a newly registered notify target.
    pub fn new(target_guid: DsaId, target_dns: impl Into<String>, options: u32) -> Self {
        ReplTarget {
            version: REPL_TARGET_VERSION,
            target_guid,
            target_dns: target_dns.into(),
            options,
            notified_usn: 0,
        }
    }

    /// Checks the version tag.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.version != REPL_TARGET_VERSION {
            return Err(SyncError::inconsistent(format!(
                "target record version {} (expected {})",
                self.version, REPL_TARGET_VERSION
            )));
        }
        Ok(())
    }

    /// Serializes the record to its stored blob form.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes and validates a stored blob.
    pub fn decode(bytes: &[u8]) -> Result<ReplTarget, SyncError> {
        let record: ReplTarget = bincode::deserialize(bytes)?;
        record.validate()?;
        Ok(record)
    }
}

/// One entry of an up-to-dateness vector: the highest USN applied from
/// one originating invocation, regardless of which partner carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtdEntry {
    /// Originating database epoch.
    pub invocation_id: InvocationId,
    /// Highest USN applied from that epoch.
    pub usn: Usn,
}

/// Folds `entry` into a vector, keeping the higher USN per invocation.
pub fn merge_utd(vector: &mut Vec<UtdEntry>, entry: UtdEntry) {
    match vector
        .iter_mut()
        .find(|e| e.invocation_id == entry.invocation_id)
    {
        Some(existing) => existing.usn = existing.usn.max(entry.usn),
        None => vector.push(entry),
    }
}
