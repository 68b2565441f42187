//! Error types for the replication control plane.

use thiserror::Error;

/// Errors that can occur during topology computation or replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A directory object lookup missed. Treated as inconsistent directory
    /// state by topology passes, which abort and retry next period.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Object kind, e.g. `"vertex"` or `"partition"`.
        kind: &'static str,
        /// Identifier that missed.
        id: String,
    },

    /// Unknown protocol level, option, or extended operation.
    #[error("unsupported: {msg}")]
    Unsupported {
        /// What was requested and why it is not supported.
        msg: String,
    },

    /// The remote DSA failed a call or was unreachable. Counted against
    /// the source; progress cursors are never advanced on this error.
    #[error("remote failure from {peer}: {msg}")]
    RemoteFailure {
        /// DNS name of the remote partner.
        peer: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// Replication metadata failed validation, e.g. a record carried an
    /// unknown version tag.
    #[error("inconsistent metadata: {msg}")]
    Inconsistent {
        /// Error message describing the inconsistency.
        msg: String,
    },

    /// An allocation or capacity limit was hit.
    #[error("resource exhaustion: {msg}")]
    ResourceExhaustion {
        /// Error message describing the exhausted resource.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error surfaced by the store.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The engine is shutting down; no further operations are accepted.
    #[error("engine shut down")]
    Shutdown,
}

impl SyncError {
    /// Builds a [`SyncError::NotFound`] for an object of `kind`.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        SyncError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Builds a [`SyncError::RemoteFailure`] attributed to `peer`.
    pub fn remote(peer: impl Into<String>, msg: impl Into<String>) -> Self {
        SyncError::RemoteFailure {
            peer: peer.into(),
            msg: msg.into(),
        }
    }

    /// Builds a [`SyncError::Inconsistent`].
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        SyncError::Inconsistent { msg: msg.into() }
    }

    /// Builds a [`SyncError::ResourceExhaustion`].
    pub fn exhausted(msg: impl Into<String>) -> Self {
        SyncError::ResourceExhaustion { msg: msg.into() }
    }

    /// Numeric result code recorded in per-source health counters.
    /// Zero is reserved for success.
    pub fn code(&self) -> u32 {
        match self {
            SyncError::NotFound { .. } => 2,
            SyncError::Unsupported { .. } => 3,
            SyncError::RemoteFailure { .. } => 5,
            SyncError::Inconsistent { .. } => 6,
            SyncError::ResourceExhaustion { .. } => 7,
            SyncError::Serialization(_) => 8,
            SyncError::Io(_) => 9,
            SyncError::Shutdown => 10,
        }
    }
}
