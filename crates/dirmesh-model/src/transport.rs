//! The remote call seam between replication partners.
//!
//! Production binds speak an RPC stack; tests bind in-process doubles.
//! Sessions are cached per host and checked with [`BoundDrs::is_alive`]
//! before reuse, so a stale session costs one lazy rebind rather than a
//! failed operation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::wire::{PullReply, PullRequest, RefsRequest, SyncRequest};

/// Connects to remote DSAs.
#[async_trait]
pub trait DrsTransport: Send + Sync {
    /// Negotiates a session with the server at `dns`.
    async fn bind(&self, dns: &str) -> Result<Arc<dyn BoundDrs>, SyncError>;
}

/// One bound session with a remote DSA.
#[async_trait]
pub trait BoundDrs: Send + Sync {
    /// Cursor-based incremental change retrieval.
    async fn get_changes(&self, req: PullRequest) -> Result<PullReply, SyncError>;

    /// Tells the remote server to pull from a source.
    async fn replica_sync(&self, req: SyncRequest) -> Result<(), SyncError>;

    /// Maintains the remote server's notify-target list.
    async fn update_refs(&self, req: RefsRequest) -> Result<(), SyncError>;

    /// True if the session is still usable. Consulted before reuse.
    fn is_alive(&self) -> bool;

    /// DNS name of the bound partner.
    fn peer_dns(&self) -> &str;
}
