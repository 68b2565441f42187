//! The notify protocol driver: one outbound change notification.
//!
//! A notify is a single `ReplicaSync` call telling one partner that this
//! server has changes, so the partner schedules a pull ahead of its next
//! polling slot. Success stamps how far the target has been told; failure
//! leaves the outbound record unchanged and the next period retries.

use std::sync::Arc;

use tracing::debug;

use dirmesh_model::ids::Usn;
use dirmesh_model::objects::{options, LocalDsa};
use dirmesh_model::store::DirectoryStore;
use dirmesh_model::transport::BoundDrs;
use dirmesh_model::wire::SyncRequest;
use dirmesh_model::SyncError;

use crate::opqueue::PendingNotify;

/// Drives notify operations against bound partner sessions.
pub struct NotifyDriver {
    store: Arc<dyn DirectoryStore>,
    local: LocalDsa,
}

impl NotifyDriver {
    /// A driver notifying on behalf of the local server.
    pub fn new(store: Arc<dyn DirectoryStore>, local: LocalDsa) -> Self {
        NotifyDriver { store, local }
    }

    /// Runs one notify for `op` over `session`, returning the USN the
    /// target is now recorded as notified up to.
    pub async fn run(
        &self,
        op: &PendingNotify,
        session: &dyn BoundDrs,
    ) -> Result<Usn, SyncError> {
        let mut flags = op.options;
        if op.urgent {
            flags |= options::URGENT;
        }
        let request = SyncRequest {
            nc: op.nc,
            source_guid: self.local.guid,
            options: flags,
        };
        session.replica_sync(request).await?;

        let mut targets = self.store.reps_to(op.nc)?;
        let target = targets
            .iter_mut()
            .find(|t| t.target_guid == op.target)
            .ok_or_else(|| SyncError::not_found("notify target", op.target))?;
        let notified = target.notified_usn.max(op.target_usn);
        target.notified_usn = notified;
        self.store.write_reps_to(op.nc, &targets)?;
        debug!(
            nc = %op.nc,
            target = %op.target,
            usn = notified,
            "partner notified"
        );
        Ok(notified)
    }
}
