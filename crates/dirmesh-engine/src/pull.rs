//! The pull protocol driver: one inbound replication cycle.
//!
//! A cycle walks Connect → GetChanges → ApplyChanges, looping while the
//! source reports more data, then registers the local server as a notify
//! target with UpdateRefs. Extended operations collapse the loop to a
//! single round trip and skip the reference update. Every batch commits
//! atomically through the store, which advances the watermark and resets
//! the source's failure counters in the same write.

use std::sync::Arc;

use tracing::{debug, warn};

use dirmesh_model::ids::Usn;
use dirmesh_model::metadata::merge_utd;
use dirmesh_model::objects::{options, LocalDsa, NcKind};
use dirmesh_model::store::DirectoryStore;
use dirmesh_model::time::now_us;
use dirmesh_model::transport::BoundDrs;
use dirmesh_model::wire::{PullRequest, RefsRequest, WorkingSchema, DRS_OK};
use dirmesh_model::SyncError;

use crate::opqueue::PendingPull;

/// What one completed pull cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOutcome {
    /// Round trips made to the source.
    pub batches: usize,
    /// Objects applied across all batches.
    pub objects: usize,
    /// Linked values applied across all batches.
    pub linked_values: usize,
    /// Source watermark after the final commit.
    pub final_cursor: Usn,
    /// True if the cycle ended with a successful reference update.
    pub refs_updated: bool,
}

/// Drives pull operations against bound partner sessions.
pub struct PullDriver {
    store: Arc<dyn DirectoryStore>,
    local: LocalDsa,
    max_objects: u32,
    max_bytes: u32,
}

impl PullDriver {
    /// A driver for the local server with the given batch caps.
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        local: LocalDsa,
        max_objects: u32,
        max_bytes: u32,
    ) -> Self {
        PullDriver {
            store,
            local,
            max_objects,
            max_bytes,
        }
    }

    /// Runs one pull cycle for `op` over `session`.
    ///
    /// On success the source record's watermark, failure counter, and
    /// last-success stamp have been updated by the final batch commit.
    /// On failure the cursor is untouched and the failure has been
    /// counted against the source, so the next period resumes from the
    /// last committed watermark.
    pub async fn run(
        &self,
        op: &PendingPull,
        session: &dyn BoundDrs,
    ) -> Result<PullOutcome, SyncError> {
        let nc = self.store.naming_context(op.nc)?;
        let record = self
            .store
            .reps_from(op.nc)?
            .into_iter()
            .find(|r| r.source_guid == op.source)
            .ok_or_else(|| SyncError::not_found("source record", op.source))?;

        let mut cursor = record.high_watermark;
        let mut utd = self.store.utd_vector(op.nc)?;
        let mut flags = record.options | op.options;
        if !nc.writable {
            flags |= options::READ_ONLY;
        }
        let extended = op.kind.extended();
        let mut working_schema: Option<WorkingSchema> = None;
        let mut outcome = PullOutcome {
            batches: 0,
            objects: 0,
            linked_values: 0,
            final_cursor: cursor,
            refs_updated: false,
        };

        loop {
            let request = PullRequest {
                nc: op.nc,
                dest_guid: self.local.guid,
                dest_invocation: self.local.invocation_id,
                cursor,
                utd: utd.clone(),
                max_objects: self.max_objects,
                max_bytes: self.max_bytes,
                options: flags,
                extended,
                target_usn: op.target_usn,
            };
            let reply = match session.get_changes(request).await {
                Ok(reply) => reply,
                Err(err) => {
                    self.count_failure(op, err.code());
                    return Err(err);
                }
            };
            if reply.remote_status != DRS_OK {
                self.count_failure(op, reply.remote_status);
                return Err(SyncError::remote(
                    session.peer_dns(),
                    format!("result code {}", reply.remote_status),
                ));
            }

            // A schema batch can redefine attributes the same batch uses;
            // decoded definitions ride along for the rest of the cycle.
            if nc.kind == NcKind::Schema {
                if let Some(decoded) = WorkingSchema::from_batch(&reply.objects) {
                    match working_schema.as_mut() {
                        Some(schema) => schema.absorb(decoded),
                        None => working_schema = Some(decoded),
                    }
                }
            }

            if let Err(err) =
                self.store
                    .commit_batch(op.nc, op.source, &reply, working_schema.as_ref(), now_us())
            {
                self.count_failure(op, err.code());
                return Err(err);
            }

            outcome.batches += 1;
            outcome.objects += reply.objects.len();
            outcome.linked_values += reply.linked_values.len();
            cursor = reply.new_cursor;
            outcome.final_cursor = cursor;
            if let Some(vector) = &reply.new_utd {
                for entry in vector {
                    merge_utd(&mut utd, *entry);
                }
            }

            // Extended operations are a single round trip regardless of
            // how much ordinary data remains.
            if extended.is_some() || !reply.more_data {
                break;
            }
        }

        debug!(
            nc = %op.nc,
            source = %op.source,
            batches = outcome.batches,
            objects = outcome.objects,
            cursor = outcome.final_cursor,
            "pull cycle committed"
        );

        if extended.is_none() && nc.writable {
            let refs = RefsRequest {
                nc: op.nc,
                dest_guid: self.local.guid,
                dest_dns: self.local.dns.clone(),
                options: options::REF_ADD | (record.options & options::NOTIFY),
            };
            match session.update_refs(refs).await {
                Ok(()) => outcome.refs_updated = true,
                // The committed data stands either way; the reference
                // registers on a later cycle.
                Err(err) => warn!(
                    nc = %op.nc,
                    source = %op.source,
                    error = %err,
                    "reference update failed after a committed cycle"
                ),
            }
        }

        Ok(outcome)
    }

    fn count_failure(&self, op: &PendingPull, result_code: u32) {
        if let Err(err) = self
            .store
            .record_pull_failure(op.nc, op.source, result_code, now_us())
        {
            warn!(
                nc = %op.nc,
                source = %op.source,
                error = %err,
                "could not record a pull failure"
            );
        }
    }
}
