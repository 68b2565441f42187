//! Turns retained spanning-tree edges into persisted connection objects.
//!
//! For every tree edge replicating into the local site, a bridgehead is
//! resolved on each side and an inbound connection object is created or
//! corrected. Existing connections are patched field by field, so a
//! run over an already correct directory writes nothing.

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use dirmesh_model::ids::{ConnId, SiteId};
use dirmesh_model::objects::{options, ConnectionObject, DcDef, NamingContext};
use dirmesh_model::store::{ConnectionPatch, DirectoryStore};
use dirmesh_model::SyncError;

use crate::bridgehead::{select_bridgehead, BridgeheadSearch, FailureDetector};
use crate::graph::{Color, Graph, MultiEdge};

/// Option bits the topology pass owns on a connection object.
const MANAGED_OPTIONS: u32 = options::NOTIFY | options::TWO_WAY | options::COMPRESS;

/// Counters for one materialization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    /// Connections created.
    pub created: usize,
    /// Corrective writes issued against existing connections.
    pub updated: usize,
    /// Existing connections confirmed as still needed.
    pub kept: usize,
    /// Tree edges skipped because a bridgehead could not be resolved.
    pub skipped: usize,
}

/// Result of one materialization run.
#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    /// Connections (new and existing) that this partition still needs.
    /// Connections into the site that are absent from every partition's
    /// keep set get deleted by the scheduler.
    pub keep: HashSet<ConnId>,
    /// Counters for the run.
    pub stats: MaterializeStats,
}

struct EdgeEndpoints {
    source: DcDef,
    dest: DcDef,
}

fn resolve_endpoints(
    store: &dyn DirectoryStore,
    graph: &Graph,
    nc: &NamingContext,
    edge: &MultiEdge,
    local_site: SiteId,
    detector: &dyn FailureDetector,
    detect_failed: bool,
    randomized: bool,
) -> Result<Option<EdgeEndpoints>, SyncError> {
    let (remote_site, dest_site) = match edge.members[..] {
        [a, b] => (a, b),
        _ => return Ok(None),
    };
    if dest_site != local_site {
        return Ok(None);
    }

    let source_full = graph.find_vertex(remote_site)?.color == Color::Red;
    let dest_full = graph.find_vertex(dest_site)?.color == Color::Red;

    let source = match select_bridgehead(
        store,
        remote_site,
        nc.id,
        edge.transport,
        source_full,
        detector,
        detect_failed,
        randomized,
    )? {
        BridgeheadSearch::Found(dc) => dc,
        other => {
            warn!(nc = %nc.id, site = %remote_site, ?other, "no source bridgehead for tree edge");
            return Ok(None);
        }
    };
    let dest = match select_bridgehead(
        store,
        dest_site,
        nc.id,
        edge.transport,
        dest_full,
        detector,
        detect_failed,
        randomized,
    )? {
        BridgeheadSearch::Found(dc) => dc,
        other => {
            warn!(nc = %nc.id, site = %dest_site, ?other, "no local bridgehead for tree edge");
            return Ok(None);
        }
    };
    Ok(Some(EdgeEndpoints { source, dest }))
}

/// Materializes `edges` into connection objects for `nc`.
pub fn materialize_connections(
    store: &dyn DirectoryStore,
    graph: &Graph,
    nc: &NamingContext,
    local_site: SiteId,
    edges: &[MultiEdge],
    detector: &dyn FailureDetector,
    detect_failed: bool,
    randomized: bool,
) -> Result<MaterializeOutcome, SyncError> {
    let mut outcome = MaterializeOutcome::default();

    for edge in edges {
        let endpoints = match resolve_endpoints(
            store,
            graph,
            nc,
            edge,
            local_site,
            detector,
            detect_failed,
            randomized,
        )? {
            Some(pair) => pair,
            None => {
                outcome.stats.skipped += 1;
                continue;
            }
        };

        let desired_schedule = edge.info.schedule.derive_polling(edge.info.interval_min);
        let desired_options = edge.info.options & MANAGED_OPTIONS;

        let existing: Vec<ConnectionObject> = store
            .connections_into_site(local_site)?
            .into_iter()
            .filter(|c| {
                c.from_dsa == endpoints.source.guid
                    && c.to_dsa == endpoints.dest.guid
                    && c.transport == edge.transport
            })
            .collect();

        if existing.is_empty() {
            let conn = ConnectionObject {
                id: Uuid::new_v4(),
                from_dsa: endpoints.source.guid,
                to_dsa: endpoints.dest.guid,
                transport: edge.transport,
                schedule: desired_schedule,
                options: desired_options,
                user_owned_schedule: false,
                generated: true,
            };
            debug!(
                nc = %nc.id,
                conn = %conn.id,
                from = %endpoints.source.dns,
                to = %endpoints.dest.dns,
                "materializing connection"
            );
            outcome.keep.insert(conn.id);
            store.create_connection(conn)?;
            outcome.stats.created += 1;
            continue;
        }

        for conn in existing {
            outcome.keep.insert(conn.id);
            outcome.stats.kept += 1;

            // Admin-pinned connections are kept as-is; reconciliation
            // only touches what the topology pass owns.
            if conn.user_owned_schedule {
                continue;
            }

            if conn.schedule != desired_schedule {
                store.update_connection(conn.id, ConnectionPatch::Schedule(desired_schedule))?;
                outcome.stats.updated += 1;
            }
            let bit_patches: [(u32, fn(bool) -> ConnectionPatch); 3] = [
                (options::NOTIFY, ConnectionPatch::Notify),
                (options::TWO_WAY, ConnectionPatch::TwoWay),
                (options::COMPRESS, ConnectionPatch::Compress),
            ];
            for (bit, patch) in bit_patches {
                let want = desired_options & bit != 0;
                let have = conn.options & bit != 0;
                if want != have {
                    store.update_connection(conn.id, patch(want))?;
                    outcome.stats.updated += 1;
                }
            }
        }
    }
    Ok(outcome)
}
