//! Vertex coloring: replica presence and transport acceptance.
//!
//! Runs once per partition pass, before any shortest-path work. Each
//! site is colored by what it replicates, and each colored site learns
//! which transports it can actually terminate, which depends on finding
//! an eligible bridgehead server.

use std::collections::BTreeSet;

use tracing::debug;

use dirmesh_model::ids::TransportId;
use dirmesh_model::objects::NamingContext;
use dirmesh_model::store::{DirectoryStore, ReplicaPresence};
use dirmesh_model::SyncError;

use crate::bridgehead::{select_bridgehead, BridgeheadSearch, FailureDetector};
use crate::graph::{Color, Graph};

/// Result of a coloring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorOutcome {
    /// True if at least one bridgehead search found candidates but the
    /// failure detector excluded all of them. A disconnected topology
    /// with this flag set is retried with detection off.
    pub found_failed_dcs: bool,
    /// Sites with full replicas.
    pub red: usize,
    /// Sites with partial replicas only.
    pub black: usize,
    /// Sites without the partition.
    pub white: usize,
}

/// Colors every vertex for `nc` and fills in transport acceptance.
pub fn color_vertices(
    graph: &mut Graph,
    store: &dyn DirectoryStore,
    nc: &NamingContext,
    detector: &dyn FailureDetector,
    detect_failed: bool,
    randomized: bool,
) -> Result<ColorOutcome, SyncError> {
    let transports: BTreeSet<TransportId> = graph.edges().map(|e| e.transport).collect();
    let mut outcome = ColorOutcome {
        found_failed_dcs: false,
        red: 0,
        black: 0,
        white: 0,
    };

    for site in graph.vertex_ids() {
        let color = match store.replica_presence(site, nc.id)? {
            ReplicaPresence::Full => Color::Red,
            ReplicaPresence::Partial => Color::Black,
            ReplicaPresence::Absent => Color::White,
        };

        let mut accepts_red_red = BTreeSet::new();
        let mut accepts_black = BTreeSet::new();
        match color {
            // A full-replica site serves both full and partial partners,
            // but only through a bridgehead carrying the full replica.
            Color::Red => {
                for &transport in &transports {
                    match select_bridgehead(
                        store,
                        site,
                        nc.id,
                        transport,
                        true,
                        detector,
                        detect_failed,
                        randomized,
                    )? {
                        BridgeheadSearch::Found(_) => {
                            accepts_red_red.insert(transport);
                            accepts_black.insert(transport);
                        }
                        BridgeheadSearch::AllExcluded => outcome.found_failed_dcs = true,
                        BridgeheadSearch::NoCandidate => {}
                    }
                }
            }
            Color::Black => {
                for &transport in &transports {
                    match select_bridgehead(
                        store,
                        site,
                        nc.id,
                        transport,
                        false,
                        detector,
                        detect_failed,
                        randomized,
                    )? {
                        BridgeheadSearch::Found(_) => {
                            accepts_black.insert(transport);
                        }
                        BridgeheadSearch::AllExcluded => outcome.found_failed_dcs = true,
                        BridgeheadSearch::NoCandidate => {}
                    }
                }
            }
            Color::White => {}
        }

        match color {
            Color::Red => outcome.red += 1,
            Color::Black => outcome.black += 1,
            Color::White => outcome.white += 1,
        }
        let vertex = graph.find_vertex_mut(site)?;
        vertex.color = color;
        vertex.accepts_red_red = accepts_red_red;
        vertex.accepts_black = accepts_black;
    }

    debug!(
        nc = %nc.id,
        red = outcome.red,
        black = outcome.black,
        white = outcome.white,
        found_failed = outcome.found_failed_dcs,
        "colored vertices"
    );
    Ok(outcome)
}
