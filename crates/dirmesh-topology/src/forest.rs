//! Shortest-path forest growth and inter-tree edge extraction.
//!
//! One forest run roots a tree at every eligible colored vertex and
//! captures white vertices into the cheapest tree that reaches them.
//! After a run, every graph edge whose best two endpoints sit in
//! different trees yields an internal edge between the two tree roots,
//! carrying the accumulated path parameters.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use dirmesh_model::ids::{LinkId, SiteId, TransportId};
use dirmesh_model::replinfo::ReplInfo;
use dirmesh_model::SyncError;

use crate::graph::{Color, Graph};

/// An edge between two tree roots, distilled from one forest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternalEdge {
    /// Lower-id root.
    pub root1: SiteId,
    /// Higher-id root.
    pub root2: SiteId,
    /// True if both roots hold full replicas.
    pub red_red: bool,
    /// Transport of the underlying graph edge.
    pub transport: TransportId,
    /// Path parameters accumulated across both tree paths and the
    /// connecting edge.
    pub info: ReplInfo,
}

/// Deduplicating accumulator for internal edges across forest runs.
#[derive(Debug, Default)]
pub struct InternalEdgeAcc {
    edges: Vec<InternalEdge>,
    seen: HashSet<InternalEdge>,
}

impl InternalEdgeAcc {
    /// An empty accumulator.
    pub fn new() -> Self {
        InternalEdgeAcc::default()
    }

    /// Adds an edge unless an identical one is already present.
    pub fn add(&mut self, edge: InternalEdge) -> bool {
        if self.seen.insert(edge) {
            self.edges.push(edge);
            true
        } else {
            false
        }
    }

    /// Accumulated edges in insertion order.
    pub fn edges(&self) -> &[InternalEdge] {
        &self.edges
    }

    /// Number of accumulated edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// True if nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Consumes the accumulator.
    pub fn into_edges(self) -> Vec<InternalEdge> {
        self.edges
    }
}

/// Grows shortest-path trees rooted at every eligible colored vertex.
///
/// With a `transport`, only edges of that transport are relaxed and
/// colored vertices not accepting the transport are demoted: they root
/// no tree and, since they never relax their edges, paths cannot pass
/// through them. Without `include_black`, partial-replica vertices are
/// demoted the same way.
///
/// A white vertex is captured by the path with the lowest accumulated
/// cost; on equal cost the path whose schedule keeps more open slots
/// wins. Paths whose schedules stop overlapping are not taken at all.
pub fn run_dijkstra(graph: &mut Graph, transport: Option<TransportId>, include_black: bool) {
    let mut heap: BinaryHeap<Reverse<(u32, SiteId)>> = BinaryHeap::new();

    for v in graph.vertices_mut() {
        if v.color == Color::White {
            v.info = ReplInfo::unreachable();
            v.root = None;
            v.component = None;
            continue;
        }
        v.info = ReplInfo::identity();
        let demoted = match v.color {
            Color::Red => transport.map_or(false, |t| !v.accepts_red_red.contains(&t)),
            Color::Black => {
                !include_black || transport.map_or(false, |t| !v.accepts_black.contains(&t))
            }
            Color::White => false,
        };
        if demoted {
            v.root = None;
            v.component = None;
        } else {
            v.root = Some(v.id);
            v.component = Some(v.id);
            heap.push(Reverse((0, v.id)));
        }
    }

    let mut settled: HashSet<SiteId> = HashSet::new();
    while let Some(Reverse((_, u_id))) = heap.pop() {
        if !settled.insert(u_id) {
            continue;
        }
        let (u_info, u_root, u_component, edge_ids) = match graph.find_vertex(u_id) {
            Ok(u) => (u.info, u.root, u.component, u.edge_ids.clone()),
            Err(_) => continue,
        };
        for edge_id in edge_ids {
            let (edge_info, members) = match graph.find_edge(edge_id) {
                Ok(e) => {
                    if transport.is_some() && transport != Some(e.transport) {
                        continue;
                    }
                    (e.info, e.members.clone())
                }
                Err(_) => continue,
            };
            let candidate = u_info.merge(&edge_info);
            if !candidate.feasible() {
                continue;
            }
            for w_id in members {
                if w_id == u_id || settled.contains(&w_id) {
                    continue;
                }
                let w = match graph.find_vertex_mut(w_id) {
                    Ok(w) => w,
                    Err(_) => continue,
                };
                let better = candidate.cost < w.info.cost
                    || (candidate.cost == w.info.cost
                        && candidate.schedule.duration() > w.info.schedule.duration());
                if better {
                    w.info = candidate;
                    w.root = u_root;
                    w.component = u_component;
                    heap.push(Reverse((candidate.cost, w_id)));
                }
            }
        }
    }
}

/// Extracts the internal edge crossing `edge_id`, if any, after a forest
/// run: the best two endpoints must lie in different trees, both roots
/// must accept the edge's transport for the exchange kind, and the
/// merged schedule must keep an open slot.
pub fn process_edge(
    graph: &Graph,
    edge_id: LinkId,
    acc: &mut InternalEdgeAcc,
) -> Result<(), SyncError> {
    let edge = graph.find_edge(edge_id)?;

    let mut endpoints = Vec::with_capacity(edge.members.len());
    for member in &edge.members {
        if let Ok(v) = graph.find_vertex(*member) {
            if v.root.is_some() {
                endpoints.push(v);
            }
        }
    }
    endpoints.sort_by_key(|v| v.rank());
    let (v1, v2) = match (endpoints.first(), endpoints.get(1)) {
        (Some(a), Some(b)) => (*a, *b),
        _ => return Ok(()),
    };
    let (r1_id, r2_id) = match (v1.root, v2.root) {
        (Some(a), Some(b)) if a != b => (a, b),
        _ => return Ok(()),
    };

    let r1 = graph.find_vertex(r1_id)?;
    let r2 = graph.find_vertex(r2_id)?;
    let red_red = r1.color == Color::Red && r2.color == Color::Red;
    let accepted = if red_red {
        r1.accepts_red_red.contains(&edge.transport) && r2.accepts_red_red.contains(&edge.transport)
    } else {
        r1.accepts_black.contains(&edge.transport) && r2.accepts_black.contains(&edge.transport)
    };
    if !accepted {
        return Ok(());
    }

    let info = v1.info.merge(&v2.info).merge(&edge.info);
    if !info.feasible() {
        return Ok(());
    }

    acc.add(InternalEdge {
        root1: r1_id.min(r2_id),
        root2: r1_id.max(r2_id),
        red_red,
        transport: edge.transport,
        info,
    });
    Ok(())
}
