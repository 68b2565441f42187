//! Minimum-cost spanning topology over internal edges.
//!
//! Kruskal over the internal edges produced by the forest runs, with
//! full-replica pairs taken before mixed pairs. The output edges that
//! touch the local site, after orientation, are what the materializer
//! turns into connection objects.

use std::collections::{HashMap, VecDeque};

use tracing::debug;
use uuid::Uuid;

use dirmesh_model::ids::SiteId;
use dirmesh_model::replinfo::MAX_COST;
use dirmesh_model::SyncError;

use crate::forest::InternalEdge;
use crate::graph::{Color, Graph, MultiEdge};

/// Disjoint-set forest over site ids with path compression and union by
/// rank.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: HashMap<SiteId, SiteId>,
    rank: HashMap<SiteId, u8>,
}

impl UnionFind {
    /// Builds singleton sets for `ids`.
    pub fn new(ids: impl IntoIterator<Item = SiteId>) -> Self {
        let mut uf = UnionFind::default();
        for id in ids {
            uf.parent.insert(id, id);
        }
        uf
    }

    /// Representative of `id`'s set. Unknown ids represent themselves.
    pub fn find(&mut self, id: SiteId) -> SiteId {
        let parent = match self.parent.get(&id) {
            Some(p) => *p,
            None => {
                self.parent.insert(id, id);
                return id;
            }
        };
        if parent == id {
            return id;
        }
        let root = self.find(parent);
        self.parent.insert(id, root);
        root
    }

    /// Merges the sets of `a` and `b`. Returns false if they were
    /// already one set.
    pub fn union(&mut self, a: SiteId, b: SiteId) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        let rank_a = self.rank.get(&ra).copied().unwrap_or(0);
        let rank_b = self.rank.get(&rb).copied().unwrap_or(0);
        if rank_a < rank_b {
            self.parent.insert(ra, rb);
        } else if rank_a > rank_b {
            self.parent.insert(rb, ra);
        } else {
            self.parent.insert(rb, ra);
            self.rank.insert(ra, rank_a + 1);
        }
        true
    }

    /// True if `a` and `b` share a set.
    pub fn connected(&mut self, a: SiteId, b: SiteId) -> bool {
        self.find(a) == self.find(b)
    }
}

/// Result of one spanning run.
#[derive(Debug)]
pub struct SpanningOutcome {
    /// Tree edges touching the local site that are undirected or point
    /// into it, ready for materialization. Directed edges have the
    /// remote site at `members[0]`.
    pub retained: Vec<MultiEdge>,
    /// Total tree edges accepted by Kruskal, before retention.
    pub tree_edges: usize,
    /// True if all colored vertices ended up in one component.
    pub connected: bool,
    /// Distinct components among colored vertices.
    pub component_count: usize,
}

/// Spans the internal edges into a minimum-cost topology and retains the
/// oriented edges relevant to `local_site`.
///
/// Edge order: full-replica pairs first, then cost ascending, then more
/// open schedule slots, then root-pair id. Edges joining two already
/// connected components are skipped, so rerunning over the same input
/// yields the same tree.
pub fn build_spanning_tree(
    graph: &mut Graph,
    mut internal: Vec<InternalEdge>,
    local_site: SiteId,
) -> Result<SpanningOutcome, SyncError> {
    internal.sort_by(|a, b| {
        b.red_red
            .cmp(&a.red_red)
            .then(a.info.cost.cmp(&b.info.cost))
            .then(b.info.schedule.duration().cmp(&a.info.schedule.duration()))
            .then((a.root1, a.root2).cmp(&(b.root1, b.root2)))
    });

    // Component bookkeeping starts from scratch each run.
    for v in graph.vertices_mut() {
        v.component = Some(v.id);
        v.distance_to_red = MAX_COST;
    }

    let vertex_ids = graph.vertex_ids();
    let mut uf = UnionFind::new(vertex_ids.iter().copied());

    let target = graph
        .vertices()
        .filter(|v| v.color == Color::Red || v.color == Color::White)
        .count();

    let mut tree: Vec<MultiEdge> = Vec::new();
    for edge in internal {
        if tree.len() >= target {
            break;
        }
        if !uf.union(edge.root1, edge.root2) {
            continue;
        }
        tree.push(MultiEdge {
            id: Uuid::new_v4(),
            members: vec![edge.root1, edge.root2],
            transport: edge.transport,
            info: edge.info,
            directed: false,
        });
    }

    // Hop distance to the nearest full-replica site, along tree edges.
    let mut adjacency: HashMap<SiteId, Vec<SiteId>> = HashMap::new();
    for edge in &tree {
        if let [a, b] = edge.members[..] {
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }
    }
    let mut queue: VecDeque<SiteId> = VecDeque::new();
    for v in graph.vertices_mut() {
        if v.color == Color::Red {
            v.distance_to_red = 0;
            queue.push_back(v.id);
        }
    }
    while let Some(site) = queue.pop_front() {
        let distance = graph.find_vertex(site)?.distance_to_red;
        let neighbors = adjacency.get(&site).cloned().unwrap_or_default();
        for neighbor in neighbors {
            let v = graph.find_vertex_mut(neighbor)?;
            if v.distance_to_red == MAX_COST {
                v.distance_to_red = distance.saturating_add(1);
                queue.push_back(neighbor);
            }
        }
    }

    // Publish final components and count them among colored vertices.
    let mut colored_components: Vec<SiteId> = Vec::new();
    for site in vertex_ids {
        let root = uf.find(site);
        let v = graph.find_vertex_mut(site)?;
        v.component = Some(root);
        if v.is_colored() && !colored_components.contains(&root) {
            colored_components.push(root);
        }
    }
    let component_count = colored_components.len();
    let connected = component_count <= 1;

    // Orient edges with a partial-replica endpoint away from the better
    // endpoint, then keep only edges that replicate into the local site.
    let tree_edges = tree.len();
    let mut retained = Vec::new();
    for mut edge in tree {
        if !edge.touches(local_site) {
            continue;
        }
        let (a_id, b_id) = match edge.members[..] {
            [a, b] => (a, b),
            _ => continue,
        };
        let a = graph.find_vertex(a_id)?;
        let b = graph.find_vertex(b_id)?;
        if a.color == Color::Black || b.color == Color::Black {
            edge.directed = true;
            if b.rank() < a.rank() {
                edge.members.swap(0, 1);
            }
        }
        if edge.directed && edge.members[1] != local_site {
            continue;
        }
        if !edge.directed && edge.members[0] == local_site {
            // Normalize: the remote endpoint leads for the materializer.
            edge.members.swap(0, 1);
        }
        retained.push(edge);
    }

    debug!(
        tree_edges,
        retained = retained.len(),
        connected,
        component_count,
        "spanning run complete"
    );
    Ok(SpanningOutcome {
        retained,
        tree_edges,
        connected,
        component_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Vertex;
    use dirmesh_model::replinfo::ReplInfo;
    use dirmesh_model::schedule::Schedule;
    use proptest::prelude::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn colored_graph(colors: &[(u128, Color)]) -> Graph {
        let mut g = Graph::new();
        for (n, color) in colors {
            let mut v = Vertex::new(id(*n));
            v.color = *color;
            g.add_vertex(v);
        }
        g
    }

    fn internal(a: u128, b: u128, cost: u32, red_red: bool) -> InternalEdge {
        InternalEdge {
            root1: id(a.min(b)),
            root2: id(a.max(b)),
            red_red,
            transport: id(100),
            info: ReplInfo::new(cost, 15, !0, Schedule::always()),
        }
    }

    mod union_find {
        use super::*;

        #[test]
        fn singletons_are_their_own_roots() {
            let mut uf = UnionFind::new([id(1), id(2)]);
            assert_eq!(uf.find(id(1)), id(1));
            assert!(!uf.connected(id(1), id(2)));
        }

        #[test]
        fn union_merges_and_reports_cycles() {
            let mut uf = UnionFind::new([id(1), id(2), id(3)]);
            assert!(uf.union(id(1), id(2)));
            assert!(uf.union(id(2), id(3)));
            assert!(!uf.union(id(1), id(3)));
            assert!(uf.connected(id(1), id(3)));
        }

        #[test]
        fn unknown_ids_become_singletons() {
            let mut uf = UnionFind::default();
            assert_eq!(uf.find(id(9)), id(9));
            assert!(uf.union(id(9), id(8)));
        }

        proptest! {
            #[test]
            fn prop_successful_unions_count_component_merges(
                pairs in prop::collection::vec((0u128..12, 0u128..12), 0..40),
            ) {
                let mut uf = UnionFind::new((0..12).map(id));
                let merged = pairs
                    .iter()
                    .filter(|&&(a, b)| uf.union(id(a), id(b)))
                    .count();
                let mut roots: Vec<SiteId> = (0..12).map(|n| uf.find(id(n))).collect();
                roots.sort();
                roots.dedup();
                prop_assert_eq!(roots.len(), 12 - merged);
            }

            #[test]
            fn prop_find_is_idempotent(
                pairs in prop::collection::vec((0u128..12, 0u128..12), 0..40),
                probe in 0u128..12,
            ) {
                let mut uf = UnionFind::new((0..12).map(id));
                for &(a, b) in &pairs {
                    uf.union(id(a), id(b));
                }
                let root = uf.find(id(probe));
                prop_assert_eq!(uf.find(root), root);
                prop_assert!(uf.connected(id(probe), root));
            }
        }
    }

    mod kruskal {
        use super::*;

        #[test]
        fn triangle_keeps_the_two_cheapest_edges() {
            let mut g = colored_graph(&[
                (1, Color::Red),
                (2, Color::Red),
                (3, Color::Red),
            ]);
            let edges = vec![
                internal(1, 2, 10, true),
                internal(2, 3, 20, true),
                internal(1, 3, 30, true),
            ];
            let out = build_spanning_tree(&mut g, edges, id(1)).unwrap();
            assert_eq!(out.tree_edges, 2);
            assert!(out.connected);
            assert_eq!(out.component_count, 1);
            // Only the cost-10 edge touches site 1 in the tree.
            assert_eq!(out.retained.len(), 1);
            assert_eq!(out.retained[0].info.cost, 10);
        }

        #[test]
        fn full_replica_pairs_are_spanned_first() {
            // The red-red edge is dearer but still wins the ordering.
            let mut g = colored_graph(&[(1, Color::Red), (2, Color::Red)]);
            let edges = vec![internal(1, 2, 100, true), internal(1, 2, 10, false)];
            let out = build_spanning_tree(&mut g, edges, id(1)).unwrap();
            assert_eq!(out.tree_edges, 1);
            assert_eq!(out.retained[0].info.cost, 100);
        }

        #[test]
        fn disconnected_components_are_reported() {
            let mut g = colored_graph(&[
                (1, Color::Red),
                (2, Color::Red),
                (3, Color::Red),
                (4, Color::Red),
            ]);
            let edges = vec![internal(1, 2, 10, true)];
            let out = build_spanning_tree(&mut g, edges, id(1)).unwrap();
            assert!(!out.connected);
            assert_eq!(out.component_count, 3);
        }

        #[test]
        fn white_only_components_do_not_break_connectivity() {
            let mut g = colored_graph(&[
                (1, Color::Red),
                (2, Color::Red),
                (3, Color::White),
            ]);
            let edges = vec![internal(1, 2, 10, true)];
            let out = build_spanning_tree(&mut g, edges, id(1)).unwrap();
            assert!(out.connected);
        }

        #[test]
        fn rerun_produces_the_same_tree() {
            let mut g = colored_graph(&[
                (1, Color::Red),
                (2, Color::Red),
                (3, Color::Red),
            ]);
            let edges = vec![
                internal(1, 2, 10, true),
                internal(2, 3, 20, true),
                internal(1, 3, 30, true),
            ];
            let first = build_spanning_tree(&mut g, edges.clone(), id(1)).unwrap();
            let second = build_spanning_tree(&mut g, edges, id(1)).unwrap();
            assert_eq!(first.tree_edges, second.tree_edges);
            assert_eq!(first.retained.len(), second.retained.len());
            assert_eq!(
                first.retained[0].members,
                second.retained[0].members
            );
        }
    }

    mod distances {
        use super::*;

        #[test]
        fn bfs_counts_hops_to_red() {
            let mut g = colored_graph(&[
                (1, Color::Red),
                (2, Color::White),
                (3, Color::White),
            ]);
            let edges = vec![internal(1, 2, 10, false), internal(2, 3, 10, false)];
            build_spanning_tree(&mut g, edges, id(1)).unwrap();
            assert_eq!(g.find_vertex(id(1)).unwrap().distance_to_red, 0);
            assert_eq!(g.find_vertex(id(2)).unwrap().distance_to_red, 1);
            assert_eq!(g.find_vertex(id(3)).unwrap().distance_to_red, 2);
        }

        #[test]
        fn unreached_vertices_stay_at_max() {
            let mut g = colored_graph(&[(1, Color::Red), (2, Color::White)]);
            let out = build_spanning_tree(&mut g, Vec::new(), id(1)).unwrap();
            assert_eq!(out.tree_edges, 0);
            assert_eq!(g.find_vertex(id(2)).unwrap().distance_to_red, MAX_COST);
        }
    }

    mod orientation {
        use super::*;

        #[test]
        fn black_endpoint_directs_the_edge_away_from_red() {
            // Local site is black: the edge points into it and survives.
            let mut g = colored_graph(&[(1, Color::Red), (2, Color::Black)]);
            let out = build_spanning_tree(
                &mut g,
                vec![internal(1, 2, 10, false)],
                id(2),
            )
            .unwrap();
            assert_eq!(out.retained.len(), 1);
            let edge = &out.retained[0];
            assert!(edge.directed);
            assert_eq!(edge.members, vec![id(1), id(2)]);
        }

        #[test]
        fn edges_directed_away_from_local_are_dropped() {
            // Same edge from the red side: it points away and is dropped.
            let mut g = colored_graph(&[(1, Color::Red), (2, Color::Black)]);
            let out = build_spanning_tree(
                &mut g,
                vec![internal(1, 2, 10, false)],
                id(1),
            )
            .unwrap();
            assert_eq!(out.tree_edges, 1);
            assert!(out.retained.is_empty());
        }

        #[test]
        fn red_red_edges_stay_undirected_with_remote_first() {
            let mut g = colored_graph(&[(1, Color::Red), (2, Color::Red)]);
            let out = build_spanning_tree(
                &mut g,
                vec![internal(1, 2, 10, true)],
                id(1),
            )
            .unwrap();
            assert_eq!(out.retained.len(), 1);
            let edge = &out.retained[0];
            assert!(!edge.directed);
            assert_eq!(edge.members, vec![id(2), id(1)]);
        }

        #[test]
        fn remote_edges_are_not_retained() {
            let mut g = colored_graph(&[
                (1, Color::Red),
                (2, Color::Red),
                (3, Color::Red),
            ]);
            let out = build_spanning_tree(
                &mut g,
                vec![internal(1, 2, 10, true)],
                id(3),
            )
            .unwrap();
            assert_eq!(out.tree_edges, 1);
            assert!(out.retained.is_empty());
        }
    }
}
