//! The site graph: vertices, multi-edges, and bridged edge sets.
//!
//! Maps are ordered by id so passes visit vertices and edges in a stable
//! order and two runs over the same directory produce the same topology.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use dirmesh_model::ids::{BridgeId, LinkId, SiteId, TransportId};
use dirmesh_model::replinfo::{ReplInfo, MAX_COST};
use dirmesh_model::SyncError;

/// Replica completeness of a site for the partition being processed.
///
/// The derived order ranks better colors first: full replicas beat
/// partial replicas beat none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Color {
    /// Some server in the site holds a full replica.
    Red,
    /// Only partial replicas are present.
    Black,
    /// The site does not replicate the partition.
    White,
}

/// One site in the graph, plus the working state of the current pass.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Site this vertex stands for.
    pub id: SiteId,
    /// Replica completeness for the partition being processed.
    pub color: Color,
    /// Links incident to this site.
    pub edge_ids: Vec<LinkId>,
    /// Transports with a bridgehead able to serve full-replica exchange.
    pub accepts_red_red: BTreeSet<TransportId>,
    /// Transports with a bridgehead able to serve partial exchange.
    pub accepts_black: BTreeSet<TransportId>,
    /// Path aggregate accumulated by the current shortest-path pass.
    pub info: ReplInfo,
    /// Hop count to the nearest full-replica site in the spanning tree.
    pub distance_to_red: u32,
    /// Root of the shortest-path tree this vertex was captured by.
    pub root: Option<SiteId>,
    /// Connected-component representative, maintained by the spanning
    /// step.
    pub component: Option<SiteId>,
}

impl Vertex {
    /// A fresh white vertex with no working state.
    pub fn new(id: SiteId) -> Self {
        Vertex {
            id,
            color: Color::White,
            edge_ids: Vec::new(),
            accepts_red_red: BTreeSet::new(),
            accepts_black: BTreeSet::new(),
            info: ReplInfo::unreachable(),
            distance_to_red: MAX_COST,
            root: None,
            component: None,
        }
    }

    /// True if the site holds any replica of the partition.
    pub fn is_colored(&self) -> bool {
        self.color != Color::White
    }

    /// Ordering key used when ranking endpoint candidates: better color
    /// first, then cheaper accumulated path, then lower id.
    pub fn rank(&self) -> (Color, u32, SiteId) {
        (self.color, self.info.cost, self.id)
    }
}

/// A site link: one edge joining two or more sites over one transport.
///
/// Spanning-tree output reuses this shape with exactly two members. When
/// `directed` is set, replication flows from `members[0]` to
/// `members[1]`.
#[derive(Debug, Clone)]
pub struct MultiEdge {
    /// Edge identifier.
    pub id: LinkId,
    /// Sites joined by the edge.
    pub members: Vec<SiteId>,
    /// Transport the edge uses.
    pub transport: TransportId,
    /// Cost, interval, options, and schedule of the edge.
    pub info: ReplInfo,
    /// True once a replication direction has been fixed.
    pub directed: bool,
}

impl MultiEdge {
    /// True if `site` is an endpoint of this edge.
    pub fn touches(&self, site: SiteId) -> bool {
        self.members.contains(&site)
    }
}

/// A set of edges of one transport that route transitively.
#[derive(Debug, Clone)]
pub struct MultiEdgeSet {
    /// Set identifier.
    pub id: BridgeId,
    /// Transport all member edges share.
    pub transport: TransportId,
    /// Member edges.
    pub members: Vec<LinkId>,
}

/// The site graph for one partition's topology pass.
#[derive(Debug, Default)]
pub struct Graph {
    vertices: BTreeMap<SiteId, Vertex>,
    edges: BTreeMap<LinkId, MultiEdge>,
    edge_sets: BTreeMap<BridgeId, MultiEdgeSet>,
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Graph::default()
    }

    /// Adds a vertex. Replaces any vertex with the same id.
    pub fn add_vertex(&mut self, vertex: Vertex) {
        self.vertices.insert(vertex.id, vertex);
    }

    /// Adds an edge and indexes it on its member vertices. Members that
    /// are not in the graph are left unindexed; a link naming an unknown
    /// site simply never carries a path.
    pub fn add_edge(&mut self, edge: MultiEdge) {
        for member in &edge.members {
            if let Some(vertex) = self.vertices.get_mut(member) {
                if !vertex.edge_ids.contains(&edge.id) {
                    vertex.edge_ids.push(edge.id);
                }
            }
        }
        self.edges.insert(edge.id, edge);
    }

    /// Adds a bridged edge set.
    pub fn add_edge_set(&mut self, set: MultiEdgeSet) {
        self.edge_sets.insert(set.id, set);
    }

    /// Vertex by site id.
    pub fn find_vertex(&self, id: SiteId) -> Result<&Vertex, SyncError> {
        self.vertices
            .get(&id)
            .ok_or_else(|| SyncError::not_found("vertex", id))
    }

    /// Mutable vertex by site id.
    pub fn find_vertex_mut(&mut self, id: SiteId) -> Result<&mut Vertex, SyncError> {
        self.vertices
            .get_mut(&id)
            .ok_or_else(|| SyncError::not_found("vertex", id))
    }

    /// Edge by link id.
    pub fn find_edge(&self, id: LinkId) -> Result<&MultiEdge, SyncError> {
        self.edges
            .get(&id)
            .ok_or_else(|| SyncError::not_found("edge", id))
    }

    /// First edge (in id order) with `site` among its members.
    pub fn find_edge_by_member(&self, site: SiteId) -> Result<&MultiEdge, SyncError> {
        self.edges
            .values()
            .find(|e| e.touches(site))
            .ok_or_else(|| SyncError::not_found("edge touching site", site))
    }

    /// Vertices in id order.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    /// Mutable vertices in id order.
    pub fn vertices_mut(&mut self) -> impl Iterator<Item = &mut Vertex> {
        self.vertices.values_mut()
    }

    /// Vertex ids in order.
    pub fn vertex_ids(&self) -> Vec<SiteId> {
        self.vertices.keys().copied().collect()
    }

    /// Edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = &MultiEdge> {
        self.edges.values()
    }

    /// Edge ids in order.
    pub fn edge_ids(&self) -> Vec<LinkId> {
        self.edges.keys().copied().collect()
    }

    /// Bridged edge sets in id order.
    pub fn edge_sets(&self) -> impl Iterator<Item = &MultiEdgeSet> {
        self.edge_sets.values()
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn edge(n: u128, members: &[u128], transport: u128) -> MultiEdge {
        MultiEdge {
            id: id(n),
            members: members.iter().map(|m| id(*m)).collect(),
            transport: id(transport),
            info: ReplInfo::new(10, 15, 0, dirmesh_model::schedule::Schedule::always()),
            directed: false,
        }
    }

    #[test]
    fn color_order_prefers_fuller_replicas() {
        assert!(Color::Red < Color::Black);
        assert!(Color::Black < Color::White);
    }

    #[test]
    fn new_vertex_is_white_and_unreachable() {
        let v = Vertex::new(id(1));
        assert_eq!(v.color, Color::White);
        assert!(!v.is_colored());
        assert_eq!(v.info.cost, MAX_COST);
        assert_eq!(v.root, None);
    }

    #[test]
    fn add_edge_indexes_members() {
        let mut g = Graph::new();
        g.add_vertex(Vertex::new(id(1)));
        g.add_vertex(Vertex::new(id(2)));
        g.add_edge(edge(10, &[1, 2], 100));

        assert_eq!(g.find_vertex(id(1)).unwrap().edge_ids, vec![id(10)]);
        assert_eq!(g.find_vertex(id(2)).unwrap().edge_ids, vec![id(10)]);
        assert!(g.find_edge(id(10)).unwrap().touches(id(1)));
    }

    #[test]
    fn add_edge_tolerates_unknown_members() {
        let mut g = Graph::new();
        g.add_vertex(Vertex::new(id(1)));
        g.add_edge(edge(10, &[1, 99], 100));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.find_vertex(id(1)).unwrap().edge_ids.len(), 1);
    }

    #[test]
    fn lookups_miss_with_not_found() {
        let g = Graph::new();
        assert!(matches!(
            g.find_vertex(id(1)),
            Err(SyncError::NotFound { kind: "vertex", .. })
        ));
        assert!(matches!(g.find_edge(id(1)), Err(SyncError::NotFound { .. })));
        assert!(matches!(
            g.find_edge_by_member(id(1)),
            Err(SyncError::NotFound { .. })
        ));
    }

    #[test]
    fn iteration_is_id_ordered() {
        let mut g = Graph::new();
        g.add_vertex(Vertex::new(id(3)));
        g.add_vertex(Vertex::new(id(1)));
        g.add_vertex(Vertex::new(id(2)));
        let ids = g.vertex_ids();
        assert_eq!(ids, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn rank_orders_by_color_then_cost() {
        let mut a = Vertex::new(id(1));
        a.color = Color::Black;
        a.info.cost = 5;
        let mut b = Vertex::new(id(2));
        b.color = Color::Red;
        b.info.cost = 50;
        // Red beats black regardless of cost.
        assert!(b.rank() < a.rank());
    }
}
