//! Drives one topology pass per partition per period.
//!
//! A pass rebuilds the site graph from the directory store, colors it,
//! grows shortest-path forests (one restricted run per bridge, then the
//! default run over every link), spans the extracted internal edges and
//! materializes connections for the local site. A store error aborts
//! only the failing partition's pass; the previous topology stays in
//! place until the next period.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use dirmesh_model::ids::{ConnId, DsaId, LinkId, NcId, SiteId, TransportId};
use dirmesh_model::metadata::ReplSource;
use dirmesh_model::objects::NamingContext;
use dirmesh_model::store::DirectoryStore;
use dirmesh_model::SyncError;

use crate::bridgehead::{FailureDetector, NoFailures};
use crate::coloring::color_vertices;
use crate::forest::{process_edge, run_dijkstra, InternalEdgeAcc};
use crate::graph::{Graph, MultiEdge, MultiEdgeSet, Vertex};
use crate::materialize::{materialize_connections, MaterializeStats};
use crate::spanning::build_spanning_tree;

/// Where a pass currently is. Observability only; the phases run
/// strictly in order within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyPhase {
    /// No pass running.
    Idle,
    /// Coloring vertices and computing transport acceptance.
    Coloring,
    /// Restricted forest runs, one per bridge.
    ForestBuilding,
    /// Default forest run over all links.
    Processing,
    /// Kruskal over the accumulated internal edges.
    SpanningTree,
    /// Creating and correcting connection objects.
    Materializing,
}

/// Static identity and policy for the topology scheduler.
#[derive(Debug, Clone, Copy)]
pub struct TopologyConfig {
    /// Site this server lives in.
    pub local_site: SiteId,
    /// This server's GUID.
    pub local_dsa: DsaId,
    /// Pick bridgeheads pseudo-randomly instead of GC-first by GUID.
    pub randomized_bridgeheads: bool,
    /// Exclude servers the failure detector flags.
    pub detect_failed_dcs: bool,
}

impl TopologyConfig {
    /// Default policy: deterministic bridgeheads, failure detection on.
    pub fn new(local_site: SiteId, local_dsa: DsaId) -> Self {
        TopologyConfig {
            local_site,
            local_dsa,
            randomized_bridgeheads: false,
            detect_failed_dcs: true,
        }
    }
}

/// Result of one partition's pass.
#[derive(Debug)]
pub struct PassOutcome {
    /// Partition the pass ran for.
    pub nc: NcId,
    /// True if every replicating site ended up reachable.
    pub connected: bool,
    /// Distinct components among replicating sites.
    pub component_count: usize,
    /// True if the pass was rerun with failure detection disabled.
    pub retried_relaxed: bool,
    /// Connections this partition still needs.
    pub keep: HashSet<ConnId>,
    /// Materializer counters.
    pub stats: MaterializeStats,
    /// Source records written for the local server.
    pub sources_written: usize,
}

/// Result of one full period across all partitions.
#[derive(Debug, Default)]
pub struct PeriodSummary {
    /// Per-partition outcomes, successful passes only.
    pub passes: Vec<PassOutcome>,
    /// Passes aborted by a store error.
    pub failed: usize,
    /// Superseded generated connections deleted.
    pub removed: usize,
    /// True if the removal sweep ran. It only runs after a period in
    /// which every pass succeeded.
    pub swept: bool,
}

struct Attempt {
    found_failed_dcs: bool,
    connected: bool,
    component_count: usize,
    keep: HashSet<ConnId>,
    stats: MaterializeStats,
    sources_written: usize,
}

impl Attempt {
    fn into_outcome(self, nc: NcId, retried_relaxed: bool) -> PassOutcome {
        PassOutcome {
            nc,
            connected: self.connected,
            component_count: self.component_count,
            retried_relaxed,
            keep: self.keep,
            stats: self.stats,
            sources_written: self.sources_written,
        }
    }
}

/// Periodic topology generator for one server.
pub struct TopologyScheduler {
    store: Arc<dyn DirectoryStore>,
    config: TopologyConfig,
    detector: Arc<dyn FailureDetector>,
    phase: Mutex<TopologyPhase>,
}

impl TopologyScheduler {
    /// Scheduler with the default detector that never excludes anyone.
    pub fn new(store: Arc<dyn DirectoryStore>, config: TopologyConfig) -> Self {
        TopologyScheduler::with_detector(store, config, Arc::new(NoFailures))
    }

    /// Scheduler with an explicit failure detector.
    pub fn with_detector(
        store: Arc<dyn DirectoryStore>,
        config: TopologyConfig,
        detector: Arc<dyn FailureDetector>,
    ) -> Self {
        TopologyScheduler {
            store,
            config,
            detector,
            phase: Mutex::new(TopologyPhase::Idle),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TopologyPhase {
        self.phase
            .lock()
            .map(|g| *g)
            .unwrap_or(TopologyPhase::Idle)
    }

    fn set_phase(&self, phase: TopologyPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
    }

    /// Builds the site graph from the store's current configuration.
    pub fn build_graph(&self) -> Result<Graph, SyncError> {
        let mut graph = Graph::new();
        for site in self.store.sites()? {
            graph.add_vertex(Vertex::new(site.id));
        }
        for link in self.store.site_links()? {
            graph.add_edge(MultiEdge {
                id: link.id,
                members: link.sites,
                transport: link.transport,
                info: link.info,
                directed: false,
            });
        }
        for bridge in self.store.link_bridges()? {
            graph.add_edge_set(MultiEdgeSet {
                id: bridge.id,
                transport: bridge.transport,
                members: bridge.links,
            });
        }
        Ok(graph)
    }

    /// Runs one pass for `nc`, retrying once with failure detection off
    /// if the first run came back disconnected after excluding servers.
    pub fn run_pass(&self, nc: &NamingContext) -> Result<PassOutcome, SyncError> {
        let result = self.pass_inner(nc);
        self.set_phase(TopologyPhase::Idle);
        result
    }

    fn pass_inner(&self, nc: &NamingContext) -> Result<PassOutcome, SyncError> {
        let detect = self.config.detect_failed_dcs;
        let first = self.attempt(nc, detect)?;
        let outcome = if !first.connected && first.found_failed_dcs && detect {
            warn!(
                nc = %nc.id,
                components = first.component_count,
                "disconnected after excluding failed servers, retrying without detection"
            );
            self.attempt(nc, false)?.into_outcome(nc.id, true)
        } else {
            first.into_outcome(nc.id, false)
        };
        info!(
            nc = %nc.id,
            connected = outcome.connected,
            created = outcome.stats.created,
            kept = outcome.stats.kept,
            sources = outcome.sources_written,
            "topology pass complete"
        );
        Ok(outcome)
    }

    fn attempt(&self, nc: &NamingContext, detect_failed: bool) -> Result<Attempt, SyncError> {
        self.set_phase(TopologyPhase::Coloring);
        let mut graph = self.build_graph()?;
        let colors = color_vertices(
            &mut graph,
            self.store.as_ref(),
            nc,
            self.detector.as_ref(),
            detect_failed,
            self.config.randomized_bridgeheads,
        )?;

        self.set_phase(TopologyPhase::ForestBuilding);
        let mut acc = InternalEdgeAcc::new();
        let bridges: Vec<(TransportId, Vec<LinkId>)> = graph
            .edge_sets()
            .map(|set| (set.transport, set.members.clone()))
            .collect();
        for (transport, members) in bridges {
            for include_black in [false, true] {
                run_dijkstra(&mut graph, Some(transport), include_black);
                for &edge_id in &members {
                    if graph.find_edge(edge_id).is_err() {
                        debug!(edge = %edge_id, "bridge references an unknown link");
                        continue;
                    }
                    process_edge(&graph, edge_id, &mut acc)?;
                }
            }
        }

        self.set_phase(TopologyPhase::Processing);
        let all_edges = graph.edge_ids();
        for include_black in [false, true] {
            run_dijkstra(&mut graph, None, include_black);
            for &edge_id in &all_edges {
                process_edge(&graph, edge_id, &mut acc)?;
            }
        }
        debug!(
            nc = %nc.id,
            red = colors.red,
            black = colors.black,
            white = colors.white,
            internal = acc.len(),
            "forest runs complete"
        );

        self.set_phase(TopologyPhase::SpanningTree);
        let spanning = build_spanning_tree(&mut graph, acc.into_edges(), self.config.local_site)?;

        self.set_phase(TopologyPhase::Materializing);
        let materialized = materialize_connections(
            self.store.as_ref(),
            &graph,
            nc,
            self.config.local_site,
            &spanning.retained,
            self.detector.as_ref(),
            detect_failed,
            self.config.randomized_bridgeheads,
        )?;
        let sources_written = self.write_sources(nc, &materialized.keep)?;

        Ok(Attempt {
            found_failed_dcs: colors.found_failed_dcs,
            connected: spanning.connected,
            component_count: spanning.component_count,
            keep: materialized.keep,
            stats: materialized.stats,
            sources_written,
        })
    }

    /// Rewrites the partition's source records from the connections the
    /// pass kept that replicate into this server. Cursor and health
    /// state of surviving sources carries over untouched.
    fn write_sources(
        &self,
        nc: &NamingContext,
        keep: &HashSet<ConnId>,
    ) -> Result<usize, SyncError> {
        let mut previous: HashMap<DsaId, ReplSource> = self
            .store
            .reps_from(nc.id)?
            .into_iter()
            .map(|s| (s.source_guid, s))
            .collect();

        let mut inbound: Vec<_> = self
            .store
            .connections_into_site(self.config.local_site)?
            .into_iter()
            .filter(|c| keep.contains(&c.id) && c.to_dsa == self.config.local_dsa)
            .collect();
        inbound.sort_by_key(|c| c.from_dsa);

        let mut sources = Vec::with_capacity(inbound.len());
        for conn in inbound {
            let dns = self.store.dc(conn.from_dsa)?.dns;
            let mut record =
                ReplSource::new(conn.from_dsa, dns, conn.transport, conn.options, conn.schedule);
            if let Some(prev) = previous.remove(&conn.from_dsa) {
                record.invocation_id = prev.invocation_id;
                record.high_watermark = prev.high_watermark;
                record.consecutive_failures = prev.consecutive_failures;
                record.last_attempt_us = prev.last_attempt_us;
                record.last_success_us = prev.last_success_us;
                record.last_result = prev.last_result;
            }
            sources.push(record);
        }
        self.store.write_reps_from(nc.id, &sources)?;
        Ok(sources.len())
    }

    /// Runs one pass per partition, then deletes generated connections
    /// into this site that no partition kept. The sweep is skipped when
    /// any pass failed, so a path is never torn down on partial
    /// information.
    pub fn run_period(&self) -> Result<PeriodSummary, SyncError> {
        let ncs = self.store.naming_contexts()?;
        let mut summary = PeriodSummary::default();
        let mut keep_union: HashSet<ConnId> = HashSet::new();

        for nc in &ncs {
            match self.run_pass(nc) {
                Ok(outcome) => {
                    keep_union.extend(outcome.keep.iter().copied());
                    summary.passes.push(outcome);
                }
                Err(err) => {
                    warn!(nc = %nc.id, error = %err, "topology pass failed, keeping previous topology");
                    summary.failed += 1;
                }
            }
        }

        if summary.failed == 0 {
            for conn in self.store.connections_into_site(self.config.local_site)? {
                if conn.generated && !keep_union.contains(&conn.id) {
                    info!(conn = %conn.id, "removing superseded connection");
                    self.store.delete_connection(conn.id)?;
                    summary.removed += 1;
                }
            }
            summary.swept = true;
        }
        Ok(summary)
    }
}
