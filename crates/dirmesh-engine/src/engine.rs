//! The replication engine: one service instance per server.
//!
//! The engine owns the topology scheduler, the partition registry, the
//! dual operation queue, and the protocol drivers, and wires them to
//! three timers. The topology timer runs a full period (passes, registry
//! refresh, due-work scheduling, pump); the pump timer drains the
//! queues; the sweep timer handles identifier-pool pressure, tombstone
//! retention, and lagging notify targets. Operation failures never stop
//! the loops; they are counted, logged, and retried next period.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dirmesh_model::ids::{DsaId, NcId, Usn};
use dirmesh_model::metadata::{ReplSource, ReplTarget, UtdEntry};
use dirmesh_model::objects::{options, LocalDsa, NamingContext, NcKind};
use dirmesh_model::schedule::Schedule;
use dirmesh_model::store::{AttrMetaEntry, DirectoryStore};
use dirmesh_model::time::now_us;
use dirmesh_model::transport::DrsTransport;
use dirmesh_model::wire::{FsmoRole, RefsRequest};
use dirmesh_model::SyncError;
use dirmesh_topology::scheduler::{PeriodSummary, TopologyConfig, TopologyScheduler};

use crate::notify::NotifyDriver;
use crate::opqueue::{OpScheduler, PendingNotify, PendingPull, PullKind, StartedOp};
use crate::pull::PullDriver;
use crate::registry::{RefreshSummary, Registry};
use crate::triggers::{PeriodicTimer, TriggerConfig};

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Object cap per GetChanges batch.
    pub max_objects_per_batch: u32,
    /// Byte cap per GetChanges batch.
    pub max_bytes_per_batch: u32,
    /// Consecutive failures after which a source is logged at warn.
    /// Retries continue regardless.
    pub failure_warn_threshold: u32,
    /// How long tombstones are kept before the sweep removes them.
    pub tombstone_retention_us: u64,
    /// Pick bridgeheads pseudo-randomly instead of GC-first by GUID.
    pub randomized_bridgeheads: bool,
    /// Exclude servers the failure detector flags from bridgehead
    /// selection.
    pub detect_failed_dcs: bool,
    /// Timer intervals.
    pub triggers: TriggerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_objects_per_batch: 100,
            max_bytes_per_batch: 1 << 20,
            failure_warn_threshold: 3,
            tombstone_retention_us: 180 * 24 * 3_600 * 1_000_000,
            randomized_bridgeheads: false,
            detect_failed_dcs: true,
            triggers: TriggerConfig::default(),
        }
    }
}

/// Lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting work and running timers.
    Running,
    /// Timers stopped and submissions refused; in-flight operations
    /// finish on their own.
    ShuttingDown,
}

/// Counters for one inbound source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    /// Pull cycles started.
    pub pulls_attempted: u64,
    /// Pull cycles fully committed.
    pub pulls_succeeded: u64,
    /// Pull cycles ended by an error.
    pub pulls_failed: u64,
    /// Objects applied.
    pub objects_applied: u64,
    /// Linked values applied.
    pub linked_values_applied: u64,
}

/// Counters for one outbound notify target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TargetStats {
    /// Notifies started.
    pub notifies_attempted: u64,
    /// Notifies delivered.
    pub notifies_sent: u64,
    /// Notifies ended by an error.
    pub notifies_failed: u64,
}

/// Engine-wide counters.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    sources: HashMap<(NcId, DsaId), SourceStats>,
    targets: HashMap<(NcId, DsaId), TargetStats>,
    /// Topology periods completed.
    pub topology_periods: u64,
    /// Maintenance sweeps completed.
    pub sweeps: u64,
}

impl EngineStats {
    /// Counters for one source; zeroed if it never ran.
    pub fn source(&self, nc: NcId, source: DsaId) -> SourceStats {
        self.sources.get(&(nc, source)).copied().unwrap_or_default()
    }

    /// Counters for one target; zeroed if it never ran.
    pub fn target(&self, nc: NcId, target: DsaId) -> TargetStats {
        self.targets.get(&(nc, target)).copied().unwrap_or_default()
    }

    fn source_mut(&mut self, nc: NcId, source: DsaId) -> &mut SourceStats {
        self.sources.entry((nc, source)).or_default()
    }

    fn target_mut(&mut self, nc: NcId, target: DsaId) -> &mut TargetStats {
        self.targets.entry((nc, target)).or_default()
    }
}

/// Read-only introspection snapshot of one partition.
#[derive(Debug, Clone)]
pub struct ReplicationInfo {
    /// Inbound partner records.
    pub neighbors: Vec<ReplSource>,
    /// Outbound notify-target records.
    pub targets: Vec<ReplTarget>,
    /// Up-to-dateness vector.
    pub cursors: Vec<UtdEntry>,
    /// Per-attribute metadata of committed objects.
    pub attribute_metadata: Vec<AttrMetaEntry>,
}

/// One replication service instance.
pub struct SyncEngine {
    store: Arc<dyn DirectoryStore>,
    local: LocalDsa,
    config: EngineConfig,
    topology: TopologyScheduler,
    pull_driver: PullDriver,
    notify_driver: NotifyDriver,
    registry: Mutex<Registry>,
    ops: Mutex<OpScheduler>,
    stats: Mutex<EngineStats>,
    shutdown: watch::Sender<bool>,
    topology_timer: PeriodicTimer,
    pump_timer: PeriodicTimer,
    sweep_timer: PeriodicTimer,
}

impl SyncEngine {
    /// Builds an engine over the given store and transport. Call
    /// [`init`](Self::init) once, then [`start`](Self::start).
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        transport: Arc<dyn DrsTransport>,
        local: LocalDsa,
        config: EngineConfig,
    ) -> Arc<SyncEngine> {
        let mut topo = TopologyConfig::new(local.site, local.guid);
        topo.randomized_bridgeheads = config.randomized_bridgeheads;
        topo.detect_failed_dcs = config.detect_failed_dcs;
        let (shutdown, _) = watch::channel(false);
        Arc::new(SyncEngine {
            topology: TopologyScheduler::new(store.clone(), topo),
            pull_driver: PullDriver::new(
                store.clone(),
                local.clone(),
                config.max_objects_per_batch,
                config.max_bytes_per_batch,
            ),
            notify_driver: NotifyDriver::new(store.clone(), local.clone()),
            registry: Mutex::new(Registry::new(store.clone(), transport)),
            ops: Mutex::new(OpScheduler::new()),
            stats: Mutex::new(EngineStats::default()),
            topology_timer: PeriodicTimer::new(
                config.triggers.topology_interval,
                config.triggers.max_jitter,
            ),
            pump_timer: PeriodicTimer::new(
                config.triggers.pump_interval,
                config.triggers.max_jitter,
            ),
            sweep_timer: PeriodicTimer::new(
                config.triggers.sweep_interval,
                config.triggers.max_jitter,
            ),
            shutdown,
            store,
            local,
            config,
        })
    }

    /// Loads the partition mirrors from the store.
    pub async fn init(&self) -> Result<RefreshSummary, SyncError> {
        self.registry.lock().await.load_partitions()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        if *self.shutdown.borrow() {
            EngineState::ShuttingDown
        } else {
            EngineState::Running
        }
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::ShuttingDown => Err(SyncError::Shutdown),
        }
    }

    /// Spawns the timer loops driving topology periods, the operation
    /// pump, and the maintenance sweep.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.subscribe();
            while engine.topology_timer.tick(&mut shutdown).await {
                engine.run_topology_period().await;
            }
            debug!("topology timer stopped");
        });
        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.subscribe();
            while engine.pump_timer.tick(&mut shutdown).await {
                engine.run_pending().await;
            }
            debug!("pump timer stopped");
        });
        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.subscribe();
            while engine.sweep_timer.tick(&mut shutdown).await {
                engine.run_sweep().await;
            }
            debug!("sweep timer stopped");
        });
    }

    /// Stops the timers and refuses further submissions. In-flight
    /// operations finish; the store handle is released when the engine
    /// drops.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        let _ = self.shutdown.send(true);
    }

    /// One topology period: per-partition passes, registry refresh, due
    /// work scheduling, then the pump.
    pub async fn run_topology_period(&self) -> PeriodSummary {
        let summary = match self.topology.run_period() {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "topology period failed");
                PeriodSummary::default()
            }
        };
        {
            let mut registry = self.registry.lock().await;
            match registry.refresh_all() {
                Ok(refresh) => debug!(
                    refreshed = refresh.refreshed,
                    failed = refresh.failed,
                    "registry refreshed"
                ),
                Err(err) => warn!(error = %err, "registry refresh failed"),
            }
        }
        if let Err(err) = self.schedule_due_work().await {
            warn!(error = %err, "due-work scheduling failed");
        }
        self.run_pending().await;
        self.stats.lock().await.topology_periods += 1;
        summary
    }

    /// Queues a pull for every source whose polling schedule is open
    /// now, then notifies for targets behind the local USN tip.
    async fn schedule_due_work(&self) -> Result<(), SyncError> {
        let now = now_us();
        let slot = Schedule::slot_at(now);
        {
            let registry = self.registry.lock().await;
            let mut ops = self.ops.lock().await;
            for part in registry.partitions() {
                for source in &part.sources {
                    if !source.record.schedule.is_open(slot) {
                        continue;
                    }
                    ops.schedule_pull(PendingPull {
                        nc: part.nc.id,
                        source: source.guid(),
                        kind: PullKind::Ordinary,
                        options: 0,
                        urgent: false,
                        target_usn: None,
                        scheduled_us: now,
                    });
                }
            }
        }
        self.schedule_lagging_notifies().await
    }

    async fn schedule_lagging_notifies(&self) -> Result<(), SyncError> {
        let now = now_us();
        let registry = self.registry.lock().await;
        let mut ops = self.ops.lock().await;
        for part in registry.partitions() {
            let tip = self.store.local_usn(part.nc.id)?;
            for target in part.notify_targets.iter().filter(|t| t.notified_usn < tip) {
                ops.schedule_notify(notify_op(&part.nc, target, tip, false, now));
            }
        }
        Ok(())
    }

    /// Starts and finishes queued operations until both queues drain.
    /// At most one pull and one notify is in flight at any time.
    pub async fn run_pending(&self) {
        loop {
            let next = self.ops.lock().await.start_next();
            match next {
                Some(StartedOp::Pull(op)) => {
                    self.execute_pull(&op).await;
                    self.ops.lock().await.complete_pull();
                }
                Some(StartedOp::Notify(op)) => {
                    self.execute_notify(&op).await;
                    self.ops.lock().await.complete_notify();
                }
                None => return,
            }
        }
    }

    async fn execute_pull(&self, op: &PendingPull) {
        self.stats
            .lock()
            .await
            .source_mut(op.nc, op.source)
            .pulls_attempted += 1;

        let attached = {
            let mut registry = self.registry.lock().await;
            registry.attach_connection(op.nc, op.source).await
        };
        let connection = match attached {
            Ok(conn) => conn,
            Err(err) => {
                warn!(nc = %op.nc, source = %op.source, error = %err, "source unreachable");
                // The driver never ran, so the store record is stamped
                // here before mirroring.
                let code = err.code();
                if let Err(err) = self.store.record_pull_failure(op.nc, op.source, code, now_us())
                {
                    warn!(nc = %op.nc, source = %op.source, error = %err, "pull failure not recorded");
                }
                self.mirror_pull_failure(op, code).await;
                return;
            }
        };

        match self.pull_driver.run(op, connection.session.as_ref()).await {
            Ok(outcome) => {
                self.registry.lock().await.mirror_success(
                    op.nc,
                    op.source,
                    outcome.final_cursor,
                    None,
                    now_us(),
                );
                let mut stats = self.stats.lock().await;
                let entry = stats.source_mut(op.nc, op.source);
                entry.pulls_succeeded += 1;
                entry.objects_applied += outcome.objects as u64;
                entry.linked_values_applied += outcome.linked_values as u64;
            }
            Err(err) => {
                debug!(nc = %op.nc, source = %op.source, error = %err, "pull failed");
                self.mirror_pull_failure(op, err.code()).await;
            }
        }
    }

    async fn mirror_pull_failure(&self, op: &PendingPull, result_code: u32) {
        let failures = {
            let mut registry = self.registry.lock().await;
            registry.mirror_failure(op.nc, op.source, result_code, now_us());
            registry
                .find_source_by_guid(op.nc, op.source)
                .map(|s| s.record.consecutive_failures)
                .unwrap_or(0)
        };
        if failures >= self.config.failure_warn_threshold {
            warn!(
                nc = %op.nc,
                source = %op.source,
                failures,
                "source keeps failing; retries continue"
            );
        }
        self.stats
            .lock()
            .await
            .source_mut(op.nc, op.source)
            .pulls_failed += 1;
    }

    async fn execute_notify(&self, op: &PendingNotify) {
        self.stats
            .lock()
            .await
            .target_mut(op.nc, op.target)
            .notifies_attempted += 1;

        let result = self.notify_once(op).await;
        match result {
            Ok(notified) => {
                self.registry
                    .lock()
                    .await
                    .mirror_notified(op.nc, op.target, notified);
                self.stats
                    .lock()
                    .await
                    .target_mut(op.nc, op.target)
                    .notifies_sent += 1;
            }
            Err(err) => {
                debug!(
                    nc = %op.nc,
                    target = %op.target,
                    error = %err,
                    "notify failed, record left for the next period"
                );
                self.stats
                    .lock()
                    .await
                    .target_mut(op.nc, op.target)
                    .notifies_failed += 1;
            }
        }
    }

    async fn notify_once(&self, op: &PendingNotify) -> Result<Usn, SyncError> {
        let dns = self
            .store
            .reps_to(op.nc)?
            .into_iter()
            .find(|t| t.target_guid == op.target)
            .map(|t| t.target_dns)
            .ok_or_else(|| SyncError::not_found("notify target", op.target))?;
        let connection = {
            let mut registry = self.registry.lock().await;
            registry.connect(&dns).await?
        };
        self.notify_driver
            .run(op, connection.session.as_ref())
            .await
    }

    /// Low-frequency maintenance: identifier-pool pressure, expired
    /// tombstones, and partners behind the local USN tip.
    pub async fn run_sweep(&self) {
        match self.store.rid_pool() {
            Ok(status) if status.needs_allocation() => {
                if let Err(err) = self.request_rid_allocation().await {
                    warn!(error = %err, "identifier-pool request not queued");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "identifier-pool state unreadable"),
        }

        match self
            .store
            .remove_expired_tombstones(self.config.tombstone_retention_us, now_us())
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "expired tombstones removed"),
            Err(err) => warn!(error = %err, "tombstone cleanup failed"),
        }

        if let Err(err) = self.schedule_lagging_notifies().await {
            warn!(error = %err, "notify scheduling failed");
        }

        self.run_pending().await;
        self.stats.lock().await.sweeps += 1;
    }

    async fn request_rid_allocation(&self) -> Result<(), SyncError> {
        let domain = self
            .store
            .naming_contexts()?
            .into_iter()
            .find(|nc| nc.kind == NcKind::Domain && nc.writable)
            .ok_or_else(|| SyncError::not_found("naming context", "writable domain"))?;
        let owner = self
            .store
            .fsmo_owner(domain.id, FsmoRole::Rid)?
            .ok_or_else(|| SyncError::not_found("role owner", "rid"))?;
        if owner == self.local.guid {
            // The owner allocates locally; nothing to pull.
            return Ok(());
        }
        info!(nc = %domain.id, %owner, "identifier pool low, requesting an allocation");
        self.ops.lock().await.schedule_pull(PendingPull {
            nc: domain.id,
            source: owner,
            kind: PullKind::RidAllocation,
            options: options::URGENT,
            urgent: true,
            target_usn: None,
            scheduled_us: now_us(),
        });
        Ok(())
    }

    /// Queues an administrative pull from `source` ahead of schedule
    /// and kicks the pump.
    pub async fn replica_sync(&self, nc: NcId, source: DsaId, flags: u32) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.require_source(nc, source).await?;
        self.ops.lock().await.schedule_pull(PendingPull {
            nc,
            source,
            kind: PullKind::Ordinary,
            options: flags,
            urgent: flags & options::URGENT != 0,
            target_usn: None,
            scheduled_us: now_us(),
        });
        self.pump_timer.fire_now();
        Ok(())
    }

    /// Rebuilds the partition mirrors from the store.
    pub async fn refresh(&self) -> Result<RefreshSummary, SyncError> {
        self.ensure_running()?;
        self.registry.lock().await.refresh_all()
    }

    /// Read-only introspection snapshot of one partition.
    pub async fn replication_info(&self, nc: NcId) -> Result<ReplicationInfo, SyncError> {
        self.store.naming_context(nc)?;
        Ok(ReplicationInfo {
            neighbors: self.store.reps_from(nc)?,
            targets: self.store.reps_to(nc)?,
            cursors: self.store.utd_vector(nc)?,
            attribute_metadata: self.store.attribute_metadata(nc)?,
        })
    }

    /// Asks the current owner of `role` for `nc` to hand it over. The
    /// transfer rides an extended pull from the owner.
    pub async fn take_fsmo_role(&self, nc: NcId, role: FsmoRole) -> Result<(), SyncError> {
        self.ensure_running()?;
        let owner = self
            .store
            .fsmo_owner(nc, role)?
            .ok_or_else(|| SyncError::not_found("role owner", format!("{role:?}")))?;
        if owner == self.local.guid {
            debug!(?role, "role already held locally");
            return Ok(());
        }
        self.require_source(nc, owner).await?;
        self.ops.lock().await.schedule_pull(PendingPull {
            nc,
            source: owner,
            kind: PullKind::FsmoTransfer(role),
            options: options::URGENT,
            urgent: true,
            target_usn: None,
            scheduled_us: now_us(),
        });
        self.pump_timer.fire_now();
        Ok(())
    }

    /// Replicates one secret-bearing object from `source` immediately.
    pub async fn trigger_secret_replication(
        &self,
        nc: NcId,
        source: DsaId,
        object: Uuid,
    ) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.require_source(nc, source).await?;
        self.ops.lock().await.schedule_pull(PendingPull {
            nc,
            source,
            kind: PullKind::SecretReplication(object),
            options: options::URGENT,
            urgent: true,
            target_usn: None,
            scheduled_us: now_us(),
        });
        self.pump_timer.fire_now();
        Ok(())
    }

    /// Applies a partner's reference update to this server's outbound
    /// notify list. Add and delete together replace the record.
    pub async fn apply_update_refs(&self, req: &RefsRequest) -> Result<(), SyncError> {
        self.ensure_running()?;
        let add = req.options & options::REF_ADD != 0;
        let delete = req.options & options::REF_DELETE != 0;
        if !add && !delete {
            return Err(SyncError::Unsupported {
                msg: format!("reference update options {:#x}", req.options),
            });
        }
        let stored = req.options & !(options::REF_ADD | options::REF_DELETE);
        let mut targets = self.store.reps_to(req.nc)?;
        if delete {
            targets.retain(|t| t.target_guid != req.dest_guid);
        }
        if add {
            match targets.iter_mut().find(|t| t.target_guid == req.dest_guid) {
                Some(existing) => {
                    existing.target_dns = req.dest_dns.clone();
                    existing.options = stored;
                }
                None => targets.push(ReplTarget::new(req.dest_guid, req.dest_dns.clone(), stored)),
            }
        }
        self.store.write_reps_to(req.nc, &targets)?;
        let mut registry = self.registry.lock().await;
        if let Err(err) = registry.refresh_partition(req.nc) {
            debug!(nc = %req.nc, error = %err, "reference change not mirrored");
        }
        Ok(())
    }

    /// Notes locally originated changes for `nc`. Urgent changes kick
    /// the pump immediately; routine ones ride the next pump run.
    pub async fn on_local_change(&self, nc: NcId, urgent: bool) -> Result<(), SyncError> {
        self.ensure_running()?;
        let context = self.store.naming_context(nc)?;
        let tip = self.store.local_usn(nc)?;
        let targets = self.store.reps_to(nc)?;
        let now = now_us();
        {
            let mut ops = self.ops.lock().await;
            for target in targets.iter().filter(|t| t.notified_usn < tip) {
                ops.schedule_notify(notify_op(&context, target, tip, urgent, now));
            }
        }
        if urgent {
            self.pump_timer.fire_now();
        }
        Ok(())
    }

    /// Snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.lock().await.clone()
    }

    /// Pending pulls and notifies not yet started.
    pub async fn backlog(&self) -> (usize, usize) {
        let ops = self.ops.lock().await;
        (ops.pull_backlog(), ops.notify_backlog())
    }

    async fn require_source(&self, nc: NcId, source: DsaId) -> Result<(), SyncError> {
        let registry = self.registry.lock().await;
        registry
            .find_source_by_guid(nc, source)
            .map(|_| ())
            .ok_or_else(|| SyncError::not_found("source", source))
    }
}

fn notify_op(
    nc: &NamingContext,
    target: &ReplTarget,
    tip: Usn,
    urgent: bool,
    now: u64,
) -> PendingNotify {
    let mut flags = target.options & options::ASYNC_NOTIFY;
    if nc.writable {
        flags |= options::WRITABLE;
    }
    PendingNotify {
        nc: nc.id,
        target: target.target_guid,
        options: flags,
        urgent,
        target_usn: tip,
        scheduled_us: now,
    }
}
