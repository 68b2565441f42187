//! Pending-operation queues: one for pulls, one for notifies.
//!
//! Each queue feeds a single in-flight slot, so at most one pull and one
//! notify run at any time. Starting is oldest-first by scheduled time;
//! when both slots are free the pull goes first unless the notify was
//! scheduled strictly earlier. Duplicate work coalesces while pending
//! instead of queueing twice.

use uuid::Uuid;

use dirmesh_model::ids::{DsaId, NcId, Usn};
use dirmesh_model::wire::{ExtendedOp, FsmoRole};

/// What a queued pull asks the partner for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    /// Incremental changes past the cursor.
    Ordinary,
    /// Role transfer piggybacked on a pull.
    FsmoTransfer(FsmoRole),
    /// Fresh identifier-pool allocation from the pool master.
    RidAllocation,
    /// Immediate replication of one secret-bearing object.
    SecretReplication(Uuid),
}

impl PullKind {
    /// The wire form, `None` for an ordinary sync.
    pub fn extended(&self) -> Option<ExtendedOp> {
        match *self {
            PullKind::Ordinary => None,
            PullKind::FsmoTransfer(role) => Some(ExtendedOp::FsmoTransfer { role }),
            PullKind::RidAllocation => Some(ExtendedOp::RidAllocation),
            PullKind::SecretReplication(object) => {
                Some(ExtendedOp::SecretReplication { object })
            }
        }
    }
}

/// A queued pull from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPull {
    /// Partition to pull.
    pub nc: NcId,
    /// Source to pull from.
    pub source: DsaId,
    /// Ordinary or extended.
    pub kind: PullKind,
    /// Option bits for the request.
    pub options: u32,
    /// True if the pull should not wait for the polling schedule.
    pub urgent: bool,
    /// Source USN the pull must reach, for extended operations.
    pub target_usn: Option<Usn>,
    /// When the pull was asked for, microseconds.
    pub scheduled_us: u64,
}

/// A queued notify to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingNotify {
    /// Partition with new changes.
    pub nc: NcId,
    /// Target to tell.
    pub target: DsaId,
    /// Option bits for the request.
    pub options: u32,
    /// True for urgent changes.
    pub urgent: bool,
    /// Local USN tip the target should learn about.
    pub target_usn: Usn,
    /// When the notify was asked for, microseconds.
    pub scheduled_us: u64,
}

/// One operation handed out for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartedOp {
    /// A pull now occupying the pull slot.
    Pull(PendingPull),
    /// A notify now occupying the notify slot.
    Notify(PendingNotify),
}

/// The dual queue. Callers serialize access; the engine keeps it behind
/// one async lock.
#[derive(Debug, Default)]
pub struct OpScheduler {
    pulls: Vec<PendingPull>,
    notifies: Vec<PendingNotify>,
    current_pull: Option<PendingPull>,
    current_notify: Option<PendingNotify>,
}

impl OpScheduler {
    /// An empty scheduler with both slots free.
    pub fn new() -> Self {
        OpScheduler::default()
    }

    /// Queues a pull, coalescing with a pending pull for the same
    /// partition, source and kind: the earlier scheduled time wins,
    /// urgency and options accumulate, and the higher target USN sticks.
    /// Returns false if the pull was folded into an existing entry.
    pub fn schedule_pull(&mut self, op: PendingPull) -> bool {
        if let Some(pending) = self
            .pulls
            .iter_mut()
            .find(|p| p.nc == op.nc && p.source == op.source && p.kind == op.kind)
        {
            pending.scheduled_us = pending.scheduled_us.min(op.scheduled_us);
            pending.urgent |= op.urgent;
            pending.options |= op.options;
            pending.target_usn = pending.target_usn.max(op.target_usn);
            return false;
        }
        self.pulls.push(op);
        true
    }

    /// Queues a notify. A pending notify for the same partition, target,
    /// urgency and options just takes the higher USN in place.
    /// Returns false if the notify was folded into an existing entry.
    pub fn schedule_notify(&mut self, op: PendingNotify) -> bool {
        if let Some(pending) = self.notifies.iter_mut().find(|n| {
            n.nc == op.nc && n.target == op.target && n.urgent == op.urgent && n.options == op.options
        }) {
            pending.target_usn = pending.target_usn.max(op.target_usn);
            pending.scheduled_us = pending.scheduled_us.min(op.scheduled_us);
            return false;
        }
        self.notifies.push(op);
        true
    }

    fn pop_oldest_pull(&mut self) -> Option<PendingPull> {
        let idx = self
            .pulls
            .iter()
            .enumerate()
            .min_by_key(|(_, op)| op.scheduled_us)
            .map(|(i, _)| i)?;
        Some(self.pulls.remove(idx))
    }

    fn pop_oldest_notify(&mut self) -> Option<PendingNotify> {
        let idx = self
            .notifies
            .iter()
            .enumerate()
            .min_by_key(|(_, op)| op.scheduled_us)
            .map(|(i, _)| i)?;
        Some(self.notifies.remove(idx))
    }

    /// Starts at most one operation into a free slot and returns it.
    /// With both slots free and both queues non-empty, the pull starts
    /// first unless the notify was scheduled strictly earlier. `None`
    /// means no slot can start anything right now.
    pub fn start_next(&mut self) -> Option<StartedOp> {
        let pull_free = self.current_pull.is_none() && !self.pulls.is_empty();
        let notify_free = self.current_notify.is_none() && !self.notifies.is_empty();

        let start_pull = match (pull_free, notify_free) {
            (false, false) => return None,
            (true, false) => true,
            (false, true) => false,
            (true, true) => {
                let oldest_pull = self.pulls.iter().map(|p| p.scheduled_us).min();
                let oldest_notify = self.notifies.iter().map(|n| n.scheduled_us).min();
                oldest_pull <= oldest_notify
            }
        };

        if start_pull {
            let op = self.pop_oldest_pull()?;
            self.current_pull = Some(op);
            Some(StartedOp::Pull(op))
        } else {
            let op = self.pop_oldest_notify()?;
            self.current_notify = Some(op);
            Some(StartedOp::Notify(op))
        }
    }

    /// Clears the pull slot, returning what was running.
    pub fn complete_pull(&mut self) -> Option<PendingPull> {
        self.current_pull.take()
    }

    /// Clears the notify slot, returning what was running.
    pub fn complete_notify(&mut self) -> Option<PendingNotify> {
        self.current_notify.take()
    }

    /// The pull in flight, if any.
    pub fn current_pull(&self) -> Option<&PendingPull> {
        self.current_pull.as_ref()
    }

    /// The notify in flight, if any.
    pub fn current_notify(&self) -> Option<&PendingNotify> {
        self.current_notify.as_ref()
    }

    /// Queued pulls not yet started.
    pub fn pull_backlog(&self) -> usize {
        self.pulls.len()
    }

    /// Queued notifies not yet started.
    pub fn notify_backlog(&self) -> usize {
        self.notifies.len()
    }

    /// True if nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.pulls.is_empty()
            && self.notifies.is_empty()
            && self.current_pull.is_none()
            && self.current_notify.is_none()
    }
}
