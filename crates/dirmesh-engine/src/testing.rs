//! In-process doubles for the remote-call seam, used by the engine's
//! own tests and by integration suites.
//!
//! A [`ScriptedDrs`] session answers `GetChanges` from a scripted reply
//! queue (an empty terminal reply once the script runs out) and records
//! every request it sees. A [`ScriptedTransport`] hands out one session
//! per host and can refuse binds or kill live sessions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dirmesh_model::transport::{BoundDrs, DrsTransport};
use dirmesh_model::wire::{PullReply, PullRequest, RefsRequest, SyncRequest};
use dirmesh_model::SyncError;

/// A scripted session to one fake partner.
pub struct ScriptedDrs {
    dns: String,
    alive: AtomicBool,
    replies: Mutex<VecDeque<Result<PullReply, SyncError>>>,
    sync_results: Mutex<VecDeque<Result<(), SyncError>>>,
    refs_results: Mutex<VecDeque<Result<(), SyncError>>>,
    pull_requests: Mutex<Vec<PullRequest>>,
    sync_requests: Mutex<Vec<SyncRequest>>,
    refs_requests: Mutex<Vec<RefsRequest>>,
}

impl ScriptedDrs {
    /// A live session for `dns` with an empty script.
    pub fn new(dns: impl Into<String>) -> Self {
        ScriptedDrs {
            dns: dns.into(),
            alive: AtomicBool::new(true),
            replies: Mutex::new(VecDeque::new()),
            sync_results: Mutex::new(VecDeque::new()),
            refs_results: Mutex::new(VecDeque::new()),
            pull_requests: Mutex::new(Vec::new()),
            sync_requests: Mutex::new(Vec::new()),
            refs_requests: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the next `GetChanges` reply.
    pub fn queue_reply(&self, reply: PullReply) {
        if let Ok(mut g) = self.replies.lock() {
            g.push_back(Ok(reply));
        }
    }

    /// Scripts the next `GetChanges` call to fail.
    pub fn queue_error(&self, err: SyncError) {
        if let Ok(mut g) = self.replies.lock() {
            g.push_back(Err(err));
        }
    }

    /// Scripts the next `ReplicaSync` call to fail.
    pub fn queue_sync_error(&self, err: SyncError) {
        if let Ok(mut g) = self.sync_results.lock() {
            g.push_back(Err(err));
        }
    }

    /// Scripts the next `UpdateRefs` call to fail.
    pub fn queue_refs_error(&self, err: SyncError) {
        if let Ok(mut g) = self.refs_results.lock() {
            g.push_back(Err(err));
        }
    }

    /// Marks the session dead or alive.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Every `GetChanges` request seen, in order.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pull_requests
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Every `ReplicaSync` request seen, in order.
    pub fn sync_requests(&self) -> Vec<SyncRequest> {
        self.sync_requests
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Every `UpdateRefs` request seen, in order.
    pub fn refs_requests(&self) -> Vec<RefsRequest> {
        self.refs_requests
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BoundDrs for ScriptedDrs {
    async fn get_changes(&self, req: PullRequest) -> Result<PullReply, SyncError> {
        let cursor = req.cursor;
        if let Ok(mut g) = self.pull_requests.lock() {
            g.push(req);
        }
        let scripted = self.replies.lock().ok().and_then(|mut g| g.pop_front());
        match scripted {
            Some(result) => result,
            None => Ok(PullReply::empty(cursor)),
        }
    }

    async fn replica_sync(&self, req: SyncRequest) -> Result<(), SyncError> {
        if let Ok(mut g) = self.sync_requests.lock() {
            g.push(req);
        }
        let scripted = self.sync_results.lock().ok().and_then(|mut g| g.pop_front());
        scripted.unwrap_or(Ok(()))
    }

    async fn update_refs(&self, req: RefsRequest) -> Result<(), SyncError> {
        if let Ok(mut g) = self.refs_requests.lock() {
            g.push(req);
        }
        let scripted = self.refs_results.lock().ok().and_then(|mut g| g.pop_front());
        scripted.unwrap_or(Ok(()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn peer_dns(&self) -> &str {
        &self.dns
    }
}

/// A transport over scripted sessions, one per host.
#[derive(Default)]
pub struct ScriptedTransport {
    sessions: Mutex<HashMap<String, Arc<ScriptedDrs>>>,
    refuse: Mutex<HashSet<String>>,
    bind_counts: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    /// A transport with no sessions yet.
    pub fn new() -> Self {
        ScriptedTransport::default()
    }

    /// The session for `dns`, creating it so tests can script replies
    /// before anything binds.
    pub fn session(&self, dns: &str) -> Arc<ScriptedDrs> {
        match self.sessions.lock() {
            Ok(mut g) => g
                .entry(dns.to_string())
                .or_insert_with(|| Arc::new(ScriptedDrs::new(dns)))
                .clone(),
            Err(_) => Arc::new(ScriptedDrs::new(dns)),
        }
    }

    /// Makes every future bind to `dns` fail.
    pub fn fail_bind(&self, dns: &str) {
        if let Ok(mut g) = self.refuse.lock() {
            g.insert(dns.to_string());
        }
    }

    /// Kills the current session for `dns`. The next bind hands out a
    /// fresh live one.
    pub fn kill(&self, dns: &str) {
        if let Ok(g) = self.sessions.lock() {
            if let Some(session) = g.get(dns) {
                session.set_alive(false);
            }
        }
    }

    /// How many times `dns` has been bound.
    pub fn bind_count(&self, dns: &str) -> usize {
        self.bind_counts
            .lock()
            .map(|g| g.get(dns).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DrsTransport for ScriptedTransport {
    async fn bind(&self, dns: &str) -> Result<Arc<dyn BoundDrs>, SyncError> {
        if let Ok(mut g) = self.bind_counts.lock() {
            *g.entry(dns.to_string()).or_insert(0) += 1;
        }
        let refused = self
            .refuse
            .lock()
            .map(|g| g.contains(dns))
            .unwrap_or(false);
        if refused {
            return Err(SyncError::remote(dns, "bind refused"));
        }
        let session = match self.sessions.lock() {
            Ok(mut g) => {
                let entry = g
                    .entry(dns.to_string())
                    .or_insert_with(|| Arc::new(ScriptedDrs::new(dns)));
                if !entry.is_alive() {
                    *entry = Arc::new(ScriptedDrs::new(dns));
                }
                entry.clone()
            }
            Err(_) => return Err(SyncError::inconsistent("session table poisoned")),
        };
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(cursor: u64) -> PullRequest {
        PullRequest {
            nc: Uuid::from_u128(20),
            dest_guid: Uuid::from_u128(2),
            dest_invocation: Uuid::from_u128(2),
            cursor,
            utd: Vec::new(),
            max_objects: 100,
            max_bytes: 1 << 20,
            options: 0,
            extended: None,
            target_usn: None,
        }
    }

    #[tokio::test]
    async fn unscripted_get_changes_returns_an_empty_terminal_reply() {
        let drs = ScriptedDrs::new("a.example.com");
        let reply = drs.get_changes(request(42)).await.unwrap();
        assert_eq!(reply.new_cursor, 42);
        assert!(!reply.more_data);
        assert_eq!(drs.pull_requests().len(), 1);
    }

    #[tokio::test]
    async fn scripted_replies_come_back_in_order() {
        let drs = ScriptedDrs::new("a.example.com");
        let mut first = PullReply::empty(10);
        first.more_data = true;
        drs.queue_reply(first);
        drs.queue_reply(PullReply::empty(20));

        assert!(drs.get_changes(request(0)).await.unwrap().more_data);
        assert_eq!(drs.get_changes(request(10)).await.unwrap().new_cursor, 20);
    }

    #[tokio::test]
    async fn scripted_errors_surface_once() {
        let drs = ScriptedDrs::new("a.example.com");
        drs.queue_error(SyncError::remote("a.example.com", "boom"));
        assert!(drs.get_changes(request(0)).await.is_err());
        assert!(drs.get_changes(request(0)).await.is_ok());
    }

    #[tokio::test]
    async fn transport_reuses_sessions_until_killed() {
        let transport = ScriptedTransport::new();
        let first = transport.bind("a.example.com").await.unwrap();
        let again = transport.bind("a.example.com").await.unwrap();
        assert!(first.is_alive());
        assert_eq!(transport.bind_count("a.example.com"), 2);
        assert!(Arc::ptr_eq(&first, &again));

        transport.kill("a.example.com");
        assert!(!first.is_alive());
        let fresh = transport.bind("a.example.com").await.unwrap();
        assert!(fresh.is_alive());
    }

    #[tokio::test]
    async fn refused_binds_fail() {
        let transport = ScriptedTransport::new();
        transport.fail_bind("bad.example.com");
        assert!(transport.bind("bad.example.com").await.is_err());
        assert!(transport.bind("good.example.com").await.is_ok());
    }
}
