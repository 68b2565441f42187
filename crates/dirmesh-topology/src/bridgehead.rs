//! Bridgehead selection: which server in a site terminates inter-site
//! replication for a partition and transport.

use std::collections::HashSet;
use std::sync::RwLock;

use rand::seq::SliceRandom;

use dirmesh_model::ids::{DsaId, NcId, SiteId, TransportId};
use dirmesh_model::objects::DcDef;
use dirmesh_model::store::DirectoryStore;
use dirmesh_model::SyncError;

/// Decides whether a server should be excluded from bridgehead duty.
pub trait FailureDetector: Send + Sync {
    /// True if the server is considered failed.
    fn is_failed(&self, dc: &DcDef) -> bool;
}

/// Detector that never excludes anyone. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailures;

impl FailureDetector for NoFailures {
    fn is_failed(&self, _dc: &DcDef) -> bool {
        false
    }
}

/// Detector backed by an explicitly maintained list of stale servers.
#[derive(Debug, Default)]
pub struct StaleLinkList {
    failed: RwLock<HashSet<DsaId>>,
}

impl StaleLinkList {
    /// An empty list.
    pub fn new() -> Self {
        StaleLinkList::default()
    }

    /// Marks a server as failed.
    pub fn mark_failed(&self, guid: DsaId) {
        if let Ok(mut g) = self.failed.write() {
            g.insert(guid);
        }
    }

    /// Clears a server's failed mark.
    pub fn mark_recovered(&self, guid: DsaId) {
        if let Ok(mut g) = self.failed.write() {
            g.remove(&guid);
        }
    }

    /// Number of servers currently marked failed.
    pub fn len(&self) -> usize {
        self.failed.read().map(|g| g.len()).unwrap_or(0)
    }

    /// True if no server is marked failed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FailureDetector for StaleLinkList {
    fn is_failed(&self, dc: &DcDef) -> bool {
        self.failed
            .read()
            .map(|g| g.contains(&dc.guid))
            .unwrap_or(false)
    }
}

/// Outcome of one bridgehead search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeheadSearch {
    /// A bridgehead was selected.
    Found(DcDef),
    /// Candidates existed but the failure detector excluded all of them.
    /// Topology passes record this and may retry with detection off.
    AllExcluded,
    /// No server in the site can serve this partition over this
    /// transport at all.
    NoCandidate,
}

/// Picks the bridgehead for `site` serving `nc` over `transport`.
///
/// Candidates come from the store; with `detect_failed` the detector
/// prunes them first. Selection is pseudo-random when `randomized`,
/// otherwise global-catalog servers come first and ties break on GUID,
/// so repeated passes pick the same server.
pub fn select_bridgehead(
    store: &dyn DirectoryStore,
    site: SiteId,
    nc: NcId,
    transport: TransportId,
    need_full: bool,
    detector: &dyn FailureDetector,
    detect_failed: bool,
    randomized: bool,
) -> Result<BridgeheadSearch, SyncError> {
    let mut candidates = store.eligible_bridgeheads(site, nc, transport, need_full)?;
    if candidates.is_empty() {
        return Ok(BridgeheadSearch::NoCandidate);
    }
    if detect_failed {
        candidates.retain(|dc| !detector.is_failed(dc));
        if candidates.is_empty() {
            return Ok(BridgeheadSearch::AllExcluded);
        }
    }
    if randomized {
        candidates.shuffle(&mut rand::thread_rng());
    } else {
        candidates.sort_by_key(|dc| (!dc.is_gc, dc.guid));
    }
    Ok(BridgeheadSearch::Found(candidates.swap_remove(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmesh_model::memory::MemoryStore;
    use dirmesh_model::objects::{NamingContext, NcKind};
    use uuid::Uuid;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn store_with_dcs(dcs: &[(u128, bool)]) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .add_nc(NamingContext {
                id: id(20),
                dn: "dc=example".into(),
                kind: NcKind::Domain,
                writable: true,
            })
            .unwrap();
        for (guid, is_gc) in dcs {
            store
                .add_dc(DcDef {
                    guid: id(*guid),
                    site: id(10),
                    dns: format!("dc{guid}.example.com"),
                    is_gc: *is_gc,
                    transports: vec![id(100)],
                    full_ncs: vec![id(20)],
                    partial_ncs: vec![],
                })
                .unwrap();
        }
        store
    }

    fn search(
        store: &MemoryStore,
        detector: &dyn FailureDetector,
        detect: bool,
    ) -> BridgeheadSearch {
        select_bridgehead(store, id(10), id(20), id(100), true, detector, detect, false).unwrap()
    }

    #[test]
    fn deterministic_selection_prefers_gc_then_lowest_guid() {
        let store = store_with_dcs(&[(3, false), (1, false), (2, true)]);
        match search(&store, &NoFailures, true) {
            BridgeheadSearch::Found(dc) => assert_eq!(dc.guid, id(2)),
            other => panic!("expected a bridgehead, got {other:?}"),
        }

        let store = store_with_dcs(&[(3, false), (1, false)]);
        match search(&store, &NoFailures, true) {
            BridgeheadSearch::Found(dc) => assert_eq!(dc.guid, id(1)),
            other => panic!("expected a bridgehead, got {other:?}"),
        }
    }

    #[test]
    fn empty_site_has_no_candidate() {
        let store = store_with_dcs(&[]);
        assert_eq!(search(&store, &NoFailures, true), BridgeheadSearch::NoCandidate);
    }

    #[test]
    fn all_failed_is_distinguished_from_no_candidate() {
        let store = store_with_dcs(&[(1, false)]);
        let detector = StaleLinkList::new();
        detector.mark_failed(id(1));

        assert_eq!(search(&store, &detector, true), BridgeheadSearch::AllExcluded);
        // With detection off the same site yields a bridgehead.
        match search(&store, &detector, false) {
            BridgeheadSearch::Found(dc) => assert_eq!(dc.guid, id(1)),
            other => panic!("expected a bridgehead, got {other:?}"),
        }
    }

    #[test]
    fn detector_prunes_failed_candidates() {
        let store = store_with_dcs(&[(1, false), (2, false)]);
        let detector = StaleLinkList::new();
        detector.mark_failed(id(1));

        match search(&store, &detector, true) {
            BridgeheadSearch::Found(dc) => assert_eq!(dc.guid, id(2)),
            other => panic!("expected a bridgehead, got {other:?}"),
        }

        detector.mark_recovered(id(1));
        assert!(detector.is_empty());
        match search(&store, &detector, true) {
            BridgeheadSearch::Found(dc) => assert_eq!(dc.guid, id(1)),
            other => panic!("expected a bridgehead, got {other:?}"),
        }
    }

    #[test]
    fn randomized_selection_still_picks_an_eligible_dc() {
        let store = store_with_dcs(&[(1, false), (2, false), (3, false)]);
        for _ in 0..8 {
            match select_bridgehead(
                &store,
                id(10),
                id(20),
                id(100),
                true,
                &NoFailures,
                true,
                true,
            )
            .unwrap()
            {
                BridgeheadSearch::Found(dc) => {
                    assert!([id(1), id(2), id(3)].contains(&dc.guid))
                }
                other => panic!("expected a bridgehead, got {other:?}"),
            }
        }
    }
}
