//! Candidate pool: the set of peers usable as circuit hops.
//!
//! Peers enter the pool through inbound introductions from the overlay. A
//! non-bootstrap peer is live while its last introduction falls within the
//! freshness window. Bootstrap peers are directory-style nodes: they are
//! tracked so the overlay can walk through them, but they never fire
//! heartbeats and are never offered for hop selection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

/// Maximum candidates tracked at once.
/// SECURITY: Bounds memory from introduction floods; least recently
/// introduced peers are evicted first.
pub const MAX_CANDIDATES: usize = 4_096;

/// Default liveness window for non-bootstrap candidates.
pub const DEFAULT_CANDIDATE_FRESHNESS: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub is_bootstrap: bool,
}

impl Candidate {
    pub fn is_live_at(&self, now: Instant, freshness: Duration) -> bool {
        !self.is_bootstrap && now.saturating_duration_since(self.last_seen) <= freshness
    }
}

pub struct CandidatePool {
    candidates: LruCache<SocketAddr, Candidate>,
    bootstrap: HashSet<SocketAddr>,
    freshness: Duration,
}

impl CandidatePool {
    pub fn new(freshness: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_CANDIDATES).expect("MAX_CANDIDATES must be non-zero");
        Self {
            candidates: LruCache::new(cap),
            bootstrap: HashSet::new(),
            freshness,
        }
    }

    /// Mark `addr` as a bootstrap peer. Any existing record is flagged too.
    pub fn add_bootstrap(&mut self, addr: SocketAddr) {
        self.bootstrap.insert(addr);
        if let Some(candidate) = self.candidates.peek_mut(&addr) {
            candidate.is_bootstrap = true;
        }
    }

    pub fn is_bootstrap(&self, addr: &SocketAddr) -> bool {
        self.bootstrap.contains(addr)
    }

    pub fn bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.bootstrap.iter().copied().collect()
    }

    /// Record or refresh `peer`. Returns `true` when a heartbeat should be
    /// fired into the circuit table, which is never the case for bootstrap
    /// peers.
    pub fn on_inbound_introduction(&mut self, peer: SocketAddr) -> bool {
        self.on_inbound_introduction_at(peer, Instant::now())
    }

    pub fn on_inbound_introduction_at(&mut self, peer: SocketAddr, now: Instant) -> bool {
        let is_bootstrap = self.bootstrap.contains(&peer);
        match self.candidates.get_mut(&peer) {
            Some(candidate) => candidate.last_seen = now,
            None => {
                if let Some((evicted, _)) = self.candidates.push(
                    peer,
                    Candidate { addr: peer, last_seen: now, is_bootstrap },
                ) && evicted != peer
                {
                    debug!(peer = %evicted, "candidate pool full, evicted least recent peer");
                }
                trace!(peer = %peer, bootstrap = is_bootstrap, "new candidate");
            }
        }
        !is_bootstrap
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&Candidate> {
        self.candidates.peek(peer)
    }

    pub fn is_live(&self, peer: &SocketAddr) -> bool {
        let now = Instant::now();
        self.get(peer)
            .is_some_and(|c| c.is_live_at(now, self.freshness))
    }

    /// Current live, non-bootstrap candidates. Order carries no meaning.
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<Candidate> {
        self.candidates
            .iter()
            .filter(|(_, c)| c.is_live_at(now, self.freshness))
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// A uniformly chosen live candidate other than `exclude`.
    pub fn random_live(&self, exclude: Option<SocketAddr>) -> Option<SocketAddr> {
        let live: Vec<SocketAddr> = self
            .snapshot()
            .into_iter()
            .map(|c| c.addr)
            .filter(|addr| Some(*addr) != exclude)
            .collect();
        live.choose(&mut rand::thread_rng()).copied()
    }

    /// Drop stale non-bootstrap candidates. The returned addresses are lost
    /// neighbors as far as the tunnel is concerned.
    pub fn prune(&mut self) -> Vec<SocketAddr> {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&mut self, now: Instant) -> Vec<SocketAddr> {
        let stale: Vec<SocketAddr> = self
            .candidates
            .iter()
            .filter(|(_, c)| !c.is_bootstrap && !c.is_live_at(now, self.freshness))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            self.candidates.pop(addr);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "pruned stale candidates");
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl Default for CandidatePool {
    fn default() -> Self {
        Self::new(DEFAULT_CANDIDATE_FRESHNESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_introduction_fires_heartbeat_for_regular_peers() {
        let mut pool = CandidatePool::default();
        assert!(pool.on_inbound_introduction(addr(1000)));
        // Refreshing fires again.
        assert!(pool.on_inbound_introduction(addr(1000)));
        assert_eq!(pool.len(), 1);
        assert!(pool.is_live(&addr(1000)));
    }

    #[test]
    fn test_bootstrap_peers_never_heartbeat_or_get_selected() {
        let mut pool = CandidatePool::default();
        pool.add_bootstrap(addr(9000));

        assert!(!pool.on_inbound_introduction(addr(9000)));
        assert!(pool.get(&addr(9000)).unwrap().is_bootstrap);
        assert!(!pool.is_live(&addr(9000)));
        assert!(pool.snapshot().is_empty());
        assert_eq!(pool.random_live(None), None);
        assert_eq!(pool.bootstrap_peers(), vec![addr(9000)]);
    }

    #[test]
    fn test_late_bootstrap_flag_applies_to_existing_record() {
        let mut pool = CandidatePool::default();
        pool.on_inbound_introduction(addr(9001));
        pool.add_bootstrap(addr(9001));
        assert!(pool.snapshot().is_empty());
    }

    #[test]
    fn test_liveness_follows_freshness_window() {
        let mut pool = CandidatePool::new(Duration::from_secs(10));
        let start = Instant::now();
        pool.on_inbound_introduction_at(addr(1), start);
        pool.on_inbound_introduction_at(addr(2), start + Duration::from_secs(8));

        let later = start + Duration::from_secs(15);
        let live: Vec<SocketAddr> = pool.snapshot_at(later).into_iter().map(|c| c.addr).collect();
        assert_eq!(live, vec![addr(2)]);

        let removed = pool.prune_at(later);
        assert_eq!(removed, vec![addr(1)]);
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&addr(1)).is_none());
    }

    #[test]
    fn test_prune_keeps_bootstrap_records() {
        let mut pool = CandidatePool::new(Duration::from_secs(1));
        pool.add_bootstrap(addr(9000));
        let start = Instant::now();
        pool.on_inbound_introduction_at(addr(9000), start);

        assert!(pool.prune_at(start + Duration::from_secs(60)).is_empty());
        assert!(pool.get(&addr(9000)).is_some());
    }

    #[test]
    fn test_random_live_respects_exclusion() {
        let mut pool = CandidatePool::default();
        pool.on_inbound_introduction(addr(1));
        assert_eq!(pool.random_live(Some(addr(1))), None);

        pool.on_inbound_introduction(addr(2));
        for _ in 0..20 {
            assert_eq!(pool.random_live(Some(addr(1))), Some(addr(2)));
        }
    }
}
