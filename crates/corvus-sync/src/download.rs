//! Per-peer block download controller.
//!
//! Missions (outstanding block downloads keyed by hash) are routed
//! across the peers that claimed the hash, with per-peer concurrency
//! bounds and idle-peer detection. There is no per-request timeout:
//! capacity is freed when a block arrives, and the free-peer pass
//! reconciles everything else against the block cache.

use crate::SyncConfig;
use corvus_p2p::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// State of a mission.
///
/// `Confirmed` is terminal and represented by removal from the mission
/// table; a dispatched mission returns to `Pending` when its peer's
/// slot is purged or the request lands in the failed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionState {
    /// Waiting for a free peer.
    Pending,
    /// A block request is out to exactly one peer.
    Dispatched,
}

/// An outstanding block download, keyed by hash in the mission table.
struct Mission {
    number: i64,
    /// Every peer that claimed the hash; any of them may serve it.
    peers: HashSet<PeerId>,
    state: MissionState,
}

/// Per-peer dispatch bookkeeping.
struct PeerSlot {
    in_flight: HashSet<Vec<u8>>,
    failed: HashSet<Vec<u8>>,
    last_active: Instant,
    capacity: usize,
}

impl PeerSlot {
    fn new(capacity: usize) -> Self {
        Self {
            in_flight: HashSet::new(),
            failed: HashSet::new(),
            last_active: Instant::now(),
            capacity,
        }
    }

    fn is_busy(&self) -> bool {
        self.in_flight.len() >= self.capacity
    }

    fn is_dead(&self, dead_after: Duration) -> bool {
        self.last_active.elapsed() > dead_after
    }
}

/// Mission table and peer slots behind one coarse lock.
struct ControllerState {
    missions: HashMap<Vec<u8>, Mission>,
    slots: HashMap<PeerId, PeerSlot>,
}

impl ControllerState {
    /// Drop a mission and scrub its hash from every slot.
    fn remove_mission(&mut self, hash: &[u8]) {
        self.missions.remove(hash);
        for slot in self.slots.values_mut() {
            slot.in_flight.remove(hash);
            slot.failed.remove(hash);
        }
    }
}

/// Download statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Missions in the table.
    pub missions: usize,
    /// Missions waiting for a peer.
    pub pending: usize,
    /// Missions with a request in flight.
    pub dispatched: usize,
    /// Tracked peer slots.
    pub peers: usize,
}

/// Routes block download missions across live peers.
pub struct DownloadController {
    state: Mutex<ControllerState>,
    /// Woken on new missions and freed capacity.
    wake: Notify,
    shutdown: watch::Sender<bool>,
    peer_capacity: usize,
    dead_after: Duration,
    purge_after: Duration,
    tick: Duration,
    free_tick: Duration,
}

impl DownloadController {
    /// Create a controller from the sync configuration.
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                missions: HashMap::new(),
                slots: HashMap::new(),
            }),
            wake: Notify::new(),
            shutdown: watch::Sender::new(false),
            peer_capacity: config.peer_capacity,
            dead_after: Duration::from_secs(config.peer_dead_secs),
            purge_after: Duration::from_secs(config.peer_purge_secs),
            tick: Duration::from_secs(crate::DOWNLOAD_TICK_SECS),
            free_tick: Duration::from_secs(config.retry_secs),
        }
    }

    /// Register `hash` for download, claiming `peer` as a source.
    ///
    /// Idempotent on hash: repeated calls union the peer into the
    /// existing mission. Callers pre-check that the block is absent.
    pub fn create_mission(&self, hash: Vec<u8>, number: i64, peer: PeerId) {
        {
            let mut state = self.state.lock();
            state
                .slots
                .entry(peer.clone())
                .or_insert_with(|| PeerSlot::new(self.peer_capacity));
            let mission = state.missions.entry(hash).or_insert_with(|| {
                debug!(number, "new download mission");
                Mission {
                    number,
                    peers: HashSet::new(),
                    state: MissionState::Pending,
                }
            });
            mission.peers.insert(peer);
        }
        self.wake.notify_one();
    }

    /// A block arrived from `peer`: free its slot and finish the mission.
    pub fn on_block_received(&self, peer: &PeerId, hash: &[u8]) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(peer) {
                slot.last_active = Instant::now();
            }
            state.remove_mission(hash);
        }
        self.wake.notify_one();
    }

    /// Drop all missions and clear every slot's in-flight and failed
    /// sets. The slots themselves survive.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        info!(
            missions = state.missions.len(),
            peers = state.slots.len(),
            "download controller reset"
        );
        state.missions.clear();
        for slot in state.slots.values_mut() {
            slot.in_flight.clear();
            slot.failed.clear();
        }
    }

    /// Signal both loops to exit.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.wake.notify_waiters();
    }

    /// State of the mission for `hash`, if it is still outstanding.
    pub fn mission_state(&self, hash: &[u8]) -> Option<MissionState> {
        self.state.lock().missions.get(hash).map(|m| m.state)
    }

    /// Current statistics.
    pub fn stats(&self) -> DownloadStats {
        let state = self.state.lock();
        let pending = state
            .missions
            .values()
            .filter(|m| m.state == MissionState::Pending)
            .count();
        DownloadStats {
            missions: state.missions.len(),
            pending,
            dispatched: state.missions.len() - pending,
            peers: state.slots.len(),
        }
    }

    /// Dispatch loop: walk pending missions and hand each to a free
    /// claiming peer.
    ///
    /// `request_fn(hash, number, peer)` returns `(sent, confirmed)`:
    /// `sent` means a request went out and the peer's slot is charged;
    /// `confirmed` means the caller already has the block and the
    /// mission is finished; neither means the peer failed for this hash
    /// and the next claimant is tried.
    pub async fn download_loop<F>(&self, request_fn: F)
    where
        F: Fn(&[u8], i64, &PeerId) -> (bool, bool) + Send + Sync,
    {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => continue,
            }
            self.dispatch_round(&request_fn);
        }
    }

    /// Free-peer loop: reconcile failed and in-flight hashes against
    /// the block cache via `has_block_fn(hash, number)`, and purge
    /// slots idle past the purge window.
    pub async fn free_peer_loop<F>(&self, has_block_fn: F)
    where
        F: Fn(&[u8], i64) -> bool + Send + Sync,
    {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.free_tick) => {}
                _ = shutdown.changed() => continue,
            }
            self.reconcile(&has_block_fn);
            self.purge_idle();
        }
    }

    /// One pass over pending missions.
    fn dispatch_round<F>(&self, request_fn: &F)
    where
        F: Fn(&[u8], i64, &PeerId) -> (bool, bool),
    {
        let pending: Vec<Vec<u8>> = {
            let state = self.state.lock();
            state
                .missions
                .iter()
                .filter(|(_, m)| m.state == MissionState::Pending)
                .map(|(hash, _)| hash.clone())
                .collect()
        };
        for hash in pending {
            self.try_dispatch(&hash, request_fn);
        }
    }

    /// Try claimants for one mission until a request is out, the block
    /// is confirmed present, or no eligible peer remains.
    fn try_dispatch<F>(&self, hash: &[u8], request_fn: &F)
    where
        F: Fn(&[u8], i64, &PeerId) -> (bool, bool),
    {
        loop {
            let picked = {
                let state = self.state.lock();
                let Some(mission) = state.missions.get(hash) else {
                    return;
                };
                if mission.state != MissionState::Pending {
                    return;
                }
                let number = mission.number;
                Self::pick_peer(&state, mission, hash, self.dead_after)
                    .map(|peer| (number, peer))
            };
            // Stuck: every claimant busy, dead, or already failed.
            let Some((number, peer)) = picked else {
                return;
            };

            // The lock is never held across the request callback.
            let (sent, confirmed) = request_fn(hash, number, &peer);

            let mut state = self.state.lock();
            if confirmed {
                debug!(number, hash = %hex::encode(hash), "mission confirmed");
                state.remove_mission(hash);
                return;
            }
            if sent {
                if let Some(mission) = state.missions.get_mut(hash) {
                    mission.state = MissionState::Dispatched;
                }
                if let Some(slot) = state.slots.get_mut(&peer) {
                    slot.in_flight.insert(hash.to_vec());
                    slot.last_active = Instant::now();
                }
                debug!(number, peer = %peer, "mission dispatched");
                return;
            }
            if let Some(slot) = state.slots.get_mut(&peer) {
                slot.failed.insert(hash.to_vec());
            }
        }
    }

    /// Best eligible claimant: fewest in-flight requests, then least
    /// recently active.
    fn pick_peer(
        state: &ControllerState,
        mission: &Mission,
        hash: &[u8],
        dead_after: Duration,
    ) -> Option<PeerId> {
        let mut best: Option<(usize, Instant, PeerId)> = None;
        for peer in &mission.peers {
            let Some(slot) = state.slots.get(peer) else {
                continue;
            };
            if slot.is_dead(dead_after)
                || slot.is_busy()
                || slot.failed.contains(hash)
                || slot.in_flight.contains(hash)
            {
                continue;
            }
            let candidate = (slot.in_flight.len(), slot.last_active);
            let better = match &best {
                Some((len, active, _)) => candidate < (*len, *active),
                None => true,
            };
            if better {
                best = Some((candidate.0, candidate.1, peer.clone()));
            }
        }
        best.map(|(_, _, peer)| peer)
    }

    /// Complete missions whose block showed up through another path.
    fn reconcile<F>(&self, has_block_fn: &F)
    where
        F: Fn(&[u8], i64) -> bool,
    {
        let candidates: Vec<(Vec<u8>, Option<i64>)> = {
            let state = self.state.lock();
            let mut hashes: HashSet<Vec<u8>> = HashSet::new();
            for slot in state.slots.values() {
                hashes.extend(slot.failed.iter().cloned());
                hashes.extend(slot.in_flight.iter().cloned());
            }
            hashes
                .into_iter()
                .map(|hash| {
                    let number = state.missions.get(&hash).map(|m| m.number);
                    (hash, number)
                })
                .collect()
        };

        let mut done = Vec::new();
        for (hash, number) in candidates {
            match number {
                // Hash with no mission left: scrub it.
                None => done.push(hash),
                Some(number) if has_block_fn(&hash, number) => done.push(hash),
                Some(_) => {}
            }
        }
        if done.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock();
            for hash in &done {
                state.remove_mission(hash);
            }
        }
        debug!(count = done.len(), "reconciled completed downloads");
        self.wake.notify_one();
    }

    /// Remove slots idle past the purge window; their in-flight
    /// missions go back to pending.
    fn purge_idle(&self) {
        let mut state = self.state.lock();
        let idle: Vec<PeerId> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.last_active.elapsed() > self.purge_after)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in idle {
            if let Some(slot) = state.slots.remove(&peer) {
                warn!(peer = %peer, "purged idle peer slot");
                for hash in slot.in_flight {
                    if let Some(mission) = state.missions.get_mut(&hash) {
                        mission.state = MissionState::Pending;
                    }
                }
            }
        }
    }
}
