//! Peer-reported height registry.

use corvus_p2p::PeerId;
use dashmap::DashMap;
use tracing::debug;

/// A height report from one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHeight {
    /// Reported head number.
    pub height: i64,
    /// When the report was made (unix seconds, reporter's clock).
    pub reported_at: i64,
}

/// Latest reported height per peer, with freshness tracking.
///
/// `record` runs on the message loop while `sample` runs on the check
/// timer; the map tolerates both without external locking.
pub struct HeightBook {
    entries: DashMap<PeerId, PeerHeight>,
    /// Reports fresher than this many seconds count into the median.
    available_secs: i64,
    /// Reports older than this many seconds are dropped on scan.
    timeout_secs: i64,
}

impl HeightBook {
    /// Create a registry with the given freshness windows.
    pub fn new(available_secs: i64, timeout_secs: i64) -> Self {
        Self {
            entries: DashMap::new(),
            available_secs,
            timeout_secs,
        }
    }

    /// Insert or replace a peer's report. No-op when the height is
    /// unchanged, so a chatty peer does not refresh its own entry.
    pub fn record(&self, peer: PeerId, height: i64, reported_at: i64) {
        if let Some(existing) = self.entries.get(&peer) {
            if existing.height == height {
                return;
            }
        }
        debug!(peer = %peer, height, reported_at, "recorded peer height");
        self.entries.insert(
            peer,
            PeerHeight {
                height,
                reported_at,
            },
        );
    }

    /// Sorted height samples: `local_head` first, then one entry per
    /// fresh peer. Expired entries are removed as a side effect.
    pub fn sample(&self, local_head: i64, now: i64) -> Vec<i64> {
        let mut samples = vec![local_head];
        let mut expired = Vec::new();

        for entry in self.entries.iter() {
            let report = *entry.value();
            if report.reported_at + self.timeout_secs < now {
                expired.push(entry.key().clone());
                continue;
            }
            if report.reported_at + self.available_secs < now {
                // Stale: kept, but not sampled.
                continue;
            }
            samples.push(report.height);
        }

        for peer in expired {
            self.entries.remove(&peer);
        }

        samples.sort_unstable();
        samples
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no peer has reported.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes(vec![seed; 4])
    }

    fn book() -> HeightBook {
        HeightBook::new(crate::HEIGHT_AVAILABLE_SECS, crate::HEIGHT_TIMEOUT_SECS)
    }

    #[test]
    fn test_record_same_height_is_idempotent() {
        let book = book();
        book.record(peer(1), 100, 10);
        book.record(peer(1), 100, 9999);

        // The original report survives: the duplicate did not refresh it.
        let samples = book.sample(0, 10);
        assert_eq!(samples, vec![0, 100]);
    }

    #[test]
    fn test_record_replaces_on_new_height() {
        let book = book();
        book.record(peer(1), 100, 10);
        book.record(peer(1), 120, 20);

        assert_eq!(book.sample(0, 20), vec![0, 120]);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_sample_is_sorted_and_counts_fresh_peers() {
        let book = book();
        book.record(peer(1), 220, 1000);
        book.record(peer(2), 200, 1000);
        book.record(peer(3), 210, 1000);

        let samples = book.sample(100, 1000);
        assert_eq!(samples, vec![100, 200, 210, 220]);
        assert_eq!(samples.len(), 1 + book.len());
    }

    #[test]
    fn test_stale_is_skipped_expired_is_removed() {
        let book = book();
        let now = 10_000;
        book.record(peer(1), 50, now - crate::HEIGHT_AVAILABLE_SECS - 1); // stale
        book.record(peer(2), 60, now - crate::HEIGHT_TIMEOUT_SECS - 1); // expired
        book.record(peer(3), 70, now); // fresh

        assert_eq!(book.sample(40, now), vec![40, 70]);
        assert_eq!(book.len(), 2); // expired peer gone, stale peer kept

        // No entry older than the timeout survives a scan.
        book.sample(40, now);
        assert!(book
            .sample(40, now)
            .iter()
            .all(|h| *h == 40 || *h == 70));
    }

    #[test]
    fn test_sample_without_peers_is_local_head_only() {
        let book = book();
        assert_eq!(book.sample(123, 0), vec![123]);
    }
}
