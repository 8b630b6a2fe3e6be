//! Pending hash-query tracker.

use dashmap::DashMap;

/// Block numbers we have asked about but received no hash for.
///
/// Marked when a query goes out, cleared when a response names the
/// number; the retry sweep re-queries whatever is left.
#[derive(Default)]
pub struct RequestTracker {
    pending: DashMap<i64, ()>,
}

impl RequestTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a number as awaiting a hash.
    pub fn mark_pending(&self, number: i64) {
        self.pending.insert(number, ());
    }

    /// Clear a number after its hash arrived.
    pub fn clear(&self, number: i64) {
        self.pending.remove(&number);
    }

    /// Sorted, non-destructive copy of the pending set.
    pub fn snapshot_sorted(&self) -> Vec<i64> {
        let mut nums: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        nums.sort_unstable();
        nums
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a number is pending.
    pub fn contains(&self, number: i64) -> bool {
        self.pending.contains_key(&number)
    }
}
