//! # corvus-sync
//!
//! Block synchronization for the corvus node.
//!
//! This crate provides:
//! - Net-height estimation from gossiped peer heights
//! - Bulk catch-up via ranged block hash queries
//! - A per-peer download controller with capacity and liveness tracking
//! - Retry of hash queries that never got an answer
//! - Mode transitions (init / normal / sync) driven by observed height

mod download;
mod error;
mod heights;
mod protocol;
mod sync;
mod tracker;

pub use download::{DownloadController, DownloadStats, MissionState};
pub use error::{SyncError, SyncResult};
pub use heights::HeightBook;
pub use protocol::ProtocolHandler;
pub use sync::Synchronizer;
pub use tracker::RequestTracker;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Depth of the confirmation window, in witness rounds.
pub const CONFIRM_NUM: i64 = 8;

/// Maximum numbers covered by a single ranged hash query.
pub const MAX_HASH_BATCH: i64 = 100;

/// Seconds between retry sweeps of unanswered hash queries.
pub const RETRY_SECS: u64 = 5;

/// Seconds between sync / fork-drift checks.
pub const CHECK_SECS: u64 = 3;

/// Seconds between height gossip broadcasts.
pub const HEIGHT_GOSSIP_SECS: u64 = 3;

/// A reported peer height counts as fresh for this many seconds.
pub const HEIGHT_AVAILABLE_SECS: i64 = 66;

/// A reported peer height is dropped entirely after this many seconds.
pub const HEIGHT_TIMEOUT_SECS: i64 = 6600;

/// Continuity bound: more single-witness blocks than this in the
/// confirmation window means the local chain has drifted onto a fork.
pub const CONTINUOUS_NUM: i64 = 5;

/// Blocks behind the network before switching to sync mode.
pub const SYNC_THRESHOLD: i64 = 11 * CONTINUOUS_NUM;

/// Concurrent block requests a single peer will be given.
pub const PEER_CAPACITY: usize = 3;

/// Seconds of inactivity before a peer slot is skipped by dispatch.
pub const PEER_DEAD_SECS: u64 = 60;

/// Seconds of inactivity before a peer slot is removed.
pub const PEER_PURGE_SECS: u64 = 600;

/// Seconds between download dispatch rounds (also woken by new work).
pub const DOWNLOAD_TICK_SECS: u64 = 1;

/// Backpressure pause while the cache digests fetched blocks.
pub const SYNC_BACKPRESSURE: Duration = Duration::from_millis(500);

/// Sync configuration.
///
/// Every tunable has a default taken from the crate constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identity of the local block producer.
    #[serde(default)]
    pub node_id: String,
    /// Depth of the confirmation window.
    pub confirm_num: i64,
    /// Maximum numbers per ranged hash query.
    pub max_hash_batch: i64,
    /// Seconds between retry sweeps.
    pub retry_secs: u64,
    /// Seconds between sync checks.
    pub check_secs: u64,
    /// Seconds between height gossip broadcasts.
    pub height_gossip_secs: u64,
    /// Freshness window for reported heights, seconds.
    pub height_available_secs: i64,
    /// Expiry for reported heights, seconds.
    pub height_timeout_secs: i64,
    /// Witness continuity bound.
    pub continuous_num: i64,
    /// Blocks behind the network before syncing.
    pub sync_threshold: i64,
    /// Concurrent block requests per peer.
    pub peer_capacity: usize,
    /// Seconds of peer inactivity before dispatch skips it.
    pub peer_dead_secs: u64,
    /// Seconds of peer inactivity before its slot is removed.
    pub peer_purge_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            confirm_num: CONFIRM_NUM,
            max_hash_batch: MAX_HASH_BATCH,
            retry_secs: RETRY_SECS,
            check_secs: CHECK_SECS,
            height_gossip_secs: HEIGHT_GOSSIP_SECS,
            height_available_secs: HEIGHT_AVAILABLE_SECS,
            height_timeout_secs: HEIGHT_TIMEOUT_SECS,
            continuous_num: CONTINUOUS_NUM,
            sync_threshold: SYNC_THRESHOLD,
            peer_capacity: PEER_CAPACITY,
            peer_dead_secs: PEER_DEAD_SECS,
            peer_purge_secs: PEER_PURGE_SECS,
        }
    }
}

impl SyncConfig {
    /// Interval between retry sweeps.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }

    /// Interval between sync checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_secs)
    }

    /// Interval between height gossip broadcasts.
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.height_gossip_secs)
    }
}
