//! Block-cache and blockchain contracts.
//!
//! The synchronizer consumes both through these traits; the concrete
//! implementations (the in-memory block tree and the persistent store)
//! live with the node, not here.

use crate::Block;
use std::sync::Arc;

/// Link state of a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Connected to the confirmed chain through its ancestors.
    Linked,
    /// Received but not yet connected (orphan).
    Single,
}

/// A node in the in-memory block tree.
///
/// Nodes form a parent-linked tree rooted at the last confirmed block.
#[derive(Debug, Clone)]
pub struct CacheNode {
    /// Block number.
    pub number: i64,
    /// Block hash.
    pub hash: Vec<u8>,
    /// Producer of the block.
    pub witness: String,
    /// Link state.
    pub link: LinkKind,
    /// Parent node, absent for the root.
    pub parent: Option<Arc<CacheNode>>,
    /// The block itself.
    pub block: Block,
}

/// In-memory tree of recently received blocks.
pub trait BlockCache: Send + Sync {
    /// Best-known tip of the tree.
    fn head(&self) -> Arc<CacheNode>;

    /// Highest confirmed node.
    fn linked_root(&self) -> Arc<CacheNode>;

    /// Look up a node by block hash.
    fn find(&self, hash: &[u8]) -> Option<Arc<CacheNode>>;

    /// Look up a block by number on the head chain.
    fn block_by_number(&self, number: i64) -> Option<Block>;
}

/// Persistent confirmed chain.
pub trait Blockchain: Send + Sync {
    /// Number of blocks on disk.
    fn length(&self) -> i64;

    /// Hash of the block at `number`.
    fn hash_by_number(&self, number: i64) -> Option<Vec<u8>>;

    /// Encoded block bytes for `hash`.
    fn block_bytes_by_hash(&self, hash: &[u8]) -> Option<Vec<u8>>;
}
