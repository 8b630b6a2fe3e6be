//! Query answering over the cache and chain contracts.

use corvus_chain::{BlockCache, Blockchain};
use corvus_p2p::{
    BlockHashQuery, BlockHashResponse, BlockInfo, MessageKind, PeerId, PeerService, Priority,
    QueryKind,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers hash and block queries from peers.
///
/// Lookups go to the in-memory cache first and fall back to the
/// persistent chain below the cache root. Missing numbers are silently
/// omitted; empty responses are never sent.
pub struct ProtocolHandler {
    service: Arc<dyn PeerService>,
    cache: Arc<dyn BlockCache>,
    chain: Arc<dyn Blockchain>,
}

impl ProtocolHandler {
    /// Create a handler over the given collaborators.
    pub fn new(
        service: Arc<dyn PeerService>,
        cache: Arc<dyn BlockCache>,
        chain: Arc<dyn Blockchain>,
    ) -> Self {
        Self {
            service,
            cache,
            chain,
        }
    }

    /// Answer a hash query with a unicast response.
    pub fn handle_hash_query(&self, query: &BlockHashQuery, from: &PeerId) {
        if query.end < query.start || query.start < 0 {
            return;
        }

        let response = match query.req_type {
            QueryKind::Range => self.block_hashes(query.start, query.end),
            QueryKind::ByNumber => self.block_hashes_by_nums(&query.nums),
        };

        if response.block_infos.is_empty() {
            return;
        }
        if let Err(e) = self.service.send_to_peer(
            from,
            response.encode(),
            MessageKind::BlockHashResponse,
            Priority::Normal,
        ) {
            warn!(peer = %from, error = %e, "failed to send hash response");
        }
    }

    /// Answer a block query with the encoded block, cache first.
    pub fn handle_block_query(&self, request: &BlockInfo, from: &PeerId) {
        let bytes = match self.cache.find(&request.hash) {
            Some(node) => node.block.encode(),
            None => match self.chain.block_bytes_by_hash(&request.hash) {
                Some(bytes) => bytes.into(),
                None => {
                    warn!(
                        number = request.number,
                        hash = %hex::encode(&request.hash),
                        "block query for unknown block"
                    );
                    return;
                }
            },
        };
        if let Err(e) =
            self.service
                .send_to_peer(from, bytes, MessageKind::BlockResponse, Priority::Normal)
        {
            warn!(peer = %from, error = %e, "failed to send block");
        }
    }

    /// Hashes for `[start, end]`, clamped to the cache head.
    ///
    /// Walks the head chain downward, falling back to the persistent
    /// chain below the cache root, then reverses into ascending order.
    pub fn block_hashes(&self, start: i64, mut end: i64) -> BlockHashResponse {
        let head = self.cache.head();
        if end > head.number {
            end = head.number;
        }

        let mut infos = Vec::new();
        let mut cursor = Some(head);
        let mut number = end;
        while number >= start {
            while let Some(node) = cursor.clone() {
                if number >= node.number {
                    break;
                }
                cursor = node.parent.clone();
            }
            let hash = match cursor.as_ref() {
                Some(node) if node.number == number => Some(node.hash.clone()),
                _ => self.chain.hash_by_number(number),
            };
            match hash {
                Some(hash) => infos.push(BlockInfo { number, hash }),
                None => debug!(number, "no hash for number"),
            }
            number -= 1;
        }
        infos.reverse();
        BlockHashResponse { block_infos: infos }
    }

    /// Hashes for each listed number, cache first.
    pub fn block_hashes_by_nums(&self, nums: &[i64]) -> BlockHashResponse {
        let mut infos = Vec::with_capacity(nums.len());
        for &number in nums {
            let hash = self
                .cache
                .block_by_number(number)
                .map(|block| block.hash())
                .or_else(|| self.chain.hash_by_number(number));
            if let Some(hash) = hash {
                infos.push(BlockInfo { number, hash });
            }
        }
        BlockHashResponse { block_infos: infos }
    }
}
