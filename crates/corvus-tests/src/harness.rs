//! Test harness: in-memory transport, cache, and chain doubles.

use bytes::Bytes;
use corvus_chain::{Block, BlockCache, Blockchain, CacheNode, LinkKind};
use corvus_p2p::{IncomingMessage, MessageKind, P2pError, P2pResult, PeerId, PeerService, Priority};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Install a test subscriber once per process.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Poll `cond` until it holds or the budget runs out.
pub async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A message the node under test handed to the transport.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Unicast target, `None` for broadcasts.
    pub to: Option<PeerId>,
    /// Message kind.
    pub kind: MessageKind,
    /// Encoded body.
    pub data: Bytes,
    /// Requested priority.
    pub priority: Priority,
}

/// In-memory transport hub.
///
/// Records every outbound send and routes injected messages into the
/// node's subscriptions.
#[derive(Default)]
pub struct HubService {
    routes: Mutex<HashMap<MessageKind, mpsc::UnboundedSender<IncomingMessage>>>,
    sent: Mutex<Vec<SentMessage>>,
    fail_unicast: AtomicBool,
}

impl HubService {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a message as if `from` had sent it.
    pub fn deliver(&self, from: PeerId, kind: MessageKind, data: Bytes) -> bool {
        let routes = self.routes.lock();
        match routes.get(&kind) {
            Some(tx) => tx.send(IncomingMessage { from, kind, data }).is_ok(),
            None => false,
        }
    }

    /// Everything sent so far, in order.
    pub fn sent_of_kind(&self, kind: MessageKind) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }

    /// Drain the send log.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Make unicast sends fail, simulating an unreachable peer.
    pub fn set_fail_unicast(&self, fail: bool) {
        self.fail_unicast.store(fail, Ordering::SeqCst);
    }
}

impl PeerService for HubService {
    fn register(
        &self,
        _topic: &str,
        kinds: &[MessageKind],
    ) -> P2pResult<mpsc::UnboundedReceiver<IncomingMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock();
        for kind in kinds {
            routes.insert(*kind, tx.clone());
        }
        Ok(rx)
    }

    fn broadcast(&self, data: Bytes, kind: MessageKind, priority: Priority) -> P2pResult<()> {
        self.sent.lock().push(SentMessage {
            to: None,
            kind,
            data,
            priority,
        });
        Ok(())
    }

    fn send_to_peer(
        &self,
        peer: &PeerId,
        data: Bytes,
        kind: MessageKind,
        priority: Priority,
    ) -> P2pResult<()> {
        if self.fail_unicast.load(Ordering::SeqCst) {
            return Err(P2pError::PeerNotFound(peer.to_string()));
        }
        self.sent.lock().push(SentMessage {
            to: Some(peer.clone()),
            kind,
            data,
            priority,
        });
        Ok(())
    }
}

struct CacheInner {
    head: Arc<CacheNode>,
    root: Arc<CacheNode>,
    by_hash: HashMap<Vec<u8>, Arc<CacheNode>>,
    by_number: HashMap<i64, Arc<CacheNode>>,
}

/// In-memory block cache double: a single linked head chain plus any
/// number of unlinked singles.
pub struct MemoryCache {
    inner: RwLock<CacheInner>,
}

impl MemoryCache {
    /// Build a cache holding `blocks` as its linked head chain. The
    /// first block becomes the linked root.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        assert!(!blocks.is_empty(), "cache needs at least a root block");
        let mut by_hash = HashMap::new();
        let mut by_number = HashMap::new();
        let mut parent: Option<Arc<CacheNode>> = None;
        let mut root = None;
        for block in blocks {
            let node = Arc::new(CacheNode {
                number: block.head.number,
                hash: block.hash(),
                witness: block.head.witness.clone(),
                link: LinkKind::Linked,
                parent: parent.clone(),
                block: block.clone(),
            });
            by_hash.insert(node.hash.clone(), node.clone());
            by_number.insert(node.number, node.clone());
            if root.is_none() {
                root = Some(node.clone());
            }
            parent = Some(node);
        }
        let head = parent.expect("non-empty chain");
        Self {
            inner: RwLock::new(CacheInner {
                head,
                root: root.expect("non-empty chain"),
                by_hash,
                by_number,
            }),
        }
    }

    /// Append a block to the head chain.
    pub fn push_block(&self, block: Block) {
        let mut inner = self.inner.write();
        let node = Arc::new(CacheNode {
            number: block.head.number,
            hash: block.hash(),
            witness: block.head.witness.clone(),
            link: LinkKind::Linked,
            parent: Some(inner.head.clone()),
            block,
        });
        inner.by_hash.insert(node.hash.clone(), node.clone());
        inner.by_number.insert(node.number, node.clone());
        inner.head = node;
    }

    /// Insert an unlinked (single) block.
    pub fn insert_single(&self, block: Block) {
        let mut inner = self.inner.write();
        let node = Arc::new(CacheNode {
            number: block.head.number,
            hash: block.hash(),
            witness: block.head.witness.clone(),
            link: LinkKind::Single,
            parent: None,
            block,
        });
        inner.by_hash.insert(node.hash.clone(), node);
    }
}

impl BlockCache for MemoryCache {
    fn head(&self) -> Arc<CacheNode> {
        self.inner.read().head.clone()
    }

    fn linked_root(&self) -> Arc<CacheNode> {
        self.inner.read().root.clone()
    }

    fn find(&self, hash: &[u8]) -> Option<Arc<CacheNode>> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    fn block_by_number(&self, number: i64) -> Option<Block> {
        self.inner
            .read()
            .by_number
            .get(&number)
            .map(|node| node.block.clone())
    }
}

/// In-memory persistent chain double: block number equals index.
#[derive(Default)]
pub struct MemoryChain {
    blocks: RwLock<Vec<Block>>,
}

impl MemoryChain {
    /// An empty chain (length zero).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A chain holding clones of `blocks`.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        Self {
            blocks: RwLock::new(blocks.to_vec()),
        }
    }

    /// Append a block.
    pub fn push_block(&self, block: Block) {
        self.blocks.write().push(block);
    }
}

impl Blockchain for MemoryChain {
    fn length(&self) -> i64 {
        self.blocks.read().len() as i64
    }

    fn hash_by_number(&self, number: i64) -> Option<Vec<u8>> {
        if number < 0 {
            return None;
        }
        self.blocks.read().get(number as usize).map(|b| b.hash())
    }

    fn block_bytes_by_hash(&self, hash: &[u8]) -> Option<Vec<u8>> {
        self.blocks
            .read()
            .iter()
            .find(|b| b.hash() == hash)
            .map(|b| b.encode().to_vec())
    }
}
