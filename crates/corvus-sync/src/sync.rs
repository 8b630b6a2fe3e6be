//! Synchronization orchestrator.
//!
//! Owns the mode transitions and the six long-running tasks: the
//! initializer, the height loop, the message loop, the retry loop, and
//! the download controller's dispatch and free-peer loops.

use crate::{
    DownloadController, HeightBook, ProtocolHandler, RequestTracker, SyncConfig, SyncError,
    SyncResult,
};
use corvus_chain::{BlockCache, Blockchain, LinkKind, Mode, ModeCell};
use corvus_p2p::{
    BlockHashQuery, BlockHashResponse, BlockInfo, IncomingMessage, MessageKind, PeerId,
    PeerService, Priority, QueryKind, SyncHeight,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Wall clock in unix seconds.
fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Broadcast a block hash query to all peers.
fn broadcast_hash_query(
    service: &dyn PeerService,
    req_type: QueryKind,
    start: i64,
    end: i64,
    nums: Vec<i64>,
) {
    info!(
        ?req_type,
        start,
        end,
        nums = nums.len(),
        "request block hashes"
    );
    let query = BlockHashQuery {
        req_type,
        start,
        end,
        nums,
    };
    if let Err(e) = service.broadcast(
        query.encode(),
        MessageKind::BlockHashQuery,
        Priority::Urgent,
    ) {
        warn!(error = %e, "failed to broadcast hash query");
    }
}

/// Issue ranged hash queries covering `[start, end]` in batches,
/// pausing while the cache digests what already arrived.
async fn sync_blocks(
    service: Arc<dyn PeerService>,
    cache: Arc<dyn BlockCache>,
    tracker: Arc<RequestTracker>,
    batch: i64,
    shutdown: watch::Receiver<bool>,
    mut start: i64,
    end: i64,
) {
    info!(start, end, "sync blocks");
    while end > start + batch - 1 {
        while cache.head().number + 3 < start {
            if *shutdown.borrow() {
                return;
            }
            tokio::time::sleep(crate::SYNC_BACKPRESSURE).await;
        }
        if *shutdown.borrow() {
            return;
        }
        for number in start..start + batch {
            tracker.mark_pending(number);
        }
        broadcast_hash_query(
            service.as_ref(),
            QueryKind::Range,
            start,
            start + batch - 1,
            Vec::new(),
        );
        start += batch;
    }
    if start <= end {
        for number in start..=end {
            tracker.mark_pending(number);
        }
        broadcast_hash_query(service.as_ref(), QueryKind::Range, start, end, Vec::new());
    }
}

/// Keeps the local chain caught up with its peers.
///
/// Construct with [`Synchronizer::new`] (which registers the transport
/// subscriptions), then call [`Synchronizer::start`] on the returned
/// `Arc` to spawn the loops.
pub struct Synchronizer {
    service: Arc<dyn PeerService>,
    cache: Arc<dyn BlockCache>,
    chain: Arc<dyn Blockchain>,
    mode: Arc<ModeCell>,
    config: SyncConfig,
    protocol: ProtocolHandler,
    heights: HeightBook,
    tracker: Arc<RequestTracker>,
    downloader: Arc<DownloadController>,
    /// Target head of the current sync run.
    sync_end: AtomicI64,
    /// Hash of the ancestor examined by the last fork-drift check.
    last_gen_cursor: Mutex<Option<Vec<u8>>>,
    message_rx: Mutex<Option<UnboundedReceiver<IncomingMessage>>>,
    height_rx: Mutex<Option<UnboundedReceiver<IncomingMessage>>>,
    shutdown: watch::Sender<bool>,
}

impl Synchronizer {
    /// Create a synchronizer and register its transport subscriptions.
    ///
    /// Registration failure is fatal: the caller should abort startup.
    pub fn new(
        service: Arc<dyn PeerService>,
        cache: Arc<dyn BlockCache>,
        chain: Arc<dyn Blockchain>,
        mode: Arc<ModeCell>,
        config: SyncConfig,
    ) -> SyncResult<Arc<Self>> {
        let message_rx = service
            .register(
                "sync message",
                &[
                    MessageKind::BlockHashQuery,
                    MessageKind::BlockHashResponse,
                    MessageKind::BlockRequest,
                ],
            )
            .map_err(|e| SyncError::Startup(e.to_string()))?;
        let height_rx = service
            .register("sync height", &[MessageKind::SyncHeight])
            .map_err(|e| SyncError::Startup(e.to_string()))?;

        let protocol = ProtocolHandler::new(service.clone(), cache.clone(), chain.clone());
        let heights = HeightBook::new(config.height_available_secs, config.height_timeout_secs);
        let downloader = Arc::new(DownloadController::new(&config));

        Ok(Arc::new(Self {
            service,
            cache,
            chain,
            mode,
            config,
            protocol,
            heights,
            tracker: Arc::new(RequestTracker::new()),
            downloader,
            sync_end: AtomicI64::new(0),
            last_gen_cursor: Mutex::new(None),
            message_rx: Mutex::new(Some(message_rx)),
            height_rx: Mutex::new(Some(height_rx)),
            shutdown: watch::Sender::new(false),
        }))
    }

    /// Spawn the six loops. Call once.
    pub fn start(self: Arc<Self>) -> SyncResult<()> {
        let message_rx = self
            .message_rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::Startup("synchronizer already started".into()))?;
        let height_rx = self
            .height_rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::Startup("synchronizer already started".into()))?;

        let sy = self.clone();
        tokio::spawn(async move { sy.initializer().await });

        let sy = self.clone();
        tokio::spawn(async move { sy.height_loop(height_rx).await });

        let sy = self.clone();
        tokio::spawn(async move { sy.message_loop(message_rx).await });

        let sy = self.clone();
        tokio::spawn(async move { sy.retry_loop().await });

        let dc = self.downloader.clone();
        let sy = self.clone();
        tokio::spawn(async move {
            dc.download_loop(move |hash, number, peer| sy.request_sync_block(hash, number, peer))
                .await;
        });

        let dc = self.downloader.clone();
        let sy = self;
        tokio::spawn(async move {
            dc.free_peer_loop(move |hash, number| sy.has_block(hash, number))
                .await;
        });

        Ok(())
    }

    /// Signal every loop to exit.
    pub fn stop(&self) {
        info!("synchronizer stopping");
        self.downloader.stop();
        self.shutdown.send_replace(true);
    }

    /// The download controller.
    pub fn downloader(&self) -> &Arc<DownloadController> {
        &self.downloader
    }

    /// The pending-request tracker.
    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// The peer-height registry.
    pub fn heights(&self) -> &HeightBook {
        &self.heights
    }

    /// A block arrived from `peer`; free its download slot.
    ///
    /// The host layer calls this when it hands a block response to the
    /// cache. With no per-request timeout, this is the normal path that
    /// releases in-flight capacity.
    pub fn on_block_received(&self, peer: &PeerId, hash: &[u8]) {
        self.downloader.on_block_received(peer, hash);
    }

    /// Compare the network's median height against the local chain and
    /// switch to sync mode when too far behind. Returns true on the
    /// transition.
    pub fn check_sync(&self) -> bool {
        if self.mode.mode() != Mode::Normal {
            return false;
        }
        let confirmed = self.chain.length() - 1;
        let samples = self.heights.sample(self.cache.head().number, unix_now());
        let net_height = samples[samples.len() / 2];
        debug!(?samples, net_height, "check sync");
        if net_height > confirmed + self.config.sync_threshold {
            info!(
                net_height,
                local = confirmed,
                "behind the network, entering sync mode"
            );
            self.mode.set_mode(Mode::Sync);
            self.downloader.reset();
            self.launch_sync_blocks(confirmed + 1, net_height);
            return true;
        }
        false
    }

    /// Detect local fork drift: if one witness produced more than
    /// `continuous_num` of the recent confirmation window behind the
    /// node's own blocks, re-fetch the range without changing mode.
    pub fn check_gen_block(&self, hash: &[u8]) -> bool {
        if self.mode.mode() != Mode::Normal {
            return false;
        }
        let Some(mut node) = self.cache.find(hash) else {
            return false;
        };
        while node.witness == self.config.node_id {
            match node.parent.clone() {
                Some(parent) => node = parent,
                None => return false,
            }
        }

        {
            let mut cursor = self.last_gen_cursor.lock();
            // Unchanged ancestor: already examined.
            if cursor.as_deref() == Some(node.hash.as_slice()) {
                return false;
            }
            *cursor = Some(node.hash.clone());
        }

        let witness = node.witness.clone();
        let mut streak = 0i64;
        let mut walk = Some(node);
        for _ in 0..self.config.confirm_num * self.config.continuous_num {
            let Some(current) = walk else {
                break;
            };
            if current.witness == witness {
                streak += 1;
            }
            walk = current.parent.clone();
        }

        if streak > self.config.continuous_num {
            let confirmed = self.chain.length() - 1;
            let head = self.cache.head().number;
            info!(
                streak,
                limit = self.config.continuous_num,
                "single witness dominating recent blocks, refetching"
            );
            self.launch_sync_blocks(confirmed + 1, head);
            return true;
        }
        false
    }

    /// Leave sync mode once the head reached the sync target.
    pub fn check_sync_process(&self) {
        if self.mode.mode() != Mode::Sync {
            return;
        }
        let head = self.cache.head().number;
        let end = self.sync_end.load(Ordering::Acquire);
        debug!(head, end, "check sync process");
        if end <= head {
            info!(head, "sync target reached, back to normal mode");
            self.mode.set_mode(Mode::Normal);
            self.downloader.reset();
        }
    }

    /// Record the target and run the batched hash queries in their own
    /// task.
    fn launch_sync_blocks(&self, start: i64, end: i64) {
        self.sync_end.store(end, Ordering::Release);
        let service = self.service.clone();
        let cache = self.cache.clone();
        let tracker = self.tracker.clone();
        let batch = self.config.max_hash_batch;
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            sync_blocks(service, cache, tracker, batch, shutdown, start, end).await;
        });
    }

    /// Wait out the init delay, then enter normal mode if the chain has
    /// blocks. An empty chain is fatal for this task; the node stays in
    /// init mode.
    async fn initializer(&self) {
        if self.mode.mode() != Mode::Init {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_interval()) => {
                if self.chain.length() == 0 {
                    error!("block chain is empty, staying in init mode");
                    return;
                }
                info!("chain ready, entering normal mode");
                self.mode.set_mode(Mode::Normal);
            }
            _ = shutdown.changed() => {}
        }
    }

    /// Gossip our height, absorb peer heights, and run the periodic
    /// checks.
    async fn height_loop(&self, mut rx: UnboundedReceiver<IncomingMessage>) {
        let mut gossip = tokio::time::interval(self.config.gossip_interval());
        let mut check = tokio::time::interval(self.config.check_interval());
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = gossip.tick() => self.broadcast_height(),
                Some(msg) = rx.recv() => self.on_sync_height(msg),
                _ = check.tick() => {
                    self.check_sync();
                    let head = self.cache.head();
                    self.check_gen_block(&head.hash);
                    self.check_sync_process();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn broadcast_height(&self) {
        let report = SyncHeight {
            height: self.cache.head().number,
            time: unix_now(),
        };
        debug!(height = report.height, "broadcast sync height");
        if let Err(e) =
            self.service
                .broadcast(report.encode(), MessageKind::SyncHeight, Priority::Urgent)
        {
            warn!(error = %e, "failed to broadcast height");
        }
    }

    fn on_sync_height(&self, msg: IncomingMessage) {
        match SyncHeight::decode(&msg.data) {
            Ok(report) => {
                debug!(peer = %msg.from, height = report.height, time = report.time, "sync height");
                self.heights.record(msg.from, report.height, report.time);
            }
            Err(e) => warn!(peer = %msg.from, error = %e, "bad sync height message"),
        }
    }

    /// Demultiplex sync protocol messages onto their handlers.
    async fn message_loop(&self, mut rx: UnboundedReceiver<IncomingMessage>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(msg) => self.dispatch_message(msg),
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_message(&self, msg: IncomingMessage) {
        match msg.kind {
            MessageKind::BlockHashQuery => match BlockHashQuery::decode(&msg.data) {
                Ok(query) => self.protocol.handle_hash_query(&query, &msg.from),
                Err(e) => warn!(peer = %msg.from, error = %e, "bad hash query"),
            },
            MessageKind::BlockHashResponse => match BlockHashResponse::decode(&msg.data) {
                Ok(response) => self.handle_hash_response(response, msg.from),
                Err(e) => warn!(peer = %msg.from, error = %e, "bad hash response"),
            },
            MessageKind::BlockRequest => match BlockInfo::decode(&msg.data) {
                Ok(request) => self.protocol.handle_block_query(&request, &msg.from),
                Err(e) => warn!(peer = %msg.from, error = %e, "bad block request"),
            },
            _ => {}
        }
    }

    /// Turn answered hashes into download missions and clear the
    /// pending set.
    fn handle_hash_response(&self, response: BlockHashResponse, from: PeerId) {
        debug!(peer = %from, count = response.block_infos.len(), "received block hashes");
        let root = self.cache.linked_root().number;
        for info in response.block_infos {
            self.tracker.clear(info.number);
            if info.number > root && self.cache.find(&info.hash).is_none() {
                self.downloader
                    .create_mission(info.hash, info.number, from.clone());
            }
        }
    }

    /// Re-query hashes whose numbers never got an answer.
    async fn retry_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval()) => {
                    let nums = self.tracker.snapshot_sorted();
                    if !nums.is_empty() {
                        info!(count = nums.len(), "retrying unanswered hash queries");
                        broadcast_hash_query(
                            self.service.as_ref(),
                            QueryKind::ByNumber,
                            0,
                            0,
                            nums,
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Whether a mission's block is already confirmed or cached.
    fn has_block(&self, hash: &[u8], number: i64) -> bool {
        if number <= self.cache.linked_root().number {
            return true;
        }
        self.cache.find(hash).is_some()
    }

    /// Download-controller dispatch callback: `(sent, confirmed)`.
    fn request_sync_block(&self, hash: &[u8], number: i64, peer: &PeerId) -> (bool, bool) {
        debug!(number, peer = %peer, "try sync block");
        if number <= self.cache.linked_root().number {
            return (false, true);
        }
        if let Some(node) = self.cache.find(hash) {
            return match node.link {
                LinkKind::Linked => (false, true),
                LinkKind::Single => (false, false),
            };
        }
        let request = BlockInfo {
            number,
            hash: hash.to_vec(),
        };
        match self.service.send_to_peer(
            peer,
            request.encode(),
            MessageKind::BlockRequest,
            Priority::Urgent,
        ) {
            Ok(()) => (true, false),
            Err(e) => {
                warn!(peer = %peer, error = %e, "block request send failed");
                (false, false)
            }
        }
    }
}
