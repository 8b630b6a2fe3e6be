//! Synchronizer scenario tests over the in-memory harness.

use crate::generators::*;
use crate::harness::*;
use corvus_chain::{Block, BlockCache, Mode, ModeCell};
use corvus_p2p::{
    BlockHashQuery, BlockHashResponse, BlockInfo, MessageKind, PeerId, Priority, QueryKind,
    SyncHeight,
};
use corvus_sync::{MissionState, SyncConfig, Synchronizer};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn peer(seed: u8) -> PeerId {
    PeerId::from_bytes(vec![seed; 4])
}

struct TestNode {
    hub: Arc<HubService>,
    cache: Arc<MemoryCache>,
    mode: Arc<ModeCell>,
    sy: Arc<Synchronizer>,
}

/// A node whose cache and chain both hold `blocks`.
fn node(blocks: &[Block], mode: Mode, config: SyncConfig) -> TestNode {
    init_tracing();
    let hub = Arc::new(HubService::new());
    let cache = Arc::new(MemoryCache::from_blocks(blocks));
    let chain = Arc::new(MemoryChain::from_blocks(blocks));
    let mode = Arc::new(ModeCell::new(mode));
    let sy = Synchronizer::new(hub.clone(), cache.clone(), chain, mode.clone(), config)
        .expect("registration succeeds");
    TestNode {
        hub,
        cache,
        mode,
        sy,
    }
}

fn range_queries(hub: &HubService) -> Vec<BlockHashQuery> {
    hub.sent_of_kind(MessageKind::BlockHashQuery)
        .iter()
        .map(|m| BlockHashQuery::decode(&m.data).unwrap())
        .filter(|q| q.req_type == QueryKind::Range)
        .collect()
}

// ============================================================================
// check_sync
// ============================================================================

#[tokio::test]
async fn test_falling_behind_enters_sync_mode() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());

    for (i, height) in [200, 210, 220].into_iter().enumerate() {
        n.sy.heights().record(peer(i as u8 + 1), height, now());
    }

    // Median of [100, 200, 210, 220] is 210, far past 100 + 55.
    assert!(n.sy.check_sync());
    assert_eq!(n.mode.mode(), Mode::Sync);
    // Already syncing: a second check is a no-op.
    assert!(!n.sy.check_sync());

    assert!(wait_for(|| range_queries(&n.hub).len() >= 2).await);
    let queries = range_queries(&n.hub);
    assert_eq!((queries[0].start, queries[0].end), (101, 200));
    assert_eq!((queries[1].start, queries[1].end), (201, 210));

    let sent = n.hub.sent_of_kind(MessageKind::BlockHashQuery);
    assert_eq!(sent[0].priority, Priority::Urgent);
    assert!(sent[0].to.is_none());

    for number in 101..=200 {
        assert!(n.sy.tracker().contains(number), "missing {}", number);
    }
}

#[tokio::test]
async fn test_close_median_does_not_sync() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());

    // No fresh peers: the median is the local head alone.
    assert!(!n.sy.check_sync());

    n.sy.heights().record(peer(1), 105, now());
    n.sy.heights().record(peer(2), 108, now());

    // Median of [100, 105, 108] is 105, inside the threshold.
    assert!(!n.sy.check_sync());
    assert_eq!(n.mode.mode(), Mode::Normal);
    assert!(n.hub.sent_of_kind(MessageKind::BlockHashQuery).is_empty());
}

#[tokio::test]
async fn test_sync_process_returns_to_normal_at_target() {
    let mut blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());

    for (i, height) in [160, 165, 170].into_iter().enumerate() {
        n.sy.heights().record(peer(i as u8 + 1), height, now());
    }
    assert!(n.sy.check_sync());
    assert_eq!(n.mode.mode(), Mode::Sync);

    // Head still short of the target: stay in sync mode.
    n.sy.check_sync_process();
    assert_eq!(n.mode.mode(), Mode::Sync);

    // The cache catches up to the sync target (median 165).
    extend_chain(&mut blocks, 65, "w3");
    for block in &blocks[101..] {
        n.cache.push_block(block.clone());
    }
    n.sy.check_sync_process();
    assert_eq!(n.mode.mode(), Mode::Normal);
    assert_eq!(n.sy.downloader().stats().missions, 0);
}

// ============================================================================
// check_gen_block
// ============================================================================

#[tokio::test]
async fn test_witness_drift_refetches_without_mode_change() {
    let mut blocks = build_chain(1, &["genesis"]);
    extend_chain(&mut blocks, 39, "w1");
    extend_chain(&mut blocks, 2, "me");

    init_tracing();
    let hub = Arc::new(HubService::new());
    let cache = Arc::new(MemoryCache::from_blocks(&blocks));
    // Only the genesis block is confirmed on disk.
    let chain = Arc::new(MemoryChain::from_blocks(&blocks[..1]));
    let mode = Arc::new(ModeCell::new(Mode::Normal));
    let config = SyncConfig {
        node_id: "me".to_string(),
        ..SyncConfig::default()
    };
    let sy = Synchronizer::new(hub.clone(), cache.clone(), chain, mode.clone(), config).unwrap();

    let head_hash = cache.head().hash.clone();
    assert!(sy.check_gen_block(&head_hash));
    assert_eq!(mode.mode(), Mode::Normal);

    assert!(wait_for(|| !range_queries(&hub).is_empty()).await);
    let queries = range_queries(&hub);
    assert_eq!((queries[0].start, queries[0].end), (1, 41));
    assert!(sy.tracker().contains(1) && sy.tracker().contains(41));

    // Same ancestor again: already examined, no re-trigger.
    assert!(!sy.check_gen_block(&head_hash));
}

// ============================================================================
// Running loops
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_sweep_requeries_pending_sorted() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    for number in [7, 3, 5] {
        n.sy.tracker().mark_pending(number);
    }

    assert!(wait_for(|| {
        n.hub
            .sent_of_kind(MessageKind::BlockHashQuery)
            .iter()
            .any(|m| {
                BlockHashQuery::decode(&m.data)
                    .map(|q| q.req_type == QueryKind::ByNumber)
                    .unwrap_or(false)
            })
    })
    .await);

    let retry = n
        .hub
        .sent_of_kind(MessageKind::BlockHashQuery)
        .iter()
        .map(|m| BlockHashQuery::decode(&m.data).unwrap())
        .find(|q| q.req_type == QueryKind::ByNumber)
        .unwrap();
    assert_eq!(retry.nums, vec![3, 5, 7]);
    assert_eq!((retry.start, retry.end), (0, 0));

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_height_loop_gossips_and_records() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    // Our own height goes out periodically.
    assert!(wait_for(|| !n.hub.sent_of_kind(MessageKind::SyncHeight).is_empty()).await);
    let gossip = n.hub.sent_of_kind(MessageKind::SyncHeight);
    assert_eq!(SyncHeight::decode(&gossip[0].data).unwrap().height, 100);
    assert!(gossip[0].to.is_none());

    // A peer's report lands in the registry.
    let report = SyncHeight {
        height: 120,
        time: now(),
    };
    assert!(n
        .hub
        .deliver(peer(9), MessageKind::SyncHeight, report.encode()));
    assert!(wait_for(|| n.sy.heights().len() == 1).await);

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_message_loop_answers_hash_query() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    let query = BlockHashQuery {
        req_type: QueryKind::Range,
        start: 99,
        end: 100,
        nums: vec![],
    };
    assert!(n
        .hub
        .deliver(peer(5), MessageKind::BlockHashQuery, query.encode()));

    assert!(wait_for(|| !n.hub.sent_of_kind(MessageKind::BlockHashResponse).is_empty()).await);
    let sent = n.hub.sent_of_kind(MessageKind::BlockHashResponse);
    assert_eq!(sent[0].to, Some(peer(5)));
    let response = BlockHashResponse::decode(&sent[0].data).unwrap();
    let numbers: Vec<i64> = response.block_infos.iter().map(|i| i.number).collect();
    assert_eq!(numbers, vec![99, 100]);

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_message_loop_serves_block_request() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    let request = BlockInfo {
        number: 97,
        hash: blocks[97].hash(),
    };
    assert!(n
        .hub
        .deliver(peer(6), MessageKind::BlockRequest, request.encode()));

    assert!(wait_for(|| !n.hub.sent_of_kind(MessageKind::BlockResponse).is_empty()).await);
    let sent = n.hub.sent_of_kind(MessageKind::BlockResponse);
    assert_eq!(sent[0].to, Some(peer(6)));
    assert_eq!(sent[0].data, blocks[97].encode());

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_hash_response_drives_block_download() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    n.sy.tracker().mark_pending(150);
    let unknown = test_hash(0xAB);
    let response = BlockHashResponse {
        block_infos: vec![BlockInfo {
            number: 150,
            hash: unknown.clone(),
        }],
    };
    assert!(n
        .hub
        .deliver(peer(7), MessageKind::BlockHashResponse, response.encode()));

    // Mission created, pending entry cleared, request dispatched to the
    // claiming peer.
    assert!(wait_for(|| n.sy.downloader().stats().missions == 1).await);
    assert!(!n.sy.tracker().contains(150));
    assert!(
        wait_for(|| n.sy.downloader().mission_state(&unknown) == Some(MissionState::Dispatched))
            .await
    );

    assert!(wait_for(|| !n.hub.sent_of_kind(MessageKind::BlockRequest).is_empty()).await);
    let sent = n.hub.sent_of_kind(MessageKind::BlockRequest);
    assert_eq!(sent[0].to, Some(peer(7)));
    assert_eq!(sent[0].priority, Priority::Urgent);
    let request = BlockInfo::decode(&sent[0].data).unwrap();
    assert_eq!(request.number, 150);
    assert_eq!(request.hash, unknown);

    // The block arrives: capacity freed, mission finished.
    n.sy.on_block_received(&peer(7), &unknown);
    assert!(wait_for(|| n.sy.downloader().stats().missions == 0).await);

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_known_hash_creates_no_mission() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    n.sy.tracker().mark_pending(97);
    let response = BlockHashResponse {
        block_infos: vec![BlockInfo {
            number: 97,
            hash: blocks[97].hash(),
        }],
    };
    assert!(n
        .hub
        .deliver(peer(8), MessageKind::BlockHashResponse, response.encode()));

    assert!(wait_for(|| !n.sy.tracker().contains(97)).await);
    assert_eq!(n.sy.downloader().stats().missions, 0);

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_unicast_failure_leaves_mission_pending() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.hub.set_fail_unicast(true);
    n.sy.clone().start().unwrap();

    let unknown = test_hash(0xBC);
    let response = BlockHashResponse {
        block_infos: vec![BlockInfo {
            number: 160,
            hash: unknown.clone(),
        }],
    };
    assert!(n
        .hub
        .deliver(peer(9), MessageKind::BlockHashResponse, response.encode()));

    assert!(wait_for(|| n.sy.downloader().stats().missions == 1).await);
    tokio::time::sleep(Duration::from_secs(3)).await;

    // The failed send left the mission pending for the retry sweep.
    assert_eq!(
        n.sy.downloader().mission_state(&unknown),
        Some(MissionState::Pending)
    );
    assert!(n.hub.sent_of_kind(MessageKind::BlockRequest).is_empty());

    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_is_discarded() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    assert!(n.hub.deliver(
        peer(4),
        MessageKind::BlockHashQuery,
        bytes::Bytes::from_static(&[0xFF, 0x01, 0x02]),
    ));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Dropped without a response, and the loop keeps serving.
    assert!(n.hub.sent_of_kind(MessageKind::BlockHashResponse).is_empty());
    let query = BlockHashQuery {
        req_type: QueryKind::Range,
        start: 100,
        end: 100,
        nums: vec![],
    };
    assert!(n
        .hub
        .deliver(peer(4), MessageKind::BlockHashQuery, query.encode()));
    assert!(wait_for(|| !n.hub.sent_of_kind(MessageKind::BlockHashResponse).is_empty()).await);

    n.sy.stop();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_initializer_enters_normal_on_ready_chain() {
    let blocks = build_chain(10, &["w1"]);
    let n = node(&blocks, Mode::Init, SyncConfig::default());
    n.sy.clone().start().unwrap();

    assert!(wait_for(|| n.mode.mode() == Mode::Normal).await);
    n.sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_initializer_gives_up_on_empty_chain() {
    init_tracing();
    let blocks = build_chain(1, &["w1"]);
    let hub = Arc::new(HubService::new());
    let cache = Arc::new(MemoryCache::from_blocks(&blocks));
    let chain = Arc::new(MemoryChain::empty());
    let mode = Arc::new(ModeCell::new(Mode::Init));
    let sy = Synchronizer::new(
        hub,
        cache,
        chain,
        mode.clone(),
        SyncConfig::default(),
    )
    .unwrap();
    sy.clone().start().unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(mode.mode(), Mode::Init);
    sy.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_subscriptions() {
    let blocks = build_chain(101, &["w1", "w2"]);
    let n = node(&blocks, Mode::Normal, SyncConfig::default());
    n.sy.clone().start().unwrap();

    // A second start is rejected.
    assert!(n.sy.clone().start().is_err());

    n.sy.stop();

    let query = BlockHashQuery {
        req_type: QueryKind::Range,
        start: 1,
        end: 2,
        nums: vec![],
    };
    assert!(
        wait_for(|| !n
            .hub
            .deliver(peer(1), MessageKind::BlockHashQuery, query.encode()))
        .await
    );
}
