//! Download controller tests through its public loop API.

use crate::generators::test_hash;
use crate::harness::wait_for;
use corvus_p2p::PeerId;
use corvus_sync::{DownloadController, MissionState, SyncConfig};
use parking_lot::Mutex;
use std::sync::Arc;

fn peer(seed: u8) -> PeerId {
    PeerId::from_bytes(vec![seed; 4])
}

#[tokio::test(start_paused = true)]
async fn test_loop_dispatches_new_mission() {
    let dc = Arc::new(DownloadController::new(&SyncConfig::default()));
    let requests: Arc<Mutex<Vec<(Vec<u8>, i64, PeerId)>>> = Arc::new(Mutex::new(Vec::new()));

    let loop_dc = dc.clone();
    let loop_requests = requests.clone();
    tokio::spawn(async move {
        loop_dc
            .download_loop(move |hash, number, peer| {
                loop_requests.lock().push((hash.to_vec(), number, peer.clone()));
                (true, false)
            })
            .await;
    });

    dc.create_mission(test_hash(0xAB), 150, peer(1));

    assert!(
        wait_for(|| dc.mission_state(&test_hash(0xAB)) == Some(MissionState::Dispatched)).await
    );
    let sent = requests.lock().clone();
    assert_eq!(sent, vec![(test_hash(0xAB), 150, peer(1))]);
    assert_eq!(dc.stats().dispatched, 1);

    dc.stop();
}

#[tokio::test(start_paused = true)]
async fn test_loop_confirmed_mission_is_removed() {
    let dc = Arc::new(DownloadController::new(&SyncConfig::default()));

    let loop_dc = dc.clone();
    tokio::spawn(async move {
        loop_dc.download_loop(|_, _, _| (false, true)).await;
    });

    dc.create_mission(test_hash(0xCD), 151, peer(1));

    assert!(wait_for(|| dc.stats().missions == 0).await);
    assert_eq!(dc.mission_state(&test_hash(0xCD)), None);

    dc.stop();
}

#[tokio::test(start_paused = true)]
async fn test_free_peer_loop_completes_arrived_blocks() {
    let dc = Arc::new(DownloadController::new(&SyncConfig::default()));

    // Dispatch the mission so the hash sits in a peer's in-flight set.
    let loop_dc = dc.clone();
    tokio::spawn(async move {
        loop_dc.download_loop(|_, _, _| (true, false)).await;
    });
    dc.create_mission(test_hash(0xEF), 152, peer(2));
    assert!(
        wait_for(|| dc.mission_state(&test_hash(0xEF)) == Some(MissionState::Dispatched)).await
    );

    // The block then shows up in the cache through another path.
    let free_dc = dc.clone();
    tokio::spawn(async move {
        free_dc.free_peer_loop(|_, _| true).await;
    });

    assert!(wait_for(|| dc.stats().missions == 0).await);
    dc.stop();
}
