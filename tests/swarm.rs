use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dynamic_peer::torrent::generate;
use dynamic_peer::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, Config, SessionManager, SessionState,
    Torrent, TorrentHandle, Tracker, TrackerError,
};
use parking_lot::Mutex;

const PIECE_LENGTH: u32 = 16 * 1024;

/// Hands out a fixed peer list and remembers every announce.
struct StaticTracker {
    peers: Vec<SocketAddr>,
    events: Mutex<Vec<AnnounceEvent>>,
}

#[async_trait]
impl Tracker for StaticTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        self.events.lock().push(request.event);
        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(60)),
            peers: self.peers.clone(),
        })
    }
}

fn local_config() -> Config {
    let mut config = Config::default();
    config.network.listen_addr = (Ipv4Addr::LOCALHOST, 0).into();
    config.session.tick_interval = Duration::from_millis(100);
    config
}

fn seed_data(dir: &Path) -> (Vec<u8>, Torrent) {
    let data: Vec<u8> = (0..1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect();
    let path = dir.join("data.bin");
    std::fs::write(&path, &data).unwrap();
    let torrent = generate(&[path], PIECE_LENGTH, &[]).unwrap();
    (data, torrent)
}

async fn wait_for(
    manager: &SessionManager,
    handle: TorrentHandle,
    done: impl Fn(SessionState, f64) -> bool,
) {
    let mut session = manager.session(handle).unwrap().clone();
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let status = session.status();
            if done(status.state, status.progress) {
                return;
            }
            session.changed().await.unwrap();
        }
    })
    .await
    .expect("the session never reached the expected state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seeder_and_leecher_produce_identical_files() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let (data, torrent) = seed_data(seed_dir.path());
    assert_eq!(torrent.info.piece_count(), 64);

    let mut seeder = SessionManager::new(local_config()).await.unwrap();
    let seeding = seeder
        .add_torrent_with_tracker(torrent.clone(), seed_dir.path(), None)
        .unwrap();
    wait_for(&seeder, seeding, |state, _| state == SessionState::Seeding).await;

    let tracker = Arc::new(StaticTracker {
        peers: vec![seeder.local_addr()],
        events: Mutex::new(Vec::new()),
    });
    let mut leecher = SessionManager::new(local_config()).await.unwrap();
    let leeching = leecher
        .add_torrent_with_tracker(torrent, leech_dir.path(), Some(tracker.clone()))
        .unwrap();
    wait_for(&leecher, leeching, |_, progress| progress >= 1.0).await;

    let status = leecher.status(leeching).unwrap();
    assert!(status.is_seeding);
    assert_eq!(status.pieces_verified, 64);
    assert_eq!(
        std::fs::read(leech_dir.path().join("data.bin")).unwrap(),
        data
    );

    leecher.remove_torrent(leeching).await.unwrap();
    // announces run in their own tasks
    tokio::time::timeout(Duration::from_secs(5), async {
        while !tracker.events.lock().contains(&AnnounceEvent::Stopped) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let events = tracker.events.lock().clone();
    assert_eq!(events.first(), Some(&AnnounceEvent::Started));
    assert!(events.contains(&AnnounceEvent::Completed));

    seeder.shutdown().await;
    leecher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_download_resumes_as_seed() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let (_, torrent) = seed_data(seed_dir.path());

    let mut seeder = SessionManager::new(local_config()).await.unwrap();
    let seeding = seeder
        .add_torrent_with_tracker(torrent.clone(), seed_dir.path(), None)
        .unwrap();
    wait_for(&seeder, seeding, |state, _| state == SessionState::Seeding).await;

    let mut leecher = SessionManager::new(local_config()).await.unwrap();
    let leeching = leecher
        .add_torrent_with_tracker(torrent.clone(), leech_dir.path(), None)
        .unwrap();
    leecher
        .add_peer(leeching, seeder.local_addr())
        .await
        .unwrap();
    wait_for(&leecher, leeching, |_, progress| progress >= 1.0).await;
    leecher.shutdown().await;
    seeder.shutdown().await;

    // the bitmap was persisted, so nothing is rechecked or fetched again
    let mut resumed = SessionManager::new(local_config()).await.unwrap();
    let handle = resumed
        .add_torrent_with_tracker(torrent, leech_dir.path(), None)
        .unwrap();
    let status = resumed.status(handle).unwrap();
    assert_eq!(status.state, SessionState::Seeding);
    assert_eq!(status.progress, 1.0);
    resumed.shutdown().await;
}

#[tokio::test]
async fn connections_for_unknown_torrents_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (_, torrent) = seed_data(dir.path());
    let mut leecher = SessionManager::new(local_config()).await.unwrap();
    let other = SessionManager::new(local_config()).await.unwrap();

    let handle = leecher
        .add_torrent_with_tracker(torrent, &dir.path().join("out"), None)
        .unwrap();
    leecher.add_peer(handle, other.local_addr()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = leecher.status(handle).unwrap();
    assert_eq!(status.num_peers, 0);
    assert_eq!(status.progress, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_frees_its_slot_after_the_handshake_timeout() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let (data, torrent) = seed_data(seed_dir.path());

    let mut seeder = SessionManager::new(local_config()).await.unwrap();
    let seeding = seeder
        .add_torrent_with_tracker(torrent.clone(), seed_dir.path(), None)
        .unwrap();
    wait_for(&seeder, seeding, |state, _| state == SessionState::Seeding).await;

    // accepts connections and never answers the handshake
    let silent = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let mut config = local_config();
    config.network.max_peers = 1;
    config.network.connect_timeout = Duration::from_millis(300);
    let mut leecher = SessionManager::new(config).await.unwrap();
    let leeching = leecher
        .add_torrent_with_tracker(torrent, leech_dir.path(), None)
        .unwrap();
    leecher.add_peer(leeching, silent_addr).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    leecher
        .add_peer(leeching, seeder.local_addr())
        .await
        .unwrap();
    wait_for(&leecher, leeching, |_, progress| progress >= 1.0).await;
    assert_eq!(
        std::fs::read(leech_dir.path().join("data.bin")).unwrap(),
        data
    );

    leecher.shutdown().await;
    seeder.shutdown().await;
}
