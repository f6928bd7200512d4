use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::FutureExt;

use crate::alert::{Alert, AlertSender};
use crate::config::Config;
use crate::peer::error::PeerError;
use crate::peer::{Handshake, PeerId};
use crate::session::piece_manager::StoreError;
use crate::session::{
    HashPool, PieceStore, SessionContext, SessionError, SessionHandle, SessionMsg, TorrentSession,
    TorrentStatus,
};
use crate::torrent::{InfoHash, Torrent};
use crate::tracker::{HttpTracker, Tracker};

type Routes = Arc<RwLock<HashMap<InfoHash, mpsc::Sender<SessionMsg>>>>;

/// Identifies a torrent added to a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentHandle(pub InfoHash);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to listen on `{addr}`: `{error}`")]
    Bind {
        error: std::io::Error,
        addr: SocketAddr,
    },
    #[error("The torrent `{0}` was already added")]
    AlreadyAdded(String),
    #[error("No torrent is known as `{0}`")]
    UnknownTorrent(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Owns the listener and every torrent session. Inbound connections are handed to the
/// session of the infohash in their handshake.
pub struct SessionManager {
    config: Arc<Config>,
    peer_id: PeerId,
    local_addr: SocketAddr,
    routes: Routes,
    sessions: HashMap<InfoHash, SessionHandle>,
    alerts: AlertSender,
    alert_rx: mpsc::Receiver<Alert>,
    hash_pool: HashPool,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Binds the listener and starts accepting connections.
    pub async fn new(config: Config) -> Result<Self, ManagerError> {
        let addr = config.network.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|error| ManagerError::Bind { error, addr })?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| ManagerError::Bind { error, addr })?;

        let (alerts, alert_rx) = AlertSender::channel(config.session.alert_capacity);
        let routes = Routes::default();
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            routes.clone(),
            config.network.connect_timeout,
            cancel.child_token(),
        ));
        tracing::info!("listening for peers on {local_addr}");

        Ok(Self {
            peer_id: PeerId::generate(config.network.client_prefix),
            hash_pool: HashPool::new(config.session.hash_workers),
            config: Arc::new(config),
            local_addr,
            routes,
            sessions: HashMap::new(),
            alerts,
            alert_rx,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adds a torrent, announcing to the trackers its metadata names.
    pub fn add_torrent(
        &mut self,
        torrent: Torrent,
        save_path: &Path,
    ) -> Result<TorrentHandle, ManagerError> {
        let trackers = torrent.trackers();
        let tracker = if trackers.is_empty() {
            None
        } else {
            match HttpTracker::new(
                &trackers,
                self.config.network.user_agent,
                self.config.network.tracker_timeout,
            ) {
                Ok(tracker) => Some(Arc::new(tracker) as Arc<dyn Tracker>),
                Err(error) => {
                    tracing::warn!("ignoring the trackers of `{}`: {error}", torrent.name());
                    None
                }
            }
        };
        self.add_torrent_with_tracker(torrent, save_path, tracker)
    }

    /// Adds a torrent with the given tracker, or none.
    pub fn add_torrent_with_tracker(
        &mut self,
        torrent: Torrent,
        save_path: &Path,
        tracker: Option<Arc<dyn Tracker>>,
    ) -> Result<TorrentHandle, ManagerError> {
        let info_hash = torrent.info_hash();
        if self.sessions.contains_key(&info_hash) {
            return Err(ManagerError::AlreadyAdded(torrent.name().to_string()));
        }
        let torrent = Arc::new(torrent);
        let store = PieceStore::open(torrent.clone(), save_path)?;

        let ctx = SessionContext {
            config: self.config.clone(),
            peer_id: self.peer_id,
            listen_port: self.local_addr.port(),
            alerts: self.alerts.clone(),
            hash_pool: self.hash_pool.clone(),
            tracker,
        };
        let handle = TorrentSession::spawn(torrent.clone(), store, ctx, self.cancel.child_token());
        self.routes
            .write()
            .insert(info_hash, handle.sender().clone());
        self.sessions.insert(info_hash, handle);

        tracing::info!(
            "added `{}` ({info_hash}) saving to {}",
            torrent.name(),
            save_path.display()
        );
        self.alerts.post(Alert::TorrentAdded {
            name: torrent.name().to_string(),
            info_hash,
        });
        Ok(TorrentHandle(info_hash))
    }

    /// Stops the session gracefully and forgets it.
    pub async fn remove_torrent(&mut self, handle: TorrentHandle) -> Result<(), ManagerError> {
        self.routes.write().remove(&handle.0);
        let session = self
            .sessions
            .remove(&handle.0)
            .ok_or_else(|| ManagerError::UnknownTorrent(handle.0.to_hex()))?;
        let name = session.torrent().name().to_string();
        if let Err(error) = session.stop().await {
            // a session that already ended has nothing left to stop
            tracing::debug!("`{name}` had already stopped: {error}");
        }
        tracing::info!("removed `{name}`");
        self.alerts.post(Alert::TorrentRemoved { name });
        Ok(())
    }

    pub async fn add_peer(
        &self,
        handle: TorrentHandle,
        addr: SocketAddr,
    ) -> Result<(), ManagerError> {
        Ok(self.session(handle)?.add_peer(addr).await?)
    }

    pub async fn remove_peer(
        &self,
        handle: TorrentHandle,
        addr: SocketAddr,
    ) -> Result<(), ManagerError> {
        Ok(self.session(handle)?.remove_peer(addr).await?)
    }

    pub fn session(&self, handle: TorrentHandle) -> Result<&SessionHandle, ManagerError> {
        self.sessions
            .get(&handle.0)
            .ok_or_else(|| ManagerError::UnknownTorrent(handle.0.to_hex()))
    }

    pub fn status(&self, handle: TorrentHandle) -> Option<TorrentStatus> {
        self.sessions.get(&handle.0).map(SessionHandle::status)
    }

    /// Statuses of every torrent, ordered by name.
    pub fn list(&self) -> Vec<TorrentStatus> {
        let mut statuses: Vec<TorrentStatus> =
            self.sessions.values().map(SessionHandle::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn find_by_name(&self, name: &str) -> Option<TorrentHandle> {
        self.sessions
            .values()
            .find(|session| session.torrent().name() == name)
            .map(|session| TorrentHandle(session.info_hash()))
    }

    /// Every alert posted since the last call, oldest first.
    pub fn take_alerts(&mut self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(alert) = self.alert_rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    /// Waits for the next alert. `None` once every sender is gone.
    pub async fn next_alert(&mut self) -> Option<Alert> {
        self.alert_rx.recv().await
    }

    /// Stops every session gracefully, then the listener.
    pub async fn shutdown(mut self) {
        let handles: Vec<TorrentHandle> = self.sessions.keys().copied().map(TorrentHandle).collect();
        for handle in handles {
            if let Err(error) = self.remove_torrent(handle).await {
                tracing::warn!("failed to stop {}: {error}", handle.0);
            }
        }
        self.cancel.cancel();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    routes: Routes,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!("failed to accept a connection: {error}");
                    continue;
                }
            },
        };
        let routes = routes.clone();
        tokio::spawn(async move {
            if let Err(error) = route_incoming(stream, addr, &routes, handshake_timeout).await {
                tracing::debug!("rejected connection from {addr}: {error}");
            }
        });
    }
}

/// Reads the handshake of an accepted connection and hands it to the session it names.
async fn route_incoming(
    mut stream: TcpStream,
    addr: SocketAddr,
    routes: &Routes,
    handshake_timeout: Duration,
) -> Result<(), PeerError> {
    let handshake = Handshake::read_from(&mut stream)
        .timeout(handshake_timeout)
        .await
        .map_err(|_| PeerError::Timeout(handshake_timeout))??;
    let info_hash = InfoHash(handshake.info_hash);
    let Some(session) = routes.read().get(&info_hash).cloned() else {
        return Err(PeerError::ProtocolViolation(format!(
            "unknown infohash {info_hash}"
        )));
    };
    session
        .send(SessionMsg::Incoming {
            stream,
            addr,
            handshake,
        })
        .await
        .map_err(|_| PeerError::SessionGone)
}

#[cfg(test)]
mod test_manager {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::torrent::generate;

    fn local_config() -> Config {
        let mut config = Config::default();
        config.network.listen_addr = (Ipv4Addr::LOCALHOST, 0).into();
        config
    }

    fn torrent(dir: &Path) -> Torrent {
        let path = dir.join("data.bin");
        std::fs::write(&path, vec![7u8; 40_000]).unwrap();
        generate(&[path], 1 << 14, &[]).unwrap()
    }

    #[tokio::test]
    async fn unknown_infohash_is_rejected() {
        let manager = SessionManager::new(local_config()).await.unwrap();
        let mut stream = TcpStream::connect(manager.local_addr()).await.unwrap();
        Handshake::new([9; 20], [1; 20])
            .write_to(&mut stream)
            .await
            .unwrap();

        let mut buf = [0u8; 68];
        let read = stream.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn add_list_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SessionManager::new(local_config()).await.unwrap();
        let torrent = torrent(dir.path());
        let handle = manager
            .add_torrent_with_tracker(torrent.clone(), dir.path(), None)
            .unwrap();
        assert!(matches!(
            manager.add_torrent_with_tracker(torrent, dir.path(), None),
            Err(ManagerError::AlreadyAdded(_))
        ));
        assert_eq!(manager.find_by_name("data.bin"), Some(handle));
        assert_eq!(manager.list().len(), 1);

        manager.remove_torrent(handle).await.unwrap();
        assert!(manager.list().is_empty());
        assert!(manager.status(handle).is_none());
        let alerts = manager.take_alerts();
        assert!(matches!(alerts.first(), Some(Alert::TorrentAdded { .. })));
        assert!(matches!(alerts.last(), Some(Alert::TorrentRemoved { .. })));
    }
}
