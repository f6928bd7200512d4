use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::alert::{Alert, AlertSender};
use crate::config::Config;
use crate::messages::{
    BitfieldPayload, HavePayload, PeerMessage, RequestPiecePayload, ResponsePiecePayload,
};
use crate::peer::error::PeerError;
use crate::peer::{ConnectionState, Handshake, PeerCommand, PeerEvent, PeerId, PeerKey, PeerTask};
use crate::torrent::{InfoHash, Torrent};
use crate::tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Tracker, TrackerError};

pub use error::SessionError;
pub use peers::{BlockRequest, PeerRecord};
use piece_manager::{BlockInfo, BlockOutcome, HashVerdict, PieceManager, StoreError};
pub use piece_manager::{HashPool, PieceStore};
pub use status::{SessionState, TorrentStatus};

mod error;
pub mod peers;
pub mod piece_manager;
pub mod status;

/// Largest block we serve to a peer.
pub const MAX_UPLOAD_BLOCK: u32 = 128 * 1024;

/// Everything a session reacts to, delivered through its inbox.
#[derive(Debug)]
pub enum SessionMsg {
    AddPeer(SocketAddr),
    RemovePeer(SocketAddr),
    /// A connection the manager accepted and routed here by the infohash of its handshake.
    Incoming {
        stream: TcpStream,
        addr: SocketAddr,
        handshake: Handshake,
    },
    Peer {
        key: PeerKey,
        event: PeerEvent,
    },
    Announced(Result<AnnounceResponse, TrackerError>),
    Stop(oneshot::Sender<()>),
}

/// What a session borrows from its manager.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub alerts: AlertSender,
    pub hash_pool: HashPool,
    pub tracker: Option<Arc<dyn Tracker>>,
}

/// The handle a manager keeps to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    torrent: Arc<Torrent>,
    tx: mpsc::Sender<SessionMsg>,
    status: watch::Receiver<TorrentStatus>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn info_hash(&self) -> InfoHash {
        self.torrent.info_hash()
    }

    pub fn status(&self) -> TorrentStatus {
        self.status.borrow().clone()
    }

    /// Waits for the next status change. Fails once the session is gone.
    pub async fn changed(&mut self) -> Result<TorrentStatus, SessionError> {
        self.status
            .changed()
            .await
            .map_err(|_| SessionError::Stopped)?;
        Ok(self.status())
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<SessionMsg> {
        &self.tx
    }

    pub async fn add_peer(&self, addr: SocketAddr) -> Result<(), SessionError> {
        self.send(SessionMsg::AddPeer(addr)).await
    }

    pub async fn remove_peer(&self, addr: SocketAddr) -> Result<(), SessionError> {
        self.send(SessionMsg::RemovePeer(addr)).await
    }

    /// Stops gracefully: in-flight hashing is finished, peers are closed and the bitmap
    /// is persisted before this returns.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMsg::Stop(tx)).await?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Tears the session down without waiting for anything.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, msg: SessionMsg) -> Result<(), SessionError> {
        self.tx.send(msg).await.map_err(|_| SessionError::Stopped)
    }
}

/// The actor owning one torrent: its store, its peers and every request in flight.
pub struct TorrentSession {
    torrent: Arc<Torrent>,
    ctx: SessionContext,
    pieces: PieceManager,
    peers: HashMap<PeerKey, PeerRecord>,
    next_key: u64,
    banned_addrs: HashSet<SocketAddr>,
    banned_ids: HashSet<PeerId>,
    inbox: mpsc::Receiver<SessionMsg>,
    self_tx: mpsc::Sender<SessionMsg>,
    status_tx: watch::Sender<TorrentStatus>,
    cancel: CancellationToken,
    state: SessionState,
    error: Option<String>,
    uploaded: u64,
    downloaded: u64,
    rates: Rates,
    next_announce: Option<Instant>,
    announce_in_flight: bool,
    resume_dirty: bool,
}

#[derive(Debug)]
struct Rates {
    since: Instant,
    downloaded: u64,
    uploaded: u64,
    download_rate: u64,
    upload_rate: u64,
}

impl Rates {
    fn new() -> Self {
        Self {
            since: Instant::now(),
            downloaded: 0,
            uploaded: 0,
            download_rate: 0,
            upload_rate: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.since).as_secs_f64();
        if elapsed > 0.0 {
            self.download_rate = (self.downloaded as f64 / elapsed) as u64;
            self.upload_rate = (self.uploaded as f64 / elapsed) as u64;
        }
        self.since = now;
        self.downloaded = 0;
        self.uploaded = 0;
    }
}

impl TorrentSession {
    /// Starts the actor for `torrent` on an opened store. A store that found data it can't
    /// vouch for is rechecked first, in the `Checking` state.
    pub fn spawn(
        torrent: Arc<Torrent>,
        store: PieceStore,
        ctx: SessionContext,
        cancel: CancellationToken,
    ) -> SessionHandle {
        let (tx, inbox) = mpsc::channel(1024);
        let checking = store.needs_recheck();
        let state = if checking {
            SessionState::Checking
        } else if store.is_complete() {
            SessionState::Seeding
        } else {
            SessionState::Downloading
        };
        let (status_tx, status) = watch::channel(initial_status(&torrent, &store, state));
        let pieces = PieceManager::new(
            torrent.clone(),
            store,
            ctx.hash_pool.clone(),
            ctx.config.session.endgame_threshold,
        );
        let handle = SessionHandle {
            torrent: torrent.clone(),
            tx: tx.clone(),
            status,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            tracing::info!(
                "starting session for `{}` ({})",
                torrent.name(),
                torrent.info_hash()
            );
            let pieces = if checking {
                tracing::info!("checking the data of `{}`", torrent.name());
                let checked = tokio::select! {
                    _ = cancel.cancelled() => return,
                    checked = pieces.recheck() => checked,
                };
                match checked {
                    Ok(pieces) => pieces,
                    Err(error) => {
                        tracing::error!("failed to check `{}`: {error}", torrent.name());
                        ctx.alerts.post(Alert::SessionError {
                            name: torrent.name().to_string(),
                            error: error.to_string(),
                        });
                        status_tx.send_modify(|status| {
                            status.state = SessionState::Error;
                            status.error = Some(error.to_string());
                        });
                        return;
                    }
                }
            } else {
                pieces
            };

            let mut session = Self {
                torrent,
                ctx,
                pieces,
                peers: HashMap::new(),
                next_key: 0,
                banned_addrs: HashSet::new(),
                banned_ids: HashSet::new(),
                inbox,
                self_tx: tx,
                status_tx,
                cancel,
                state,
                error: None,
                uploaded: 0,
                downloaded: 0,
                rates: Rates::new(),
                next_announce: None,
                announce_in_flight: false,
                resume_dirty: checking,
            };
            if checking {
                let state = if session.pieces.is_complete() {
                    SessionState::Seeding
                } else {
                    SessionState::Downloading
                };
                session.set_state(state);
            }
            session.announce(AnnounceEvent::Started);
            session.run().await;
        });
        handle
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.ctx.config.session.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close_all_peers();
                    self.persist();
                    self.set_state(SessionState::Stopped);
                    break;
                }
                msg = self.inbox.recv() => match msg {
                    Some(SessionMsg::Stop(done)) => {
                        self.stop().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                (piece, passed) = self.pieces.next_hashed() => self.on_hashed(piece, passed),
                _ = tick.tick() => self.on_tick(),
            }
            if self.state == SessionState::Error {
                break;
            }
        }
        tracing::info!("session for `{}` ended", self.torrent.name());
    }

    fn handle(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::AddPeer(addr) => self.connect(addr),
            SessionMsg::RemovePeer(addr) => {
                let keys: Vec<PeerKey> = self
                    .peers
                    .values()
                    .filter(|record| record.addr == addr)
                    .map(|record| record.key)
                    .collect();
                for key in keys {
                    self.disconnect(key, "removed");
                }
            }
            SessionMsg::Incoming {
                stream,
                addr,
                handshake,
            } => self.accept(stream, addr, handshake),
            SessionMsg::Peer { key, event } => self.on_peer_event(key, event),
            SessionMsg::Announced(result) => self.on_announced(result),
            // handled by the loop
            SessionMsg::Stop(done) => {
                let _ = done.send(());
            }
        }
    }

    fn can_take_peer(&self, addr: SocketAddr) -> bool {
        if self.state == SessionState::Stopped || self.banned_addrs.contains(&addr) {
            return false;
        }
        self.peers.len() < self.ctx.config.network.max_peers
    }

    fn connect(&mut self, addr: SocketAddr) {
        if !self.can_take_peer(addr) || self.peers.values().any(|record| record.addr == addr) {
            tracing::debug!("not connecting to {addr}");
            return;
        }
        let (mut record, task, commands) = self.new_peer(addr);
        record.state = ConnectionState::Connecting;
        tokio::spawn(task.run_outbound(commands));
        self.peers.insert(record.key, record);
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr, handshake: Handshake) {
        let peer_id = PeerId(handshake.peer_id);
        if !self.can_take_peer(addr) || self.banned_ids.contains(&peer_id) {
            tracing::debug!("refusing connection from {addr}");
            return;
        }
        let (mut record, task, commands) = self.new_peer(addr);
        record.state = ConnectionState::Handshaking;
        record.peer_id = Some(peer_id);
        tokio::spawn(task.run_inbound(stream, handshake, commands));
        self.peers.insert(record.key, record);
    }

    fn new_peer(
        &mut self,
        addr: SocketAddr,
    ) -> (
        PeerRecord,
        PeerTask,
        mpsc::Receiver<PeerCommand>,
    ) {
        let key = PeerKey(self.next_key);
        self.next_key += 1;
        let (commands_tx, commands) = mpsc::channel(self.ctx.config.session.peer_queue);
        let cancel = self.cancel.child_token();
        let task = PeerTask::new(
            key,
            addr,
            self.torrent.info_hash(),
            self.ctx.peer_id,
            self.self_tx.clone(),
            cancel.clone(),
            self.ctx.config.network.clone(),
        );
        self.pieces.selector.add_peer(key);
        (PeerRecord::new(key, addr, commands_tx, cancel), task, commands)
    }

    fn disconnect(&mut self, key: PeerKey, reason: &str) {
        let Some(mut record) = self.peers.remove(&key) else {
            return;
        };
        record.state = ConnectionState::Disconnected;
        record.shutdown();
        let released = self.pieces.selector.remove_peer(key);
        tracing::debug!(
            "dropped peer {} ({reason}), {released} blocks back in the pool",
            record.addr
        );
        self.fill_all();
    }

    fn close_all_peers(&mut self) {
        for (key, record) in self.peers.drain() {
            record.shutdown();
            self.pieces.selector.remove_peer(key);
        }
    }

    fn on_peer_event(&mut self, key: PeerKey, event: PeerEvent) {
        if !self.peers.contains_key(&key) {
            // events still queued from a peer we already dropped
            return;
        }
        match event {
            PeerEvent::Handshaking => {
                if let Some(record) = self.peers.get_mut(&key) {
                    record.state = ConnectionState::Handshaking;
                }
            }
            PeerEvent::Connected(peer_id) => self.on_connected(key, peer_id),
            PeerEvent::Message(message) => {
                if let Err(violation) = self.on_message(key, message) {
                    let addr = self.peers.get(&key).map(|record| record.addr);
                    tracing::warn!("peer {addr:?} violated the protocol: {violation}");
                    self.disconnect(key, "protocol violation");
                }
            }
            PeerEvent::Closed(reason) => {
                let reason = match &reason {
                    Some(PeerError::HandshakeMismatch { .. }) => "handshake mismatch",
                    Some(PeerError::ProtocolViolation(_)) => "protocol violation",
                    Some(PeerError::Timeout(_)) => "timeout",
                    Some(_) => "connection closed",
                    None => "shut down",
                };
                self.disconnect(key, reason);
            }
        }
    }

    fn on_connected(&mut self, key: PeerKey, peer_id: PeerId) {
        let duplicate = self.peers.values().any(|record| {
            record.key != key && record.state.is_active() && record.peer_id == Some(peer_id)
        });
        if peer_id == self.ctx.peer_id || duplicate || self.banned_ids.contains(&peer_id) {
            self.disconnect(key, "unwanted peer id");
            return;
        }

        let have = self.pieces.store.have().to_vec();
        let Some(record) = self.peers.get_mut(&key) else {
            return;
        };
        record.peer_id = Some(peer_id);
        record.state = ConnectionState::Connected;
        tracing::info!("connected to {} ({peer_id})", record.addr);

        let bitfield = BitfieldPayload {
            pieces_available: have,
        };
        if !bitfield.is_nothing() && !record.send(PeerMessage::Bitfield(bitfield)) {
            self.disconnect(key, "slow peer");
            return;
        }
        self.publish();
    }

    fn on_message(&mut self, key: PeerKey, message: PeerMessage) -> Result<(), String> {
        let piece_count = self.torrent.info.piece_count();
        let Some(record) = self.peers.get_mut(&key) else {
            return Ok(());
        };
        let first_message = record.messages_received == 0;
        if message != PeerMessage::KeepAlive {
            record.messages_received += 1;
        }

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                record.state = ConnectionState::Choked;
                record.clear_requests();
                self.pieces.selector.release_peer(key);
            }
            PeerMessage::Unchoke => {
                record.state = ConnectionState::Unchoked;
                self.fill_requests(key);
            }
            PeerMessage::Interested => {
                record.peer_interested = true;
                self.rechoke();
            }
            PeerMessage::NotInterested => {
                record.peer_interested = false;
                self.rechoke();
            }
            PeerMessage::Have(have) => {
                if have.piece_index >= piece_count {
                    return Err(format!("have for piece {}", have.piece_index));
                }
                let interesting = self.pieces.selector.peer_have(key, have.piece_index);
                self.update_interest(key, interesting);
            }
            PeerMessage::Bitfield(bitfield) => {
                if !first_message {
                    return Err("bitfield after the first message".to_string());
                }
                let bits = bitfield.pieces_available;
                let n = piece_count as usize;
                if bits.len() != n.div_ceil(8) * 8 || bits[n..].iter().any(|&spare| spare) {
                    return Err(format!("bitfield of {} bits for {n} pieces", bits.len()));
                }
                let interesting = self.pieces.selector.peer_bitfield(key, &bits[..n]);
                self.update_interest(key, interesting);
            }
            PeerMessage::Request(request) => {
                if request.length > MAX_UPLOAD_BLOCK {
                    return Err(format!("request of {} bytes", request.length));
                }
                if record.am_choking || request.length == 0 {
                    return Ok(());
                }
                match self
                    .pieces
                    .read_block(request.index, request.begin, request.length)
                {
                    Ok(block) => {
                        let length = block.len() as u64;
                        let piece = PeerMessage::Piece(ResponsePiecePayload {
                            index: request.index,
                            begin: request.begin,
                            block,
                        });
                        if !record.send(piece) {
                            self.disconnect(key, "slow peer");
                            return Ok(());
                        }
                        record.uploaded += length;
                        self.uploaded += length;
                        self.rates.uploaded += length;
                    }
                    Err(error) if error.is_fatal() => self.fail(error),
                    Err(error) => tracing::debug!("not serving {request:?}: {error}"),
                }
            }
            PeerMessage::Piece(piece) => self.on_piece(key, piece),
            // requests are answered right away, so there is nothing left to cancel
            PeerMessage::Cancel(_) => {}
        }
        Ok(())
    }

    fn on_piece(&mut self, key: PeerKey, piece: ResponsePiecePayload) {
        let block = BlockInfo {
            piece: piece.index,
            offset: piece.begin,
            length: piece.block.len() as u32,
        };
        if let Some(record) = self.peers.get_mut(&key) {
            record.take_request(&block);
        }

        match self.pieces.on_block(key, block, &piece.block) {
            Ok(BlockOutcome::Accepted { cancel, .. }) => {
                let length = block.length as u64;
                self.downloaded += length;
                self.rates.downloaded += length;
                if let Some(record) = self.peers.get_mut(&key) {
                    record.downloaded += length;
                }
                for other in cancel {
                    let Some(record) = self.peers.get_mut(&other) else {
                        continue;
                    };
                    if record.forget(&block) {
                        let request = RequestPiecePayload::new(
                            block.piece,
                            block.offset,
                            block.length,
                        );
                        record.send(PeerMessage::Cancel(request));
                    }
                }
            }
            Ok(BlockOutcome::Duplicate) => {
                tracing::trace!("duplicate block {}+{}", block.piece, block.offset);
            }
            Ok(BlockOutcome::Unexpected) => {
                tracing::debug!("unexpected block {}+{}", block.piece, block.offset);
            }
            Err(error) if error.is_fatal() => {
                self.fail(error);
                return;
            }
            Err(error) => tracing::warn!("failed to store block: {error}"),
        }
        self.fill_requests(key);
    }

    fn update_interest(&mut self, key: PeerKey, interesting: bool) {
        let Some(record) = self.peers.get_mut(&key) else {
            return;
        };
        if record.am_interested != interesting {
            record.am_interested = interesting;
            let message = if interesting {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            };
            if !record.send(message) {
                self.disconnect(key, "slow peer");
                return;
            }
        }
        self.fill_requests(key);
    }

    /// Tops up the queue of `key` from the selector and sends requests until the pipeline
    /// is full.
    fn fill_requests(&mut self, key: PeerKey) {
        let depth = self.ctx.config.session.pipeline_depth;
        let Some(record) = self.peers.get_mut(&key) else {
            return;
        };
        if !record.state.can_request() || !record.am_interested {
            return;
        }

        let wanted = (2 * depth).saturating_sub(record.outstanding.len() + record.queued.len());
        if wanted > 0 {
            record
                .queued
                .extend(self.pieces.selector.next_requests(key, wanted));
        }

        let now = Instant::now();
        while record.outstanding.len() < depth
            && let Some(block) = record.queued.pop_front()
        {
            let request =
                RequestPiecePayload::new(block.piece, block.offset, block.length);
            if !record.send(PeerMessage::Request(request)) {
                self.disconnect(key, "slow peer");
                return;
            }
            record.outstanding.push(BlockRequest {
                block,
                peer: key,
                issued: now,
            });
        }
    }

    fn fill_all(&mut self) {
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.fill_requests(key);
        }
    }

    /// Unchokes interested peers up to the upload slot limit, the ones that gave us the
    /// most first.
    fn rechoke(&mut self) {
        let mut interested: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|record| record.peer_interested && record.state.is_active())
            .collect();
        // a seed ranks by what the peers took from us, there is nothing left to download
        let seeding = self.pieces.is_complete();
        interested.sort_by_key(|record| {
            let rate = if seeding {
                record.uploaded
            } else {
                record.downloaded
            };
            (std::cmp::Reverse(rate), record.key)
        });
        let unchoked: HashSet<PeerKey> = interested
            .iter()
            .take(self.ctx.config.network.upload_slots)
            .map(|record| record.key)
            .collect();

        let mut slow = Vec::new();
        for record in self.peers.values_mut() {
            let choke = !unchoked.contains(&record.key);
            if choke != record.am_choking {
                record.am_choking = choke;
                let message = if choke {
                    PeerMessage::Choke
                } else {
                    PeerMessage::Unchoke
                };
                if !record.send(message) {
                    slow.push(record.key);
                }
            }
        }
        for key in slow {
            self.disconnect(key, "slow peer");
        }
    }

    fn on_hashed(&mut self, piece: u32, passed: bool) {
        match self.pieces.finish_hash(piece, passed) {
            Ok(HashVerdict::Verified { .. }) => {
                self.resume_dirty = true;
                let mut slow = Vec::new();
                for record in self.peers.values() {
                    if record.state.is_active()
                        && !record.send(PeerMessage::Have(HavePayload { piece_index: piece }))
                    {
                        slow.push(record.key);
                    }
                }
                for key in slow {
                    self.disconnect(key, "slow peer");
                }
                // peers that only had what we now have are not interesting anymore
                let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
                for key in keys {
                    let interesting = self.pieces.selector.is_interesting(key);
                    self.update_interest(key, interesting);
                }
                if self.pieces.is_complete() && self.state == SessionState::Downloading {
                    self.on_finished();
                }
                self.publish();
            }
            Ok(HashVerdict::Failed { contributors }) => {
                self.ctx.alerts.post(Alert::PieceFailed {
                    name: self.torrent.name().to_string(),
                    piece,
                });
                for key in contributors {
                    self.count_hash_failure(key);
                }
                self.fill_all();
            }
            Err(error) if error.is_fatal() => self.fail(error),
            Err(error) => {
                tracing::warn!("failed to store piece {piece}: {error}");
                self.fill_all();
            }
        }
    }

    fn count_hash_failure(&mut self, key: PeerKey) {
        let limit = self.ctx.config.session.max_hash_failures;
        let Some(record) = self.peers.get_mut(&key) else {
            return;
        };
        record.hash_failures += 1;
        if record.hash_failures < limit {
            return;
        }
        tracing::warn!(
            "banning {} after {} hash failures",
            record.addr,
            record.hash_failures
        );
        let addr = record.addr;
        self.banned_addrs.insert(addr);
        if let Some(peer_id) = record.peer_id {
            self.banned_ids.insert(peer_id);
        }
        self.ctx.alerts.post(Alert::PeerBanned {
            name: self.torrent.name().to_string(),
            addr,
        });
        self.disconnect(key, "banned");
    }

    fn on_finished(&mut self) {
        tracing::info!("`{}` finished downloading", self.torrent.name());
        self.ctx.alerts.post(Alert::TorrentFinished {
            name: self.torrent.name().to_string(),
        });
        self.set_state(SessionState::Seeding);
        self.persist();
        self.announce(AnnounceEvent::Completed);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let timeout = self.ctx.config.session.request_timeout;
        for record in self.peers.values_mut() {
            for expired in record.expired(timeout, now) {
                tracing::debug!(
                    "request {}+{} to {} timed out",
                    expired.block.piece,
                    expired.block.offset,
                    record.addr
                );
                self.pieces.selector.release(record.key, expired.block);
                let request = RequestPiecePayload::new(
                    expired.block.piece,
                    expired.block.offset,
                    expired.block.length,
                );
                record.send(PeerMessage::Cancel(request));
            }
        }
        self.fill_all();
        self.rechoke();
        self.rates.roll(now);

        if !self.announce_in_flight
            && let Some(at) = self.next_announce
            && at <= now
        {
            self.announce(AnnounceEvent::Periodic);
        }
        if self.resume_dirty {
            self.persist();
        }
        self.publish();
    }

    fn announce(&mut self, event: AnnounceEvent) {
        let Some(tracker) = self.ctx.tracker.clone() else {
            return;
        };
        let request = AnnounceRequest {
            info_hash: self.torrent.info_hash(),
            peer_id: self.ctx.peer_id,
            port: self.ctx.listen_port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.torrent.info.total_length() - self.pieces.store.bytes_verified(),
            event,
        };
        let tx = self.self_tx.clone();
        let reply = event != AnnounceEvent::Stopped;
        self.announce_in_flight |= reply;
        tokio::spawn(async move {
            let result = tracker.announce(&request).await;
            if reply {
                let _ = tx.send(SessionMsg::Announced(result)).await;
            } else if let Err(error) = result {
                tracing::debug!("stopped announce failed: {error}");
            }
        });
    }

    fn on_announced(&mut self, result: Result<AnnounceResponse, TrackerError>) {
        self.announce_in_flight = false;
        let default_interval = self.ctx.config.network.default_announce_interval;
        match result {
            Ok(response) => {
                tracing::debug!(
                    "tracker returned {} peers for `{}`",
                    response.peers.len(),
                    self.torrent.name()
                );
                self.next_announce =
                    Some(Instant::now() + response.interval.unwrap_or(default_interval));
                if !self.pieces.is_complete() {
                    for addr in response.peers {
                        self.connect(addr);
                    }
                }
            }
            Err(error) => {
                tracing::warn!("announce for `{}` failed: {error}", self.torrent.name());
                self.ctx.alerts.post(Alert::TrackerError {
                    name: self.torrent.name().to_string(),
                    error: error.to_string(),
                });
                self.next_announce = Some(Instant::now() + default_interval);
            }
        }
    }

    async fn stop(&mut self) {
        let deadline = Instant::now() + self.ctx.config.session.stop_timeout;
        while self.pieces.hashing_in_flight() > 0 {
            match tokio::time::timeout_at(deadline, self.pieces.next_hashed()).await {
                Ok((piece, passed)) => self.on_hashed(piece, passed),
                Err(_) => {
                    tracing::warn!("gave up waiting for hashing of `{}`", self.torrent.name());
                    break;
                }
            }
        }
        self.close_all_peers();
        self.persist();
        self.announce(AnnounceEvent::Stopped);
        self.set_state(SessionState::Stopped);
    }

    fn persist(&mut self) {
        match self.pieces.store.persist() {
            Ok(()) => self.resume_dirty = false,
            Err(error) => tracing::warn!(
                "failed to persist the bitmap of `{}`: {error}",
                self.torrent.name()
            ),
        }
    }

    fn fail(&mut self, error: StoreError) {
        tracing::error!("session for `{}` failed: {error}", self.torrent.name());
        self.ctx.alerts.post(Alert::SessionError {
            name: self.torrent.name().to_string(),
            error: error.to_string(),
        });
        self.error = Some(error.to_string());
        self.close_all_peers();
        self.set_state(SessionState::Error);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.ctx.alerts.post(Alert::StateChanged {
                name: self.torrent.name().to_string(),
                state,
            });
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> TorrentStatus {
        let total = self.torrent.info.total_length();
        let verified = self.pieces.store.bytes_verified();
        TorrentStatus {
            name: self.torrent.name().to_string(),
            info_hash: self.torrent.info_hash().to_hex(),
            state: self.state,
            progress: progress(verified, total),
            is_seeding: self.state == SessionState::Seeding,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            num_peers: self
                .peers
                .values()
                .filter(|record| record.state.is_active())
                .count(),
            download_rate: self.rates.download_rate,
            upload_rate: self.rates.upload_rate,
            pieces_verified: self.pieces.store.verified_count(),
            pieces_total: self.torrent.info.piece_count() as usize,
            endgame: self.pieces.selector.in_endgame(),
            error: self.error.clone(),
        }
    }
}

fn initial_status(torrent: &Torrent, store: &PieceStore, state: SessionState) -> TorrentStatus {
    let total = torrent.info.total_length();
    TorrentStatus {
        name: torrent.name().to_string(),
        info_hash: torrent.info_hash().to_hex(),
        state,
        progress: progress(store.bytes_verified(), total),
        is_seeding: state == SessionState::Seeding,
        uploaded: 0,
        downloaded: 0,
        num_peers: 0,
        download_rate: 0,
        upload_rate: 0,
        pieces_verified: store.verified_count(),
        pieces_total: torrent.info.piece_count() as usize,
        endgame: false,
        error: None,
    }
}

fn progress(verified: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        verified as f64 / total as f64
    }
}
