use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::messages::PeerMessage;
use crate::peer::{ConnectionState, PeerCommand, PeerId, PeerKey};
use crate::session::piece_manager::BlockInfo;

/// A request that was put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub block: BlockInfo,
    pub peer: PeerKey,
    pub issued: Instant,
}

/// Everything a session knows about one connection.
#[derive(Debug)]
pub struct PeerRecord {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub state: ConnectionState,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,
    /// frames received since the handshake; a bitfield is only valid as the first
    pub messages_received: u64,
    /// requests in flight, at most the pipeline depth
    pub outstanding: Vec<BlockRequest>,
    /// picked for this peer but not sent yet
    pub queued: VecDeque<BlockInfo>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub hash_failures: u32,
    commands: mpsc::Sender<PeerCommand>,
    cancel: CancellationToken,
}

impl PeerRecord {
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        commands: mpsc::Sender<PeerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            addr,
            peer_id: None,
            state: ConnectionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_interested: false,
            messages_received: 0,
            outstanding: Vec::new(),
            queued: VecDeque::new(),
            uploaded: 0,
            downloaded: 0,
            hash_failures: 0,
            commands,
            cancel,
        }
    }

    /// Hands a message to the peer task without waiting. `false` means the task is gone or
    /// can't keep up, and the peer should be dropped.
    pub fn send(&self, message: PeerMessage) -> bool {
        self.commands.try_send(PeerCommand::Send(message)).is_ok()
    }

    /// Asks the task to close the connection, or cancels it when it can't be asked.
    pub fn shutdown(&self) {
        if self.commands.try_send(PeerCommand::Shutdown).is_err() {
            self.cancel.cancel();
        }
    }

    /// Removes the request for `block` if it is in flight.
    pub fn take_request(&mut self, block: &BlockInfo) -> Option<BlockRequest> {
        let i = self
            .outstanding
            .iter()
            .position(|request| request.block == *block)?;
        Some(self.outstanding.swap_remove(i))
    }

    /// Forgets `block` wherever it is. Returns whether it had been sent.
    pub fn forget(&mut self, block: &BlockInfo) -> bool {
        self.queued.retain(|queued| queued != block);
        self.take_request(block).is_some()
    }

    /// Removes and returns the requests older than `timeout`.
    pub fn expired(&mut self, timeout: Duration, now: Instant) -> Vec<BlockRequest> {
        let (expired, alive): (Vec<_>, Vec<_>) = self
            .outstanding
            .drain(..)
            .partition(|request| now.duration_since(request.issued) >= timeout);
        self.outstanding = alive;
        expired
    }

    /// Drops every sent and queued request, as after a choke.
    pub fn clear_requests(&mut self) {
        self.outstanding.clear();
        self.queued.clear();
    }
}
