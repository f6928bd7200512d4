use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::session::status::SessionState;
use crate::torrent::InfoHash;

/// Something a front end may want to tell its user about.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    TorrentAdded { name: String, info_hash: InfoHash },
    StateChanged { name: String, state: SessionState },
    PieceFailed { name: String, piece: u32 },
    TorrentFinished { name: String },
    PeerBanned { name: String, addr: SocketAddr },
    TrackerError { name: String, error: String },
    /// The session hit a fatal error and stopped.
    SessionError { name: String, error: String },
    TorrentRemoved { name: String },
}

impl Alert {
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Alert::TrackerError { .. } | Alert::SessionError { .. }
        )
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::TorrentAdded { name, info_hash } => {
                write!(f, "{name}: added ({info_hash})")
            }
            Alert::StateChanged { name, state } => write!(f, "{name}: {state}"),
            Alert::PieceFailed { name, piece } => {
                write!(f, "{name}: piece {piece} failed the hash check")
            }
            Alert::TorrentFinished { name } => write!(f, "{name}: torrent finished downloading"),
            Alert::PeerBanned { name, addr } => write!(f, "{name}: banned peer {addr}"),
            Alert::TrackerError { name, error } => write!(f, "{name}: tracker error: {error}"),
            Alert::SessionError { name, error } => write!(f, "{name}: error: {error}"),
            Alert::TorrentRemoved { name } => write!(f, "{name}: removed"),
        }
    }
}

/// The sending half of the alert channel. Posting never waits; alerts are dropped while
/// nobody drains the channel.
#[derive(Debug, Clone)]
pub struct AlertSender(mpsc::Sender<Alert>);

impl AlertSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self(tx), rx)
    }

    pub fn post(&self, alert: Alert) {
        if let Err(mpsc::error::TrySendError::Full(alert)) = self.0.try_send(alert) {
            tracing::debug!("alert channel full, dropping `{alert}`");
        }
    }
}
