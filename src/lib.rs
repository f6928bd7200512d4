//! A BitTorrent peer: torrent creation, a session engine that downloads and seeds over the
//! peer wire protocol, and the command line on top of it.

pub mod alert;
pub mod cli;
pub mod config;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod session;
pub mod torrent;
pub mod tracker;

pub use alert::Alert;
pub use config::Config;
pub use manager::{ManagerError, SessionManager, TorrentHandle};
pub use session::{SessionHandle, SessionState, TorrentStatus};
pub use torrent::{InfoHash, Torrent, TorrentError};
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Tracker, TrackerError};
