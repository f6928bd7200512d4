use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// hashing the data already on disk
    Checking,
    Downloading,
    Seeding,
    Stopped,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Checking => "checking",
            SessionState::Downloading => "downloading",
            SessionState::Seeding => "seeding",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        })
    }
}

/// A snapshot of a torrent session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentStatus {
    pub name: String,
    pub info_hash: String,
    pub state: SessionState,
    /// verified bytes over total bytes, between 0 and 1
    pub progress: f64,
    pub is_seeding: bool,
    pub uploaded: u64,
    pub downloaded: u64,
    pub num_peers: usize,
    /// bytes per second, averaged over the last tick
    pub download_rate: u64,
    pub upload_rate: u64,
    pub pieces_verified: usize,
    pub pieces_total: usize,
    pub endgame: bool,
    pub error: Option<String>,
}

impl TorrentStatus {
    pub fn is_finished(&self) -> bool {
        self.pieces_verified == self.pieces_total
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {:.1}% | down {} B ({:.1} KB/s) | up {} B ({:.1} KB/s) | peers {}",
            self.name,
            self.state,
            self.progress * 100.0,
            self.downloaded,
            self.download_rate as f64 / 1000.0,
            self.uploaded,
            self.upload_rate as f64 / 1000.0,
            self.num_peers,
        )?;
        if let Some(error) = &self.error {
            write!(f, " | {error}")?;
        }
        Ok(())
    }
}
