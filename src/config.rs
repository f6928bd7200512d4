//! Tunable parameters of the engine.
//!
//! Everything has a default; `Config::from_env` lets `DYNAMIC_PEER_*` variables override the
//! values most likely to need changing, and the CLI overrides a few more from its flags.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::torrent::DEFAULT_PIECE_LENGTH;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

/// Peer wire and tracker settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the manager accepts peer connections on.
    pub listen_addr: SocketAddr,
    /// The first 8 bytes of our peer id, Azureus style.
    pub client_prefix: &'static str,
    /// User agent of tracker requests
    pub user_agent: &'static str,
    /// Connected peers per torrent
    pub max_peers: usize,
    /// How many interested peers get unchoked at once.
    pub upload_slots: usize,
    pub connect_timeout: Duration,
    /// A keep-alive is sent after this much silence on our side.
    pub keep_alive: Duration,
    /// The peer is dropped after this much silence on its side.
    pub idle_timeout: Duration,
    pub tracker_timeout: Duration,
    /// Used when a tracker does not tell us its interval.
    pub default_announce_interval: Duration,
    /// Announce url written into torrents we create when none is given.
    pub default_tracker: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 6881)),
            client_prefix: "-DP0001-",
            user_agent: "dynamic-peer/1.0",
            max_peers: 50,
            upload_slots: 4,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(180),
            tracker_timeout: Duration::from_secs(30),
            default_announce_interval: Duration::from_secs(1800),
            default_tracker: Some("http://localhost:8080/announce".to_string()),
        }
    }
}

/// Settings of a running torrent session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Requests in flight per peer; the rest wait in the peer's queue.
    pub pipeline_depth: usize,
    pub request_timeout: Duration,
    /// Unreceived blocks at or below which endgame starts.
    pub endgame_threshold: usize,
    /// Pieces hashed concurrently.
    pub hash_workers: usize,
    /// Hash failures a peer may contribute to before it is banned.
    pub max_hash_failures: u32,
    pub alert_capacity: usize,
    /// Commands buffered per peer task before the peer counts as too slow.
    pub peer_queue: usize,
    /// Period of timeouts, choking and rate bookkeeping.
    pub tick_interval: Duration,
    /// Upper bound for waiting on in-flight hashing when stopping.
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 8,
            request_timeout: Duration::from_secs(30),
            endgame_threshold: 16,
            hash_workers: 2,
            max_hash_failures: 3,
            alert_capacity: 256,
            peer_queue: 256,
            tick_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Piece length of torrents we create.
    pub piece_length: u32,
    /// Where `seed` writes the generated `.torrent` files.
    pub torrents_dir: PathBuf,
    /// Default save path of downloads.
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            piece_length: DEFAULT_PIECE_LENGTH,
            torrents_dir: PathBuf::from("torrents"),
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl Config {
    /// Defaults overridden by the `DYNAMIC_PEER_*` environment variables that are set and
    /// parse. Durations are given in seconds.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("DYNAMIC_PEER_{name}"));
        let mut config = Self::default();

        if let Some(addr) = parsed(get("LISTEN_ADDR")) {
            config.network.listen_addr = addr;
        }
        if let Some(max_peers) = parsed(get("MAX_PEERS")) {
            config.network.max_peers = max_peers;
        }
        if let Some(slots) = parsed(get("UPLOAD_SLOTS")) {
            config.network.upload_slots = slots;
        }
        // an empty value turns the default tracker off
        if let Some(tracker) = get("TRACKER") {
            let tracker = tracker.trim();
            config.network.default_tracker = (!tracker.is_empty()).then(|| tracker.to_string());
        }
        if let Some(seconds) = parsed(get("TRACKER_TIMEOUT")) {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }
        if let Some(depth) = parsed::<usize>(get("PIPELINE_DEPTH"))
            && depth > 0
        {
            config.session.pipeline_depth = depth;
        }
        if let Some(seconds) = parsed(get("REQUEST_TIMEOUT")) {
            config.session.request_timeout = Duration::from_secs(seconds);
        }
        if let Some(threshold) = parsed(get("ENDGAME_THRESHOLD")) {
            config.session.endgame_threshold = threshold;
        }
        if let Some(workers) = parsed::<usize>(get("HASH_WORKERS"))
            && workers > 0
        {
            config.session.hash_workers = workers;
        }
        if let Some(failures) = parsed(get("MAX_HASH_FAILURES")) {
            config.session.max_hash_failures = failures;
        }
        if let Some(piece_length) = parsed::<u32>(get("PIECE_LENGTH"))
            && piece_length > 0
        {
            config.storage.piece_length = piece_length;
        }
        if let Some(dir) = get("TORRENTS_DIR") {
            config.storage.torrents_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        config
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring unparsable configuration value `{value}`");
            None
        }
    }
}

#[cfg(test)]
mod test_config {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.network.client_prefix.len(), 8);
        assert_eq!(config.session.pipeline_depth, 8);
        assert_eq!(config.storage.piece_length, 16 * 1024);
        assert_eq!(config.storage.torrents_dir, PathBuf::from("torrents"));
        assert_eq!(
            config.network.default_tracker.as_deref(),
            Some("http://localhost:8080/announce")
        );
    }

    #[test]
    fn default_tracker_can_be_replaced_or_disabled() {
        let replaced = Config::from_lookup(|name| {
            (name == "DYNAMIC_PEER_TRACKER").then(|| "http://tracker.lan/announce".to_string())
        });
        assert_eq!(
            replaced.network.default_tracker.as_deref(),
            Some("http://tracker.lan/announce")
        );

        let disabled =
            Config::from_lookup(|name| (name == "DYNAMIC_PEER_TRACKER").then(|| " ".to_string()));
        assert_eq!(disabled.network.default_tracker, None);
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DYNAMIC_PEER_LISTEN_ADDR", "127.0.0.1:7000"),
            ("DYNAMIC_PEER_PIPELINE_DEPTH", "16"),
            ("DYNAMIC_PEER_REQUEST_TIMEOUT", "5"),
            ("DYNAMIC_PEER_HASH_WORKERS", "0"),
            ("DYNAMIC_PEER_MAX_PEERS", "many"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.network.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.session.pipeline_depth, 16);
        assert_eq!(config.session.request_timeout, Duration::from_secs(5));
        // zero workers and garbage fall back to the defaults
        assert_eq!(config.session.hash_workers, 2);
        assert_eq!(config.network.max_peers, 50);
    }
}
