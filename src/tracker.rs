use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_bencode::value::Value;
use thiserror::Error;

use crate::peer::PeerId;
use crate::torrent::InfoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    /// a regular re-announce
    Periodic,
}

impl AnnounceEvent {
    fn as_query(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Periodic => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// the port we accept connections on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// the number of bytes left to download
    pub left: u64,
    pub event: AnnounceEvent,
}

impl AnnounceRequest {
    fn to_url_encoded(&self) -> String {
        let mut url_encoded = String::new();
        url_encoded.push_str(&format!(
            "info_hash={}",
            escape_bytes_url(&self.info_hash.0)
        ));
        url_encoded.push_str(&format!("&peer_id={}", escape_bytes_url(&self.peer_id.0)));
        url_encoded.push_str(&format!("&port={}", self.port));
        url_encoded.push_str(&format!("&uploaded={}", self.uploaded));
        url_encoded.push_str(&format!("&downloaded={}", self.downloaded));
        url_encoded.push_str(&format!("&left={}", self.left));
        url_encoded.push_str("&compact=1");
        if let Some(event) = self.event.as_query() {
            url_encoded.push_str(&format!("&event={event}"));
        }
        url_encoded
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// how long to wait before the next regular announce
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

/// Where a session learns about peers.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;
}

/// Announces over HTTP, trying the urls in order until one answers.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
    urls: Vec<url::Url>,
}

impl HttpTracker {
    pub fn new(
        urls: &[String],
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, TrackerError> {
        let urls = urls
            .iter()
            .map(|url| url::Url::parse(url))
            .collect::<Result<Vec<_>, _>>()?;
        if urls.is_empty() {
            return Err(TrackerError::NoTrackers);
        }
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, urls })
    }

    async fn announce_to(
        &self,
        url: &url::Url,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut url = url.clone();
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => {
                format!("{existing}&{}", request.to_url_encoded())
            }
            _ => request.to_url_encoded(),
        };
        url.set_query(Some(&query));

        let response = self.client.get(url.clone()).send().await?;
        let response_bytes = Bytes::copy_from_slice(&response.bytes().await?);
        parse_response(&response_bytes, url.as_str())
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let mut last_error = TrackerError::NoTrackers;
        for url in &self.urls {
            match self.announce_to(url, request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::debug!("announce to {url} failed: {error}");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }
}

fn escape_bytes_url(bytes: &[u8; 20]) -> String {
    bytes
        .iter()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b"-_.~".contains(b) {
                (*b as char).to_string()
            } else {
                format!("%{}", hex::encode([*b]))
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    /// An integer, indicating how often your client should make a request to the tracker, in seconds.
    #[serde(default)]
    interval: Option<u64>,
    /// Either a string of 6 bytes per peer (4 for the ip, 2 for the port), or a list of
    /// dictionaries with `ip` and `port`.
    #[serde(default)]
    peers: Option<Value>,
}

fn parse_response(bytes: &[u8], url: &str) -> Result<AnnounceResponse, TrackerError> {
    let invalid = |reason: String| TrackerError::InvalidResponse {
        reason,
        url: url.to_string(),
    };
    let response = serde_bencode::from_bytes::<TrackerResponse>(bytes)
        .map_err(|error| invalid(error.to_string()))?;
    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure {
            reason,
            url: url.to_string(),
        });
    }

    let peers = match response.peers {
        None => Vec::new(),
        Some(Value::Bytes(compact)) => {
            if compact.len() % 6 != 0 {
                return Err(invalid(format!(
                    "compact peers of {} bytes are not a multiple of 6",
                    compact.len()
                )));
            }
            compact
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::V4(SocketAddrV4::new(ip, port))
                })
                .collect()
        }
        Some(Value::List(dicts)) => dicts.iter().filter_map(dict_peer).collect(),
        Some(_) => return Err(invalid("`peers` has an unknown shape".to_string())),
    };

    Ok(AnnounceResponse {
        interval: response.interval.map(Duration::from_secs),
        peers,
    })
}

fn dict_peer(value: &Value) -> Option<SocketAddr> {
    let Value::Dict(dict) = value else {
        return None;
    };
    let Some(Value::Bytes(ip)) = dict.get(b"ip".as_slice()) else {
        return None;
    };
    let Some(Value::Int(port)) = dict.get(b"port".as_slice()) else {
        return None;
    };
    let ip = std::str::from_utf8(ip).ok()?.parse().ok()?;
    Some(SocketAddr::new(ip, u16::try_from(*port).ok()?))
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Failed to parse announce url: `{0}`")]
    InvalidUrl(#[from] url::ParseError),
    #[error("The tracker at `{url}` sent an invalid response: {reason}")]
    InvalidResponse { reason: String, url: String },
    #[error("The tracker at `{url}` refused the announce: {reason}")]
    Failure { reason: String, url: String },
    #[error("Something failed with requesting the tracker-response: `{0}`")]
    ReqwestError(#[from] reqwest::Error),
    #[error("The torrent has no trackers")]
    NoTrackers,
}
