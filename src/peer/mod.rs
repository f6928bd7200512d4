use std::fmt;

use rand::Rng;

use crate::messages::PeerMessage;
use crate::peer::error::PeerError;

pub mod conn;
pub mod error;
mod event_loop;
pub mod handshake;
pub mod states;

pub use conn::PeerTask;
pub use handshake::Handshake;
pub use states::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// An Azureus style id: the 8 byte client prefix followed by random alphanumerics.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = &prefix.as_bytes()[..prefix.len().min(8)];
        id[..prefix.len()].copy_from_slice(prefix);
        let mut rng = rand::rng();
        for byte in &mut id[prefix.len()..] {
            *byte = rng.sample(rand::distr::Alphanumeric);
        }
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "%{byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// Identifies a connection inside its session. Never reused, unlike addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u64);

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a peer task reports to its session, in the order it happened on the wire.
#[derive(Debug)]
pub enum PeerEvent {
    Handshaking,
    Connected(PeerId),
    Message(PeerMessage),
    /// The connection is gone; `None` when the session asked for it.
    Closed(Option<PeerError>),
}

/// What the session asks a peer task to do.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Send(PeerMessage),
    Shutdown,
}
