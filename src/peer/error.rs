use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::messages::MessageError;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Failed to establish a tcp connection to the address `{addr}` with error: `{error:?}`")]
    FailedToConnect { error: io::Error, addr: SocketAddr },
    #[error("Connecting to `{0}` timed out")]
    ConnectTimeout(SocketAddr),
    #[error("Failed to write the handshake to the remote peer with the error: `{0}`.")]
    SendHandshake(io::Error),
    #[error(
        "Failed to read the bytes from the remote peer needed for the handshake with the error: `{0}`."
    )]
    RecvHandshake(io::Error),
    #[error("Failed to decode the handshake received from the peer with the error: `{0}`")]
    DecodeHandshake(#[from] bincode::error::DecodeError),
    #[error("Failed to encode the handshake with the error: `{0}`")]
    EncodeHandshake(#[from] bincode::error::EncodeError),
    #[error("The remote peer doesn't speak the BitTorrent protocol")]
    UnknownProtocol,
    #[error("The peer answered for infohash `{got}` instead of `{expected}`")]
    HandshakeMismatch { expected: String, got: String },
    #[error("The peer violated the protocol: {0}")]
    ProtocolViolation(String),
    #[error("Failed to exchange messages with the peer: `{0}`")]
    Io(io::Error),
    #[error("The peer sent nothing for {0:?}")]
    Timeout(Duration),
    #[error("The peer unexpectedly disconnected.")]
    PeerDisconnected,
    #[error("The session owning this connection is gone")]
    SessionGone,
}

impl From<MessageError> for PeerError {
    fn from(error: MessageError) -> Self {
        match error {
            MessageError::Io(error) => PeerError::Io(error),
            violation => PeerError::ProtocolViolation(violation.to_string()),
        }
    }
}
