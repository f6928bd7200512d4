use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub use payloads::{BitfieldPayload, HavePayload, RequestPiecePayload, ResponsePiecePayload};

pub mod payloads;

/// Frames above this length are rejected in both directions.
pub const MAX_FRAME: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(HavePayload),
    Bitfield(BitfieldPayload),
    Request(RequestPiecePayload),
    Piece(ResponsePiecePayload),
    Cancel(RequestPiecePayload),
    KeepAlive,
}

impl PeerMessage {
    /// The message id, `None` for keep-alives which have none.
    pub fn id(&self) -> Option<u8> {
        match self {
            PeerMessage::Choke => Some(0),
            PeerMessage::Unchoke => Some(1),
            PeerMessage::Interested => Some(2),
            PeerMessage::NotInterested => Some(3),
            PeerMessage::Have(_) => Some(4),
            PeerMessage::Bitfield(_) => Some(5),
            PeerMessage::Request(_) => Some(6),
            PeerMessage::Piece(_) => Some(7),
            PeerMessage::Cancel(_) => Some(8),
            PeerMessage::KeepAlive => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not interested",
            PeerMessage::Have(_) => "have",
            PeerMessage::Bitfield(_) => "bitfield",
            PeerMessage::Request(_) => "request",
            PeerMessage::Piece(_) => "piece",
            PeerMessage::Cancel(_) => "cancel",
            PeerMessage::KeepAlive => "keep-alive",
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            PeerMessage::Have(_) => 4,
            PeerMessage::Bitfield(bitfield) => bitfield.encoded_len(),
            PeerMessage::Request(_) | PeerMessage::Cancel(_) => 12,
            PeerMessage::Piece(piece) => 8 + piece.block.len(),
            _ => 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Frame of length {0} is too large.")]
    FrameTooLarge(usize),
    #[error("Invalid message type: {0}")]
    UnknownId(u8),
    #[error("The {kind} payload must be {expected} bytes long, got {got}")]
    PayloadLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Failed to read or write a frame: `{0}`")]
    Io(#[from] std::io::Error),
}

impl MessageError {
    /// Whether the remote sent something that breaks the wire protocol, as opposed to the
    /// connection failing.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, MessageError::Io(_))
    }
}

/// Length prefixed peer wire codec.
pub struct MessageFramer;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read the length marker.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes);

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        // Check before buffering so a peer can't make us allocate arbitrary amounts.
        if length > MAX_FRAME {
            return Err(MessageError::FrameTooLarge(length as usize));
        }

        let frame_len = 4 + length as usize;
        if src.len() < frame_len {
            // The full frame has not yet arrived.
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let msg_type = src.get_u8();
        let data = src.split_to(length as usize - 1).freeze();

        let message = match msg_type {
            0..=3 => {
                if !data.is_empty() {
                    return Err(MessageError::PayloadLength {
                        kind: "state",
                        expected: 0,
                        got: data.len(),
                    });
                }
                match msg_type {
                    0 => PeerMessage::Choke,
                    1 => PeerMessage::Unchoke,
                    2 => PeerMessage::Interested,
                    _ => PeerMessage::NotInterested,
                }
            }
            4 => PeerMessage::Have(HavePayload::from_be_bytes(&data)?),
            5 => PeerMessage::Bitfield(BitfieldPayload::from_be_bytes(&data)),
            6 => PeerMessage::Request(RequestPiecePayload::from_be_bytes(&data)?),
            7 => PeerMessage::Piece(ResponsePiecePayload::from_be_bytes(data)?),
            8 => PeerMessage::Cancel(RequestPiecePayload::from_be_bytes(&data)?),
            id => return Err(MessageError::UnknownId(id)),
        };
        Ok(Some(message))
    }
}

impl Encoder<PeerMessage> for MessageFramer {
    type Error = MessageError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let Some(id) = item.id() else {
            dst.put_u32(0);
            return Ok(());
        };

        let length = 1 + item.payload_len();
        // Don't send a frame that is longer than the other end will accept.
        if length > MAX_FRAME as usize {
            return Err(MessageError::FrameTooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(id);
        match &item {
            PeerMessage::Have(have) => have.encode(dst),
            PeerMessage::Bitfield(bitfield) => bitfield.encode(dst),
            PeerMessage::Request(request) | PeerMessage::Cancel(request) => request.encode(dst),
            PeerMessage::Piece(piece) => piece.encode(dst),
            _ => {}
        }
        Ok(())
    }
}
