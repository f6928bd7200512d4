use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MessageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HavePayload {
    pub piece_index: u32,
}

impl HavePayload {
    pub fn from_be_bytes(mut bytes: &[u8]) -> Result<Self, MessageError> {
        expect_len("have", bytes, 4)?;
        Ok(Self {
            piece_index: bytes.get_u32(),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.piece_index);
    }
}

/// One bool per piece, high bit of the first byte first. Decoding yields every bit of the
/// payload; the receiver knows the piece count and checks the spare bits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitfieldPayload {
    pub pieces_available: Vec<bool>,
}

impl BitfieldPayload {
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let pieces_available = bytes
            .iter()
            .flat_map(|byte| (0..8).rev().map(move |bit| byte >> bit & 1 == 1))
            .collect();
        Self { pieces_available }
    }

    pub fn encoded_len(&self) -> usize {
        self.pieces_available.len().div_ceil(8)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        for chunk in self.pieces_available.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &has)| byte | (u8::from(has) << (7 - i)));
            dst.put_u8(byte);
        }
    }

    /// Whether we have none of the pieces, in which case the bitfield may be left out.
    pub fn is_nothing(&self) -> bool {
        !self.pieces_available.iter().any(|&has| has)
    }
}

/// Payload of both `request` and `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestPiecePayload {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl RequestPiecePayload {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn from_be_bytes(mut bytes: &[u8]) -> Result<Self, MessageError> {
        expect_len("request", bytes, 12)?;
        Ok(Self {
            index: bytes.get_u32(),
            begin: bytes.get_u32(),
            length: bytes.get_u32(),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.index);
        dst.put_u32(self.begin);
        dst.put_u32(self.length);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePiecePayload {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

impl ResponsePiecePayload {
    pub fn from_be_bytes(mut bytes: Bytes) -> Result<Self, MessageError> {
        if bytes.len() < 8 {
            return Err(MessageError::PayloadLength {
                kind: "piece",
                expected: 8,
                got: bytes.len(),
            });
        }
        let index = bytes.get_u32();
        let begin = bytes.get_u32();
        Ok(Self {
            index,
            begin,
            block: bytes,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.index);
        dst.put_u32(self.begin);
        dst.extend_from_slice(&self.block);
    }
}

fn expect_len(kind: &'static str, bytes: &[u8], expected: usize) -> Result<(), MessageError> {
    if bytes.len() != expected {
        return Err(MessageError::PayloadLength {
            kind,
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}
