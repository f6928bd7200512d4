use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::error::PeerError;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

#[derive(Debug, Copy, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Handshake {
    length: u8,
    protocol: [u8; 19],
    reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_limit::<HANDSHAKE_LEN>()
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            length: 19,
            protocol: PROTOCOL,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; HANDSHAKE_LEN], PeerError> {
        let mut bytes = [0_u8; HANDSHAKE_LEN];
        bincode::encode_into_slice(*self, &mut bytes, config())?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, PeerError> {
        let (handshake, _) = bincode::decode_from_slice::<Handshake, _>(bytes, config())?;
        if handshake.length != 19 || handshake.protocol != PROTOCOL {
            return Err(PeerError::UnknownProtocol);
        }
        // reserved bits are extension flags we don't speak, so they are ignored
        Ok(handshake)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), PeerError> {
        writer
            .write_all(&self.to_bytes()?)
            .await
            .map_err(PeerError::SendHandshake)
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, PeerError> {
        let mut bytes = [0_u8; HANDSHAKE_LEN];
        reader
            .read_exact(&mut bytes)
            .await
            .map_err(PeerError::RecvHandshake)?;
        Self::from_bytes(&bytes)
    }

    /// Writes our handshake and waits for the remote one, which has to be for the same
    /// torrent.
    pub async fn shake_hands<S>(self, stream: &mut S) -> Result<Self, PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.write_to(stream).await?;
        let remote = Self::read_from(stream).await?;
        if remote.info_hash != self.info_hash {
            return Err(PeerError::HandshakeMismatch {
                expected: hex::encode(self.info_hash),
                got: hex::encode(remote.info_hash),
            });
        }
        Ok(remote)
    }
}

#[cfg(test)]
mod test_handshake {
    use super::*;

    #[test]
    fn wire_layout() {
        let bytes = Handshake::new([1; 20], [2; 20]).to_bytes().unwrap();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[1; 20]);
        assert_eq!(&bytes[48..68], &[2; 20]);
        assert_eq!(
            Handshake::from_bytes(&bytes).unwrap(),
            Handshake::new([1; 20], [2; 20])
        );
    }

    #[test]
    fn other_protocols_are_rejected() {
        let mut bytes = Handshake::new([1; 20], [2; 20]).to_bytes().unwrap();
        bytes[1] = b'b';
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(PeerError::UnknownProtocol)
        ));
    }

    #[tokio::test]
    async fn mismatched_infohash_fails_the_handshake() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        let remote = tokio::spawn(async move {
            let _ = Handshake::read_from(&mut theirs).await.unwrap();
            Handshake::new([9; 20], [3; 20])
                .write_to(&mut theirs)
                .await
                .unwrap();
        });

        let result = Handshake::new([1; 20], [2; 20]).shake_hands(&mut ours).await;
        assert!(matches!(result, Err(PeerError::HandshakeMismatch { .. })));
        remote.await.unwrap();
    }
}
