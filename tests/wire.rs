use std::net::Ipv4Addr;
use std::time::Duration;

use dynamic_peer::messages::{MessageFramer, PeerMessage, RequestPiecePayload};
use dynamic_peer::peer::Handshake;
use dynamic_peer::torrent::generate;
use dynamic_peer::{Config, SessionManager, SessionState};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

async fn next_message(framed: &mut Framed<TcpStream, MessageFramer>) -> Option<PeerMessage> {
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("the seeder went quiet")
        .and_then(Result::ok)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seeder_serves_blocks_and_drops_oversized_requests() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let path = dir.path().join("blob");
    std::fs::write(&path, &data).unwrap();
    let torrent = generate(&[path], 1 << 14, &[]).unwrap();
    let info_hash = torrent.info_hash();

    let mut config = Config::default();
    config.network.listen_addr = (Ipv4Addr::LOCALHOST, 0).into();
    let mut seeder = SessionManager::new(config).await.unwrap();
    let handle = seeder
        .add_torrent_with_tracker(torrent, dir.path(), None)
        .unwrap();
    let mut session = seeder.session(handle).unwrap().clone();
    while session.status().state != SessionState::Seeding {
        session.changed().await.unwrap();
    }

    let mut stream = TcpStream::connect(seeder.local_addr()).await.unwrap();
    let remote = Handshake::new(info_hash.0, *b"-XX0001-abcdefghijkl")
        .shake_hands(&mut stream)
        .await
        .unwrap();
    assert_eq!(remote.info_hash, info_hash.0);
    let mut framed = Framed::new(stream, MessageFramer);

    // 7 pieces, padded to a whole byte
    let Some(PeerMessage::Bitfield(bitfield)) = next_message(&mut framed).await else {
        panic!("expected a bitfield first");
    };
    assert_eq!(bitfield.pieces_available.len(), 8);
    assert_eq!(bitfield.pieces_available.iter().filter(|&&has| has).count(), 7);

    framed.send(PeerMessage::Interested).await.unwrap();
    assert_eq!(next_message(&mut framed).await, Some(PeerMessage::Unchoke));

    framed
        .send(PeerMessage::Request(RequestPiecePayload::new(2, 100, 1000)))
        .await
        .unwrap();
    let Some(PeerMessage::Piece(piece)) = next_message(&mut framed).await else {
        panic!("expected a block");
    };
    let start = 2 * (1 << 14) + 100;
    assert_eq!((piece.index, piece.begin), (2, 100));
    assert_eq!(&piece.block[..], &data[start..start + 1000]);

    framed
        .send(PeerMessage::Request(RequestPiecePayload::new(0, 0, 200_000)))
        .await
        .unwrap();
    assert_eq!(next_message(&mut framed).await, None);

    seeder.shutdown().await;
}
