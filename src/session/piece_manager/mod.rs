use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;

use crate::peer::PeerKey;
use crate::torrent::Torrent;

pub use hasher::{HashPool, PieceHasher};
pub use piece_selector::{BlockOutcome, PieceSelector};
pub use store::{PieceStore, StoreError};

mod hasher;
mod piece_selector;
mod resume;
mod store;

/// Requests are made in blocks of this size, only the last block of a piece is shorter.
pub const BLOCK_MAX: u32 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PieceStatus {
    Missing,
    Requested,
    Downloading,
    Verified,
    /// Failed its last hash check. Selected again exactly like `Missing`.
    Failed,
}

impl PieceStatus {
    /// Nobody is fetching the piece and it is still needed.
    pub fn is_wanted(self) -> bool {
        matches!(self, PieceStatus::Missing | PieceStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceState {
    pub index: u32,
    pub hash: [u8; 20],
    pub status: PieceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

pub(crate) fn block_count(piece_size: u32) -> usize {
    piece_size.div_ceil(BLOCK_MAX) as usize
}

pub(crate) fn block_len(piece_size: u32, offset: u32) -> u32 {
    (piece_size - offset).min(BLOCK_MAX)
}

/// The outcome of a hash check once it has been applied.
#[derive(Debug, PartialEq, Eq)]
pub enum HashVerdict {
    Verified { contributors: Vec<PeerKey> },
    Failed { contributors: Vec<PeerKey> },
}

/// Ties the store, the selector and the hashing pool of one torrent together.
#[derive(Debug)]
pub struct PieceManager {
    torrent: Arc<Torrent>,
    pub(crate) store: PieceStore,
    pub(crate) selector: PieceSelector,
    hasher: PieceHasher,
    pool: HashPool,
    hashing: JoinSet<(u32, bool)>,
}

impl PieceManager {
    pub fn new(
        torrent: Arc<Torrent>,
        store: PieceStore,
        pool: HashPool,
        endgame_threshold: usize,
    ) -> Self {
        let selector = PieceSelector::new(&torrent.info, store.have(), endgame_threshold);
        Self {
            hasher: PieceHasher::new(torrent.clone()),
            torrent,
            store,
            selector,
            pool,
            hashing: JoinSet::new(),
        }
    }

    pub fn piece_state(&self, index: u32) -> Option<PieceState> {
        let hash = *self.torrent.info.piece_hash(index)?;
        Some(PieceState {
            index,
            hash,
            status: self.selector.status(index),
        })
    }

    /// Runs a recheck of the data on disk on the hashing pool and rebuilds the selector
    /// from the result.
    pub async fn recheck(self) -> Result<Self, StoreError> {
        let Self {
            torrent,
            mut store,
            hasher,
            pool,
            hashing,
            selector,
        } = self;
        let endgame_threshold = selector.endgame_threshold();
        let recheck_hasher = hasher.clone();
        let store = pool
            .run(move || store.recheck(&recheck_hasher).map(|_| store))
            .await
            .ok_or_else(|| StoreError::Io {
                error: std::io::Error::other("the recheck job was cancelled"),
                path: torrent.name().into(),
            })??;
        Ok(Self {
            selector: PieceSelector::new(&torrent.info, store.have(), endgame_threshold),
            torrent,
            store,
            hasher,
            pool,
            hashing,
        })
    }

    /// Stores a delivered block. A block that completes its piece sends the piece to the
    /// hashing pool.
    pub fn on_block(
        &mut self,
        key: PeerKey,
        block: BlockInfo,
        data: &[u8],
    ) -> Result<BlockOutcome, StoreError> {
        let outcome = self.selector.block_received(key, block);
        if let BlockOutcome::Accepted { piece_complete, .. } = &outcome {
            if let Err(error) = self.store.write_block(block.piece, block.offset, data) {
                self.selector.release(key, block);
                return Err(error);
            }
            if *piece_complete {
                let data = self.store.buffered_piece(block.piece)?;
                self.start_hashing(block.piece, data);
            }
        }
        Ok(outcome)
    }

    fn start_hashing(&mut self, piece: u32, data: Bytes) {
        let pool = self.pool.clone();
        let hasher = self.hasher.clone();
        self.hashing
            .spawn(async move { (piece, pool.verify(hasher, piece, data).await) });
    }

    pub fn hashing_in_flight(&self) -> usize {
        self.hashing.len()
    }

    /// Waits for the next finished hash check. Pending forever while nothing is hashed.
    pub async fn next_hashed(&mut self) -> (u32, bool) {
        loop {
            match self.hashing.join_next().await {
                Some(Ok(result)) => return result,
                Some(Err(error)) => tracing::error!("hashing task failed: {error}"),
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Applies the result of a hash check: a good piece is flushed to disk, a bad one is
    /// thrown away completely.
    pub fn finish_hash(&mut self, piece: u32, passed: bool) -> Result<HashVerdict, StoreError> {
        if passed {
            if let Err(error) = self.store.mark_verified(piece) {
                // the piece is fetched again rather than kept half written
                self.store.discard_piece(piece);
                self.selector.piece_failed(piece);
                return Err(error);
            }
            let contributors = self.selector.piece_verified(piece);
            tracing::debug!("piece {piece} of `{}` verified", self.torrent.name());
            Ok(HashVerdict::Verified { contributors })
        } else {
            self.store.discard_piece(piece);
            let contributors = self.selector.piece_failed(piece);
            tracing::warn!("piece {piece} of `{}` failed its hash check", self.torrent.name());
            Ok(HashVerdict::Failed { contributors })
        }
    }

    /// Reads a block for an upload request, only from verified pieces.
    pub fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StoreError> {
        self.store.read_block(piece, offset, length)
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }
}

#[cfg(test)]
mod test_piece_manager {
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::torrent::{Hashes, Key, Metainfo};

    const A: PeerKey = PeerKey(1);

    fn setup(data: &[u8], dir: &std::path::Path) -> PieceManager {
        let info = Metainfo {
            name: "blob".to_string(),
            piece_length: 2 * BLOCK_MAX,
            pieces: Hashes(
                data.chunks(2 * BLOCK_MAX as usize)
                    .map(|chunk| Sha1::digest(chunk).into())
                    .collect(),
            ),
            files: Key::SingleFile {
                length: data.len() as u64,
            },
        };
        let torrent = Arc::new(Torrent::from_parts(None, None, info).unwrap());
        let store = PieceStore::open(torrent.clone(), dir).unwrap();
        PieceManager::new(torrent, store, HashPool::new(1), 0)
    }

    fn deliver(manager: &mut PieceManager, data: &[u8]) {
        for block in manager.selector.next_requests(A, 8) {
            let start = (block.piece * 2 * BLOCK_MAX + block.offset) as usize;
            let bytes = &data[start..start + block.length as usize];
            manager.on_block(A, block, bytes).unwrap();
        }
    }

    #[tokio::test]
    async fn good_piece_is_verified_and_written() {
        let data: Vec<u8> = (0..(3 * BLOCK_MAX) as usize).map(|i| i as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let mut manager = setup(&data, dir.path());
        manager.selector.peer_bitfield(A, &[true, true]);
        deliver(&mut manager, &data);

        for _ in 0..2 {
            let (piece, passed) = manager.next_hashed().await;
            assert!(passed);
            assert_eq!(
                manager.finish_hash(piece, passed).unwrap(),
                HashVerdict::Verified {
                    contributors: vec![A]
                }
            );
        }
        assert!(manager.is_complete());
        assert_eq!(std::fs::read(dir.path().join("blob")).unwrap(), data);
        assert_eq!(manager.piece_state(1).unwrap().status, PieceStatus::Verified);
    }

    #[tokio::test]
    async fn corrupt_piece_is_marked_failed_and_wanted_again() {
        let data: Vec<u8> = vec![1; (2 * BLOCK_MAX) as usize];
        let dir = tempfile::tempdir().unwrap();
        let mut manager = setup(&data, dir.path());
        manager.selector.peer_bitfield(A, &[true]);
        deliver(&mut manager, &vec![2; data.len()]);

        let (piece, passed) = manager.next_hashed().await;
        assert!(!passed);
        assert!(matches!(
            manager.finish_hash(piece, passed).unwrap(),
            HashVerdict::Failed { .. }
        ));
        let status = manager.piece_state(0).unwrap().status;
        assert_eq!(status, PieceStatus::Failed);
        assert!(status.is_wanted());
        assert!(matches!(
            manager.read_block(0, 0, BLOCK_MAX),
            Err(StoreError::NotVerified(0))
        ));
    }
}
