use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::Semaphore;

use crate::torrent::Torrent;

/// Checks piece data against the hashes of the metadata.
#[derive(Debug, Clone)]
pub struct PieceHasher {
    torrent: Arc<Torrent>,
}

impl PieceHasher {
    pub fn new(torrent: Arc<Torrent>) -> Self {
        Self { torrent }
    }

    pub fn verify(&self, piece: u32, data: &[u8]) -> bool {
        let Some(expected) = self.torrent.info.piece_hash(piece) else {
            return false;
        };
        let hash: [u8; 20] = Sha1::digest(data).into();
        hash == *expected
    }
}

/// A bounded set of blocking threads for hashing, shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct HashPool {
    permits: Arc<Semaphore>,
}

impl HashPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Runs `job` on a blocking thread once a worker is free.
    pub async fn run<T, F>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let result = tokio::task::spawn_blocking(move || {
            let result = job();
            drop(permit);
            result
        })
        .await;
        match result {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::error!("hashing job failed: {error}");
                None
            }
        }
    }

    /// Verifies `data` off the async threads. A job that can't run counts as a mismatch.
    pub async fn verify(&self, hasher: PieceHasher, piece: u32, data: Bytes) -> bool {
        self.run(move || hasher.verify(piece, &data))
            .await
            .unwrap_or(false)
    }
}
