use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::session::piece_manager::hasher::PieceHasher;
use crate::session::piece_manager::resume::ResumeData;
use crate::torrent::{FileLayout, Torrent, TorrentError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed with error `{error}` to access the file with path `{path}`")]
    Io { error: io::Error, path: PathBuf },
    #[error("The block {offset}+{length} doesn't fit into piece {piece}")]
    OutOfRange { piece: u32, offset: u32, length: u32 },
    #[error("Piece {0} is not verified")]
    NotVerified(u32),
    #[error("No data was buffered for piece {0}")]
    NotBuffered(u32),
    #[error("Failed to encode the resume data: `{0}`")]
    Resume(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Layout(#[from] TorrentError),
}

impl StoreError {
    /// Running out of disk space or memory ends the session; everything else only costs
    /// the piece or request at hand.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Io { error, .. } => matches!(
                error.kind(),
                io::ErrorKind::StorageFull | io::ErrorKind::OutOfMemory
            ),
            _ => false,
        }
    }
}

/// The on-disk side of a torrent: the backing files, the buffers of pieces being
/// downloaded and the completion bitmap.
///
/// File handles live as long as the store.
#[derive(Debug)]
pub struct PieceStore {
    torrent: Arc<Torrent>,
    layout: FileLayout,
    files: Vec<(PathBuf, File)>,
    buffers: HashMap<u32, BytesMut>,
    have: Vec<bool>,
    resume_path: PathBuf,
    needs_recheck: bool,
}

impl PieceStore {
    /// Opens (and creates) every file below `save_path`.
    ///
    /// The bitmap comes from the resume file when there is a matching one. Without it, data
    /// that was already on disk has to be rechecked, see [`PieceStore::needs_recheck`].
    pub fn open(torrent: Arc<Torrent>, save_path: &Path) -> Result<Self, StoreError> {
        let layout = FileLayout::from_metainfo(&torrent.info)?;
        let mut files = Vec::with_capacity(layout.files().len());
        let mut existing_data = false;

        for entry in layout.files() {
            let path = save_path.join(&entry.path);
            let io_error = |error| StoreError::Io {
                error,
                path: path.clone(),
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(io_error)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(io_error)?;
            let len = file.metadata().map_err(io_error)?.len();
            existing_data |= len > 0;
            if len < entry.length {
                file.set_len(entry.length).map_err(io_error)?;
            }
            files.push((path, file));
        }

        let piece_count = torrent.info.piece_count() as usize;
        let resume_path = ResumeData::path_for(save_path, torrent.info_hash());
        let resume = ResumeData::load(&resume_path, torrent.info_hash(), piece_count);
        let needs_recheck = resume.is_none() && existing_data;
        let have = resume.map_or_else(|| vec![false; piece_count], |resume| resume.have);

        Ok(Self {
            torrent,
            layout,
            files,
            buffers: HashMap::new(),
            have,
            resume_path,
            needs_recheck,
        })
    }

    /// The verified pieces recorded for `torrent` below `save_path`, without touching the
    /// data files.
    pub fn saved_bitmap(torrent: &Torrent, save_path: &Path) -> Option<Vec<bool>> {
        let path = ResumeData::path_for(save_path, torrent.info_hash());
        ResumeData::load(
            &path,
            torrent.info_hash(),
            torrent.info.piece_count() as usize,
        )
        .map(|resume| resume.have)
    }

    /// Whether the files held data the resume file doesn't account for.
    pub fn needs_recheck(&self) -> bool {
        self.needs_recheck
    }

    pub fn have(&self) -> &[bool] {
        &self.have
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.have.get(piece as usize).copied().unwrap_or(false)
    }

    pub fn verified_count(&self) -> usize {
        self.have.iter().filter(|&&have| have).count()
    }

    pub fn is_complete(&self) -> bool {
        self.have.iter().all(|&have| have)
    }

    /// Bytes of verified content; the last piece counts with its real size.
    pub fn bytes_verified(&self) -> u64 {
        (0..self.torrent.info.piece_count())
            .filter(|&piece| self.is_verified(piece))
            .map(|piece| self.torrent.info.piece_size(piece) as u64)
            .sum()
    }

    fn check_range(&self, piece: u32, offset: u32, length: u32) -> Result<(), StoreError> {
        let out_of_range = piece >= self.torrent.info.piece_count()
            || offset as u64 + length as u64 > self.torrent.info.piece_size(piece) as u64;
        if out_of_range {
            return Err(StoreError::OutOfRange {
                piece,
                offset,
                length,
            });
        }
        Ok(())
    }

    /// Copies a block into the buffer of its piece.
    pub fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StoreError> {
        self.check_range(piece, offset, data.len() as u32)?;
        let piece_size = self.torrent.info.piece_size(piece) as usize;
        let buffer = self
            .buffers
            .entry(piece)
            .or_insert_with(|| BytesMut::zeroed(piece_size));
        let start = offset as usize;
        buffer[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// A copy of the buffered piece, for hashing.
    pub fn buffered_piece(&self, piece: u32) -> Result<Bytes, StoreError> {
        self.buffers
            .get(&piece)
            .map(|buffer| Bytes::copy_from_slice(buffer))
            .ok_or(StoreError::NotBuffered(piece))
    }

    /// Drops whatever was buffered for `piece`.
    pub fn discard_piece(&mut self, piece: u32) {
        self.buffers.remove(&piece);
    }

    /// Flushes the buffer of a verified piece to disk and records it in the bitmap.
    /// Marking a piece twice is a no-op.
    pub fn mark_verified(&mut self, piece: u32) -> Result<(), StoreError> {
        if self.is_verified(piece) {
            self.buffers.remove(&piece);
            return Ok(());
        }
        let buffer = self
            .buffers
            .remove(&piece)
            .ok_or(StoreError::NotBuffered(piece))?;
        if let Err(error) = self.write_at(self.piece_offset(piece), &buffer) {
            // keep the data so a retry doesn't need the network
            self.buffers.insert(piece, buffer);
            return Err(error);
        }
        self.have[piece as usize] = true;
        Ok(())
    }

    /// Reads a block of a verified piece for uploading.
    pub fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StoreError> {
        self.check_range(piece, offset, length)?;
        if !self.is_verified(piece) {
            return Err(StoreError::NotVerified(piece));
        }
        let mut buf = BytesMut::zeroed(length as usize);
        self.read_at(self.piece_offset(piece) + offset as u64, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Reads a whole piece back from disk, whatever its state.
    pub fn read_piece(&self, piece: u32) -> Result<Vec<u8>, StoreError> {
        self.check_range(piece, 0, 0)?;
        let mut buf = vec![0u8; self.torrent.info.piece_size(piece) as usize];
        self.read_at(self.piece_offset(piece), &mut buf)?;
        Ok(buf)
    }

    /// Hashes the data on disk and rebuilds the bitmap from it. Blocking.
    pub fn recheck(&mut self, hasher: &PieceHasher) -> Result<usize, StoreError> {
        for piece in 0..self.torrent.info.piece_count() {
            let data = self.read_piece(piece)?;
            self.have[piece as usize] = hasher.verify(piece, &data);
        }
        self.needs_recheck = false;
        let verified = self.verified_count();
        tracing::info!(
            "recheck of `{}` found {verified}/{} pieces",
            self.torrent.name(),
            self.have.len()
        );
        Ok(verified)
    }

    /// Writes the completion bitmap to the resume file.
    pub fn persist(&self) -> Result<(), StoreError> {
        ResumeData {
            info_hash: self.torrent.info_hash().0,
            have: self.have.clone(),
        }
        .save(&self.resume_path)
    }

    fn piece_offset(&self, piece: u32) -> u64 {
        piece as u64 * self.torrent.info.piece_length as u64
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let mut written = 0usize;
        for segment in self.layout.segments(offset, data.len() as u64) {
            let (path, file) = &self.files[segment.file_i];
            let chunk = &data[written..written + segment.length as usize];
            file.write_all_at(chunk, segment.file_offset)
                .map_err(|error| StoreError::Io {
                    error,
                    path: path.clone(),
                })?;
            written += chunk.len();
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let mut read = 0usize;
        for segment in self.layout.segments(offset, buf.len() as u64) {
            let (path, file) = &self.files[segment.file_i];
            let chunk = &mut buf[read..read + segment.length as usize];
            file.read_exact_at(chunk, segment.file_offset)
                .map_err(|error| StoreError::Io {
                    error,
                    path: path.clone(),
                })?;
            read += chunk.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_store {
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::torrent::{File as TorrentFile, Hashes, Key, Metainfo};

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    /// Two files of 5 and 6 bytes with 4 byte pieces.
    fn torrent(data: &[u8]) -> Arc<Torrent> {
        let info = Metainfo {
            name: "dir".to_string(),
            piece_length: 4,
            pieces: Hashes(data.chunks(4).map(|c| Sha1::digest(c).into()).collect()),
            files: Key::MultiFile {
                files: vec![
                    TorrentFile {
                        length: 5,
                        path: vec!["a".to_string()],
                    },
                    TorrentFile {
                        length: 6,
                        path: vec!["b".to_string()],
                    },
                ],
            },
        };
        Arc::new(Torrent::from_parts(None, None, info).unwrap())
    }

    #[test]
    fn blocks_past_the_piece_end_are_rejected() {
        let data = content(11);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::open(torrent(&data), dir.path()).unwrap();

        assert!(store.write_block(0, 0, &data[..4]).is_ok());
        // the last piece only has 3 bytes
        assert!(matches!(
            store.write_block(2, 0, &[0; 4]),
            Err(StoreError::OutOfRange { piece: 2, .. })
        ));
        assert!(matches!(
            store.write_block(3, 0, &[0; 1]),
            Err(StoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn verified_pieces_land_in_the_right_files() {
        let data = content(11);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::open(torrent(&data), dir.path()).unwrap();

        for (piece, chunk) in data.chunks(4).enumerate() {
            store.write_block(piece as u32, 0, &chunk[..2]).unwrap();
            store.write_block(piece as u32, 2, &chunk[2..]).unwrap();
            store.mark_verified(piece as u32).unwrap();
        }
        // idempotent
        store.mark_verified(1).unwrap();

        assert!(store.is_complete());
        assert_eq!(store.bytes_verified(), 11);
        assert_eq!(std::fs::read(dir.path().join("dir/a")).unwrap(), &data[..5]);
        assert_eq!(std::fs::read(dir.path().join("dir/b")).unwrap(), &data[5..]);
        assert_eq!(&store.read_block(1, 0, 4).unwrap()[..], &data[4..8]);
    }

    #[test]
    fn unverified_pieces_are_not_served() {
        let data = content(11);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::open(torrent(&data), dir.path()).unwrap();
        store.write_block(0, 0, &data[..4]).unwrap();
        assert!(matches!(
            store.read_block(0, 0, 4),
            Err(StoreError::NotVerified(0))
        ));
        store.discard_piece(0);
        assert!(matches!(
            store.mark_verified(0),
            Err(StoreError::NotBuffered(0))
        ));
    }

    #[test]
    fn bitmap_survives_reopening() {
        let data = content(11);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(&data);
        {
            let mut store = PieceStore::open(torrent.clone(), dir.path()).unwrap();
            store.write_block(1, 0, &data[4..8]).unwrap();
            store.mark_verified(1).unwrap();
            store.persist().unwrap();
        }
        let store = PieceStore::open(torrent, dir.path()).unwrap();
        assert_eq!(store.have(), &[false, true, false]);
        assert!(!store.needs_recheck());
    }

    #[test]
    fn existing_data_is_rechecked() {
        let data = content(11);
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dir")).unwrap();
        std::fs::write(dir.path().join("dir/a"), &data[..5]).unwrap();
        let mut broken = data[5..].to_vec();
        broken[4] ^= 0xff;
        std::fs::write(dir.path().join("dir/b"), &broken).unwrap();

        let torrent = torrent(&data);
        let mut store = PieceStore::open(torrent.clone(), dir.path()).unwrap();
        assert!(store.needs_recheck());
        assert_eq!(store.recheck(&PieceHasher::new(torrent)).unwrap(), 2);
        // byte 9 lives in piece 2
        assert_eq!(store.have(), &[true, true, false]);
    }
}
