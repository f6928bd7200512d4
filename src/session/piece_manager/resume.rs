use std::path::{Path, PathBuf};

use crate::session::piece_manager::store::StoreError;
use crate::torrent::InfoHash;

const RESUME_DIR: &str = ".resume";

/// The persisted completion bitmap of a torrent.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ResumeData {
    pub info_hash: [u8; 20],
    pub have: Vec<bool>,
}

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
}

impl ResumeData {
    pub fn path_for(save_path: &Path, info_hash: InfoHash) -> PathBuf {
        save_path
            .join(RESUME_DIR)
            .join(format!("{}.resume", info_hash.to_hex()))
    }

    /// Reads the resume file at `path`.
    ///
    /// A missing file, or one that belongs to another torrent or doesn't decode, gives
    /// `None`: the data on disk is then rechecked instead.
    pub fn load(path: &Path, info_hash: InfoHash, piece_count: usize) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        match bincode::decode_from_slice::<ResumeData, _>(&bytes, config()) {
            Ok((resume, _)) if resume.info_hash == info_hash.0 && resume.have.len() == piece_count => {
                Some(resume)
            }
            Ok(_) => {
                tracing::warn!("ignoring resume file `{}` of another torrent", path.display());
                None
            }
            Err(error) => {
                tracing::warn!("ignoring corrupt resume file `{}`: {error}", path.display());
                None
            }
        }
    }

    /// Writes to a temporary file first so a crash never leaves a torn bitmap behind.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_error = |error| StoreError::Io {
            error,
            path: path.to_path_buf(),
        };
        let bytes = bincode::encode_to_vec(self, config())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let tmp = path.with_extension("resume.tmp");
        std::fs::write(&tmp, bytes).map_err(io_error)?;
        std::fs::rename(&tmp, path).map_err(io_error)
    }
}
