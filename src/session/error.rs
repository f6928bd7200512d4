use thiserror::Error;

use crate::session::piece_manager::StoreError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to open the torrent storage: `{0}`")]
    Store(#[from] StoreError),
    #[error("The session has already stopped")]
    Stopped,
}
