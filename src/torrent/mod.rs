use std::fmt;
use std::path::{Path, PathBuf};

pub use create::generate;
pub use hashes::Hashes;
pub use layout::{FileEntry, FileLayout, Segment};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

mod create;
mod layout;
mod raw;

/// Piece length used by `create` when none is configured.
pub const DEFAULT_PIECE_LENGTH: u32 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hashes an already bencoded `info` dictionary.
    pub fn of_info_bytes(bytes: &[u8]) -> Self {
        InfoHash(Sha1::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

mod hashes {
    use serde::de::{self, Visitor};
    use serde::ser::{Serialize, Serializer};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Hashes(pub Vec<[u8; 20]>);
    struct HashesVisitor;

    impl Serialize for Hashes {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let single_slice = self.0.concat();
            serializer.serialize_bytes(&single_slice)
        }
    }

    impl<'de> Visitor<'de> for HashesVisitor {
        type Value = Hashes;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("Bytes which length is a multiple of 20")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 20 != 0 {
                return Err(de::Error::custom(format!(
                    "Bytes which length is a multiple of 20. Got {:?}",
                    v.len()
                )));
            }
            let mut hashes = Vec::with_capacity(v.len() / 20);
            for slice_20 in v.chunks_exact(20) {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(slice_20);
                hashes.push(hash);
            }
            Ok(Hashes(hashes))
        }
    }

    impl<'de> Deserialize<'de> for Hashes {
        fn deserialize<D>(deserializer: D) -> Result<Hashes, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(HashesVisitor)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
/// The Metainfo files
pub struct Torrent {
    /// The url of the tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    /// Tiers of tracker urls (BEP 12), only written when more than one tracker is known.
    #[serde(
        rename = "announce-list",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub announce_list: Option<Vec<Vec<String>>>,
    /// This maps to a dictionary.
    pub info: Metainfo,
    #[serde(skip)]
    info_hash: InfoHash,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Metainfo {
    /// The name key maps to a UTF-8 encoded string.
    /// In the single file case, the name key is the name of a file, in the muliple file case,
    /// it's the name of a directory.
    pub name: String,
    /// `piece length` maps to the number of bytes in each piece the file is split into.
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// pieces is to be subdivided into strings of length 20,
    /// each of which is the SHA1 hash of the piece at the corresponding index.
    pub pieces: Hashes,
    /// If length is present then the download represents a single file,
    /// otherwise it represents a set of files which go in a directory structure.
    #[serde(flatten)]
    pub files: Key,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Key {
    /// In the single file case, length maps to the length of the file in bytes.
    SingleFile { length: u64 },
    /// For the purposes of the other keys, the multi-file case is treated as only having
    /// a single file by concatenating the files in the order they appear in the files list.
    MultiFile { files: Vec<File> },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct File {
    /// The length of the file, in bytes.
    pub length: u64,
    /// A list of UTF-8 encoded strings corresponding to subdirectory names,
    /// the last of which is the actual file name (a zero length list is an error case).
    pub path: Vec<String>,
}

impl Torrent {
    pub(crate) fn from_parts(
        announce: Option<String>,
        announce_list: Option<Vec<Vec<String>>>,
        info: Metainfo,
    ) -> Result<Self, TorrentError> {
        let info_bytes = serde_bencode::to_bytes(&info)?;
        let torrent = Self {
            announce,
            announce_list,
            info,
            info_hash: InfoHash::of_info_bytes(&info_bytes),
        };
        torrent.validate()?;
        Ok(torrent)
    }

    /// Parses a bencoded metainfo file.
    ///
    /// The infohash is the SHA-1 of the `info` value exactly as it appears in `bytes`, so
    /// unknown keys and non canonical key order are preserved.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentError> {
        let mut torrent = serde_bencode::from_bytes::<Torrent>(bytes)?;
        let info_span = raw::dict_value_span(bytes, b"info")?;
        torrent.info_hash = InfoHash::of_info_bytes(&bytes[info_span]);

        torrent.validate()?;
        Ok(torrent)
    }

    pub fn read_from_file(path: &Path) -> Result<Self, TorrentError> {
        let bytes = std::fs::read(path).map_err(|error| TorrentError::Io {
            error,
            path: path.to_path_buf(),
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TorrentError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), TorrentError> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|error| TorrentError::Io {
                error,
                path: parent.to_path_buf(),
            })?;
        }
        std::fs::write(path, bytes).map_err(|error| TorrentError::Io {
            error,
            path: path.to_path_buf(),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Every tracker url, `announce-list` tiers first, without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers: Vec<String> = Vec::new();
        let tiers = self.announce_list.iter().flatten().flatten();
        for url in tiers.chain(self.announce.iter()) {
            if !trackers.contains(url) {
                trackers.push(url.clone());
            }
        }
        trackers
    }

    /// Ordered `(relative path, length)` pairs. A single-file torrent yields one entry named
    /// after the torrent.
    pub fn files(&self) -> Vec<(PathBuf, u64)> {
        self.info.files()
    }

    fn validate(&self) -> Result<(), TorrentError> {
        let info = &self.info;
        if info.piece_length == 0 {
            return Err(TorrentError::Malformed("`piece length` is zero".to_string()));
        }
        if let Key::MultiFile { files } = &info.files {
            if files.is_empty() {
                return Err(TorrentError::Malformed("`files` is empty".to_string()));
            }
            if files.iter().any(|file| file.path.is_empty()) {
                return Err(TorrentError::Malformed(
                    "a file in `files` has an empty path".to_string(),
                ));
            }
        }
        let expected = info.total_length().div_ceil(info.piece_length as u64);
        if expected != info.pieces.0.len() as u64 {
            return Err(TorrentError::PieceCountMismatch {
                expected,
                got: info.pieces.0.len(),
            });
        }
        // rejects `..` and absolute paths
        FileLayout::from_metainfo(info)?;
        Ok(())
    }
}

impl Metainfo {
    pub fn total_length(&self) -> u64 {
        match &self.files {
            Key::SingleFile { length } => *length,
            Key::MultiFile { files } => files.iter().map(|file| file.length).sum(),
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.0.len() as u32
    }

    /// The size of a piece; only the last one may be shorter than `piece length`.
    pub fn piece_size(&self, piece_i: u32) -> u32 {
        let length = self.total_length();
        let piece_length = self.piece_length as u64;
        if piece_i + 1 == self.piece_count() && length % piece_length != 0 {
            (length % piece_length) as u32
        } else {
            self.piece_length
        }
    }

    pub fn piece_hash(&self, piece_i: u32) -> Option<&[u8; 20]> {
        self.pieces.0.get(piece_i as usize)
    }

    pub fn files(&self) -> Vec<(PathBuf, u64)> {
        match &self.files {
            Key::SingleFile { length } => vec![(PathBuf::from(&self.name), *length)],
            Key::MultiFile { files } => files
                .iter()
                .map(|file| {
                    let path: PathBuf = std::iter::once(self.name.as_str())
                        .chain(file.path.iter().map(String::as_str))
                        .collect();
                    (path, file.length)
                })
                .collect(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TorrentError {
    #[error("Failed with error `{error}` to access the file with path `{path}`")]
    Io {
        error: std::io::Error,
        path: PathBuf,
    },
    #[error("Failed to (de)serialize the torrent bencode: `{0}`")]
    InvalidBencode(#[from] serde_bencode::Error),
    #[error("The metainfo is malformed: {0}")]
    Malformed(String),
    #[error("Expected {expected} piece hashes for the file layout, got {got}")]
    PieceCountMismatch { expected: u64, got: usize },
    #[error("The file path `{0}` leaves the download directory")]
    UnsafePath(String),
    #[error("The tracker url `{url}` is invalid: `{error}`")]
    InvalidTracker {
        url: String,
        error: url::ParseError,
    },
    #[error("There is nothing to put into a torrent: {0}")]
    Empty(String),
}

impl TorrentError {
    /// Whether the error is about the content of a metainfo file rather than about
    /// reaching it.
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            TorrentError::Io { .. } | TorrentError::InvalidTracker { .. } | TorrentError::Empty(_)
        )
    }
}

#[cfg(test)]
mod test_torrent {
    use super::*;

    fn single_file(length: u64, piece_length: u32) -> Torrent {
        let n = length.div_ceil(piece_length as u64) as usize;
        let info = Metainfo {
            name: "sample.bin".to_string(),
            piece_length,
            pieces: Hashes(vec![[7u8; 20]; n]),
            files: Key::SingleFile { length },
        };
        Torrent::from_parts(Some("http://localhost:8080/announce".to_string()), None, info)
            .expect("valid layout")
    }

    #[test]
    fn layout_matches_bencode() {
        let torrent = single_file(3, 2);
        let bytes = torrent.to_bytes().unwrap();
        let mut expected = b"d8:announce30:http://localhost:8080/announce4:infod6:lengthi3e4:name10:sample.bin12:piece lengthi2e6:pieces40:".to_vec();
        expected.extend_from_slice(&[7u8; 40]);
        expected.extend_from_slice(b"ee");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn parse_round_trip() {
        let torrent = single_file(100_000, 1 << 14);
        let parsed = Torrent::from_bytes(&torrent.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, torrent);
        assert_eq!(parsed.info_hash(), torrent.info_hash());
        assert_eq!(parsed.info.piece_count(), 7);
        assert_eq!(parsed.info.piece_size(6), 100_000 - 6 * (1 << 14));
    }

    #[test]
    fn multi_file_round_trip() {
        let info = Metainfo {
            name: "dir".to_string(),
            piece_length: 4,
            pieces: Hashes(vec![[1u8; 20]; 3]),
            files: Key::MultiFile {
                files: vec![
                    File {
                        length: 5,
                        path: vec!["a.txt".to_string()],
                    },
                    File {
                        length: 5,
                        path: vec!["sub".to_string(), "b.txt".to_string()],
                    },
                ],
            },
        };
        let torrent = Torrent::from_parts(None, None, info).unwrap();
        let parsed = Torrent::from_bytes(&torrent.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, torrent);
        assert_eq!(
            parsed.files(),
            vec![
                (PathBuf::from("dir/a.txt"), 5),
                (PathBuf::from("dir/sub/b.txt"), 5)
            ]
        );
    }

    #[test]
    fn unknown_info_keys_count_towards_the_infohash() {
        let mut bytes = b"d4:infod6:lengthi3e4:name1:a12:piece lengthi4e6:pieces20:".to_vec();
        bytes.extend_from_slice(&[9u8; 20]);
        bytes.extend_from_slice(b"7:privatei1eee");
        let torrent = Torrent::from_bytes(&bytes).unwrap();

        let info_start = b"d4:info".len();
        let info_bytes = &bytes[info_start..bytes.len() - 1];
        assert_eq!(torrent.info_hash(), InfoHash::of_info_bytes(info_bytes));
    }

    #[test]
    fn unsorted_info_keys_are_hashed_as_written() {
        let mut bytes = b"d4:infod4:name1:a6:lengthi3e12:piece lengthi4e6:pieces20:".to_vec();
        bytes.extend_from_slice(&[9u8; 20]);
        bytes.extend_from_slice(b"ee");
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(torrent.info.name, "a");

        let info_start = b"d4:info".len();
        let info_bytes = &bytes[info_start..bytes.len() - 1];
        assert_eq!(torrent.info_hash(), InfoHash::of_info_bytes(info_bytes));
        let canonical = serde_bencode::to_bytes(&torrent.info).unwrap();
        assert_ne!(torrent.info_hash(), InfoHash::of_info_bytes(&canonical));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = single_file(10, 4).to_bytes().unwrap();
        let err = Torrent::from_bytes(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn rejects_hash_blob_not_multiple_of_20() {
        let mut bytes = b"d4:infod6:lengthi3e4:name1:a12:piece lengthi4e6:pieces19:".to_vec();
        bytes.extend_from_slice(&[9u8; 19]);
        bytes.extend_from_slice(b"ee");
        assert!(matches!(
            Torrent::from_bytes(&bytes),
            Err(TorrentError::InvalidBencode(_))
        ));
    }

    #[test]
    fn rejects_wrong_hash_count() {
        let mut bytes = b"d4:infod6:lengthi9e4:name1:a12:piece lengthi4e6:pieces20:".to_vec();
        bytes.extend_from_slice(&[9u8; 20]);
        bytes.extend_from_slice(b"ee");
        assert!(matches!(
            Torrent::from_bytes(&bytes),
            Err(TorrentError::PieceCountMismatch {
                expected: 3,
                got: 1
            })
        ));
    }

    #[test]
    fn trackers_are_deduplicated() {
        let mut torrent = single_file(3, 2);
        torrent.announce_list = Some(vec![
            vec!["http://localhost:8080/announce".to_string()],
            vec!["http://backup/announce".to_string()],
        ]);
        assert_eq!(
            torrent.trackers(),
            vec![
                "http://localhost:8080/announce".to_string(),
                "http://backup/announce".to_string()
            ]
        );
    }
}
