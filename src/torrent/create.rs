use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use super::{File, Hashes, Key, Metainfo, Torrent, TorrentError};

/// A file found while walking the inputs, with the path it gets inside the torrent.
struct Source {
    disk_path: PathBuf,
    torrent_path: Vec<String>,
    length: u64,
}

/// Creates the metainfo for `paths`.
///
/// A single regular file gives a single-file torrent named after it. A directory, or more
/// than one input, gives a multi-file torrent; directories are walked recursively in
/// name order so the same tree always hashes to the same infohash.
pub fn generate(
    paths: &[PathBuf],
    piece_length: u32,
    trackers: &[String],
) -> Result<Torrent, TorrentError> {
    if piece_length == 0 {
        return Err(TorrentError::Malformed("`piece length` is zero".to_string()));
    }
    for url in trackers {
        url::Url::parse(url).map_err(|error| TorrentError::InvalidTracker {
            url: url.clone(),
            error,
        })?;
    }

    let (name, single_file, sources) = collect_sources(paths)?;
    let total_length: u64 = sources.iter().map(|source| source.length).sum();
    if total_length == 0 {
        return Err(TorrentError::Empty(format!(
            "`{name}` contains no data to hash"
        )));
    }

    let pieces = hash_pieces(&sources, piece_length)?;
    tracing::info!(
        "hashed {} pieces of {} bytes for `{}`",
        pieces.0.len(),
        piece_length,
        name
    );

    let files = if single_file {
        Key::SingleFile {
            length: total_length,
        }
    } else {
        Key::MultiFile {
            files: sources
                .into_iter()
                .map(|source| File {
                    length: source.length,
                    path: source.torrent_path,
                })
                .collect(),
        }
    };
    let info = Metainfo {
        name,
        piece_length,
        pieces,
        files,
    };

    let announce = trackers.first().cloned();
    let announce_list = (trackers.len() > 1)
        .then(|| trackers.iter().map(|url| vec![url.clone()]).collect());
    Torrent::from_parts(announce, announce_list, info)
}

fn collect_sources(paths: &[PathBuf]) -> Result<(String, bool, Vec<Source>), TorrentError> {
    let [first, ..] = paths else {
        return Err(TorrentError::Empty("no input paths were given".to_string()));
    };

    if let [path] = paths {
        let metadata = fs::metadata(path).map_err(|error| io_error(error, path))?;
        let name = file_name(path)?;
        if metadata.is_file() {
            let source = Source {
                disk_path: path.clone(),
                torrent_path: vec![name.clone()],
                length: metadata.len(),
            };
            return Ok((name, true, vec![source]));
        }
        let mut sources = Vec::new();
        walk(path, &mut Vec::new(), &mut sources)?;
        return Ok((name, false, sources));
    }

    let name = first
        .parent()
        .and_then(|parent| parent.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "files".to_string());
    let mut sources = Vec::new();
    for path in paths {
        let metadata = fs::metadata(path).map_err(|error| io_error(error, path))?;
        let component = file_name(path)?;
        if metadata.is_file() {
            sources.push(Source {
                disk_path: path.clone(),
                torrent_path: vec![component],
                length: metadata.len(),
            });
        } else {
            walk(path, &mut vec![component], &mut sources)?;
        }
    }
    Ok((name, false, sources))
}

fn walk(dir: &Path, prefix: &mut Vec<String>, sources: &mut Vec<Source>) -> Result<(), TorrentError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|error| io_error(error, dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| io_error(error, dir))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let metadata = entry.metadata().map_err(|error| io_error(error, &path))?;
        prefix.push(entry.file_name().to_string_lossy().into_owned());
        if metadata.is_dir() {
            walk(&path, prefix, sources)?;
        } else if metadata.is_file() {
            sources.push(Source {
                disk_path: path,
                torrent_path: prefix.clone(),
                length: metadata.len(),
            });
        }
        prefix.pop();
    }
    Ok(())
}

/// Hashes the concatenation of all sources in `piece_length` chunks.
fn hash_pieces(sources: &[Source], piece_length: u32) -> Result<Hashes, TorrentError> {
    let mut hashes = Vec::new();
    let mut piece = Vec::with_capacity(piece_length as usize);
    let mut buf = vec![0u8; piece_length as usize];

    for source in sources {
        let mut file =
            fs::File::open(&source.disk_path).map_err(|error| io_error(error, &source.disk_path))?;
        let mut read_total = 0u64;
        loop {
            let wanted = piece_length as usize - piece.len();
            let n = file
                .read(&mut buf[..wanted])
                .map_err(|error| io_error(error, &source.disk_path))?;
            if n == 0 {
                break;
            }
            read_total += n as u64;
            piece.extend_from_slice(&buf[..n]);
            if piece.len() == piece_length as usize {
                tracing::debug!("hashing piece {}", hashes.len());
                hashes.push(Sha1::digest(&piece).into());
                piece.clear();
            }
        }
        if read_total != source.length {
            return Err(io_error(
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "the file changed size while it was hashed",
                ),
                &source.disk_path,
            ));
        }
    }
    if !piece.is_empty() {
        hashes.push(Sha1::digest(&piece).into());
    }
    Ok(Hashes(hashes))
}

fn file_name(path: &Path) -> Result<String, TorrentError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| TorrentError::Empty(format!("`{}` has no file name", path.display())))
}

fn io_error(error: std::io::Error, path: &Path) -> TorrentError {
    TorrentError::Io {
        error,
        path: path.to_path_buf(),
    }
}
