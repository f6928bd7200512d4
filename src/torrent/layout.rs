use std::path::{Component, Path, PathBuf};

use super::{Key, Metainfo, TorrentError};

/// One file of the torrent with its position in the concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save directory, starting with the torrent name for multi-file
    /// torrents.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte of this file in the concatenated content.
    pub offset: u64,
}

/// A contiguous run of bytes inside a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_i: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps byte ranges of the concatenated torrent content onto the backing files
/// through a cumulative offset table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    files: Vec<FileEntry>,
    total_length: u64,
}

impl FileLayout {
    pub fn from_metainfo(info: &Metainfo) -> Result<Self, TorrentError> {
        check_component(&info.name)?;
        if let Key::MultiFile { files } = &info.files {
            for component in files.iter().flat_map(|file| file.path.iter()) {
                check_component(component)?;
            }
        }

        let mut offset = 0;
        let files = info
            .files()
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry {
                    path,
                    length,
                    offset,
                };
                offset += length;
                entry
            })
            .collect();

        Ok(Self {
            files,
            total_length: offset,
        })
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Splits `[offset, offset + length)` of the content into per-file segments.
    /// Zero length files never show up in the result.
    pub fn segments(&self, offset: u64, length: u64) -> Vec<Segment> {
        let end = (offset + length).min(self.total_length);
        let mut segments = Vec::new();
        if offset >= end {
            return segments;
        }

        // first file that ends after `offset`
        let first = self
            .files
            .partition_point(|file| file.offset + file.length <= offset);
        let mut position = offset;
        for (file_i, file) in self.files.iter().enumerate().skip(first) {
            if position >= end {
                break;
            }
            let file_end = file.offset + file.length;
            if file.length == 0 || file_end <= position {
                continue;
            }
            let segment_end = file_end.min(end);
            segments.push(Segment {
                file_i,
                file_offset: position - file.offset,
                length: segment_end - position,
            });
            position = segment_end;
        }
        segments
    }
}

fn check_component(component: &str) -> Result<(), TorrentError> {
    let mut components = Path::new(component).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TorrentError::UnsafePath(component.to_string())),
    }
}

#[cfg(test)]
mod test_layout {
    use super::*;
    use crate::torrent::{File, Hashes};

    fn layout(lengths: &[u64]) -> FileLayout {
        let files = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| File {
                length,
                path: vec![format!("f{i}")],
            })
            .collect();
        let info = Metainfo {
            name: "dir".to_string(),
            piece_length: 4,
            pieces: Hashes(Vec::new()),
            files: Key::MultiFile { files },
        };
        FileLayout::from_metainfo(&info).unwrap()
    }

    #[test]
    fn offsets_are_cumulative() {
        let layout = layout(&[3, 0, 5]);
        let offsets: Vec<u64> = layout.files().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 3, 3]);
        assert_eq!(layout.total_length(), 8);
    }

    #[test]
    fn range_spanning_files_skips_empty_ones() {
        let layout = layout(&[3, 0, 5]);
        assert_eq!(
            layout.segments(2, 4),
            vec![
                Segment {
                    file_i: 0,
                    file_offset: 2,
                    length: 1
                },
                Segment {
                    file_i: 2,
                    file_offset: 0,
                    length: 3
                },
            ]
        );
    }

    #[test]
    fn range_is_clamped_to_content() {
        let layout = layout(&[3, 5]);
        assert_eq!(
            layout.segments(6, 10),
            vec![Segment {
                file_i: 1,
                file_offset: 3,
                length: 2
            }]
        );
        assert!(layout.segments(8, 1).is_empty());
    }

    #[test]
    fn parent_dir_is_rejected() {
        let info = Metainfo {
            name: "dir".to_string(),
            piece_length: 4,
            pieces: Hashes(Vec::new()),
            files: Key::MultiFile {
                files: vec![File {
                    length: 1,
                    path: vec!["..".to_string(), "etc".to_string()],
                }],
            },
        };
        assert!(matches!(
            FileLayout::from_metainfo(&info),
            Err(TorrentError::UnsafePath(_))
        ));
    }
}
