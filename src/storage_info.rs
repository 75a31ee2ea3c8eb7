use std::{ops::Range, path::PathBuf};

use crate::{metainfo::Metainfo, BlockInfo, FileIndex, PieceIndex, BLOCK_LEN};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the last
    /// bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at the
    /// given offset.
    ///
    /// # Arguments
    ///
    /// * `torrent_offset` - A byte offset in the entire torrent.
    /// * `len` - The length of the byte range, starting from the offset. This
    ///         may exceed the file length, in which case the returned file
    ///         length will be smaller.
    ///
    /// # Panics
    ///
    /// This will panic if `torrent_offset` is smaller than the file's offset in
    /// torrent, or if it's past the last byte in file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of the
    /// piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the file
    /// is downloaded, named as the torrent.
    /// In case of archive downloads, this directory is the download directory
    /// joined by the torrent's name. This is because in case of a torrent that
    /// has multiple top-level entries, the downloaded files would be scattered
    /// across the download directory, which is an annoyance we want to avoid.
    /// E.g. downloading files into ~/Downloads/<torrent> instead of just
    /// ~/Downloads.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files.
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, data_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.total_len();
        let piece_len = metainfo.info.piece_length;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count as u64 - 1);
        let last_piece_len = last_piece_len as u32;

        let (download_dir, structure) = if let Some(files) =
            &metainfo.info.files
        {
            // if this is an archive, download files into torrent's own dir
            let mut torrent_offset = 0;
            let files = files
                .iter()
                .map(|file| {
                    let mut path = PathBuf::new();
                    for part in &file.path {
                        path.push(part);
                    }
                    let info = FileInfo {
                        path,
                        len: file.length,
                        torrent_offset,
                    };
                    torrent_offset += file.length;
                    info
                })
                .collect();
            (
                data_dir.join(&metainfo.info.name),
                FsStructure::Archive { files },
            )
        } else {
            (
                data_dir,
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&metainfo.info.name),
                    len: download_len,
                    torrent_offset: 0,
                }),
            )
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure,
        }
    }

    /// Returns the length of the piece at the given index.
    ///
    /// The index must be within the torrent; wire-derived indices are
    /// validated at the dispatch boundary before they get here.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        debug_assert!(index < self.piece_count);
        if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Returns the block that contains the given offset into the torrent, or
    /// `None` if the offset is outside the torrent.
    ///
    /// Blocks tile each piece from its start, so the returned block begins at
    /// the nearest block boundary at or before the offset.
    pub fn offset_request(&self, offset: u64) -> Option<BlockInfo> {
        if offset >= self.download_len {
            return None;
        }
        let piece_index = (offset / self.piece_len as u64) as PieceIndex;
        let begin =
            (offset % self.piece_len as u64) as u32 / BLOCK_LEN * BLOCK_LEN;
        let left = self.download_len
            - piece_index as u64 * self.piece_len as u64
            - begin as u64;
        let len = (BLOCK_LEN as u64).min(left) as u32;
        Some(BlockInfo {
            piece_index,
            offset: begin,
            len,
        })
    }

    /// Returns the offset of the block in the torrent, when all pieces are
    /// viewed as a single contiguous byte array.
    pub fn request_offset(&self, block: BlockInfo) -> u64 {
        debug_assert!(block.piece_index < self.piece_count);
        block.piece_index as u64 * self.piece_len as u64 + block.offset as u64
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub(crate) enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories.
    Archive {
        /// A flattened list of all files in the archive, in torrent order,
        /// with their cumulative byte offsets.
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns every file in the download, in torrent order.
    pub fn files(&self) -> &[FileInfo] {
        match self {
            Self::File(file) => std::slice::from_ref(file),
            Self::Archive { files } => files,
        }
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `bytes.start` is the offset and `bytes.end` is one past the
    /// last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        match self {
            // when torrent only has one file, only that file can be returned
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                // find the index of the first file that contains the first byte
                // of the given range
                let first_matching_index = match files
                    .iter()
                    .enumerate()
                    .find(|(_, file)| {
                        // check if the file's byte range contains the first
                        // byte of the given range
                        file.byte_range().contains(&byte_range.start)
                    })
                    .map(|(index, _)| index)
                {
                    Some(index) => index,
                    None => return 0..0,
                };

                // the resulting files
                let mut file_range =
                    first_matching_index..first_matching_index + 1;

                // Find the the last file that contains the last byte of the
                // given range, starting at the file after the above found one.
                //
                // NOTE: the order of `enumerate` and `skip` matters as
                // otherwise we'd be getting relative indices
                for (index, file) in
                    files.iter().enumerate().skip(first_matching_index + 1)
                {
                    // stop if file's first byte is not contained by the given
                    // byte range (is at or past the end of the byte range we're
                    // looking for)
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }

                    // note that we need to add one to the end as this is
                    // a left-inclusive range, so we want the end (excluded) to
                    // be one past the actually included value
                    file_range.end = index + 1;
                }

                file_range
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    #[test]
    fn test_file_get_slice() {
        let file = FileInfo {
            // file doesn't need to exist as we're not doing any IO in this test
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice {
                offset: 300 - 200,
                len: 500 - (300 - 200),
            },
            "file slice for byte range longer than file should return \
            at most file length long slice"
        );

        assert_eq!(
            file.get_slice(300, 10),
            FileSlice {
                offset: 300 - 200,
                len: 10,
            },
            "file slice for byte range smaller than file should return \
            at most byte range long slice"
        );

        assert_eq!(
            file.get_slice(200, 500),
            FileSlice {
                offset: 0,
                len: 500,
            },
            "file slice for byte range equal to file length should return \
            the full file slice"
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_file_get_slice_starting_before_file() {
        let file = FileInfo {
            // file doesn't need to exist as we're not doing any IO in this test
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        // we can't query a file slice for a byte range starting before the file
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_file_get_slice_starting_after_file() {
        let file = FileInfo {
            // file doesn't need to exist as we're not doing any IO in this test
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        // we can't query a file slice for a byte range starting after the file
        file.get_slice(200 + 500, 400);
    }

    #[test]
    fn test_files_intersecting_bytes() {
        // single file
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: 12341234,
        });
        assert_eq!(structure.files_intersecting_bytes(0..0), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..1), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..12341234), 0..1);

        // multi-file
        let structure = FsStructure::Archive {
            files: vec![
                FileInfo {
                    path: PathBuf::from("/bogus0"),
                    torrent_offset: 0,
                    len: 4,
                },
                FileInfo {
                    path: PathBuf::from("/bogus1"),
                    torrent_offset: 4,
                    len: 9,
                },
                FileInfo {
                    path: PathBuf::from("/bogus2"),
                    torrent_offset: 13,
                    len: 3,
                },
                FileInfo {
                    path: PathBuf::from("/bogus3"),
                    torrent_offset: 16,
                    len: 10,
                },
            ],
        };
        // bytes only in the first file
        assert_eq!(structure.files_intersecting_bytes(0..4), 0..1);
        // bytes intersecting two files
        assert_eq!(structure.files_intersecting_bytes(0..5), 0..2);
        // bytes overlapping with two files
        assert_eq!(structure.files_intersecting_bytes(0..13), 0..2);
        // bytes intersecting three files
        assert_eq!(structure.files_intersecting_bytes(0..15), 0..3);
        // bytes intersecting all files
        assert_eq!(structure.files_intersecting_bytes(0..18), 0..4);
        // bytes intersecting the last byte of the last file
        assert_eq!(structure.files_intersecting_bytes(25..26), 3..4);
        // bytes overlapping with two files in the middle
        assert_eq!(structure.files_intersecting_bytes(4..16), 1..3);
        // bytes intersecting only one byte of two files each, among the middle
        // of all files
        assert_eq!(structure.files_intersecting_bytes(8..14), 1..3);
        // bytes intersecting only one byte of one file, among the middle of all
        // files
        assert_eq!(structure.files_intersecting_bytes(13..14), 2..3);
        // bytes not intersecting any files
        assert_eq!(structure.files_intersecting_bytes(30..38), 0..0);
    }

    fn test_info() -> StorageInfo {
        // 2 full pieces of 2 blocks each, 1 final piece of 1.5 blocks
        let piece_len = 2 * BLOCK_LEN;
        let last_piece_len = BLOCK_LEN + BLOCK_LEN / 2;
        let download_len = 2 * piece_len as u64 + last_piece_len as u64;
        StorageInfo {
            piece_count: 3,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("/bogus"),
                torrent_offset: 0,
                len: download_len,
            }),
        }
    }

    #[test]
    fn test_piece_len() {
        let info = test_info();
        assert_eq!(info.piece_len(0), 2 * BLOCK_LEN);
        assert_eq!(info.piece_len(1), 2 * BLOCK_LEN);
        assert_eq!(info.piece_len(2), BLOCK_LEN + BLOCK_LEN / 2);
    }

    #[test]
    fn test_offset_request_round_trip() {
        let info = test_info();
        // offset -> request -> offset is the identity on block boundaries
        for block_index in 0..7 {
            let offset = block_index as u64 * BLOCK_LEN as u64;
            let block = info.offset_request(offset).unwrap();
            assert_eq!(info.request_offset(block), offset);
        }
        // an offset in the middle of a block maps to its containing block
        let block = info.offset_request(BLOCK_LEN as u64 + 5).unwrap();
        assert_eq!(
            block,
            BlockInfo {
                piece_index: 0,
                offset: BLOCK_LEN,
                len: BLOCK_LEN,
            }
        );
    }

    #[test]
    fn test_offset_request_tail() {
        let info = test_info();
        // the torrent's final block is truncated to the data that is left
        let last_block_offset = 6 * BLOCK_LEN as u64;
        assert_eq!(
            info.offset_request(last_block_offset).unwrap(),
            BlockInfo {
                piece_index: 2,
                offset: BLOCK_LEN,
                len: BLOCK_LEN / 2,
            }
        );
        // one past the end of the torrent is no block at all
        assert_eq!(info.offset_request(info.download_len), None);
    }
}
