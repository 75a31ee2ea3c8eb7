//! Disk access for a torrent's files.
//!
//! [`TorrentData`] turns the torrent's (possibly multi file) on-disk layout
//! into one contiguous byte array addressed by torrent offsets, the same view
//! the piece and block arithmetic uses. All operations are positioned reads
//! and writes on pre-opened handles, so they take `&self` and can be used from
//! any task.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::fs::FileExt,
};

use sha1::{Digest, Sha1};

use crate::{
    storage_info::StorageInfo, FileInfo, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// The opened files of a torrent.
pub(crate) struct TorrentData {
    files: Vec<TorrentFile>,
    info: StorageInfo,
}

impl TorrentData {
    /// Creates the file system structure of the torrent and opens all file
    /// handles.
    ///
    /// Existing files are kept as they are so that partially downloaded or
    /// seeded data survives a restart; missing or short files are extended to
    /// their full length up front, which makes every in-bounds positioned read
    /// well defined (unwritten regions read as zeroes and simply fail their
    /// piece hash).
    pub fn open(info: StorageInfo) -> io::Result<Self> {
        fs::create_dir_all(&info.download_dir)?;

        let mut files = Vec::with_capacity(info.structure.files().len());
        for file_info in info.structure.files() {
            let path = info.download_dir.join(&file_info.path);
            if let Some(subdir) = path.parent() {
                fs::create_dir_all(subdir)?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}: {}", path, e);
                    e
                })?;
            if handle.metadata()?.len() < file_info.len {
                handle.set_len(file_info.len)?;
            }
            files.push(TorrentFile {
                info: file_info.clone(),
                handle,
            });
        }

        Ok(Self { files, info })
    }

    /// The torrent's total length in bytes.
    pub fn size(&self) -> u64 {
        self.info.download_len
    }

    /// Reads bytes at the given torrent offset, walking all files the range
    /// overlaps. The buffer is clipped to the end of the torrent; a read past
    /// the end returns 0.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.info.download_len {
            return Ok(0);
        }
        let len =
            (buf.len() as u64).min(self.info.download_len - offset) as usize;
        let buf = &mut buf[..len];

        let files = self
            .info
            .structure
            .files_intersecting_bytes(offset..offset + len as u64);
        let mut cur = offset;
        let mut read = 0;
        for file in &self.files[files] {
            let slice = file.info.get_slice(cur, (len - read) as u64);
            file.handle.read_exact_at(
                &mut buf[read..read + slice.len as usize],
                slice.offset,
            )?;
            cur += slice.len;
            read += slice.len as usize;
        }
        debug_assert_eq!(read, len);
        Ok(read)
    }

    /// Writes bytes at the given torrent offset, walking all files the range
    /// overlaps. Writing past the end of the torrent is a caller bug.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        debug_assert!(offset + buf.len() as u64 <= self.info.download_len);

        let files = self
            .info
            .structure
            .files_intersecting_bytes(offset..offset + buf.len() as u64);
        let mut cur = offset;
        let mut written = 0;
        for file in &self.files[files] {
            let slice =
                file.info.get_slice(cur, (buf.len() - written) as u64);
            file.handle.write_all_at(
                &buf[written..written + slice.len as usize],
                slice.offset,
            )?;
            cur += slice.len;
            written += slice.len as usize;
        }
        debug_assert_eq!(written, buf.len());
        Ok(written)
    }

    /// Streams a section of the torrent into the given writer, one block at
    /// a time. Used to hash pieces without buffering them whole.
    pub fn write_section_to<W: Write>(
        &self,
        writer: &mut W,
        offset: u64,
        len: u64,
    ) -> io::Result<u64> {
        let mut buf = vec![0; BLOCK_LEN as usize];
        let mut cur = offset;
        let end = offset + len;
        while cur < end {
            let n = (buf.len() as u64).min(end - cur) as usize;
            let read = self.read_at(&mut buf[..n], cur)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read])?;
            cur += read as u64;
        }
        Ok(cur - offset)
    }

    /// Computes the SHA-1 digest of the piece at the given index.
    ///
    /// This performs blocking IO and a full digest pass, so it is meant to be
    /// run on the blocking pool and not the executor.
    pub fn hash_piece(&self, index: PieceIndex) -> io::Result<Sha1Hash> {
        let offset = index as u64 * self.info.piece_len as u64;
        let len = self.info.piece_len(index) as u64;
        let mut writer = DigestWriter(Sha1::new());
        let n = self.write_section_to(&mut writer, offset, len)?;
        if n != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("hashed {} of {} piece bytes", n, len),
            ));
        }
        Ok(writer.0.finalize().into())
    }

    /// Flushes all file contents to durable storage.
    pub fn close(&self) -> io::Result<()> {
        for file in &self.files {
            file.handle.sync_all()?;
        }
        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

/// Adapts a SHA-1 context to `io::Write` for use with `write_section_to`.
struct DigestWriter(Sha1);

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage_info::FsStructure;

    fn archive_info(dir: PathBuf) -> StorageInfo {
        // 40 bytes split unevenly across three files, pieces of 16 bytes
        StorageInfo {
            piece_count: 3,
            piece_len: 16,
            last_piece_len: 8,
            download_len: 40,
            download_dir: dir,
            structure: FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a"),
                        len: 10,
                        torrent_offset: 0,
                    },
                    FileInfo {
                        path: PathBuf::from("sub/b"),
                        len: 25,
                        torrent_offset: 10,
                    },
                    FileInfo {
                        path: PathBuf::from("c"),
                        len: 5,
                        torrent_offset: 35,
                    },
                ],
            },
        }
    }

    #[test]
    fn test_write_read_across_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let data = TorrentData::open(archive_info(dir.path().into())).unwrap();

        let payload: Vec<u8> = (0..40).collect();
        // a write spanning all three files
        data.write_at(&payload, 0).unwrap();

        let mut read_back = vec![0; 40];
        assert_eq!(data.read_at(&mut read_back, 0).unwrap(), 40);
        assert_eq!(read_back, payload);

        // a read clipped by the end of the torrent
        let mut tail = vec![0; 16];
        assert_eq!(data.read_at(&mut tail, 32).unwrap(), 8);
        assert_eq!(&tail[..8], &payload[32..]);

        // a read past the end reads nothing
        assert_eq!(data.read_at(&mut tail, 40).unwrap(), 0);
    }

    #[test]
    fn test_unwritten_regions_read_as_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let data = TorrentData::open(archive_info(dir.path().into())).unwrap();

        data.write_at(&[0xff; 8], 12).unwrap();

        let mut buf = vec![0xaa; 16];
        assert_eq!(data.read_at(&mut buf, 8).unwrap(), 16);
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..12], &[0xff; 8]);
        assert_eq!(&buf[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_hash_piece_matches_direct_digest() {
        let dir = tempfile::tempdir().unwrap();
        let data = TorrentData::open(archive_info(dir.path().into())).unwrap();

        let payload: Vec<u8> = (0..40).map(|b| b ^ 0x5a).collect();
        data.write_at(&payload, 0).unwrap();

        let expected: Sha1Hash = Sha1::digest(&payload[16..32]).into();
        assert_eq!(data.hash_piece(1).unwrap(), expected);

        // the short last piece hashes only the remaining 8 bytes
        let expected: Sha1Hash = Sha1::digest(&payload[32..40]).into();
        assert_eq!(data.hash_piece(2).unwrap(), expected);
    }
}
