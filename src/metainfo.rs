//! The metainfo (.torrent) model.
//!
//! Discovery and file plumbing hand the engine an already parsed [`Metainfo`]
//! record; this module owns its shape, the info hash derivation, and access
//! to the per-piece digests.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{error::*, PieceIndex, Sha1Hash};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    /// The announce URL of the torrent's primary tracker, if any.
    pub announce: Option<String>,
    /// The tiered tracker list of BEP 12, if present.
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        if metainfo.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo("bad piece hash length"));
        }
        if metainfo.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("zero piece length"));
        }
        Ok(metainfo)
    }

    /// Computes the torrent's info hash by re-encoding the info dictionary.
    ///
    /// The `Info` fields are declared in bencode key order, so serializing
    /// them reproduces the canonical dictionary byte for byte.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        Ok(digest.into())
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected digest of the piece at the given index, out of the
    /// concatenated hash string of the info dictionary.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// The sum of the length of all files in the torrent.
    pub fn total_len(&self) -> u64 {
        if let Some(len) = self.info.length {
            len
        } else if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Returns true if the download consists of multiple files.
    pub fn is_archive(&self) -> bool {
        self.info.files.is_some()
    }
}

// Field order matters: bencode dictionaries are sorted by key, and the info
// hash is computed over the re-encoded dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // A handcrafted single file torrent: 64 bytes in 32 byte pieces.
    const SAMPLE: &[u8] = b"d4:infod6:lengthi64e4:name4:t.px\
        12:piece lengthi32e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee";

    #[test]
    fn test_parse_single_file() {
        let metainfo = Metainfo::from_bytes(SAMPLE).unwrap();
        assert_eq!(metainfo.info.name, "t.px");
        assert_eq!(metainfo.info.piece_length, 32);
        assert_eq!(metainfo.total_len(), 64);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.is_archive());
        assert_eq!(metainfo.piece_hash(0), *b"aaaaaaaaaaaaaaaaaaaa");
        assert_eq!(metainfo.piece_hash(1), *b"bbbbbbbbbbbbbbbbbbbb");
    }

    #[test]
    fn test_info_hash_matches_raw_dictionary() {
        let metainfo = Metainfo::from_bytes(SAMPLE).unwrap();
        // the info dictionary is everything between "4:info" and the final "e"
        let raw_info = &SAMPLE[b"d4:info".len()..SAMPLE.len() - 1];
        let expected: Sha1Hash = Sha1::digest(raw_info).into();
        assert_eq!(metainfo.info_hash().unwrap(), expected);
    }

    #[test]
    fn test_parse_multi_file() {
        let sample: &[u8] = b"d4:infod5:filesld6:lengthi3e4:pathl1:aeed\
            6:lengthi5e4:pathl3:sub1:beee4:name3:dir\
            12:piece lengthi8e6:pieces20:ccccccccccccccccccccee";
        let metainfo = Metainfo::from_bytes(sample).unwrap();
        assert!(metainfo.is_archive());
        assert_eq!(metainfo.total_len(), 8);
        let files = metainfo.info.files.as_ref().unwrap();
        assert_eq!(files[0].path, vec!["a".to_string()]);
        assert_eq!(files[1].path, vec!["sub".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_rejects_truncated_piece_hashes() {
        let sample: &[u8] = b"d4:infod6:lengthi64e4:name1:x\
            12:piece lengthi32e6:pieces19:aaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(
            Metainfo::from_bytes(sample),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
