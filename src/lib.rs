#[macro_use]
extern crate serde_derive;

pub mod client;
pub mod conf;
mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
mod piece;
mod storage_info;
mod torrent;
pub mod tracker;

use std::net::SocketAddr;

use bitvec::prelude::{BitVec, Msb0};

pub use client::{Client, DataWaiter};
pub use conf::Conf;
pub use error::{Error, Result};
pub use metainfo::Metainfo;
pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The 20-byte SHA-1 digest of the bencoded info dictionary. It identifies a
/// swarm, both on the wire and in the client's torrent registry.
pub type InfoHash = Sha1Hash;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block).  It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A peer's address as handed to us by a discovery source, before any
/// connection attempt was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peer {
    /// The peer's 20 byte BitTorrent id, if the discovery source knew it.
    /// Learned authoritatively during the handshake.
    pub id: Option<PeerId>,
    /// The peer's address.
    pub addr: SocketAddr,
}

/// A block's position within its piece: byte offset and length.
///
/// Blocks not yet received since a piece's last hash attempt are tracked as a
/// set of these specs on the piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkSpec {
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The length in bytes. Always 16 KiB except for the last block of the
    /// last piece, which may be shorter.
    pub len: u32,
}

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
///
/// This is also the key under which outstanding requests are tracked, so two
/// requests for the same bytes compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except for
    /// the last block of the torrent.
    pub len: u32,
}

impl BlockInfo {
    /// Reassembles a block from a piece index and a chunk spec.
    pub fn from_spec(piece_index: PieceIndex, chunk: ChunkSpec) -> Self {
        Self {
            piece_index,
            offset: chunk.offset,
            len: chunk.len,
        }
    }

    /// The block's position within its piece, without the piece index.
    pub fn chunk_spec(&self) -> ChunkSpec {
        ChunkSpec {
            offset: self.offset,
            len: self.len,
        }
    }

    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last block in
        // which case it may be shorter than the default block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the returned
/// value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the specs of every block in a piece of the given length, in offset
/// order. The last spec is truncated to the piece boundary.
pub(crate) fn chunk_specs(piece_len: u32) -> impl Iterator<Item = ChunkSpec> {
    (0..block_count(piece_len)).map(move |index| ChunkSpec {
        offset: index as u32 * BLOCK_LEN,
        len: block_len(piece_len, index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical block
    // length and the amount with which it overlaps the nearest exact multiple
    // value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);

        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    #[test]
    fn test_chunk_specs() {
        let specs: Vec<_> = chunk_specs(UNEVEN_PIECE_LEN).collect();
        assert_eq!(
            specs,
            vec![
                ChunkSpec {
                    offset: 0,
                    len: BLOCK_LEN
                },
                ChunkSpec {
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN
                },
                ChunkSpec {
                    offset: 2 * BLOCK_LEN,
                    len: OVERLAP
                },
            ]
        );
    }

    #[test]
    fn test_block_chunk_spec_round_trip() {
        let block = BlockInfo {
            piece_index: 7,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(BlockInfo::from_spec(7, block.chunk_spec()), block);
        assert_eq!(block.index_in_piece(), 1);
    }
}
