//! The error type shared by all parts of the engine.

use thiserror::Error;

use crate::{BlockInfo, PieceIndex};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A read raced ahead of the download: the requested bytes exist but have
    /// not been downloaded and verified yet. Distinct from end-of-data, which
    /// reads report as 0 bytes.
    #[error("torrent data not ready")]
    DataNotReady,

    /// The client has no torrent with the given info hash.
    #[error("unknown torrent")]
    UnknownTorrent,

    /// The metainfo record is structurally unusable.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(&'static str),

    /// Bencoding or re-encoding the metainfo failed.
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A piece index outside the torrent, either from the API or the wire.
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    /// The handshake did not start with the BitTorrent protocol string.
    #[error("peer sent wrong protocol string")]
    WrongProtocol,

    /// An outbound peer's handshake carried a different info hash than the
    /// torrent we dialed it for.
    #[error("peer handshake has unexpected info hash")]
    WrongInfoHash,

    /// An inbound peer's handshake named a torrent we don't serve.
    #[error("no torrent matching handshake info hash")]
    UnknownInfoHash,

    /// The remote peer presented our own peer id.
    #[error("connected to ourselves")]
    SelfConnection,

    /// A frame that does not parse: oversized length prefix, unknown message
    /// id, or a payload inconsistent with its type.
    #[error("peer sent malformed message")]
    MalformedMessage,

    /// A bitfield after the peer's availability was already established.
    #[error("peer sent a second bitfield")]
    UnexpectedBitfield,

    /// A bitfield too short to cover the torrent's pieces.
    #[error("peer bitfield is shorter than piece count")]
    InvalidBitfield,

    /// A piece message for a block we never requested.
    #[error("peer sent block {0:?} that was not requested")]
    UnexpectedPiece(BlockInfo),

    /// A peer request that does not match the stored data.
    #[error("peer request does not match stored data")]
    BadRequest,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
