//! The BEP 3 peer wire protocol: the 68 byte handshake and the
//! length-prefixed message framing used after it.
//!
//! The message layer is a [`tokio_util::codec`] codec so a connection can be
//! driven as a `Framed` stream/sink pair. The handshake has no codec: its
//! second half is deferred on inbound connections until the info hash has
//! been matched to a torrent, so the engine reads and writes it directly.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, PieceIndex};

/// The protocol string of the standard BitTorrent handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The default upper bound on a single frame's declared payload length.
/// Anything longer is treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// The fixed 68 byte preamble both sides exchange before any messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol string, always "BitTorrent protocol".
    pub prot: [u8; 19],
    /// Extension bits. We send all zeroes but remember what the peer set.
    pub reserved: [u8; 8],
    /// The digest identifying the swarm this connection is for.
    pub info_hash: [u8; 20],
    /// The remote end's self-assigned id.
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// The handshake's length on the wire, including the leading protocol
    /// string length byte.
    pub const LEN: usize = 68;

    /// The length of the protocol string length byte, the protocol string,
    /// and the reserved bytes: the part sent before the info hash.
    pub const PREFIX_LEN: usize = 28;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// The handshake's first 28 bytes: length-prefixed protocol string and
    /// reserved bits. This much can be sent before knowing the info hash.
    pub fn prefix() -> [u8; Self::PREFIX_LEN] {
        let mut buf = [0; Self::PREFIX_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
        buf
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.prot.len() as u8;
        buf[1..20].copy_from_slice(&self.prot);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a received handshake, validating the protocol string byte for
    /// byte.
    pub fn decode(buf: &[u8; Self::LEN]) -> Result<Self> {
        if buf[0] as usize != PROTOCOL_STRING.len()
            || &buf[1..20] != PROTOCOL_STRING.as_bytes()
        {
            return Err(Error::WrongProtocol);
        }
        let mut handshake = Self::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }
}

/// The message id as it appears on the wire, directly after the length
/// prefix. A frame with a zero length has no id; it is a keepalive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            20 => Ok(Self::Extended),
            _ => Err(Error::MalformedMessage),
        }
    }
}

/// A single message of the peer wire protocol.
///
/// The piece message is called a block here: on the wire the name refers to
/// whole pieces for historical reasons, but what it actually carries is a
/// 16 KiB block of one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// BEP 10 extension messages. Recognized on the wire so that peers using
    /// extensions aren't dropped, but otherwise ignored by the engine.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The message's wire id, or `None` for a keepalive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// Codec for the length-prefixed message protocol spoken after the handshake.
pub struct PeerCodec {
    /// Frames whose declared length exceeds this are rejected outright.
    max_frame_len: usize,
}

impl PeerCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("flag message id") as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                // pad the logical piece vector out to full bytes
                let mut bitfield = bitfield;
                let byte_len = (bitfield.len() + 7) / 8;
                bitfield.resize(byte_len * 8, false);
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > self.max_frame_len {
            return Err(Error::MalformedMessage);
        }
        if src.len() < 4 + len {
            // wait for the rest of the frame
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(len);
        let id = MessageId::try_from(payload.get_u8())?;
        let rest = payload.remaining();

        use MessageId::*;
        let msg = match id {
            Choke if rest == 0 => Message::Choke,
            Unchoke if rest == 0 => Message::Unchoke,
            Interested if rest == 0 => Message::Interested,
            NotInterested if rest == 0 => Message::NotInterested,
            Have if rest == 4 => Message::Have {
                piece_index: payload.get_u32() as PieceIndex,
            },
            Bitfield => Message::Bitfield(crate::Bitfield::from_vec(
                payload.to_vec(),
            )),
            Request if rest == 12 => Message::Request(BlockInfo {
                piece_index: payload.get_u32() as PieceIndex,
                offset: payload.get_u32(),
                len: payload.get_u32(),
            }),
            Block if rest >= 8 => Message::Block {
                piece_index: payload.get_u32() as PieceIndex,
                offset: payload.get_u32(),
                data: payload.to_vec(),
            },
            Cancel if rest == 12 => Message::Cancel(BlockInfo {
                piece_index: payload.get_u32() as PieceIndex,
                offset: payload.get_u32(),
                len: payload.get_u32(),
            }),
            Extended if rest >= 1 => Message::Extended {
                id: payload.get_u8(),
                payload: payload.to_vec(),
            },
            // a recognized id whose payload doesn't have the right shape
            _ => return Err(Error::MalformedMessage),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::BLOCK_LEN;

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec::default().encode(msg, &mut buf).unwrap();
        buf
    }

    fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
        PeerCodec::default().decode(buf)
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0xab; 20], *b"-PW0001-012345678901");
        let decoded = Handshake::decode(&handshake.encode()).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_handshake_prefix_matches_encoding() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        assert_eq!(handshake.encode()[..28], Handshake::prefix());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut bytes = Handshake::new([0; 20], [0; 20]).encode();
        bytes[1] = b'b';
        assert!(matches!(
            Handshake::decode(&bytes),
            Err(Error::WrongProtocol)
        ));
    }

    #[test]
    fn test_message_round_trips() {
        let block = BlockInfo {
            piece_index: 42,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let mut bitfield = Bitfield::from_vec(vec![0b1100_0001]);
        bitfield.resize(8, false);
        let msgs = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 7 },
            Message::Bitfield(bitfield),
            Message::Request(block),
            Message::Block {
                piece_index: 42,
                offset: BLOCK_LEN,
                data: (0..255).collect(),
            },
            Message::Cancel(block),
            Message::Extended {
                id: 1,
                payload: b"d1:md11:ut_metadatai1eee".to_vec(),
            },
        ];
        for msg in msgs {
            let mut wire = encode(msg.clone());
            let original_wire = wire.clone();
            let decoded = decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(wire.is_empty());
            // and re-encoding the decoded message is byte-identical
            assert_eq!(encode(decoded), original_wire);
        }
    }

    #[test]
    fn test_wire_layout() {
        // spot check a few fixed encodings against the BEP 3 layout
        assert_eq!(&encode(Message::KeepAlive)[..], &[0, 0, 0, 0]);
        assert_eq!(&encode(Message::Unchoke)[..], &[0, 0, 0, 1, 1]);
        assert_eq!(
            &encode(Message::Have { piece_index: 1 })[..],
            &[0, 0, 0, 5, 4, 0, 0, 0, 1]
        );
        assert_eq!(
            &encode(Message::Request(BlockInfo {
                piece_index: 1,
                offset: BLOCK_LEN,
                len: BLOCK_LEN,
            }))[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let wire = encode(Message::Have { piece_index: 3 });
        let mut partial = BytesMut::from(&wire[..6]);
        assert_eq!(decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&wire[6..]);
        assert_eq!(
            decode(&mut partial).unwrap(),
            Some(Message::Have { piece_index: 3 })
        );
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut wire = BytesMut::new();
        wire.put_u32(MAX_FRAME_LEN as u32 + 1);
        wire.put_u8(MessageId::Block as u8);
        assert!(matches!(
            decode(&mut wire),
            Err(Error::MalformedMessage)
        ));
    }

    #[test]
    fn test_rejects_unknown_message_id() {
        let mut wire = BytesMut::new();
        wire.put_u32(1);
        wire.put_u8(9); // DHT port message, not part of the core protocol
        assert!(matches!(
            decode(&mut wire),
            Err(Error::MalformedMessage)
        ));
    }

    #[test]
    fn test_rejects_malformed_payload() {
        // a Have message with a truncated piece index
        let mut wire = BytesMut::new();
        wire.put_u32(3);
        wire.put_u8(MessageId::Have as u8);
        wire.put_u16(1);
        assert!(matches!(
            decode(&mut wire),
            Err(Error::MalformedMessage)
        ));
    }
}
