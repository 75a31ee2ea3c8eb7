//! Per-peer connection state and the tasks that feed its socket.
//!
//! Each established connection is a [`Connection`] record living under the
//! client's lock, plus three tasks: the connection loop reading and
//! dispatching messages (driven by the client), a write optimizer thinning
//! the outgoing queue, and a writer serializing frames to the socket.

pub mod codec;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use futures::{stream::SplitSink, SinkExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedSender},
    time,
};
use tokio_util::codec::Framed;

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex};
use self::codec::{Message, PeerCodec};

/// Identifies a connection within its torrent for the lifetime of the client.
/// Needed because the connection loop must find its own record again after
/// every suspension, and peers may reconnect.
pub(crate) type ConnId = u64;

/// The engine's record of one established peer connection.
///
/// Everything here is guarded by the client's lock; the socket itself lives
/// in the connection's tasks. By protocol, both directions start choked and
/// not interested.
pub(crate) struct Connection {
    pub id: ConnId,
    pub addr: SocketAddr,
    /// The id the peer presented in its handshake.
    pub peer_id: PeerId,
    /// The extension bits from the peer's handshake. Remembered but unused by
    /// the core.
    pub peer_extensions: [u8; 8],
    /// If we choke the peer, we don't allow it to download pieces from us.
    pub choked: bool,
    /// If we're interested, the peer has pieces that we don't have.
    pub interested: bool,
    /// If the peer choked us, it doesn't allow us to download pieces from it.
    pub peer_choked: bool,
    /// If the peer is interested, it means to download pieces that we have.
    pub peer_interested: bool,
    /// All pieces the peer has, from its bitfield and have messages. `None`
    /// until the peer advertises anything.
    pub peer_pieces: Option<Bitfield>,
    /// The block requests we have sent and not yet seen answered. Emptied
    /// wholesale when the peer chokes us.
    pub requests: HashSet<BlockInfo>,
    /// The block requests the peer has sent us. Entries leave on cancel.
    pub peer_requests: HashSet<BlockInfo>,
    /// The head of the connection's outgoing queue.
    post: UnboundedSender<Message>,
}

impl Connection {
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        peer_id: PeerId,
        peer_extensions: [u8; 8],
        post: UnboundedSender<Message>,
    ) -> Self {
        Self {
            id,
            addr,
            peer_id,
            peer_extensions,
            choked: true,
            interested: false,
            peer_choked: true,
            peer_interested: false,
            peer_pieces: None,
            requests: HashSet::new(),
            peer_requests: HashSet::new(),
            post,
        }
    }

    /// Enqueues a message on the connection's outgoing queue. If the writer
    /// is already gone the message is dropped; the connection loop will
    /// notice the dead socket on its own.
    pub fn post(&self, msg: Message) {
        let _ = self.post.send(msg);
    }

    pub fn peer_has_piece(&self, index: PieceIndex) -> bool {
        self.peer_pieces
            .as_ref()
            .map_or(false, |pieces| pieces.get(index).map_or(false, |b| *b))
    }

    /// Tries to place a request for the block with the peer.
    ///
    /// Returns false when no further requests can be placed on this
    /// connection right now: the pipeline is full, or the peer has the piece
    /// but still has us choked (in which case interest is expressed so an
    /// unchoke can follow). Returns true if the caller should keep offering
    /// candidates.
    pub fn request(&mut self, block: BlockInfo, max_requests: usize) -> bool {
        if self.requests.len() >= max_requests {
            return false;
        }
        if !self.peer_has_piece(block.piece_index) {
            return true;
        }
        self.set_interested(true);
        if self.peer_choked {
            return false;
        }
        if self.requests.insert(block) {
            self.post(Message::Request(block));
        }
        true
    }

    /// Updates our interest flag, notifying the peer on a transition.
    pub fn set_interested(&mut self, interested: bool) {
        if self.interested != interested {
            self.interested = interested;
            self.post(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Lifts our choke on the peer, notifying it on a transition.
    pub fn unchoke(&mut self) {
        if self.choked {
            self.choked = false;
            self.post(Message::Unchoke);
        }
    }
}

/// Spawns the writer and write-optimizer tasks for a freshly established
/// connection and returns the post queue the engine enqueues messages on.
///
/// Both tasks run until the returned sender is dropped (the engine removing
/// the connection) or the socket dies, whichever comes first.
pub(crate) fn spawn_conn_writer(
    sink: SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    keepalive_interval: Duration,
) -> UnboundedSender<Message> {
    let (post, posted) = mpsc::unbounded_channel();
    // rendezvous-like handoff so messages linger in the optimizer's queue,
    // where they can still be thinned, rather than in the channel
    let (write, to_write) = mpsc::channel(1);
    tokio::spawn(write_optimizer(posted, write));
    tokio::spawn(conn_writer(sink, to_write, keepalive_interval));
    post
}

/// Sits between the engine and the writer, thinning the queue while messages
/// wait for the socket: a cancel annihilates its not yet sent request, and an
/// interest flip annihilates the queued opposite flip.
async fn write_optimizer(
    mut posted: mpsc::UnboundedReceiver<Message>,
    write: mpsc::Sender<Message>,
) {
    let mut queue: VecDeque<Message> = VecDeque::new();
    loop {
        if queue.is_empty() {
            match posted.recv().await {
                Some(msg) => enqueue_optimized(&mut queue, msg),
                None => break,
            }
        } else {
            tokio::select! {
                permit = write.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(queue.pop_front().expect("non-empty queue"));
                    }
                    // writer is gone, nothing left to do
                    Err(_) => return,
                },
                msg = posted.recv() => match msg {
                    Some(msg) => enqueue_optimized(&mut queue, msg),
                    None => break,
                },
            }
        }
    }
    // the engine hung up; flush what it left behind
    while let Some(msg) = queue.pop_front() {
        if write.send(msg).await.is_err() {
            return;
        }
    }
}

fn enqueue_optimized(queue: &mut VecDeque<Message>, msg: Message) {
    match msg {
        Message::Cancel(block) => {
            let request = Message::Request(block);
            if let Some(pos) = queue.iter().position(|m| *m == request) {
                // the request hasn't hit the wire, so neither needs to
                queue.remove(pos);
            } else {
                queue.push_back(msg);
            }
        }
        Message::Interested => {
            if let Some(pos) =
                queue.iter().rposition(|m| *m == Message::NotInterested)
            {
                queue.remove(pos);
            } else {
                queue.push_back(msg);
            }
        }
        Message::NotInterested => {
            if let Some(pos) =
                queue.iter().rposition(|m| *m == Message::Interested)
            {
                queue.remove(pos);
            } else {
                queue.push_back(msg);
            }
        }
        msg => queue.push_back(msg),
    }
}

/// Serializes messages to the socket, heartbeating with a keepalive whenever
/// the queue has been idle for the configured interval.
async fn conn_writer(
    mut sink: SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    mut to_write: mpsc::Receiver<Message>,
    keepalive_interval: Duration,
) {
    loop {
        let msg = match time::timeout(keepalive_interval, to_write.recv()).await
        {
            Ok(Some(msg)) => msg,
            // engine and optimizer hung up
            Ok(None) => break,
            Err(_) => Message::KeepAlive,
        };
        if let Err(e) = sink.send(msg).await {
            log::debug!("Peer socket write error: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn block(piece_index: PieceIndex) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset: 0,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn test_cancel_annihilates_queued_request() {
        let mut queue = VecDeque::new();
        enqueue_optimized(&mut queue, Message::Request(block(0)));
        enqueue_optimized(&mut queue, Message::Request(block(1)));
        enqueue_optimized(&mut queue, Message::Cancel(block(0)));
        assert_eq!(queue, vec![Message::Request(block(1))]);

        // a cancel for an already sent request goes out as-is
        enqueue_optimized(&mut queue, Message::Cancel(block(2)));
        assert_eq!(
            queue,
            vec![Message::Request(block(1)), Message::Cancel(block(2))]
        );
    }

    #[test]
    fn test_interest_toggles_collapse() {
        let mut queue = VecDeque::new();
        enqueue_optimized(&mut queue, Message::Interested);
        enqueue_optimized(&mut queue, Message::NotInterested);
        assert!(queue.is_empty());

        enqueue_optimized(&mut queue, Message::NotInterested);
        enqueue_optimized(&mut queue, Message::Interested);
        assert!(queue.is_empty());

        // an unpaired flip is kept
        enqueue_optimized(&mut queue, Message::Interested);
        enqueue_optimized(&mut queue, Message::Request(block(0)));
        assert_eq!(
            queue,
            vec![Message::Interested, Message::Request(block(0))]
        );
    }

    #[test]
    fn test_connection_starts_choked_and_uninterested() {
        let (post, _posted) = mpsc::unbounded_channel();
        let conn = Connection::new(
            0,
            "127.0.0.1:6881".parse().unwrap(),
            [0; 20],
            [0; 8],
            post,
        );
        assert!(conn.choked);
        assert!(conn.peer_choked);
        assert!(!conn.interested);
        assert!(!conn.peer_interested);
        assert!(conn.peer_pieces.is_none());
    }

    #[test]
    fn test_request_expresses_interest_but_stops_while_choked() {
        let (post, mut posted) = mpsc::unbounded_channel();
        let mut conn = Connection::new(
            0,
            "127.0.0.1:6881".parse().unwrap(),
            [0; 20],
            [0; 8],
            post,
        );
        let mut pieces = Bitfield::repeat(false, 4);
        pieces.set(1, true);
        conn.peer_pieces = Some(pieces);

        // peer doesn't have piece 0: skip, stay uninterested
        assert!(conn.request(block(0), 4));
        assert!(!conn.interested);

        // peer has piece 1 but still chokes us: become interested and stop
        assert!(!conn.request(block(1), 4));
        assert!(conn.interested);
        assert!(conn.requests.is_empty());
        assert_eq!(posted.try_recv().unwrap(), Message::Interested);
        assert!(posted.try_recv().is_err());

        // once unchoked the same request goes out
        conn.peer_choked = false;
        assert!(conn.request(block(1), 4));
        assert!(conn.requests.contains(&block(1)));
        assert_eq!(posted.try_recv().unwrap(), Message::Request(block(1)));

        // the pipeline cap is a hard stop
        assert!(!conn.request(block(1), 1));
    }
}
