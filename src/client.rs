//! The process-level engine: the registry of swarms and every task that
//! drives them.
//!
//! All swarm and client state lives behind one lock, with a single broadcast
//! notifier as its condition variable. Connection loops, dialers, verifiers
//! and announcers are tokio tasks that take the lock only between
//! suspensions: socket reads and writes, piece digests, and announce sleeps
//! all happen with the lock released.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::{stream::SplitStream, StreamExt};
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{watch, Mutex, Notify},
    task, time,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    peer::{
        codec::{Handshake, Message, PeerCodec},
        spawn_conn_writer, ConnId, Connection,
    },
    piece::Piece,
    torrent::Torrent,
    tracker::{AnnounceRequest, PeerSource},
    BlockInfo, InfoHash, Peer, PeerId, PieceIndex,
};

/// The engine handle. Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    conf: Conf,
    /// Our own id: the configured fingerprint followed by random bytes.
    peer_id: PeerId,
    /// Where the listener actually bound, for announces and tests.
    listen_addr: Option<SocketAddr>,
    /// The one lock guarding all swarm and client state.
    state: Mutex<State>,
    /// The broadcast condition associated with `state`: piece completions,
    /// verification transitions and shutdown all notify here.
    event: Notify,
    /// The engine-wide shutdown signal.
    quit: CancellationToken,
}

struct State {
    torrents: HashMap<InfoHash, Torrent>,
    /// Connections dialed but not yet past their handshake.
    half_open: usize,
    next_conn_id: ConnId,
    /// The armed global data-ready waiter, if anyone subscribed since the
    /// last event.
    data_waiter: Option<watch::Sender<()>>,
}

/// A one-shot subscription to "some new data became readable". Fires on the
/// next downloaded block or verified piece anywhere in the client and is then
/// spent; callers that keep caring re-subscribe.
pub struct DataWaiter(watch::Receiver<()>);

impl DataWaiter {
    pub async fn wait(mut self) {
        // an error means the client fired and dropped the sender before we
        // polled, which counts as the event having happened
        let _ = self.0.changed().await;
    }
}

impl Client {
    /// Starts the engine: generates a peer id, binds the listener if one is
    /// configured, and begins accepting inbound connections.
    pub async fn new(conf: Conf) -> Result<Self> {
        let mut peer_id = [0u8; 20];
        let prefix = conf.engine.client_id_prefix.as_bytes();
        let prefix_len = prefix.len().min(peer_id.len());
        peer_id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        rand::thread_rng().fill(&mut peer_id[prefix_len..]);

        let listener = match conf.engine.listen_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let listen_addr =
            listener.as_ref().map(|l| l.local_addr()).transpose()?;

        let client = Self {
            inner: Arc::new(Inner {
                conf,
                peer_id,
                listen_addr,
                state: Mutex::new(State {
                    torrents: HashMap::new(),
                    half_open: 0,
                    next_conn_id: 0,
                    data_waiter: None,
                }),
                event: Notify::new(),
                quit: CancellationToken::new(),
            }),
        };
        log::info!(
            "Client starting with peer id {}",
            hex::encode(client.inner.peer_id)
        );
        if let Some(listener) = listener {
            task::spawn(client.clone().accept_loop(listener));
        }
        Ok(client)
    }

    /// The address inbound peers can reach us on, if we are listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listen_addr
    }

    /// Shuts the engine down: all connection, announce and wait loops return
    /// and torrent data is flushed to disk.
    pub async fn stop(&self) {
        log::info!("Stopping client");
        self.inner.quit.cancel();
        self.inner.event.notify_waiters();
        let mut state = self.inner.state.lock().await;
        for (_, torrent) in state.torrents.drain() {
            torrent.close();
        }
    }

    fn stopped(&self) -> bool {
        self.inner.quit.is_cancelled()
    }

    /// Registers a torrent and starts working on it.
    ///
    /// Every piece is immediately queued for verification, so data already
    /// present in the data directory is recognized and seeded. Returns the
    /// torrent's info hash, under which all other operations address it.
    /// Adding a torrent that is already present is a no-op.
    pub async fn add_torrent(
        &self,
        metainfo: &Metainfo,
        trackers: Vec<Vec<Arc<dyn PeerSource>>>,
    ) -> Result<InfoHash> {
        let info_hash = metainfo.info_hash()?;
        let has_trackers = !trackers.is_empty();
        let torrent = Torrent::new(
            info_hash,
            metainfo,
            self.inner.conf.engine.data_dir.clone(),
            trackers,
        )?;
        let piece_count = torrent.storage.piece_count;

        {
            let mut state = self.inner.state.lock().await;
            if state.torrents.contains_key(&info_hash) {
                log::debug!(
                    "Torrent {} already added",
                    hex::encode(info_hash)
                );
                torrent.close();
                return Ok(info_hash);
            }
            log::info!(
                "Adding torrent {} ({})",
                metainfo.info.name,
                hex::encode(info_hash)
            );
            state.torrents.insert(info_hash, torrent);
            if let Some(torrent) = state.torrents.get_mut(&info_hash) {
                for index in 0..piece_count {
                    self.queue_piece_check(torrent, index);
                }
            }
        }

        if has_trackers {
            task::spawn(self.clone().announce_torrent(info_hash));
        }
        Ok(info_hash)
    }

    /// Feeds peer candidates into a swarm and dials as many as the half-open
    /// limit allows.
    pub async fn add_peers(
        &self,
        info_hash: InfoHash,
        peers: Vec<Peer>,
    ) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let torrent = state
            .torrents
            .get_mut(&info_hash)
            .ok_or(Error::UnknownTorrent)?;
        log::debug!(
            "Adding {} peer candidates to torrent {}",
            peers.len(),
            torrent.name
        );
        torrent.peers.extend(peers);
        self.open_new_conns(state);
        Ok(())
    }

    /// Blocks until every torrent has every piece, or the client is stopped.
    pub async fn wait_all(&self) {
        loop {
            let notified = self.inner.event.notified();
            {
                let state = self.inner.state.lock().await;
                if state.torrents.values().all(|t| t.have_all_pieces()) {
                    return;
                }
            }
            tokio::select! {
                _ = self.inner.quit.cancelled() => return,
                _ = notified => {}
            }
        }
    }

    /// Subscribes to the next data-ready event. See [`DataWaiter`].
    pub async fn data_waiter(&self) -> DataWaiter {
        let mut state = self.inner.state.lock().await;
        let receiver = match &state.data_waiter {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = watch::channel(());
                state.data_waiter = Some(sender);
                receiver
            }
        };
        DataWaiter(receiver)
    }

    /// Reads already verified bytes at the given offset into the torrent.
    ///
    /// Returns as many bytes as are verified and contiguous at the offset,
    /// clipped to the piece boundary: 0 at the end of the torrent, and
    /// [`Error::DataNotReady`] when the offset's piece is unverified, being
    /// verified, or the offset sits in a block that hasn't arrived. Every
    /// byte returned has been part of a piece whose hash checked out.
    pub async fn read_at(
        &self,
        info_hash: InfoHash,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let torrent = state
            .torrents
            .get_mut(&info_hash)
            .ok_or(Error::UnknownTorrent)?;
        if offset >= torrent.storage.download_len {
            // reading past the end of the data is the end of the data
            return Ok(0);
        }
        let index =
            (offset / torrent.storage.piece_len as u64) as PieceIndex;
        if !torrent.pieces[index].ever_hashed {
            // never verified; get a verdict going and report not-ready
            self.queue_piece_check(torrent, index);
            return Err(Error::DataNotReady);
        }
        if torrent.pieces[index].hashing {
            return Err(Error::DataNotReady);
        }
        let piece_off = (offset % torrent.storage.piece_len as u64) as u32;
        let len = buf
            .len()
            .min((torrent.storage.piece_len(index) - piece_off) as usize);
        let len = clip_to_ready(&torrent.pieces[index], piece_off, len)
            .ok_or(Error::DataNotReady)?;
        let n = torrent.data.read_at(&mut buf[..len], offset)?;
        Ok(n)
    }

    /// Pins a byte region as urgent: its still-missing blocks are requested
    /// before anything else, front of the region first. Duplicate pins are
    /// tolerated; entries fall out as their blocks arrive.
    pub async fn prioritize_region(
        &self,
        info_hash: InfoHash,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let max_requests = self.inner.conf.torrent.max_outstanding_requests;
        let mut state = self.inner.state.lock().await;
        let torrent = state
            .torrents
            .get_mut(&info_hash)
            .ok_or(Error::UnknownTorrent)?;

        let mut urgent = Vec::new();
        let mut cursor = offset;
        let end = offset.saturating_add(len);
        while cursor < end {
            let block = match torrent.storage.offset_request(cursor) {
                Some(block) => block,
                None => break,
            };
            cursor = torrent.storage.request_offset(block) + block.len as u64;
            // only blocks that are still missing are worth pinning
            if torrent.pieces[block.piece_index]
                .pending_chunks
                .contains(&block.chunk_spec())
            {
                urgent.push(block);
            }
        }
        if urgent.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Prioritizing {} blocks of torrent {}",
            urgent.len(),
            torrent.name
        );
        torrent.priorities.push_front(urgent[0]);
        for block in &urgent[1..] {
            torrent.priorities.push_back(*block);
        }
        for conn_index in 0..torrent.conns.len() {
            torrent.replenish_conn_requests(conn_index, max_requests);
        }
        Ok(())
    }

    /// Dials peer candidates from every swarm while the half-open budget
    /// lasts.
    fn open_new_conns(&self, state: &mut State) {
        let limit = self.inner.conf.engine.half_open_limit;
        let info_hashes: Vec<InfoHash> =
            state.torrents.keys().copied().collect();
        for info_hash in info_hashes {
            loop {
                if state.half_open >= limit {
                    return;
                }
                let peer = match state.torrents.get_mut(&info_hash) {
                    Some(torrent) => match torrent.peers.pop_front() {
                        Some(peer) => peer,
                        None => break,
                    },
                    None => break,
                };
                self.initiate_conn(state, peer, info_hash);
            }
        }
    }

    /// Starts an outbound connection attempt, charging it against the
    /// half-open budget until the dial resolves.
    fn initiate_conn(&self, state: &mut State, peer: Peer, info_hash: InfoHash) {
        if peer.id == Some(self.inner.peer_id) {
            return;
        }
        state.half_open += 1;
        let client = self.clone();
        task::spawn(async move {
            let dialed = time::timeout(
                client.inner.conf.torrent.dial_timeout,
                TcpStream::connect(peer.addr),
            )
            .await;

            // the dial resolved one way or the other: release the half-open
            // slot and let the next candidate use it
            {
                let mut state = client.inner.state.lock().await;
                debug_assert!(state.half_open > 0);
                state.half_open = state.half_open.saturating_sub(1);
                client.open_new_conns(&mut state);
            }

            let socket = match dialed {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => {
                    // refused and unreachable peers are normal churn
                    log::debug!(
                        "Failed to connect to peer {}: {}",
                        peer.addr,
                        e
                    );
                    return;
                }
                Err(_) => {
                    log::debug!("Connection to peer {} timed out", peer.addr);
                    return;
                }
            };
            log::info!("Connected to peer {}", peer.addr);
            if let Err(e) = client.run_connection(socket, Some(info_hash)).await
            {
                if !client.stopped() {
                    log::info!("Peer {} connection error: {}", peer.addr, e);
                }
            }
        });
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.quit.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, addr)) => {
                    log::debug!("Accepted connection from {}", addr);
                    let client = self.clone();
                    task::spawn(async move {
                        if let Err(e) =
                            client.run_connection(socket, None).await
                        {
                            if !client.stopped() {
                                log::info!(
                                    "Inbound peer {} error: {}",
                                    addr,
                                    e
                                );
                            }
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Listener error: {}", e);
                    return;
                }
            }
        }
    }

    /// Performs the handshake on a fresh socket, registers the connection
    /// with its torrent and runs its message loop until the peer goes away,
    /// a protocol rule is broken, or the engine stops.
    ///
    /// `expected` carries the info hash we dialed for; `None` means the
    /// connection is inbound and the peer names the torrent. In that case our
    /// handshake's second half is held back until the info hash is matched.
    async fn run_connection(
        &self,
        mut socket: TcpStream,
        expected: Option<InfoHash>,
    ) -> Result<()> {
        let addr = socket.peer_addr()?;

        if let Some(info_hash) = expected {
            socket
                .write_all(&Handshake::new(info_hash, self.inner.peer_id).encode())
                .await?;
        } else {
            socket.write_all(&Handshake::prefix()).await?;
        }

        let mut buf = [0u8; Handshake::LEN];
        tokio::select! {
            _ = self.inner.quit.cancelled() => return Ok(()),
            res = socket.read_exact(&mut buf[..Handshake::PREFIX_LEN]) => match res {
                // a peer hanging up before the handshake is a clean end
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                res => {
                    res?;
                }
            },
        }
        tokio::select! {
            _ = self.inner.quit.cancelled() => return Ok(()),
            res = socket.read_exact(&mut buf[Handshake::PREFIX_LEN..]) => {
                res?;
            }
        }
        let handshake = Handshake::decode(&buf)?;

        if handshake.peer_id == self.inner.peer_id {
            return Err(Error::SelfConnection);
        }

        let info_hash = match expected {
            Some(info_hash) => {
                if handshake.info_hash != info_hash {
                    return Err(Error::WrongInfoHash);
                }
                info_hash
            }
            None => {
                let info_hash = handshake.info_hash;
                {
                    let state = self.inner.state.lock().await;
                    if !state.torrents.contains_key(&info_hash) {
                        return Err(Error::UnknownInfoHash);
                    }
                }
                // the torrent is known; complete our half of the handshake
                socket.write_all(&info_hash).await?;
                socket.write_all(&self.inner.peer_id).await?;
                info_hash
            }
        };

        // handshake done; switch to the message codec and start the
        // connection's writer pipeline
        let framed = Framed::new(
            socket,
            PeerCodec::new(self.inner.conf.torrent.max_frame_len),
        );
        let (sink, stream) = framed.split();
        let post = spawn_conn_writer(
            sink,
            self.inner.conf.torrent.keepalive_interval,
        );

        let conn_id = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let conn_id = state.next_conn_id;
            state.next_conn_id += 1;
            let torrent = match state.torrents.get_mut(&info_hash) {
                Some(torrent) => torrent,
                None => return Err(Error::UnknownInfoHash),
            };
            if torrent
                .conns
                .iter()
                .any(|conn| conn.peer_id == handshake.peer_id)
            {
                log::info!(
                    "Peer {} presented an already connected id {}, dropping",
                    addr,
                    hex::encode(handshake.peer_id)
                );
                return Ok(());
            }
            let conn = Connection::new(
                conn_id,
                addr,
                handshake.peer_id,
                handshake.reserved,
                post,
            );
            log::debug!(
                "Peer {} id {} extensions {}",
                addr,
                hex::encode(conn.peer_id),
                hex::encode(conn.peer_extensions)
            );
            // let the peer know what we already have
            if torrent.have_any_pieces() {
                conn.post(Message::Bitfield(torrent.bitfield()));
            }
            torrent.conns.push(conn);
            log::info!(
                "Peer {} joined torrent {} ({} connections)",
                addr,
                torrent.name,
                torrent.conns.len()
            );
            conn_id
        };

        let res = self.connection_loop(info_hash, conn_id, stream).await;

        // deregister on the way out, whatever happened; dropping the record
        // also drops the post queue, which winds down the writer tasks
        {
            let mut state = self.inner.state.lock().await;
            if let Some(torrent) = state.torrents.get_mut(&info_hash) {
                if let Some(index) = torrent.conn_index(conn_id) {
                    let conn = &torrent.conns[index];
                    log::debug!(
                        "Peer {} closing (interested: {}, peer interested: \
                         {}, outstanding requests: {})",
                        addr,
                        conn.interested,
                        conn.peer_interested,
                        conn.requests.len()
                    );
                    torrent.conns.remove(index);
                }
                log::info!(
                    "Peer {} left torrent {} ({} connections)",
                    addr,
                    torrent.name,
                    torrent.conns.len()
                );
            }
        }
        res
    }

    /// Reads messages off the socket and dispatches each under the lock.
    /// Dispatch for one connection is strictly sequential: decode, lock,
    /// process, unlock, decode the next.
    async fn connection_loop(
        &self,
        info_hash: InfoHash,
        conn_id: ConnId,
        mut stream: SplitStream<Framed<TcpStream, PeerCodec>>,
    ) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = self.inner.quit.cancelled() => return Ok(()),
                msg = stream.next() => match msg {
                    // the peer closed the connection cleanly
                    None => return Ok(()),
                    Some(Err(e)) => {
                        if self.stopped() {
                            return Ok(());
                        }
                        return Err(e);
                    }
                    Some(Ok(msg)) => msg,
                },
            };
            let mut state = self.inner.state.lock().await;
            self.handle_message(&mut state, info_hash, conn_id, msg)?;
        }
    }

    /// Processes one message from a peer. Returning an error drops the
    /// connection.
    fn handle_message(
        &self,
        state: &mut State,
        info_hash: InfoHash,
        conn_id: ConnId,
        msg: Message,
    ) -> Result<()> {
        let max_requests = self.inner.conf.torrent.max_outstanding_requests;
        let mut data_ready = false;
        {
            let torrent = match state.torrents.get_mut(&info_hash) {
                Some(torrent) => torrent,
                // the torrent went away under us; the quit signal will end
                // the loop shortly
                None => return Ok(()),
            };
            let ci = match torrent.conn_index(conn_id) {
                Some(ci) => ci,
                None => return Ok(()),
            };
            log::trace!(
                "Peer {} sent {:?}",
                torrent.conns[ci].addr,
                msg.id()
            );
            match msg {
                Message::KeepAlive => return Ok(()),
                Message::Choke => {
                    let conn = &mut torrent.conns[ci];
                    conn.peer_choked = true;
                    // nothing to refund: cleared requests become pending
                    // again from the scheduler's point of view
                    conn.requests.clear();
                }
                Message::Unchoke => {
                    torrent.conns[ci].peer_choked = false;
                }
                Message::Interested => {
                    let conn = &mut torrent.conns[ci];
                    conn.peer_interested = true;
                    // trivial choking policy: whoever asks may download
                    conn.unchoke();
                }
                Message::NotInterested => {
                    torrent.conns[ci].peer_interested = false;
                }
                Message::Have { piece_index } => {
                    if piece_index >= torrent.storage.piece_count {
                        return Err(Error::InvalidPieceIndex(piece_index));
                    }
                    if torrent.pieces[piece_index].is_complete() {
                        log::debug!(
                            "Peer {} has piece {} which we already have",
                            torrent.conns[ci].addr,
                            piece_index
                        );
                    }
                    torrent.peer_got_piece(ci, piece_index);
                }
                Message::Bitfield(mut pieces) => {
                    if torrent.conns[ci].peer_pieces.is_some() {
                        return Err(Error::UnexpectedBitfield);
                    }
                    if pieces.len() < torrent.storage.piece_count {
                        return Err(Error::InvalidBitfield);
                    }
                    // the wire pads the bitfield to a byte boundary; drop
                    // the padding bits
                    pieces.resize(torrent.storage.piece_count, false);
                    torrent.conns[ci].peer_pieces = Some(pieces);
                }
                Message::Request(block) => {
                    if !valid_wire_block(torrent, block) {
                        return Err(Error::BadRequest);
                    }
                    torrent.conns[ci].peer_requests.insert(block);
                    // Serving reads the data adaptor while holding the
                    // client lock, stalling everything else for the
                    // duration. Known bottleneck, kept so served bytes are
                    // consistent with in-flight writes.
                    let mut data = vec![0; block.len as usize];
                    let n = torrent
                        .data
                        .read_at(&mut data, torrent.storage.request_offset(block))?;
                    if n != block.len as usize {
                        return Err(Error::BadRequest);
                    }
                    torrent.conns[ci].post(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    });
                }
                Message::Block {
                    piece_index,
                    offset,
                    data,
                } => {
                    if piece_index >= torrent.storage.piece_count {
                        return Err(Error::InvalidPieceIndex(piece_index));
                    }
                    let block = BlockInfo {
                        piece_index,
                        offset,
                        len: data.len() as u32,
                    };
                    if !torrent.conns[ci].requests.remove(&block) {
                        return Err(Error::UnexpectedPiece(block));
                    }
                    data_ready =
                        self.downloaded_chunk(torrent, block, &data)?;
                }
                Message::Cancel(block) => {
                    torrent.conns[ci].peer_requests.remove(&block);
                }
                Message::Extended { id, .. } => {
                    log::debug!(
                        "Peer {} sent extension message {}, ignoring",
                        torrent.conns[ci].addr,
                        id
                    );
                }
            }
            // whatever changed, see if this connection can take more work
            torrent.replenish_conn_requests(ci, max_requests);
        }
        if data_ready {
            Self::fire_data_ready(state);
        }
        Ok(())
    }

    /// Lands a block that answered one of our requests.
    ///
    /// Returns whether new data became available. Blocks we no longer need
    /// (a benign race with another peer's delivery) are logged and dropped.
    fn downloaded_chunk(
        &self,
        torrent: &mut Torrent,
        block: BlockInfo,
        data: &[u8],
    ) -> Result<bool> {
        let chunk = block.chunk_spec();
        if !torrent.pieces[block.piece_index]
            .pending_chunks
            .contains(&chunk)
        {
            log::debug!(
                "Torrent {} got unnecessary block {:?}",
                torrent.name,
                block
            );
            return Ok(false);
        }
        if torrent.pieces[block.piece_index].hashing {
            // A verifier is digesting this piece (a startup check can run
            // with blocks still pending). Nothing may be written under it;
            // the block stays pending and is re-requested after the verdict.
            log::debug!(
                "Torrent {} dropping block {:?} for piece being verified",
                torrent.name,
                block
            );
            return Ok(false);
        }
        // a storage failure here is fatal for the connection but not the
        // swarm
        torrent.write_chunk(block, data)?;
        torrent.pieces[block.piece_index].pending_chunks.remove(&chunk);
        if torrent.pieces[block.piece_index].pending_chunks.is_empty() {
            self.queue_piece_check(torrent, block.piece_index);
        }
        // lazily drop any matching priority pins
        torrent.priorities.retain(|prioritized| *prioritized != block);
        Ok(true)
    }

    /// Ensures a verifier is on its way for the piece. Idempotent while one
    /// is queued.
    fn queue_piece_check(&self, torrent: &mut Torrent, index: PieceIndex) {
        let piece = &mut torrent.pieces[index];
        if piece.queued_for_hash {
            return;
        }
        piece.queued_for_hash = true;
        log::trace!(
            "Queueing piece {} of torrent {} for verification",
            index,
            torrent.name
        );
        task::spawn(self.clone().verify_piece(torrent.info_hash, index));
    }

    /// Verifies one piece: waits out any verifier already digesting it,
    /// claims the hashing flag, digests the piece off the lock, and applies
    /// the verdict.
    async fn verify_piece(self, info_hash: InfoHash, index: PieceIndex) {
        // at most one verifier may be digesting a given piece at a time
        loop {
            let notified = self.inner.event.notified();
            {
                let mut state = self.inner.state.lock().await;
                let torrent = match state.torrents.get_mut(&info_hash) {
                    Some(torrent) => torrent,
                    None => return,
                };
                let piece = &mut torrent.pieces[index];
                if !piece.hashing {
                    piece.hashing = true;
                    piece.queued_for_hash = false;
                    break;
                }
            }
            notified.await;
        }

        let (data, gate, expected) = {
            let state = self.inner.state.lock().await;
            let torrent = match state.torrents.get(&info_hash) {
                Some(torrent) => torrent,
                None => return,
            };
            (
                Arc::clone(&torrent.data),
                torrent.pieces[index].write_gate(),
                torrent.pieces[index].hash,
            )
        };

        // Digest without the lock; pieces can be megabytes. Writes keep
        // landing meanwhile, but only into pending chunks, and this piece
        // has none while it hashes.
        let sum = task::spawn_blocking(move || {
            // let any in-flight write for this piece land first
            gate.wait_idle();
            data.hash_piece(index)
        })
        .await
        .expect("piece verifier task panicked");
        // the data adaptor owns these files; failing to read back bytes we
        // wrote is a bug, not a runtime condition
        let sum = sum.expect("piece hash IO failure");

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        match state.torrents.get_mut(&info_hash) {
            Some(torrent) => torrent.pieces[index].hashing = false,
            None => return,
        }
        self.piece_hashed(state, info_hash, index, sum == expected);
    }

    /// Applies a verification verdict: completion fan-out on success,
    /// re-pending and re-requesting on failure. Always wakes the condition
    /// so queued verifiers and `wait_all` re-check.
    fn piece_hashed(
        &self,
        state: &mut State,
        info_hash: InfoHash,
        index: PieceIndex,
        correct: bool,
    ) {
        let max_requests = self.inner.conf.torrent.max_outstanding_requests;
        if let Some(torrent) = state.torrents.get_mut(&info_hash) {
            torrent.pieces[index].ever_hashed = true;
            if correct {
                torrent.pieces[index].pending_chunks.clear();
                torrent
                    .priorities
                    .retain(|block| block.piece_index != index);
                log::info!(
                    "Torrent {} got piece {} ({}/{})",
                    torrent.name,
                    index,
                    torrent.num_complete_pieces(),
                    torrent.storage.piece_count
                );
                torrent.broadcast(Message::Have { piece_index: index });
            } else {
                log::warn!(
                    "Torrent {} piece {} failed verification (expected {})",
                    torrent.name,
                    index,
                    hex::encode(torrent.pieces[index].hash)
                );
                if torrent.pieces[index].pending_chunks.is_empty() {
                    // a full piece came out wrong: all of it is suspect, so
                    // everything goes back on the plate
                    torrent.pend_all_chunk_specs(index);
                }
                for conn_index in 0..torrent.conns.len() {
                    if torrent.conns[conn_index].peer_has_piece(index) {
                        torrent
                            .replenish_conn_requests(conn_index, max_requests);
                    }
                }
            }
        }
        if correct {
            // a whole piece became readable
            Self::fire_data_ready(state);
        }
        self.inner.event.notify_waiters();
    }

    /// Fires and disarms the global data-ready waiter, if armed.
    fn fire_data_ready(state: &mut State) {
        if let Some(waiter) = state.data_waiter.take() {
            let _ = waiter.send(());
        }
    }

    /// Announces a torrent to its tracker tiers for as long as both live.
    async fn announce_torrent(self, info_hash: InfoHash) {
        let req = AnnounceRequest {
            info_hash,
            peer_id: self.inner.peer_id,
            port: self
                .inner
                .listen_addr
                .map(|addr| addr.port())
                .unwrap_or(0),
        };
        'announce: loop {
            if self.stopped() {
                return;
            }
            let tiers: Vec<Vec<Arc<dyn PeerSource>>> = {
                let state = self.inner.state.lock().await;
                match state.torrents.get(&info_hash) {
                    Some(torrent) => torrent.trackers.clone(),
                    None => return,
                }
            };
            for (tier_index, tier) in tiers.iter().enumerate() {
                for (tracker_index, tracker) in tier.iter().enumerate() {
                    let resp = match tracker.announce(&req).await {
                        Ok(resp) => resp,
                        Err(e) => {
                            log::debug!(
                                "Announce for {} failed: {}",
                                hex::encode(info_hash),
                                e
                            );
                            continue;
                        }
                    };
                    // remember the responsive tracker at the head of its
                    // tier for the next round
                    {
                        let mut state = self.inner.state.lock().await;
                        if let Some(torrent) =
                            state.torrents.get_mut(&info_hash)
                        {
                            let tier = &mut torrent.trackers[tier_index];
                            if tracker_index < tier.len() {
                                tier.swap(0, tracker_index);
                            }
                        }
                    }
                    log::debug!(
                        "Tracker sent {} peers for {}",
                        resp.peers.len(),
                        hex::encode(info_hash)
                    );
                    if self.add_peers(info_hash, resp.peers).await.is_err() {
                        return;
                    }
                    tokio::select! {
                        _ = self.inner.quit.cancelled() => return,
                        _ = time::sleep(resp.interval) => {}
                    }
                    continue 'announce;
                }
            }
            // every tracker in every tier failed; retry shortly
            tokio::select! {
                _ = self.inner.quit.cancelled() => return,
                _ = time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

/// Is this block description consistent with the torrent's geometry?
fn valid_wire_block(torrent: &Torrent, block: BlockInfo) -> bool {
    block.piece_index < torrent.storage.piece_count
        && block.len > 0
        && block
            .offset
            .checked_add(block.len)
            .map_or(false, |end| {
                end <= torrent.storage.piece_len(block.piece_index)
            })
}

/// Clips a read of `len` bytes starting at `piece_off` so it ends before the
/// first pending chunk after it. Returns `None` when the read begins inside a
/// pending chunk.
fn clip_to_ready(
    piece: &Piece,
    piece_off: u32,
    mut len: usize,
) -> Option<usize> {
    for chunk in &piece.pending_chunks {
        let chunk_off = piece_off as i64 - chunk.offset as i64;
        if 0 <= chunk_off && chunk_off < chunk.len as i64 {
            // the read begins in a hole
            return None;
        }
        if chunk_off < 0 {
            // a pending chunk ahead caps the available data
            len = len.min((-chunk_off) as usize);
        }
    }
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chunk_specs, ChunkSpec, BLOCK_LEN};

    fn piece_with_pending(pending: &[ChunkSpec]) -> Piece {
        let mut piece = Piece::new([0; 20]);
        piece.ever_hashed = true;
        piece.pending_chunks = pending.iter().copied().collect();
        piece
    }

    #[test]
    fn test_clip_to_ready_full_piece() {
        // no pending chunks: the read is untouched
        let piece = piece_with_pending(&[]);
        assert_eq!(clip_to_ready(&piece, 0, 1000), Some(1000));
        assert_eq!(clip_to_ready(&piece, BLOCK_LEN, 1000), Some(1000));
    }

    #[test]
    fn test_clip_to_ready_inside_hole() {
        let pending = ChunkSpec {
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let piece = piece_with_pending(&[pending]);
        // reads beginning anywhere inside the pending chunk are not ready
        assert_eq!(clip_to_ready(&piece, BLOCK_LEN, 10), None);
        assert_eq!(clip_to_ready(&piece, BLOCK_LEN + 100, 10), None);
        assert_eq!(clip_to_ready(&piece, 2 * BLOCK_LEN - 1, 10), None);
    }

    #[test]
    fn test_clip_to_ready_caps_before_hole() {
        let pending = ChunkSpec {
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let piece = piece_with_pending(&[pending]);
        // a read before the hole is clipped to it
        assert_eq!(
            clip_to_ready(&piece, 0, 3 * BLOCK_LEN as usize),
            Some(BLOCK_LEN as usize)
        );
        // a read after the hole is unaffected
        assert_eq!(
            clip_to_ready(&piece, 2 * BLOCK_LEN, 500),
            Some(500)
        );
    }

    #[test]
    fn test_clip_to_ready_fresh_piece_is_all_holes() {
        let pending: Vec<_> = chunk_specs(2 * BLOCK_LEN).collect();
        let piece = piece_with_pending(&pending);
        assert_eq!(clip_to_ready(&piece, 0, 10), None);
        assert_eq!(clip_to_ready(&piece, BLOCK_LEN + 7, 10), None);
    }
}
