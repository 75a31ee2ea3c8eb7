//! The per-swarm state: piece store, peer candidates, live connections, the
//! priority queue, and the request scheduler that feeds connections from all
//! of these.

use std::{
    collections::{HashMap, VecDeque},
    io,
    path::PathBuf,
    sync::Arc,
};

use rand::seq::SliceRandom;

use crate::{
    chunk_specs,
    disk::TorrentData,
    error::*,
    metainfo::Metainfo,
    peer::{codec::Message, ConnId, Connection},
    piece::Piece,
    storage_info::StorageInfo,
    tracker::PeerSource,
    BlockInfo, Bitfield, InfoHash, Peer, PieceIndex,
};

pub(crate) struct Torrent {
    pub info_hash: InfoHash,
    /// The torrent's display name, from the metainfo.
    pub name: String,
    pub storage: StorageInfo,
    /// One record per piece, tracking block pendingness and hash status.
    pub pieces: Vec<Piece>,
    pub data: Arc<TorrentData>,
    /// The established connections. Distinct from `peers`: candidates are
    /// cheap, connections are expensive, and the half-open limiter sits
    /// between the two.
    pub conns: Vec<Connection>,
    /// Peer candidates handed to us by discovery, not yet dialed.
    pub peers: VecDeque<Peer>,
    /// User-pinned urgent blocks, front to back. May contain duplicates;
    /// entries are lazily removed when their block arrives or their piece
    /// completes.
    pub priorities: VecDeque<BlockInfo>,
    /// BEP 12 tracker tiers. Each tier is shuffled once at creation; the
    /// announce driver rotates a successful tracker to its tier's head.
    pub trackers: Vec<Vec<Arc<dyn PeerSource>>>,
}

impl Torrent {
    /// Prepares a torrent: opens (or creates) its files and pends every block
    /// of every piece. Verification against whatever data was already on disk
    /// is queued separately by the client.
    pub fn new(
        info_hash: InfoHash,
        metainfo: &Metainfo,
        data_dir: PathBuf,
        mut trackers: Vec<Vec<Arc<dyn PeerSource>>>,
    ) -> Result<Self> {
        if metainfo.piece_count() == 0 {
            return Err(Error::InvalidMetainfo("no pieces"));
        }
        if metainfo.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo("bad piece hash length"));
        }
        if metainfo.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("zero piece length"));
        }
        let total_len = metainfo.total_len();
        let piece_len = metainfo.info.piece_length as u64;
        let piece_count = metainfo.piece_count() as u64;
        if total_len <= piece_len * (piece_count - 1)
            || total_len > piece_len * piece_count
        {
            return Err(Error::InvalidMetainfo(
                "length does not match piece count",
            ));
        }

        let storage = StorageInfo::new(metainfo, data_dir);
        let data = Arc::new(TorrentData::open(storage.clone())?);

        // the trackers within each tier must be shuffled before use, per
        // http://www.bittorrent.org/beps/bep_0012.html#order-of-processing
        let mut rng = rand::thread_rng();
        for tier in trackers.iter_mut() {
            tier.shuffle(&mut rng);
        }

        let mut torrent = Self {
            info_hash,
            name: metainfo.info.name.clone(),
            pieces: (0..metainfo.piece_count())
                .map(|index| Piece::new(metainfo.piece_hash(index)))
                .collect(),
            storage,
            data,
            conns: Vec::new(),
            peers: VecDeque::new(),
            priorities: VecDeque::new(),
            trackers,
        };
        for index in 0..torrent.pieces.len() {
            torrent.pend_all_chunk_specs(index);
        }
        Ok(torrent)
    }

    /// Re-pends every block of the piece, putting it back on the scheduler's
    /// plate. Used at creation and after a failed hash attempt.
    pub fn pend_all_chunk_specs(&mut self, index: PieceIndex) {
        let piece_len = self.storage.piece_len(index);
        self.pieces[index].pending_chunks = chunk_specs(piece_len).collect();
    }

    /// The number of bytes of the piece still missing since its last hash
    /// attempt.
    pub fn piece_num_pending_bytes(&self, index: PieceIndex) -> u32 {
        self.pieces[index]
            .pending_chunks
            .iter()
            .map(|chunk| chunk.len)
            .sum()
    }

    /// Piece indices ordered by descending pending byte count.
    fn pieces_by_pending_bytes_desc(&self) -> Vec<PieceIndex> {
        let mut indices: Vec<PieceIndex> = (0..self.pieces.len()).collect();
        indices.sort_by_key(|index| {
            std::cmp::Reverse(self.piece_num_pending_bytes(*index))
        });
        indices
    }

    /// Counts, for every outstanding request in the swarm, how many
    /// connections currently hold it. The scheduler uses this to avoid
    /// asking two peers for the same block.
    fn request_heat(&self) -> HashMap<BlockInfo, usize> {
        let mut heat = HashMap::new();
        for conn in &self.conns {
            for block in &conn.requests {
                *heat.entry(*block).or_insert(0) += 1;
            }
        }
        heat
    }

    /// Do we still need this piece? True once it has been through at least
    /// one (failed) verification and has blocks missing.
    pub fn want_piece(&self, index: PieceIndex) -> bool {
        let piece = &self.pieces[index];
        piece.ever_hashed && !piece.pending_chunks.is_empty()
    }

    pub fn have_all_pieces(&self) -> bool {
        self.pieces.iter().all(|piece| piece.is_complete())
    }

    pub fn have_any_pieces(&self) -> bool {
        self.pieces.iter().any(|piece| piece.is_complete())
    }

    pub fn num_complete_pieces(&self) -> usize {
        self.pieces.iter().filter(|piece| piece.is_complete()).count()
    }

    /// The number of bytes left to download and verify.
    pub fn bytes_left(&self) -> u64 {
        (0..self.pieces.len())
            .map(|index| {
                if self.pieces[index].is_complete() {
                    0
                } else {
                    // count never-downloaded bytes as pending too: a fresh
                    // piece that hasn't failed a hash yet is all pending
                    self.piece_num_pending_bytes(index) as u64
                }
            })
            .sum()
    }

    /// Our own piece availability, bit per piece.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.pieces.len());
        for (index, piece) in self.pieces.iter().enumerate() {
            if piece.is_complete() {
                bitfield.set(index, true);
            }
        }
        bitfield
    }

    /// Writes a received block through the data adaptor, holding the piece's
    /// write gate so a verifier can't start digesting half-written bytes.
    pub fn write_chunk(&self, block: BlockInfo, data: &[u8]) -> io::Result<()> {
        let _gate = self.pieces[block.piece_index].begin_write();
        self.data
            .write_at(data, self.storage.request_offset(block))?;
        Ok(())
    }

    pub fn conn_index(&self, id: ConnId) -> Option<usize> {
        self.conns.iter().position(|conn| conn.id == id)
    }

    /// Marks the peer as having a piece, allocating its availability vector
    /// on first use.
    pub fn peer_got_piece(&mut self, conn_index: usize, piece: PieceIndex) {
        let piece_count = self.storage.piece_count;
        let conn = &mut self.conns[conn_index];
        let pieces = conn
            .peer_pieces
            .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
        pieces.set(piece, true);
    }

    /// Tops up the connection's request pipeline.
    ///
    /// Stateless by design: candidates are recomputed from current piece and
    /// priority state on every call, so there is no per-connection plan to go
    /// stale under have/bitfield churn. Urgent blocks come first, then the
    /// pending blocks of pieces in order of most bytes remaining.
    pub fn replenish_conn_requests(
        &mut self,
        conn_index: usize,
        max_requests: usize,
    ) {
        let heat = self.request_heat();
        let order = self.pieces_by_pending_bytes_desc();
        let Self {
            pieces,
            conns,
            priorities,
            ..
        } = self;
        let conn = &mut conns[conn_index];
        let mut found_wanted = false;
        let mut saturated = false;

        // first request prioritized chunks
        for block in priorities.iter().copied() {
            if !try_add_request(
                pieces,
                &heat,
                conn,
                block,
                max_requests,
                &mut found_wanted,
            ) {
                saturated = true;
                break;
            }
        }

        // then fill up from pieces by bytes remaining
        if !saturated {
            'pieces: for index in order {
                let chunks: Vec<_> =
                    pieces[index].pending_chunks.iter().copied().collect();
                for chunk in chunks {
                    let block = BlockInfo::from_spec(index, chunk);
                    if !try_add_request(
                        pieces,
                        &heat,
                        conn,
                        block,
                        max_requests,
                        &mut found_wanted,
                    ) {
                        break 'pieces;
                    }
                }
            }
        }

        // nothing outstanding and nothing wanted from this peer
        if conn.requests.is_empty() && !found_wanted {
            conn.set_interested(false);
        }
    }

    /// Broadcasts a message to every connection's outgoing queue.
    pub fn broadcast(&self, msg: Message) {
        for conn in &self.conns {
            conn.post(msg.clone());
        }
    }

    /// Flushes the torrent's data to disk. Connections are torn down by their
    /// own tasks when the client shuts down.
    pub fn close(&self) {
        if let Err(e) = self.data.close() {
            log::warn!("Failed to sync torrent {} data: {}", self.name, e);
        }
    }
}

/// Offers one candidate block to the connection, applying the swarm-level
/// eligibility rules the connection itself can't see. Returns false when the
/// connection can take no more requests right now.
fn try_add_request(
    pieces: &[Piece],
    heat: &HashMap<BlockInfo, usize>,
    conn: &mut Connection,
    block: BlockInfo,
    max_requests: usize,
    found_wanted: &mut bool,
) -> bool {
    let piece = &pieces[block.piece_index];
    if piece.hashing {
        // the hash attempt may succeed, so we can't be sure we want this
        return true;
    }
    if piece.is_complete() {
        return true;
    }
    if heat.get(&block).copied().unwrap_or(0) > 0 {
        // someone is already asked for this block
        return true;
    }
    if conn.peer_has_piece(block.piece_index) {
        *found_wanted = true;
    }
    conn.request(block, max_requests)
}
