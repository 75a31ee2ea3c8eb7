//! The per-piece download and verification state.

use std::{
    collections::HashSet,
    sync::{Arc, Condvar, Mutex},
};

use crate::{ChunkSpec, Sha1Hash};

/// The state of a single piece: which of its blocks are still missing and
/// where it is in its verification lifecycle.
///
/// A piece is considered complete once a hash attempt has succeeded, at which
/// point its pending set is empty. A failed attempt re-pends every block so
/// the scheduler requests them again.
pub(crate) struct Piece {
    /// The completed piece's expected SHA-1 hash, from the metainfo "pieces"
    /// field.
    pub hash: Sha1Hash,
    /// Blocks not received since the last hash attempt. Absence from the set
    /// means the block's bytes have been written to disk.
    pub pending_chunks: HashSet<ChunkSpec>,
    /// Whether any hash attempt has completed for this piece. Together with
    /// an empty pending set this means the piece is complete.
    pub ever_hashed: bool,
    /// A verifier task is currently digesting this piece.
    pub hashing: bool,
    /// A verifier task has been spawned but has not started digesting yet.
    pub queued_for_hash: bool,
    /// Lets in-flight disk writes signal verifiers without touching the
    /// client-wide lock.
    write_gate: Arc<WriteGate>,
}

impl Piece {
    pub fn new(hash: Sha1Hash) -> Self {
        Self {
            hash,
            pending_chunks: HashSet::new(),
            ever_hashed: false,
            hashing: false,
            queued_for_hash: false,
            write_gate: Arc::new(WriteGate::default()),
        }
    }

    /// A piece is complete when its last verification succeeded and nothing
    /// has been re-pended since.
    pub fn is_complete(&self) -> bool {
        self.ever_hashed && self.pending_chunks.is_empty()
    }

    /// Registers a disk write in flight for this piece. Verifiers wait for
    /// the returned guard (and all its siblings) to drop before digesting.
    pub fn begin_write(&self) -> WriteGuard {
        self.write_gate.increment();
        WriteGuard(Arc::clone(&self.write_gate))
    }

    /// The gate a verifier waits on before digesting the piece's bytes.
    pub fn write_gate(&self) -> Arc<WriteGate> {
        Arc::clone(&self.write_gate)
    }
}

/// Counts the piece's in-flight disk writes behind a piece-local lock.
#[derive(Default)]
pub(crate) struct WriteGate {
    count: Mutex<usize>,
    idle: Condvar,
}

impl WriteGate {
    fn increment(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Blocks until no write is in flight. Called from the blocking pool,
    /// never from the executor.
    pub fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.idle.wait(count).unwrap();
        }
    }
}

pub(crate) struct WriteGuard(Arc<WriteGate>);

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_specs;

    #[test]
    fn test_completion_requires_a_successful_hash() {
        let mut piece = Piece::new([0; 20]);
        // a fresh piece with no pending blocks is still not complete
        assert!(!piece.is_complete());

        piece.pending_chunks = chunk_specs(2 * crate::BLOCK_LEN).collect();
        piece.ever_hashed = true;
        assert!(!piece.is_complete());

        piece.pending_chunks.clear();
        assert!(piece.is_complete());
    }

    #[test]
    fn test_write_gate_waits_for_guards() {
        let piece = Piece::new([0; 20]);
        let gate = piece.write_gate();

        let guard = piece.begin_write();
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_idle())
        };
        // the waiter can only finish once the guard is gone
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.join().unwrap();
        // and with no writes in flight it returns immediately
        gate.wait_idle();
    }
}
