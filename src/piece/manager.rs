//! Owns the piece-have vector, the in-progress assembly table, and the
//! piece-fingerprint table. A single exclusive lock (held by the caller,
//! typically a `tokio::sync::Mutex<PieceManager>`) protects all mutation;
//! queries are served from a cloned `Bitfield` snapshot so readers never
//! block on a write in progress.
use super::block::{block_count, blocks_for_piece, Block, BLOCK_SIZE};
use super::selection::SelectionStrategy;
use super::{PieceError, PieceResult};
use crate::peer::Bitfield;
use crate::store::FileStore;
use crate::torrent::{info_hash, Fingerprint};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

#[derive(Debug)]
struct InProgressPiece {
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
}

impl InProgressPiece {
    fn new(piece_size: u32) -> Self {
        Self {
            buffer: vec![0u8; piece_size as usize],
            received: vec![false; block_count(piece_size)],
            received_count: 0,
        }
    }
}

#[derive(Debug)]
pub struct PieceManager {
    piece_length: u32,
    total_length: u64,
    fingerprints: Vec<Fingerprint>,
    have: Bitfield,
    in_progress: HashMap<usize, InProgressPiece>,
    downloaded_count: usize,
}

impl PieceManager {
    pub fn new(piece_length: u32, total_length: u64, fingerprints: Vec<Fingerprint>) -> Self {
        let num_pieces = fingerprints.len();
        Self {
            piece_length,
            total_length,
            fingerprints,
            have: Bitfield::new(num_pieces),
            in_progress: HashMap::new(),
            downloaded_count: 0,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.fingerprints.len()
    }

    /// Nominal size of piece `index`: `piece_length` except the last piece,
    /// which is `total_length mod piece_length` (or full when that
    /// remainder is zero).
    pub fn piece_size(&self, index: usize) -> u32 {
        if self.num_pieces() == 0 {
            return 0;
        }
        if index + 1 != self.num_pieces() {
            return self.piece_length;
        }
        let full_pieces = (self.num_pieces() - 1) as u64 * self.piece_length as u64;
        let remainder = self.total_length - full_pieces;
        if remainder == 0 {
            self.piece_length
        } else {
            remainder as u32
        }
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn have_snapshot(&self) -> Bitfield {
        self.have.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    pub fn downloaded_count(&self) -> usize {
        self.downloaded_count
    }

    pub fn missing_count(&self) -> usize {
        self.num_pieces() - self.downloaded_count
    }

    pub fn blocks_for_piece(&self, index: usize) -> PieceResult<Vec<Block>> {
        if index >= self.num_pieces() {
            return Err(PieceError::IndexOutOfRange(index));
        }
        Ok(blocks_for_piece(self.piece_size(index)))
    }

    /// If we already have piece `index`, this is a no-op that returns `Ok`
    /// so peers re-delivering a block we no longer need don't get an error.
    #[instrument(skip(self, bytes), level = "trace")]
    pub fn add_block(&mut self, index: usize, offset: u32, bytes: &[u8]) -> PieceResult<()> {
        if index >= self.num_pieces() {
            return Err(PieceError::IndexOutOfRange(index));
        }
        if self.have.has(index) {
            return Ok(());
        }
        let piece_size = self.piece_size(index);
        if offset % BLOCK_SIZE != 0 {
            return Err(PieceError::UnalignedOffset { offset, block_size: BLOCK_SIZE });
        }
        if offset + bytes.len() as u32 > piece_size {
            return Err(PieceError::BlockOutOfRange { offset, len: bytes.len(), piece_size });
        }
        let block_index = (offset / BLOCK_SIZE) as usize;
        let entry = self
            .in_progress
            .entry(index)
            .or_insert_with(|| InProgressPiece::new(piece_size));
        if block_index >= entry.received.len() {
            return Err(PieceError::BlockOutOfRange { offset, len: bytes.len(), piece_size });
        }
        let start = offset as usize;
        entry.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        // Duplicate blocks are idempotent: only the first delivery counts.
        if !entry.received[block_index] {
            entry.received[block_index] = true;
            entry.received_count += 1;
        }
        Ok(())
    }

    pub fn is_piece_ready_to_verify(&self, index: usize) -> bool {
        self.in_progress
            .get(&index)
            .is_some_and(|p| p.received_count == p.received.len())
    }

    /// Preconditions: the piece is in-progress and all blocks received.
    /// Verifies the fingerprint, writes through the file store on match,
    /// and records the piece as held; on mismatch the in-progress entry is
    /// discarded so a future `addBlock` starts the piece fresh.
    #[instrument(skip(self, store), level = "debug")]
    pub async fn complete_piece<S: FileStore>(&mut self, index: usize, store: &S) -> PieceResult<()> {
        let entry = self
            .in_progress
            .get(&index)
            .ok_or(PieceError::IncompletePiece(index))?;
        if entry.received_count != entry.received.len() {
            return Err(PieceError::IncompletePiece(index));
        }

        let digest = info_hash::hash_bytes(&entry.buffer);
        if digest != self.fingerprints[index] {
            self.in_progress.remove(&index);
            warn!(index, "piece failed fingerprint verification");
            return Err(PieceError::FingerprintMismatch(index));
        }

        let buffer = self.in_progress.remove(&index).unwrap().buffer;
        store.write_piece(index, buffer).await?;
        self.have.set(index);
        self.downloaded_count += 1;
        debug!(index, "piece verified and committed");
        Ok(())
    }

    /// Drops an in-progress piece, e.g. after repeated fingerprint failures
    /// or when the coordinator reassigns it away from a misbehaving peer.
    pub fn discard_in_progress(&mut self, index: usize) {
        self.in_progress.remove(&index);
    }

    pub fn select_piece_for_peer<R: Rng + ?Sized>(
        &self,
        strategy: SelectionStrategy,
        peer_have: &Bitfield,
        excluded: &HashSet<usize>,
        rarity: &[usize],
        rng: &mut R,
    ) -> Option<usize> {
        strategy.select(peer_have, &self.have, excluded, rarity, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::Mutex;

    struct MemoryStore {
        written: Mutex<HashMap<usize, Vec<u8>>>,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self { written: Mutex::new(HashMap::new()) }
        }
    }

    impl FileStore for MemoryStore {
        async fn write_piece(&self, index: usize, bytes: Vec<u8>) -> Result<(), StoreError> {
            self.written.lock().unwrap().insert(index, bytes);
            Ok(())
        }

        async fn read_piece(&self, index: usize) -> Result<Vec<u8>, StoreError> {
            self.written
                .lock()
                .unwrap()
                .get(&index)
                .cloned()
                .ok_or(StoreError::PieceNotWritten(index))
        }
    }

    fn fingerprint_of(data: &[u8]) -> Fingerprint {
        info_hash::hash_bytes(data)
    }

    #[test]
    fn piece_size_is_short_only_for_the_last_piece() {
        let manager = PieceManager::new(16384, 16384 * 2 + 100, vec![[0u8; 20]; 3]);
        assert_eq!(manager.piece_size(0), 16384);
        assert_eq!(manager.piece_size(1), 16384);
        assert_eq!(manager.piece_size(2), 100);
    }

    #[test]
    fn duplicate_blocks_are_idempotent() {
        let mut manager = PieceManager::new(32768, 32768, vec![[0u8; 20]; 1]);
        let data = vec![1u8; 16384];
        manager.add_block(0, 0, &data).unwrap();
        manager.add_block(0, 0, &data).unwrap();
        assert!(!manager.is_piece_ready_to_verify(0));
        manager.add_block(0, 16384, &data).unwrap();
        assert!(manager.is_piece_ready_to_verify(0));
    }

    #[test]
    fn rejects_unaligned_and_out_of_range_blocks() {
        let mut manager = PieceManager::new(16384, 16384, vec![[0u8; 20]; 1]);
        assert!(matches!(
            manager.add_block(0, 100, &[1, 2, 3]),
            Err(PieceError::UnalignedOffset { .. })
        ));
        assert!(matches!(
            manager.add_block(0, 0, &vec![0u8; 20000]),
            Err(PieceError::BlockOutOfRange { .. })
        ));
    }

    #[test]
    fn add_block_on_already_held_piece_is_a_silent_no_op() {
        let mut manager = PieceManager::new(16384, 16384, vec![[0u8; 20]; 1]);
        manager.have.set(0);
        assert!(manager.add_block(0, 0, &[1, 2, 3]).is_ok());
        assert!(!manager.in_progress.contains_key(&0));
    }

    #[tokio::test]
    async fn complete_piece_verifies_and_commits_on_match() {
        let data = vec![7u8; 16384];
        let fingerprint = fingerprint_of(&data);
        let mut manager = PieceManager::new(16384, 16384, vec![fingerprint]);
        manager.add_block(0, 0, &data).unwrap();
        let store = MemoryStore::new();
        manager.complete_piece(0, &store).await.unwrap();
        assert!(manager.have().has(0));
        assert_eq!(manager.downloaded_count(), 1);
        assert_eq!(store.read_piece(0).await.unwrap(), data);
    }

    #[tokio::test]
    async fn complete_piece_discards_on_fingerprint_mismatch() {
        let data = vec![7u8; 16384];
        let mut manager = PieceManager::new(16384, 16384, vec![[0xffu8; 20]]);
        manager.add_block(0, 0, &data).unwrap();
        let store = MemoryStore::new();
        let err = manager.complete_piece(0, &store).await.unwrap_err();
        assert!(matches!(err, PieceError::FingerprintMismatch(0)));
        assert!(!manager.have().has(0));
        assert!(!manager.is_piece_ready_to_verify(0));
    }
}
