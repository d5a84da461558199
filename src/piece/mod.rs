//! The piece manager: owns the piece-have vector, the in-progress-piece
//! assembly table, and the piece-fingerprint table; exposes block-level
//! add/verify/commit and the three piece-selection strategies.
use thiserror::Error;

pub mod block;
pub mod manager;
pub mod selection;

pub use block::{Block, BLOCK_SIZE};
pub use manager::PieceManager;
pub use selection::SelectionStrategy;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("piece index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("block offset {offset} is not aligned to the {block_size}-byte block size")]
    UnalignedOffset { offset: u32, block_size: u32 },

    #[error("block at offset {offset} (len {len}) overruns piece size {piece_size}")]
    BlockOutOfRange { offset: u32, len: usize, piece_size: u32 },

    #[error("piece {0} is not in-progress or not yet fully received")]
    IncompletePiece(usize),

    #[error("piece {0} failed fingerprint verification")]
    FingerprintMismatch(usize),

    #[error("file store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;
