//! Download coordinator: the control loop tying together tracker refresh,
//! peer pool management, and piece assignment (including endgame).
use thiserror::Error;

pub mod assignment;
pub mod events;

pub use assignment::AssignmentLoop;
pub use events::CoordinatorEvent;

/// Below this many missing pieces, the assignment loop enters endgame: the
/// exclusion set is ignored and multiple peers may be asked for the same
/// piece in parallel.
pub const ENDGAME_THRESHOLD: usize = 5;

/// Default peer pool cap.
pub const DEFAULT_MAX_PEERS: usize = 50;

/// A peer beyond this long since its last message (keep-alives included)
/// is evicted as inactive.
pub const PEER_INACTIVITY_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error("peer error: {0}")]
    Peer(#[from] crate::peer::PeerError),

    #[error("piece error: {0}")]
    Piece(#[from] crate::piece::PieceError),

    #[error("no trackers configured")]
    NoTrackers,
}

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
