//! Events flowing between peer driver tasks, the tracker refresh task, and
//! the assignment loop.
use std::net::SocketAddr;

#[derive(Debug)]
pub enum CoordinatorEvent {
    /// A fresh peer address arrived from the tracker, DHT, LSD, or PEX.
    PeerDiscovered(SocketAddr),
    /// A peer connection ended; its pending assignment (if any) should be
    /// returned to the pool.
    PeerDisconnected { addr: SocketAddr, piece_assignment: Option<usize> },
    /// A block arrived and was applied to piece-manager state.
    BlockReceived { addr: SocketAddr, piece_index: u32, offset: u32 },
    /// A piece passed fingerprint verification and was committed.
    PieceCompleted { piece_index: usize },
    /// A piece failed fingerprint verification; its exclusion-set entry and
    /// assignment should be cleared so it can be reassigned.
    PieceFailed { piece_index: usize },
    /// All pieces have been downloaded and verified; the coordinator should
    /// transition to seeding mode and emit tracker event=completed.
    DownloadCompleted,
    /// The tracker refresh task could not reach any tracker after
    /// exhausting its retry budget.
    TrackerUnreachable,
}
