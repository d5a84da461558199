//! Piece assignment loop: ties peer piece-have state to the piece
//! manager's selection strategies, including the endgame transition.
use super::ENDGAME_THRESHOLD;
use crate::peer::Bitfield;
use crate::piece::{selection::compute_rarity, PieceManager, SelectionStrategy};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::{debug, instrument};

/// What the assignment loop needs to know about one peer to consider it for
/// a new piece assignment this tick.
#[derive(Debug, Clone)]
pub struct PeerDownloadInfo {
    pub can_download: bool,
    pub have: Bitfield,
}

#[derive(Debug)]
pub struct AssignmentLoop {
    strategy: Option<SelectionStrategy>,
    /// peer address -> piece index currently assigned to it.
    assignments: HashMap<SocketAddr, usize>,
    /// Pieces currently assigned or in-progress, excluded from fresh
    /// selection outside endgame.
    excluded: HashSet<usize>,
    endgame: bool,
    endgame_threshold: usize,
}

impl AssignmentLoop {
    /// Uses the standing default endgame threshold ([`ENDGAME_THRESHOLD`]).
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self::with_endgame_threshold(strategy, ENDGAME_THRESHOLD)
    }

    /// Uses a caller-supplied endgame threshold, e.g. from `Config::endgame_threshold`.
    pub fn with_endgame_threshold(strategy: SelectionStrategy, endgame_threshold: usize) -> Self {
        Self {
            strategy: Some(strategy),
            assignments: HashMap::new(),
            excluded: HashSet::new(),
            endgame: false,
            endgame_threshold,
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    /// Runs one assignment pass. Returns the (peer, piece_index) pairs that
    /// received a *new* assignment this tick; the caller issues block
    /// REQUESTs for those through the peer's driver task.
    #[instrument(skip(self, peers, manager, rng))]
    pub fn tick<R: Rng + ?Sized>(
        &mut self,
        peers: &HashMap<SocketAddr, PeerDownloadInfo>,
        manager: &PieceManager,
        rng: &mut R,
    ) -> Vec<(SocketAddr, usize)> {
        self.endgame = manager.missing_count() <= self.endgame_threshold && manager.missing_count() > 0;
        let strategy = self.strategy.unwrap_or(SelectionStrategy::RarestFirst);

        let rarity = compute_rarity(
            &peers.values().map(|p| p.have.clone()).collect::<Vec<_>>(),
            manager.num_pieces(),
        );

        let mut new_assignments = Vec::new();
        for (addr, info) in peers {
            if !info.can_download {
                continue;
            }
            if !self.endgame && self.assignments.contains_key(addr) {
                continue;
            }
            let excluded = if self.endgame { HashSet::new() } else { self.excluded.clone() };
            if let Some(piece) =
                manager.select_piece_for_peer(strategy, &info.have, &excluded, &rarity, rng)
            {
                self.assignments.insert(*addr, piece);
                self.excluded.insert(piece);
                new_assignments.push((*addr, piece));
                debug!(?addr, piece, endgame = self.endgame, "assigned piece");
            }
        }
        new_assignments
    }

    /// A piece completed: clears its assignment and exclusion-set entry for
    /// every peer, returning the peers that had it assigned (used during
    /// endgame to CANCEL their now-redundant in-flight requests).
    pub fn on_piece_completed(&mut self, index: usize) -> Vec<SocketAddr> {
        self.excluded.remove(&index);
        let holders: Vec<SocketAddr> = self
            .assignments
            .iter()
            .filter(|(_, &p)| p == index)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &holders {
            self.assignments.remove(addr);
        }
        holders
    }

    /// A piece failed fingerprint verification: make it eligible for
    /// reassignment.
    pub fn on_piece_failed(&mut self, index: usize) {
        self.excluded.remove(&index);
        self.assignments.retain(|_, &mut p| p != index);
    }

    /// A peer disconnected: returns its assignment, if any, so the caller
    /// can decide whether to keep it excluded (another peer may still be
    /// working on it) or free it immediately.
    pub fn on_peer_disconnected(&mut self, addr: &SocketAddr) -> Option<usize> {
        let piece = self.assignments.remove(addr)?;
        if !self.assignments.values().any(|&p| p == piece) {
            self.excluded.remove(&piece);
        }
        Some(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_with(num_pieces: usize, have: &[usize]) -> PeerDownloadInfo {
        let mut bf = Bitfield::new(num_pieces);
        for &i in have {
            bf.set(i);
        }
        PeerDownloadInfo { can_download: true, have: bf }
    }

    fn manager_with(num_pieces: usize) -> PieceManager {
        PieceManager::new(16384, 16384 * num_pieces as u64, vec![[0u8; 20]; num_pieces])
    }

    #[test]
    fn assigns_distinct_pieces_to_distinct_peers_outside_endgame() {
        let manager = manager_with(20);
        let mut peers = HashMap::new();
        let addr_a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        peers.insert(addr_a, peer_with(20, &[0, 1, 2]));
        peers.insert(addr_b, peer_with(20, &[0, 1, 2]));

        let mut loop_ = AssignmentLoop::new(SelectionStrategy::Sequential);
        let mut rng = rand::rng();
        let assigned = loop_.tick(&peers, &manager, &mut rng);
        assert_eq!(assigned.len(), 2);
        let pieces: HashSet<usize> = assigned.iter().map(|(_, p)| *p).collect();
        assert_eq!(pieces.len(), 2, "peers should not both be assigned the same piece");
    }

    #[test]
    fn enters_endgame_when_missing_count_at_or_below_threshold() {
        let manager = manager_with(3);
        let peers = HashMap::new();
        let mut loop_ = AssignmentLoop::new(SelectionStrategy::Sequential);
        let mut rng = rand::rng();
        loop_.tick(&peers, &manager, &mut rng);
        assert!(loop_.is_endgame());
    }

    #[test]
    fn peer_disconnect_frees_its_sole_assignment() {
        let mut loop_ = AssignmentLoop::new(SelectionStrategy::Sequential);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        loop_.assignments.insert(addr, 4);
        loop_.excluded.insert(4);
        let freed = loop_.on_peer_disconnected(&addr);
        assert_eq!(freed, Some(4));
        assert!(!loop_.excluded.contains(&4));
    }
}
