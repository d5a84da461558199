//! Piece-selection strategies. All variants exclude pieces we already have,
//! pieces currently in-progress, and pieces in the coordinator's
//! "in_download" exclusion set — callers are expected to have folded
//! in-progress indices into `excluded` before calling.
use crate::peer::Bitfield;
use rand::Rng;
use std::collections::HashSet;

/// Random-first picks uniformly at random until we hold this many pieces,
/// then defers to rarest-first.
pub const RANDOM_FIRST_THRESHOLD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Lowest-index eligible piece, in order. Used for streaming-style
    /// in-order playback.
    Sequential,
    /// Random-first bootstrap (`RANDOM_FIRST_THRESHOLD` pieces), then
    /// rarest-first for the remainder of the download. The common default.
    RarestFirst,
}

fn eligible_pieces(peer_have: &Bitfield, our_have: &Bitfield, excluded: &HashSet<usize>) -> Vec<usize> {
    (0..peer_have.num_pieces())
        .filter(|&i| peer_have.has(i) && !our_have.has(i) && !excluded.contains(&i))
        .collect()
}

fn select_sequential(peer_have: &Bitfield, our_have: &Bitfield, excluded: &HashSet<usize>) -> Option<usize> {
    eligible_pieces(peer_have, our_have, excluded).into_iter().min()
}

fn select_random_first<R: Rng + ?Sized>(
    peer_have: &Bitfield,
    our_have: &Bitfield,
    excluded: &HashSet<usize>,
    rng: &mut R,
) -> Option<usize> {
    let eligible = eligible_pieces(peer_have, our_have, excluded);
    if eligible.is_empty() {
        return None;
    }
    Some(eligible[rng.random_range(0..eligible.len())])
}

/// `rarity[i]` is the number of known peers holding piece `i`. Among
/// eligible pieces, picks the smallest non-zero count; ties break on the
/// lowest piece index, which is deterministic given the same rarity vector.
fn select_rarest_first(
    peer_have: &Bitfield,
    our_have: &Bitfield,
    excluded: &HashSet<usize>,
    rarity: &[usize],
) -> Option<usize> {
    eligible_pieces(peer_have, our_have, excluded)
        .into_iter()
        .filter(|&i| rarity.get(i).copied().unwrap_or(0) > 0)
        .min_by_key(|&i| (rarity[i], i))
}

impl SelectionStrategy {
    /// Selects the next piece to request from a specific peer.
    ///
    /// `rarity` is only consulted by `RarestFirst`; pass an empty slice for
    /// `Sequential`.
    pub fn select<R: Rng + ?Sized>(
        &self,
        peer_have: &Bitfield,
        our_have: &Bitfield,
        excluded: &HashSet<usize>,
        rarity: &[usize],
        rng: &mut R,
    ) -> Option<usize> {
        match self {
            SelectionStrategy::Sequential => select_sequential(peer_have, our_have, excluded),
            SelectionStrategy::RarestFirst => {
                if our_have.count_have() < RANDOM_FIRST_THRESHOLD {
                    select_random_first(peer_have, our_have, excluded, rng)
                } else {
                    select_rarest_first(peer_have, our_have, excluded, rarity)
                }
            }
        }
    }
}

/// Computes `rarity[i] = count of peers whose bitfield has piece i`, for use
/// with `select_rarest_first`.
pub fn compute_rarity(peer_bitfields: &[Bitfield], num_pieces: usize) -> Vec<usize> {
    let mut rarity = vec![0usize; num_pieces];
    for bf in peer_bitfields {
        for (i, count) in rarity.iter_mut().enumerate() {
            if bf.has(i) {
                *count += 1;
            }
        }
    }
    rarity
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield_with(num_pieces: usize, have: &[usize]) -> Bitfield {
        let mut bf = Bitfield::new(num_pieces);
        for &i in have {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn sequential_picks_lowest_eligible_index() {
        let peer = bitfield_with(5, &[1, 3, 4]);
        let ours = bitfield_with(5, &[1]);
        let excluded = HashSet::new();
        assert_eq!(select_sequential(&peer, &ours, &excluded), Some(3));
    }

    #[test]
    fn sequential_respects_exclusion_set() {
        let peer = bitfield_with(5, &[1, 3, 4]);
        let ours = bitfield_with(5, &[]);
        let mut excluded = HashSet::new();
        excluded.insert(1);
        excluded.insert(3);
        assert_eq!(select_sequential(&peer, &ours, &excluded), Some(4));
    }

    #[test]
    fn strategy_bootstraps_with_random_first_below_threshold() {
        let peer = bitfield_with(10, &[0, 1, 2, 3, 4, 5]);
        let ours = bitfield_with(10, &[0]); // 1 piece held, below threshold of 4
        let excluded = HashSet::new();
        let mut rng = rand::rng();
        let picked = SelectionStrategy::RarestFirst.select(&peer, &ours, &excluded, &[], &mut rng);
        assert!(picked.is_some());
    }

    #[test]
    fn strategy_defers_to_rarest_first_once_past_threshold() {
        let peer = bitfield_with(10, &[0, 1, 2, 3, 4, 5]);
        let ours = bitfield_with(10, &[0, 1, 2, 3]); // exactly at threshold
        let excluded = HashSet::new();
        let rarity = vec![5, 5, 5, 5, 1, 5, 0, 0, 0, 0];
        let mut rng = rand::rng();
        let picked = SelectionStrategy::RarestFirst.select(&peer, &ours, &excluded, &rarity, &mut rng);
        assert_eq!(picked, Some(4));
    }

    #[test]
    fn rarest_first_ignores_pieces_with_zero_known_holders() {
        let peer = bitfield_with(3, &[0, 1, 2]);
        let ours = Bitfield::new(3);
        let excluded = HashSet::new();
        let rarity = vec![0, 0, 2];
        assert_eq!(select_rarest_first(&peer, &ours, &excluded, &rarity), Some(2));
    }

    #[test]
    fn compute_rarity_counts_holders_per_piece() {
        let a = bitfield_with(3, &[0, 1]);
        let b = bitfield_with(3, &[1]);
        let rarity = compute_rarity(&[a, b], 3);
        assert_eq!(rarity, vec![1, 2, 0]);
    }
}
