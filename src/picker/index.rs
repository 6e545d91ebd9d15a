use std::ops::Range;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::constants::{PRIORITY_LEVELS, RANK_FACTOR};

/// Sentinel position for pieces that are not in the priority ordering.
pub(crate) const UNORDERED: u32 = u32::MAX;

/// Coarse state of a piece as seen by the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PieceState {
    /// No block has been requested or received.
    #[default]
    Open,
    Downloading,
    DownloadingReverse,
    Full,
    FullReverse,
    Finished,
    ZeroPriority,
    /// Downloaded and verified.
    Have,
}

/// Rank of a piece in the pick ordering. Lower ranks are picked first.
///
/// `availability` counts seeds. Returns `None` for pieces that take no
/// part in the ordering: filtered, unavailable, or in a state with
/// nothing left to request.
pub fn piece_rank(priority: u8, availability: u32, state: PieceState) -> Option<u32> {
    if priority == 0 || availability == 0 {
        return None;
    }
    // Partial pieces sort ahead of open pieces at equal availability.
    let adjustment = match state {
        PieceState::Downloading => 3,
        PieceState::Open => 2,
        PieceState::DownloadingReverse => 1,
        _ => return None,
    };
    let levels = PRIORITY_LEVELS - priority.min(PRIORITY_LEVELS as u8 - 1) as u32;
    Some(
        availability
            .saturating_mul(levels * RANK_FACTOR)
            .saturating_sub(adjustment),
    )
}

/// Per-piece record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PiecePos {
    /// Peers that have the piece, not counting seeds.
    pub peer_count: u32,
    pub priority: u8,
    pub state: PieceState,
    /// Position in the ordering, or [`UNORDERED`].
    pub index: u32,
}

impl PiecePos {
    pub fn new(priority: u8) -> Self {
        Self {
            peer_count: 0,
            priority,
            state: PieceState::Open,
            index: UNORDERED,
        }
    }

    pub fn have(&self) -> bool {
        self.state == PieceState::Have
    }

    pub fn filtered(&self) -> bool {
        self.priority == 0
    }

    pub fn rank(&self, seeds: u32) -> Option<u32> {
        if self.have() {
            return None;
        }
        piece_rank(self.priority, self.peer_count + seeds, self.state)
    }
}

/// Pieces grouped by rank.
///
/// `pieces` is sorted by rank; the pieces of rank `r` occupy
/// `boundaries[r - 1]..boundaries[r]`. Order within a rank is random.
/// Single-piece changes are applied incrementally by shifting one piece
/// per rank boundary crossed. Bulk changes mark the ordering dirty and
/// it is rebuilt before the next pick.
#[derive(Debug, Default)]
pub(crate) struct PriorityOrder {
    pub pieces: Vec<u32>,
    pub boundaries: Vec<u32>,
    pub dirty: bool,
}

impl PriorityOrder {
    /// Positions of the pieces of `rank`.
    pub fn range(&self, rank: usize) -> Range<usize> {
        let start = if rank == 0 {
            0
        } else {
            self.boundaries[rank - 1] as usize
        };
        start..self.boundaries[rank] as usize
    }

    pub fn num_ranks(&self) -> usize {
        self.boundaries.len()
    }

    pub fn add(&mut self, map: &mut [PiecePos], piece: u32, rank: u32, rng: &mut StdRng) {
        debug_assert!(!self.dirty);
        let rank = rank as usize;
        self.grow(rank);

        let mut hole = self.pieces.len();
        self.pieces.push(piece);
        for k in (rank + 1..self.boundaries.len()).rev() {
            let start = self.boundaries[k - 1] as usize;
            if start != hole {
                self.place(map, self.pieces[start], hole);
            }
            hole = start;
            self.boundaries[k] += 1;
        }
        self.boundaries[rank] += 1;
        self.place(map, piece, hole);
        self.shuffle_into(map, rank, hole, rng);
    }

    pub fn remove(&mut self, map: &mut [PiecePos], rank: u32, elem: u32) {
        debug_assert!(!self.dirty);
        let piece = self.pieces[elem as usize];
        map[piece as usize].index = UNORDERED;

        let mut hole = elem as usize;
        for k in rank as usize..self.boundaries.len() {
            let last = self.boundaries[k] as usize - 1;
            if last != hole {
                self.place(map, self.pieces[last], hole);
            }
            hole = last;
            self.boundaries[k] -= 1;
        }
        debug_assert_eq!(hole, self.pieces.len() - 1);
        self.pieces.pop();
    }

    /// Moves the piece at `elem` from rank `prev` to rank `new`.
    pub fn update(
        &mut self,
        map: &mut [PiecePos],
        prev: u32,
        new: u32,
        elem: u32,
        rng: &mut StdRng,
    ) {
        debug_assert!(!self.dirty);
        if prev == new {
            return;
        }
        let (prev, new) = (prev as usize, new as usize);
        self.grow(new);
        let piece = self.pieces[elem as usize];

        let mut hole = elem as usize;
        if new > prev {
            for k in prev..new {
                let last = self.boundaries[k] as usize - 1;
                if last != hole {
                    self.place(map, self.pieces[last], hole);
                }
                hole = last;
                self.boundaries[k] -= 1;
            }
        } else {
            for k in (new + 1..=prev).rev() {
                let start = self.boundaries[k - 1] as usize;
                if start != hole {
                    self.place(map, self.pieces[start], hole);
                }
                hole = start;
                self.boundaries[k - 1] += 1;
            }
        }
        self.place(map, piece, hole);
        self.shuffle_into(map, new, hole, rng);
    }

    /// Recomputes the ordering from scratch.
    pub fn rebuild(&mut self, map: &mut [PiecePos], seeds: u32, rng: &mut StdRng) {
        let mut counts: Vec<u32> = Vec::new();
        for pos in map.iter() {
            if let Some(rank) = pos.rank(seeds) {
                let rank = rank as usize;
                if rank >= counts.len() {
                    counts.resize(rank + 1, 0);
                }
                counts[rank] += 1;
            }
        }

        let mut boundaries = Vec::with_capacity(counts.len());
        let mut next = Vec::with_capacity(counts.len());
        let mut total = 0;
        for count in counts {
            next.push(total);
            total += count;
            boundaries.push(total);
        }

        let mut pieces = vec![0; total as usize];
        for (piece, pos) in map.iter_mut().enumerate() {
            pos.index = UNORDERED;
            if let Some(rank) = pos.rank(seeds) {
                let at = &mut next[rank as usize];
                pieces[*at as usize] = piece as u32;
                *at += 1;
            }
        }

        self.pieces = pieces;
        self.boundaries = boundaries;
        for rank in 0..self.boundaries.len() {
            let range = self.range(rank);
            self.pieces[range].shuffle(rng);
        }
        for (at, &piece) in self.pieces.iter().enumerate() {
            map[piece as usize].index = at as u32;
        }
        self.dirty = false;
    }

    fn grow(&mut self, rank: usize) {
        if rank >= self.boundaries.len() {
            let end = self.pieces.len() as u32;
            self.boundaries.resize(rank + 1, end);
        }
    }

    fn place(&mut self, map: &mut [PiecePos], piece: u32, at: usize) {
        self.pieces[at] = piece;
        map[piece as usize].index = at as u32;
    }

    /// Swaps the piece at `at` with a random member of its rank.
    fn shuffle_into(&mut self, map: &mut [PiecePos], rank: usize, at: usize, rng: &mut StdRng) {
        let range = self.range(rank);
        if range.len() < 2 {
            return;
        }
        let other = rng.random_range(range);
        if other != at {
            let (a, b) = (self.pieces[at], self.pieces[other]);
            self.place(map, b, at);
            self.place(map, a, other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn map_with(avail: &[u32]) -> Vec<PiecePos> {
        avail
            .iter()
            .map(|&a| PiecePos {
                peer_count: a,
                ..PiecePos::new(4)
            })
            .collect()
    }

    fn check(order: &PriorityOrder, map: &[PiecePos]) {
        assert_eq!(
            order.boundaries.last().copied().unwrap_or(0) as usize,
            order.pieces.len()
        );
        for rank in 0..order.num_ranks() {
            for at in order.range(rank) {
                let piece = order.pieces[at];
                assert_eq!(map[piece as usize].index as usize, at);
                assert_eq!(map[piece as usize].rank(0), Some(rank as u32));
            }
        }
        for pos in map {
            if pos.rank(0).is_none() {
                assert_eq!(pos.index, UNORDERED);
            }
        }
    }

    #[test]
    fn test_piece_rank() {
        // availability 1, default priority, open
        assert_eq!(piece_rank(4, 1, PieceState::Open), Some(10));
        assert_eq!(piece_rank(4, 1, PieceState::Downloading), Some(9));
        assert_eq!(piece_rank(4, 1, PieceState::DownloadingReverse), Some(11));
        assert_eq!(piece_rank(7, 1, PieceState::Downloading), Some(0));
        assert_eq!(piece_rank(0, 5, PieceState::Open), None);
        assert_eq!(piece_rank(4, 0, PieceState::Open), None);
        assert_eq!(piece_rank(4, 3, PieceState::Full), None);
        assert_eq!(piece_rank(4, 3, PieceState::Finished), None);
        assert_eq!(piece_rank(4, 3, PieceState::Have), None);
    }

    #[test]
    fn test_rank_is_monotonic() {
        for priority in 1..=7u8 {
            for avail in 1..20 {
                let open = piece_rank(priority, avail, PieceState::Open).unwrap();
                let partial = piece_rank(priority, avail, PieceState::Downloading).unwrap();
                assert!(partial < open);
                assert!(open < piece_rank(priority, avail + 1, PieceState::Open).unwrap());
                if priority < 7 {
                    assert!(piece_rank(priority + 1, avail, PieceState::Open).unwrap() < open);
                }
            }
        }
    }

    #[test]
    fn test_incremental_matches_rebuild() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut map = map_with(&[1, 2, 1, 3, 0, 2, 1]);
        let mut order = PriorityOrder::default();
        order.rebuild(&mut map, 0, &mut rng);
        check(&order, &map);
        assert_eq!(order.pieces.len(), 6);

        // piece 4 becomes available
        map[4].peer_count = 1;
        let rank = map[4].rank(0).unwrap();
        order.add(&mut map, 4, rank, &mut rng);
        check(&order, &map);

        // piece 3 loses two peers
        let prev = map[3].rank(0).unwrap();
        map[3].peer_count = 1;
        let new = map[3].rank(0).unwrap();
        let at = map[3].index;
        order.update(&mut map, prev, new, at, &mut rng);
        check(&order, &map);

        // piece 0 gains peers, jumping past empty ranks
        let prev = map[0].rank(0).unwrap();
        map[0].peer_count = 9;
        let new = map[0].rank(0).unwrap();
        let at = map[0].index;
        order.update(&mut map, prev, new, at, &mut rng);
        check(&order, &map);

        // piece 5 goes unavailable
        let prev = map[5].rank(0).unwrap();
        map[5].peer_count = 0;
        let at = map[5].index;
        order.remove(&mut map, prev, at);
        check(&order, &map);
        assert_eq!(order.pieces.len(), 6);
    }
}
