//! Piece and block picking.
//!
//! [`PiecePicker`] tracks, for one torrent, how many peers have each piece,
//! the priority of every piece, and the state of every block of pieces
//! that are partially downloaded. It answers "which blocks should this peer
//! be asked for next" through [`PiecePicker::pick_pieces`].
//!
//! Pieces are kept in an ordering sorted by rank (see [`piece_rank`]):
//! rarer and higher-priority pieces first, pieces already in flight ahead
//! of untouched ones. Single-piece changes update the ordering in place.
//! Bulk changes (a peer's bitfield, a seed joining) mark it dirty and it is
//! rebuilt on the next pick.
//!
//! Peers are referred to by [`PeerKey`]. The picker never owns peer state;
//! callers must invoke [`PiecePicker::clear_peer`] when a peer goes away.

mod block;
mod downloads;
mod error;
mod index;
mod layout;
mod ledger;
mod options;
mod pick;
mod progress;

pub use block::{BlockState, PieceBlock};
pub use downloads::DownloadQueue;
pub use error::PickerError;
pub use index::{piece_rank, PieceState};
pub use layout::PieceLayout;
pub use options::PickOptions;
pub use pick::PickRequest;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::constants::{DEFAULT_PRIORITY, TOP_PRIORITY};
use crate::peer::{Bitfield, PeerKey};
use block::BlockInfo;
use downloads::{DownloadRegistry, DownloadingPiece};
use index::{PiecePos, PriorityOrder};
use ledger::BlockLedger;

/// Snapshot of one piece's download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadInfo {
    pub piece: u32,
    pub state: PieceState,
    pub finished: u32,
    pub writing: u32,
    pub requested: u32,
    pub pad_blocks: u32,
    pub locked: bool,
    pub hashing: bool,
    pub passed_hash_check: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    layout: PieceLayout,
    piece_map: Vec<PiecePos>,
    order: PriorityOrder,
    downloads: DownloadRegistry,
    ledger: BlockLedger,
    pad_blocks: BTreeSet<PieceBlock>,
    /// Extents with pieces started recently, oldest first.
    recent_extents: Vec<u32>,
    seeds: u32,
    /// First piece that is neither had nor filtered.
    cursor: u32,
    /// One past the last piece that is neither had nor filtered.
    reverse_cursor: u32,
    num_have: u32,
    num_filtered: u32,
    num_have_filtered: u32,
    rng: StdRng,
}

impl PiecePicker {
    pub fn new(layout: PieceLayout) -> Self {
        Self::with_rng(layout, StdRng::from_os_rng())
    }

    /// A picker whose tie-breaks are reproducible.
    pub fn with_seed(layout: PieceLayout, seed: u64) -> Self {
        Self::with_rng(layout, StdRng::seed_from_u64(seed))
    }

    fn with_rng(layout: PieceLayout, rng: StdRng) -> Self {
        let num_pieces = layout.num_pieces();
        Self {
            layout,
            piece_map: vec![PiecePos::new(DEFAULT_PRIORITY); num_pieces as usize],
            order: PriorityOrder::default(),
            downloads: DownloadRegistry::new(num_pieces),
            ledger: BlockLedger::new(layout.blocks_per_piece()),
            pad_blocks: BTreeSet::new(),
            recent_extents: Vec::new(),
            seeds: 0,
            cursor: 0,
            reverse_cursor: num_pieces,
            num_have: 0,
            num_filtered: 0,
            num_have_filtered: 0,
            rng,
        }
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    pub fn num_pieces(&self) -> u32 {
        self.layout.num_pieces()
    }

    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        self.layout.blocks_in_piece(piece)
    }

    // ------------------------------------------------------------------
    // Priorities
    // ------------------------------------------------------------------

    pub fn piece_priority(&self, piece: u32) -> u8 {
        self.piece_map[piece as usize].priority
    }

    /// Sets the priority of `piece`. Returns true if the piece went from
    /// filtered to wanted or back.
    pub fn set_piece_priority(&mut self, piece: u32, priority: u8) -> bool {
        debug_assert!(priority <= TOP_PRIORITY, "priority {priority} out of range");
        let priority = priority.min(TOP_PRIORITY);
        let pos = self.piece_map[piece as usize];
        if pos.priority == priority {
            return false;
        }

        let prev = self.rank_of(piece);
        self.piece_map[piece as usize].priority = priority;

        let filter_changed = pos.filtered() != (priority == 0);
        if filter_changed {
            match (priority == 0, pos.have()) {
                (true, true) => self.num_have_filtered += 1,
                (true, false) => {
                    self.num_filtered += 1;
                    self.cursor_remove(piece);
                }
                (false, true) => self.num_have_filtered -= 1,
                (false, false) => {
                    self.num_filtered -= 1;
                    self.cursor_add(piece);
                }
            }
        }

        self.sync_queue(piece);
        self.rerank(piece, prev);
        filter_changed
    }

    // ------------------------------------------------------------------
    // Availability
    // ------------------------------------------------------------------

    pub fn inc_refcount(&mut self, piece: u32, peer: PeerKey) {
        let prev = self.rank_of(piece);
        self.piece_map[piece as usize].peer_count += 1;
        self.rerank(piece, prev);
        trace!(piece, %peer, "piece availability increased");
    }

    pub fn dec_refcount(&mut self, piece: u32, peer: PeerKey) {
        let pos = &self.piece_map[piece as usize];
        debug_assert!(pos.peer_count > 0, "piece {piece} availability underflow");
        if pos.peer_count == 0 {
            return;
        }
        let prev = self.rank_of(piece);
        self.piece_map[piece as usize].peer_count -= 1;
        self.rerank(piece, prev);
        trace!(piece, %peer, "piece availability decreased");
    }

    /// Counts every piece in `bitfield` as available from one more peer.
    pub fn inc_refcount_bitfield(
        &mut self,
        bitfield: &Bitfield,
        peer: PeerKey,
    ) -> Result<(), PickerError> {
        self.check_bitfield(bitfield)?;
        let mut counted = 0;
        for piece in bitfield.iter_set() {
            self.piece_map[piece as usize].peer_count += 1;
            counted += 1;
        }
        if counted > 0 {
            self.order.dirty = true;
        }
        trace!(%peer, pieces = counted, "bitfield availability added");
        Ok(())
    }

    pub fn dec_refcount_bitfield(
        &mut self,
        bitfield: &Bitfield,
        peer: PeerKey,
    ) -> Result<(), PickerError> {
        self.check_bitfield(bitfield)?;
        let mut counted = 0;
        for piece in bitfield.iter_set() {
            let pos = &mut self.piece_map[piece as usize];
            debug_assert!(pos.peer_count > 0, "piece {piece} availability underflow");
            pos.peer_count = pos.peer_count.saturating_sub(1);
            counted += 1;
        }
        if counted > 0 {
            self.order.dirty = true;
        }
        trace!(%peer, pieces = counted, "bitfield availability removed");
        Ok(())
    }

    /// A peer that has every piece joined.
    pub fn inc_refcount_all(&mut self, peer: PeerKey) {
        self.seeds += 1;
        self.order.dirty = true;
        trace!(%peer, seeds = self.seeds, "seed added");
    }

    /// A peer that had every piece left, or lost its have-all status.
    pub fn dec_refcount_all(&mut self, peer: PeerKey) {
        if self.seeds > 0 {
            self.seeds -= 1;
        } else {
            // Counted piece by piece (a bitfield with every bit set).
            for pos in &mut self.piece_map {
                debug_assert!(pos.peer_count > 0);
                pos.peer_count = pos.peer_count.saturating_sub(1);
            }
        }
        self.order.dirty = true;
        trace!(%peer, seeds = self.seeds, "seed removed");
    }

    pub fn num_seeds(&self) -> u32 {
        self.seeds
    }

    /// Peers that have `piece`, seeds included.
    pub fn availability(&self, piece: u32) -> u32 {
        self.piece_map[piece as usize].peer_count + self.seeds
    }

    pub fn availability_all(&self) -> Vec<u32> {
        self.piece_map
            .iter()
            .map(|pos| pos.peer_count + self.seeds)
            .collect()
    }

    /// Number of complete copies in the swarm: the lowest availability,
    /// plus the fraction of pieces that are more available than that.
    pub fn distributed_copies(&self) -> f32 {
        let Some(min) = self.piece_map.iter().map(|pos| pos.peer_count).min() else {
            return 0.0;
        };
        let above = self
            .piece_map
            .iter()
            .filter(|pos| pos.peer_count > min)
            .count();
        (min + self.seeds) as f32 + above as f32 / self.piece_map.len() as f32
    }

    // ------------------------------------------------------------------
    // Have
    // ------------------------------------------------------------------

    pub fn have_piece(&self, piece: u32) -> bool {
        self.piece_map[piece as usize].have()
    }

    pub fn piece_state(&self, piece: u32) -> PieceState {
        self.piece_map[piece as usize].state
    }

    /// Marks `piece` downloaded and verified, dropping its block state.
    pub fn we_have(&mut self, piece: u32) {
        let pos = self.piece_map[piece as usize];
        debug_assert!(!pos.have(), "piece {piece} already had");
        if pos.have() {
            return;
        }

        let prev = self.rank_of(piece);
        if let Some(dp) = self.downloads.remove(piece) {
            self.ledger.release(dp.ledger_slot);
        }
        self.piece_map[piece as usize].state = PieceState::Have;
        self.num_have += 1;
        if pos.filtered() {
            self.num_filtered -= 1;
            self.num_have_filtered += 1;
        } else {
            self.cursor_remove(piece);
        }
        self.rerank(piece, prev);
        debug!(piece, have = self.num_have, "piece complete");
    }

    /// Reverts `piece` to not downloaded.
    pub fn we_dont_have(&mut self, piece: u32) {
        let pos = self.piece_map[piece as usize];
        if !pos.have() {
            return;
        }

        self.piece_map[piece as usize].state = PieceState::Open;
        self.num_have -= 1;
        if pos.filtered() {
            self.num_have_filtered -= 1;
            self.num_filtered += 1;
        } else {
            self.cursor_add(piece);
        }
        self.rerank(piece, None);
        self.install_pads(piece);
        debug!(piece, "piece no longer had");
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn reverse_cursor(&self) -> u32 {
        self.reverse_cursor
    }

    pub fn num_have(&self) -> u32 {
        self.num_have
    }

    /// Pieces with priority 0 that we don't have.
    pub fn num_filtered(&self) -> u32 {
        self.num_filtered
    }

    /// Pieces with priority 0 that we have anyway.
    pub fn num_have_filtered(&self) -> u32 {
        self.num_have_filtered
    }

    /// Wanted pieces still missing.
    pub fn num_want_left(&self) -> u32 {
        self.num_pieces() - self.num_have - self.num_filtered
    }

    /// Every piece is had.
    pub fn is_seeding(&self) -> bool {
        self.num_have == self.num_pieces()
    }

    /// Every wanted piece is had.
    pub fn is_finished(&self) -> bool {
        self.num_want_left() == 0
    }

    // ------------------------------------------------------------------
    // Block queries
    // ------------------------------------------------------------------

    pub fn block_state(&self, block: PieceBlock) -> BlockState {
        if self.have_piece(block.piece_index) {
            return BlockState::Finished;
        }
        self.block_info(block)
            .map(|info| info.state)
            .unwrap_or_default()
    }

    pub fn is_requested(&self, block: PieceBlock) -> bool {
        self.block_state(block) == BlockState::Requested
    }

    /// The block is writing or finished.
    pub fn is_downloaded(&self, block: PieceBlock) -> bool {
        matches!(
            self.block_state(block),
            BlockState::Writing | BlockState::Finished
        )
    }

    pub fn is_finished_block(&self, block: PieceBlock) -> bool {
        self.block_state(block) == BlockState::Finished
    }

    /// Number of peers the block is currently requested from.
    pub fn num_peers(&self, block: PieceBlock) -> u32 {
        self.block_info(block)
            .map(|info| info.num_peers as u32)
            .unwrap_or(0)
    }

    /// Last peer to request or deliver the block.
    pub fn downloader(&self, block: PieceBlock) -> Option<PeerKey> {
        self.block_info(block)
            .filter(|info| info.state != BlockState::None)
            .and_then(|info| info.peer)
    }

    /// [`downloader`](Self::downloader) of every block of `piece`.
    pub fn downloaders(&self, piece: u32) -> Vec<Option<PeerKey>> {
        let blocks = self.blocks_in_piece(piece);
        match self.downloads.get(piece) {
            Some(dp) => self
                .piece_blocks(dp)
                .iter()
                .map(|info| match info.state {
                    BlockState::None => None,
                    _ => info.peer,
                })
                .collect(),
            None => vec![None; blocks as usize],
        }
    }

    /// Every block of `piece` is finished.
    pub fn is_piece_finished(&self, piece: u32) -> bool {
        if self.have_piece(piece) {
            return true;
        }
        self.downloads
            .get(piece)
            .is_some_and(|dp| dp.finished == self.blocks_in_piece(piece))
    }

    /// Blocks received but not yet part of a verified piece, pads excluded.
    pub fn unverified_blocks(&self) -> u32 {
        self.downloads
            .iter()
            .map(|dp| dp.finished + dp.writing - dp.pad_blocks)
            .sum()
    }

    pub fn num_downloading(&self) -> usize {
        self.downloads.len()
    }

    pub fn piece_info(&self, piece: u32) -> DownloadInfo {
        let state = self.piece_state(piece);
        match self.downloads.get(piece) {
            Some(dp) => Self::info_of(dp, state),
            None => {
                let finished = if state == PieceState::Have {
                    self.blocks_in_piece(piece)
                } else {
                    0
                };
                DownloadInfo {
                    piece,
                    state,
                    finished,
                    writing: 0,
                    requested: 0,
                    pad_blocks: self.pad_blocks_in_piece(piece),
                    locked: false,
                    hashing: false,
                    passed_hash_check: false,
                }
            }
        }
    }

    /// Progress of every partially downloaded piece.
    pub fn downloading_pieces(&self) -> Vec<DownloadInfo> {
        self.downloads
            .iter()
            .map(|dp| Self::info_of(dp, self.piece_state(dp.index)))
            .collect()
    }

    pub fn is_pad(&self, block: PieceBlock) -> bool {
        self.pad_blocks.contains(&block)
    }

    pub fn num_pad_blocks(&self) -> u32 {
        self.pad_blocks.len() as u32
    }

    pub fn pad_blocks_in_piece(&self, piece: u32) -> u32 {
        self.pads_of(piece).count() as u32
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn info_of(dp: &DownloadingPiece, state: PieceState) -> DownloadInfo {
        DownloadInfo {
            piece: dp.index,
            state,
            finished: dp.finished,
            writing: dp.writing,
            requested: dp.requested,
            pad_blocks: dp.pad_blocks,
            locked: dp.locked,
            hashing: dp.hashing,
            passed_hash_check: dp.passed_hash_check,
        }
    }

    fn check_bitfield(&self, bitfield: &Bitfield) -> Result<(), PickerError> {
        if bitfield.len() != self.num_pieces() as usize {
            return Err(PickerError::BitfieldLength {
                expected: self.num_pieces() as usize,
                actual: bitfield.len(),
            });
        }
        Ok(())
    }

    fn block_info(&self, block: PieceBlock) -> Option<&BlockInfo> {
        let dp = self.downloads.get(block.piece_index)?;
        self.piece_blocks(dp).get(block.block_index as usize)
    }

    /// The valid blocks of a downloading piece.
    fn piece_blocks(&self, dp: &DownloadingPiece) -> &[BlockInfo] {
        let blocks = self.blocks_in_piece(dp.index) as usize;
        &self.ledger.blocks(dp.ledger_slot)[..blocks]
    }

    fn pads_of(&self, piece: u32) -> impl Iterator<Item = &PieceBlock> {
        self.pad_blocks
            .range(PieceBlock::new(piece, 0)..=PieceBlock::new(piece, u32::MAX))
    }

    fn rank_of(&self, piece: u32) -> Option<u32> {
        self.piece_map[piece as usize].rank(self.seeds)
    }

    /// Brings the ordering up to date after `piece` changed rank.
    fn rerank(&mut self, piece: u32, prev: Option<u32>) {
        if self.order.dirty {
            return;
        }
        let pos = self.piece_map[piece as usize];
        match (prev, pos.rank(self.seeds)) {
            (None, None) => {}
            (None, Some(rank)) => self.order.add(&mut self.piece_map, piece, rank, &mut self.rng),
            (Some(prev), None) => self.order.remove(&mut self.piece_map, prev, pos.index),
            (Some(prev), Some(rank)) => {
                self.order
                    .update(&mut self.piece_map, prev, rank, pos.index, &mut self.rng)
            }
        }
    }

    /// Rebuilds the ordering if a bulk change left it dirty.
    fn update_pieces(&mut self) {
        if !self.order.dirty {
            return;
        }
        self.order
            .rebuild(&mut self.piece_map, self.seeds, &mut self.rng);
        trace!(
            ranked = self.order.pieces.len(),
            ranks = self.order.num_ranks(),
            "piece ordering rebuilt"
        );
    }

    /// Moves a downloading piece to the bucket its counters call for.
    fn sync_queue(&mut self, piece: u32) {
        let blocks = self.blocks_in_piece(piece);
        let priority = self.piece_map[piece as usize].priority;
        let Some(dp) = self.downloads.get(piece) else {
            return;
        };
        let queue = dp.classify(blocks, priority);
        self.downloads.set_queue(piece, queue);
        self.piece_map[piece as usize].state = queue.into();
    }

    fn reclassify(&mut self, piece: u32) {
        let prev = self.rank_of(piece);
        self.sync_queue(piece);
        self.rerank(piece, prev);
    }

    fn is_done(&self, piece: u32) -> bool {
        let pos = &self.piece_map[piece as usize];
        pos.have() || pos.filtered()
    }

    /// `piece` became had or filtered.
    fn cursor_remove(&mut self, piece: u32) {
        let n = self.num_pieces();
        if self.cursor == piece && self.reverse_cursor == piece + 1 {
            self.cursor = n;
            self.reverse_cursor = 0;
        } else if self.cursor == piece {
            self.cursor += 1;
            while self.cursor < n && self.is_done(self.cursor) {
                self.cursor += 1;
            }
        } else if self.reverse_cursor == piece + 1 {
            self.reverse_cursor -= 1;
            while self.reverse_cursor > 0 && self.is_done(self.reverse_cursor - 1) {
                self.reverse_cursor -= 1;
            }
        }
    }

    /// `piece` is wanted and missing again.
    fn cursor_add(&mut self, piece: u32) {
        if piece < self.cursor {
            self.cursor = piece;
        }
        if piece >= self.reverse_cursor {
            self.reverse_cursor = piece + 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariant(&self) {
        self.downloads.check_invariant();
        let n = self.num_pieces();

        let mut num_have = 0;
        let mut num_filtered = 0;
        let mut num_have_filtered = 0;
        for (piece, pos) in self.piece_map.iter().enumerate() {
            let piece = piece as u32;
            if pos.have() {
                num_have += 1;
            }
            match (pos.have(), pos.filtered()) {
                (true, true) => num_have_filtered += 1,
                (false, true) => num_filtered += 1,
                _ => {}
            }

            match self.downloads.get(piece) {
                Some(dp) => {
                    assert!(!pos.have(), "had piece {piece} has a download entry");
                    assert!(!dp.is_empty(), "empty download entry for piece {piece}");
                    let blocks = self.piece_blocks(dp);
                    let count = |state: BlockState| {
                        blocks.iter().filter(|b| b.state == state).count() as u32
                    };
                    assert_eq!(dp.requested, count(BlockState::Requested));
                    assert_eq!(dp.writing, count(BlockState::Writing));
                    assert_eq!(dp.finished, count(BlockState::Finished));
                    assert!(dp.finished + dp.writing + dp.requested <= self.blocks_in_piece(piece));
                    assert_eq!(dp.queue, dp.classify(self.blocks_in_piece(piece), pos.priority));
                    assert_eq!(pos.state, PieceState::from(dp.queue));
                    for info in blocks {
                        assert_eq!(info.num_peers > 0, info.state == BlockState::Requested);
                    }
                }
                None => assert!(
                    matches!(pos.state, PieceState::Open | PieceState::Have),
                    "piece {piece} in state {:?} without an entry",
                    pos.state
                ),
            }

            if !self.order.dirty {
                match pos.rank(self.seeds) {
                    Some(rank) => {
                        let at = pos.index as usize;
                        assert_eq!(self.order.pieces[at], piece);
                        assert!(self.order.range(rank as usize).contains(&at));
                    }
                    None => assert_eq!(pos.index, index::UNORDERED),
                }
            }
        }
        assert_eq!(num_have, self.num_have);
        assert_eq!(num_filtered, self.num_filtered);
        assert_eq!(num_have_filtered, self.num_have_filtered);
        assert_eq!(self.ledger.slots_in_use(), self.downloads.len());

        if !self.order.dirty {
            assert!(self.order.boundaries.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(
                self.order.boundaries.last().copied().unwrap_or(0) as usize,
                self.order.pieces.len()
            );
        }

        if self.cursor == n {
            assert_eq!(self.reverse_cursor, 0);
            assert!((0..n).all(|p| self.is_done(p)));
        } else {
            assert!(!self.is_done(self.cursor));
            assert!(!self.is_done(self.reverse_cursor - 1));
            assert!((0..self.cursor).all(|p| self.is_done(p)));
            assert!((self.reverse_cursor..n).all(|p| self.is_done(p)));
        }
    }
}
