use std::cmp::Reverse;
use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::trace;

use crate::constants::{
    MAX_RECENT_EXTENTS, PARTIALS_PER_PEER_DENOMINATOR, PARTIALS_PER_PEER_NUMERATOR,
    RANK_FACTOR, TOP_PRIORITY,
};
use crate::peer::{Bitfield, PeerKey};

use super::block::{BlockInfo, BlockState, PieceBlock};
use super::downloads::DownloadQueue;
use super::options::PickOptions;
use super::PiecePicker;

/// Input to [`PiecePicker::pick_pieces`].
#[derive(Debug, Clone, Copy)]
pub struct PickRequest<'a> {
    /// Pieces the peer has.
    pub pieces: &'a Bitfield,
    /// Number of blocks wanted.
    pub num_blocks: usize,
    /// Try to pick runs of this many blocks from untouched pieces.
    pub prefer_contiguous_blocks: usize,
    pub peer: PeerKey,
    pub options: PickOptions,
    /// Pieces to try before the regular order.
    pub suggested: &'a [u32],
    /// Connected peers, used to decide when to stop opening new pieces.
    pub num_peers: usize,
}

impl<'a> PickRequest<'a> {
    pub fn new(pieces: &'a Bitfield, num_blocks: usize, peer: PeerKey) -> Self {
        Self {
            pieces,
            num_blocks,
            prefer_contiguous_blocks: 0,
            peer,
            options: PickOptions::rarest_first(),
            suggested: &[],
            num_peers: 1,
        }
    }

    pub fn with_options(mut self, options: PickOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_contiguous(mut self, blocks: usize) -> Self {
        self.prefer_contiguous_blocks = blocks;
        self
    }

    pub fn with_suggested(mut self, suggested: &'a [u32]) -> Self {
        self.suggested = suggested;
        self
    }

    pub fn with_num_peers(mut self, num_peers: usize) -> Self {
        self.num_peers = num_peers;
        self
    }
}

struct BusyCandidate {
    block: PieceBlock,
    num_peers: u16,
    /// Blocks of the piece not yet received.
    outstanding: u32,
}

/// Working state of one pick.
struct Picks {
    interesting: Vec<PieceBlock>,
    /// Free blocks of partial pieces being downloaded in the other direction.
    backup: Vec<PieceBlock>,
    /// Free blocks of partial pieces, while whole pieces are wanted.
    backup2: Vec<PieceBlock>,
    busy: Vec<BusyCandidate>,
    num_blocks: usize,
    prefer_contiguous: usize,
    visited: HashSet<u32>,
    random_start: u32,
}

impl Picks {
    fn new(request: &PickRequest<'_>, random_start: u32) -> Self {
        Self {
            interesting: Vec::with_capacity(request.num_blocks),
            backup: Vec::new(),
            backup2: Vec::new(),
            busy: Vec::new(),
            num_blocks: request.num_blocks,
            prefer_contiguous: request.prefer_contiguous_blocks,
            visited: HashSet::new(),
            random_start,
        }
    }

    fn done(&self) -> bool {
        self.num_blocks == 0
    }

    fn append_backups(&mut self) {
        for list in [&mut self.backup, &mut self.backup2] {
            let take = list.len().min(self.num_blocks);
            self.interesting.extend(list.drain(..take));
            self.num_blocks -= take;
        }
    }

    fn finish(mut self) -> Vec<PieceBlock> {
        let take = self.busy.len().min(self.num_blocks);
        self.interesting
            .extend(self.busy.into_iter().take(take).map(|c| c.block));
        self.interesting
    }
}

impl PiecePicker {
    /// Picks up to `request.num_blocks` blocks to request from a peer.
    ///
    /// Blocks nobody has requested come first, in this order: partial
    /// pieces (when partials are prioritized), suggested pieces, pieces in
    /// recently started extents, then the regular order (rarest first,
    /// sequential or random). Blocks already requested from other peers
    /// ("busy" blocks) fill what is left, fewest requesters first, unless
    /// the peer is on parole.
    ///
    /// The result may be longer than `num_blocks` when contiguous blocks are
    /// preferred. Nothing is marked; the caller calls
    /// [`mark_as_downloading`](Self::mark_as_downloading) for the blocks it
    /// actually requests, and must check [`is_requested`](Self::is_requested)
    /// to tell busy blocks apart.
    pub fn pick_pieces(&mut self, request: &PickRequest<'_>) -> Vec<PieceBlock> {
        debug_assert!(request.options.is_valid(), "rarest_first and sequential both set");
        let n = self.num_pieces();
        if request.num_blocks == 0 || request.pieces.len() != n as usize {
            return Vec::new();
        }
        self.update_pieces();

        let mut options = request.options;
        if self.downloads.len()
            > request.num_peers * PARTIALS_PER_PEER_NUMERATOR / PARTIALS_PER_PEER_DENOMINATOR
        {
            options.prioritize_partials = true;
        }
        if !options.rarest_first && !options.sequential {
            options.prioritize_partials = true;
        }

        let random_start = self.rng.random_range(0..n);
        let mut picks = Picks::new(request, random_start);
        self.collect(request, options, &mut picks);

        if picks.busy.len() > 1 {
            // Stable sort keeps the shuffled order among equal candidates.
            picks.busy.shuffle(&mut self.rng);
            picks
                .busy
                .sort_by_key(|c| (c.num_peers, Reverse(c.outstanding)));
        }

        if options.piece_extent_affinity {
            self.expire_extents();
        }

        let blocks = picks.finish();
        trace!(
            peer = %request.peer,
            options = options.to_bits(),
            picked = blocks.len(),
            "picked blocks"
        );
        blocks
    }

    fn collect(&self, request: &PickRequest<'_>, options: PickOptions, picks: &mut Picks) {
        if options.time_critical {
            self.collect_time_critical(request, options, picks);
            return;
        }

        if options.prioritize_partials {
            for queue in [DownloadQueue::Downloading, DownloadQueue::DownloadingReverse] {
                for &piece in self.downloads.queue(queue) {
                    if !self.is_piece_free(piece, request.pieces) {
                        continue;
                    }
                    self.add_blocks_downloading(piece, request, options, picks);
                    if picks.done() {
                        return;
                    }
                }
            }
            picks.append_backups();
            if picks.done() {
                return;
            }
        }

        for &piece in request.suggested {
            if piece < self.num_pieces() && self.visit(piece, request, options, picks) {
                return;
            }
        }

        if options.piece_extent_affinity && self.pick_recent_extents(request, options, picks) {
            return;
        }

        let done = if options.sequential {
            self.pick_sequential(request, options, picks)
        } else if options.rarest_first && options.reverse {
            self.pick_common_first(request, options, picks)
        } else if options.rarest_first {
            self.pick_rarest_first(request, options, picks)
        } else {
            self.pick_random(request, options, picks)
        };
        if done {
            return;
        }

        picks.append_backups();
        if !picks.done() && !options.on_parole {
            self.collect_busy(request, picks, 1);
        }
    }

    /// Only top-priority pieces, in rank order.
    fn collect_time_critical(
        &self,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) {
        let options = PickOptions {
            prioritize_partials: false,
            ..options
        };
        for &piece in &self.order.pieces {
            if self.piece_map[piece as usize].priority < TOP_PRIORITY {
                continue;
            }
            if self.visit(piece, request, options, picks) {
                return;
            }
        }
        picks.append_backups();
        if !picks.done() && !options.on_parole {
            self.collect_busy(request, picks, TOP_PRIORITY);
        }
    }

    fn pick_sequential(
        &self,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) -> bool {
        let mut range = self.cursor..self.reverse_cursor;
        if options.reverse {
            range
                .rev()
                .any(|piece| self.visit(piece, request, options, picks))
        } else {
            range.any(|piece| self.visit(piece, request, options, picks))
        }
    }

    fn pick_rarest_first(
        &self,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) -> bool {
        self.order
            .pieces
            .iter()
            .any(|&piece| self.visit(piece, request, options, picks))
    }

    /// Walks availability levels from most to least common. The ranks of
    /// one availability level are kept in order, so partial pieces still
    /// come before untouched ones.
    fn pick_common_first(
        &self,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) -> bool {
        let ranks = self.order.num_ranks();
        let group = RANK_FACTOR as usize;
        for first in (0..ranks.div_ceil(group)).rev().map(|g| g * group) {
            for rank in first..(first + group).min(ranks) {
                for at in self.order.range(rank) {
                    let piece = self.order.pieces[at];
                    if self.visit(piece, request, options, picks) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn pick_random(
        &self,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) -> bool {
        let n = self.num_pieces();
        let start = picks.random_start;
        for offset in 0..n {
            let piece = (start + offset) % n;
            if !self.can_pick(piece, request.pieces) {
                continue;
            }
            if self.visit(piece, request, options, picks) {
                return true;
            }
        }
        false
    }

    /// Pieces of recently started extents, newest extent first.
    fn pick_recent_extents(
        &self,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) -> bool {
        let len = self.layout.extent_pieces();
        let n = self.num_pieces();
        for &extent in self.recent_extents.iter().rev() {
            let start = extent.saturating_mul(len).min(n);
            let end = start.saturating_add(len).min(n);
            if (start..end).any(|piece| self.visit(piece, request, options, picks)) {
                return true;
            }
        }
        false
    }

    /// Picks from `piece` if the peer can give it to us. Returns true once
    /// enough blocks are picked.
    fn visit(
        &self,
        piece: u32,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) -> bool {
        if self.is_piece_free(piece, request.pieces) {
            self.add_blocks(piece, request, options, picks);
        }
        picks.done()
    }

    fn add_blocks(
        &self,
        piece: u32,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) {
        if picks.visited.contains(&piece) {
            return;
        }
        if self.downloads.contains(piece) {
            // Already offered by the partials pass.
            if !options.prioritize_partials {
                self.add_blocks_downloading(piece, request, options, picks);
            }
            return;
        }

        let (start, end) = if picks.prefer_contiguous > 0 {
            self.expand_piece(piece, request.pieces, options, picks)
        } else {
            (piece, piece + 1)
        };
        for k in start..end {
            let blocks = self.blocks_in_piece(k) as usize;
            let take = if picks.prefer_contiguous > 0 {
                blocks
            } else {
                blocks.min(picks.num_blocks)
            };
            if take == 0 {
                break;
            }
            picks.visited.insert(k);
            picks
                .interesting
                .extend((0..take as u32).map(|b| PieceBlock::new(k, b)));
            picks.num_blocks = picks.num_blocks.saturating_sub(take);
            picks.prefer_contiguous = picks.prefer_contiguous.saturating_sub(take);
        }
    }

    fn add_blocks_downloading(
        &self,
        piece: u32,
        request: &PickRequest<'_>,
        options: PickOptions,
        picks: &mut Picks,
    ) {
        if !picks.visited.insert(piece) {
            return;
        }
        let Some(dp) = self.downloads.get(piece) else {
            return;
        };
        if dp.locked || dp.unrequested(self.blocks_in_piece(piece)) == 0 {
            return;
        }

        let blocks = self.piece_blocks(dp);
        let (exclusive, exclusive_active) = self.requested_from(piece, blocks, request.peer);
        if options.on_parole && !exclusive {
            return;
        }

        let free = blocks
            .iter()
            .enumerate()
            .filter(|(_, info)| info.state == BlockState::None)
            .map(|(i, _)| PieceBlock::new(piece, i as u32));

        // Someone else is working on this piece and we want whole pieces.
        if picks.prefer_contiguous > 0 && !exclusive_active {
            if picks.backup2.len() < picks.num_blocks {
                picks.backup2.extend(free);
            }
            return;
        }

        // Avoid mixing fast and slow peers on one piece.
        if dp.reverse != options.reverse && !exclusive_active {
            for block in free {
                if picks.backup.len() >= picks.num_blocks {
                    break;
                }
                picks.backup.push(block);
            }
            return;
        }

        for block in free {
            picks.interesting.push(block);
            picks.num_blocks = picks.num_blocks.saturating_sub(1);
            if picks.prefer_contiguous > 0 {
                picks.prefer_contiguous -= 1;
                continue;
            }
            if picks.num_blocks == 0 {
                return;
            }
        }
    }

    /// Whether `peer` is the only downloader of a piece (`exclusive`) and
    /// the only peer with requests outstanding for it (`exclusive_active`).
    fn requested_from(&self, piece: u32, blocks: &[BlockInfo], peer: PeerKey) -> (bool, bool) {
        let mut exclusive = true;
        for (i, info) in blocks.iter().enumerate() {
            if info.state == BlockState::None || info.peer == Some(peer) {
                continue;
            }
            if self.is_pad(PieceBlock::new(piece, i as u32)) {
                continue;
            }
            exclusive = false;
            if info.state == BlockState::Requested && info.peer.is_some() {
                return (false, false);
            }
        }
        (exclusive, true)
    }

    /// Grows `piece` into a run of untouched pieces long enough to cover
    /// `picks.prefer_contiguous` blocks.
    fn expand_piece(
        &self,
        piece: u32,
        have: &Bitfield,
        options: PickOptions,
        picks: &Picks,
    ) -> (u32, u32) {
        let per_piece = self.layout.blocks_per_piece() as usize;
        let whole = picks.prefer_contiguous.div_ceil(per_piece).max(1) as u32;
        let n = self.num_pieces();
        let available = |p: u32| self.can_pick(p, have) && !picks.visited.contains(&p);

        let lower = if options.align_expanded_pieces {
            piece - piece % whole
        } else {
            piece.saturating_sub(whole - 1)
        };
        let mut start = piece;
        while start > lower && available(start - 1) {
            start -= 1;
        }

        let upper = if options.align_expanded_pieces {
            lower + whole
        } else {
            start + whole
        }
        .min(n);
        let mut end = piece + 1;
        while end < upper && available(end) {
            end += 1;
        }
        (start, end)
    }

    /// Requested blocks of other peers, for end-game duplicates.
    fn collect_busy(&self, request: &PickRequest<'_>, picks: &mut Picks, min_priority: u8) {
        for dp in self.downloads.iter() {
            let piece = dp.index;
            let priority = self.piece_map[piece as usize].priority;
            if dp.locked
                || dp.requested == 0
                || priority == 0
                || priority < min_priority
                || !request.pieces.has(piece as usize)
            {
                continue;
            }
            let outstanding = self.blocks_in_piece(piece) - dp.finished - dp.writing;
            for (i, info) in self.piece_blocks(dp).iter().enumerate() {
                if info.state != BlockState::Requested || info.peer == Some(request.peer) {
                    continue;
                }
                picks.busy.push(BusyCandidate {
                    block: PieceBlock::new(piece, i as u32),
                    num_peers: info.num_peers,
                    outstanding,
                });
            }
        }
    }

    /// The peer has `piece`, we don't, and we want it.
    fn is_piece_free(&self, piece: u32, have: &Bitfield) -> bool {
        let pos = &self.piece_map[piece as usize];
        have.has(piece as usize) && !pos.have() && !pos.filtered()
    }

    /// [`is_piece_free`](Self::is_piece_free) and untouched.
    fn can_pick(&self, piece: u32, have: &Bitfield) -> bool {
        self.is_piece_free(piece, have) && !self.downloads.contains(piece)
    }

    /// Remembers the extent of a newly started piece, unless a wanted piece
    /// in it has a different priority.
    pub(super) fn note_extent(&mut self, piece: u32) {
        let extent = self.layout.extent_of(piece);
        if self.recent_extents.contains(&extent) {
            return;
        }
        let priority = self.piece_priority(piece);
        let len = self.layout.extent_pieces();
        let n = self.num_pieces();
        let start = extent.saturating_mul(len).min(n);
        let end = start.saturating_add(len).min(n);
        let mixed = (start..end).any(|k| {
            let pos = &self.piece_map[k as usize];
            !pos.have() && !pos.filtered() && self.piece_priority(k) != priority
        });
        if mixed {
            return;
        }
        if self.recent_extents.len() >= MAX_RECENT_EXTENTS {
            self.recent_extents.remove(0);
        }
        self.recent_extents.push(extent);
    }

    /// Forgets extents without an untouched wanted piece.
    fn expire_extents(&mut self) {
        let len = self.layout.extent_pieces();
        let n = self.num_pieces();
        let keep: Vec<u32> = self
            .recent_extents
            .iter()
            .copied()
            .filter(|&extent| {
                let start = extent.saturating_mul(len).min(n);
                let end = start.saturating_add(len).min(n);
                (start..end).any(|piece| {
                    let pos = &self.piece_map[piece as usize];
                    !pos.have() && !pos.filtered() && !self.downloads.contains(piece)
                })
            })
            .collect();
        self.recent_extents = keep;
    }
}
