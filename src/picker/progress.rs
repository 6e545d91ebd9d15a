use tracing::{debug, trace, warn};

use crate::peer::PeerKey;

use super::block::{BlockInfo, BlockState, PieceBlock};
use super::downloads::DownloadQueue;
use super::index::PieceState;
use super::options::PickOptions;
use super::PiecePicker;

impl PiecePicker {
    /// Records that `block` was requested from `peer`.
    ///
    /// A block that is already requested gains a second requester (end-game).
    /// Returns false if the block is already downloaded or the piece is
    /// locked or had.
    pub fn mark_as_downloading(
        &mut self,
        block: PieceBlock,
        peer: PeerKey,
        options: PickOptions,
    ) -> bool {
        let piece = block.piece_index;
        debug_assert!(block.block_index < self.blocks_in_piece(piece));
        if self.have_piece(piece) {
            return false;
        }
        if !self.downloads.contains(piece) {
            self.add_download(piece, options.reverse);
            if options.piece_extent_affinity {
                self.note_extent(piece);
            }
        }
        let Some(dp) = self.downloads.get_mut(piece) else {
            return false;
        };
        if dp.locked {
            return false;
        }
        let info = &mut self.ledger.blocks_mut(dp.ledger_slot)[block.block_index as usize];
        match info.state {
            BlockState::Writing | BlockState::Finished => return false,
            BlockState::None => {
                // The first active requester decides the piece's direction.
                if dp.requested == 0 {
                    dp.reverse = options.reverse;
                }
                info.state = BlockState::Requested;
                info.num_peers = 1;
                dp.requested += 1;
            }
            BlockState::Requested => {
                info.num_peers += 1;
            }
        }
        info.peer = Some(peer);
        if !options.reverse {
            dp.reverse = false;
        }
        self.reclassify(piece);
        trace!(%block, %peer, "block requested");
        true
    }

    /// Records that `block` was received and is being written to disk.
    ///
    /// Every other requester's claim lapses with it. Returns false if the
    /// block was already received.
    pub fn mark_as_writing(&mut self, block: PieceBlock, peer: PeerKey) -> bool {
        let piece = block.piece_index;
        debug_assert!(block.block_index < self.blocks_in_piece(piece));
        if self.have_piece(piece) {
            return false;
        }
        if !self.downloads.contains(piece) {
            self.add_download(piece, false);
        }
        let Some(dp) = self.downloads.get_mut(piece) else {
            return false;
        };
        let info = &mut self.ledger.blocks_mut(dp.ledger_slot)[block.block_index as usize];
        match info.state {
            BlockState::Writing | BlockState::Finished => return false,
            BlockState::Requested => dp.requested -= 1,
            BlockState::None => {}
        }
        info.state = BlockState::Writing;
        info.peer = Some(peer);
        info.num_peers = 0;
        dp.writing += 1;
        if dp.requested == 0 {
            dp.reverse = false;
        }
        self.reclassify(piece);
        true
    }

    /// Records that `block` is on disk.
    ///
    /// If the piece already passed its hash check and this was its last
    /// block, the piece becomes had.
    pub fn mark_as_finished(&mut self, block: PieceBlock, peer: Option<PeerKey>) {
        let piece = block.piece_index;
        debug_assert!(block.block_index < self.blocks_in_piece(piece));
        if self.have_piece(piece) {
            return;
        }
        if !self.downloads.contains(piece) {
            self.add_download(piece, false);
        }
        let blocks_in_piece = self.blocks_in_piece(piece);
        let Some(dp) = self.downloads.get_mut(piece) else {
            return;
        };
        let info = &mut self.ledger.blocks_mut(dp.ledger_slot)[block.block_index as usize];
        match info.state {
            BlockState::Finished => return,
            BlockState::Writing => dp.writing -= 1,
            BlockState::Requested => dp.requested -= 1,
            BlockState::None => {}
        }
        info.state = BlockState::Finished;
        info.num_peers = 0;
        if peer.is_some() {
            info.peer = peer;
        }
        dp.finished += 1;
        if dp.requested == 0 {
            dp.reverse = false;
        }
        let complete = dp.passed_hash_check && dp.finished == blocks_in_piece;
        self.reclassify(piece);
        if complete {
            self.we_have(piece);
        }
    }

    /// The disk layer failed to write `block`.
    ///
    /// The block goes back to `None` and the piece is locked until
    /// [`unlock_piece`](Self::unlock_piece) or
    /// [`restore_piece`](Self::restore_piece).
    pub fn write_failed(&mut self, block: PieceBlock) {
        let piece = block.piece_index;
        let Some(dp) = self.downloads.get_mut(piece) else {
            return;
        };
        let info = &mut self.ledger.blocks_mut(dp.ledger_slot)[block.block_index as usize];
        match info.state {
            BlockState::Requested | BlockState::Finished => return,
            BlockState::Writing => dp.writing -= 1,
            BlockState::None => {}
        }
        *info = BlockInfo::default();
        dp.passed_hash_check = false;
        dp.locked = true;
        let empty = dp.is_empty();
        warn!(%block, "block write failed, piece locked");
        if empty {
            self.erase_download(piece);
        } else {
            self.reclassify(piece);
        }
    }

    /// Withdraws `peer`'s request for `block`.
    ///
    /// The block returns to `None` once no peer has it requested, and the
    /// piece returns to `Open` once none of its blocks are in flight.
    pub fn abort_download(&mut self, block: PieceBlock, peer: PeerKey) {
        let piece = block.piece_index;
        let Some(dp) = self.downloads.get_mut(piece) else {
            return;
        };
        let info = &mut self.ledger.blocks_mut(dp.ledger_slot)[block.block_index as usize];
        if info.state != BlockState::Requested {
            return;
        }
        debug_assert!(info.num_peers > 0);
        info.num_peers = info.num_peers.saturating_sub(1);
        if info.peer == Some(peer) {
            info.peer = None;
        }
        if info.num_peers > 0 {
            return;
        }

        *info = BlockInfo::default();
        dp.requested -= 1;
        if dp.requested == 0 {
            dp.reverse = false;
        }
        let empty = dp.is_empty();
        trace!(%block, %peer, "block request aborted");
        if empty {
            self.erase_download(piece);
        } else {
            self.reclassify(piece);
        }
    }

    /// No further blocks of `piece` are handed out until it is unlocked or
    /// restored.
    pub fn lock_piece(&mut self, piece: u32) {
        if let Some(dp) = self.downloads.get_mut(piece) {
            dp.locked = true;
            debug!(piece, "piece locked");
        }
    }

    pub fn unlock_piece(&mut self, piece: u32) {
        if let Some(dp) = self.downloads.get_mut(piece) {
            dp.locked = false;
            debug!(piece, "piece unlocked");
        }
    }

    pub fn is_locked(&self, piece: u32) -> bool {
        self.downloads.get(piece).is_some_and(|dp| dp.locked)
    }

    /// Discards all block state of `piece`, returning it to `Open`.
    ///
    /// Pad blocks stay finished. Requests other peers still hold for the
    /// piece must be cancelled by the caller first.
    pub fn restore_piece(&mut self, piece: u32) {
        let Some(dp) = self.downloads.get(piece) else {
            return;
        };
        // Only pads left: nothing to restore.
        if dp.finished == dp.pad_blocks && dp.writing == 0 && dp.requested == 0 && !dp.locked {
            return;
        }
        debug_assert_eq!(dp.requested, 0, "restoring piece {piece} with requests out");
        self.erase_download(piece);
        self.install_pads(piece);
        debug!(piece, "piece restored");
    }

    /// A hash job for `piece` was started.
    pub fn mark_hashing(&mut self, piece: u32) {
        if let Some(dp) = self.downloads.get_mut(piece) {
            dp.hashing = true;
        }
    }

    /// `piece` passed its hash check.
    ///
    /// Returns true if the piece is now had. If blocks are still being
    /// written, the pass is remembered and the last
    /// [`mark_as_finished`](Self::mark_as_finished) completes the piece.
    pub fn piece_passed(&mut self, piece: u32) -> bool {
        if self.have_piece(piece) {
            return true;
        }
        let blocks_in_piece = self.blocks_in_piece(piece);
        let Some(dp) = self.downloads.get_mut(piece) else {
            self.we_have(piece);
            return true;
        };
        dp.hashing = false;
        dp.passed_hash_check = true;
        if dp.finished == blocks_in_piece {
            self.we_have(piece);
            true
        } else {
            debug!(piece, "hash passed, waiting for writes");
            false
        }
    }

    /// `piece` failed its hash check. The piece is locked until restored.
    pub fn piece_failed(&mut self, piece: u32) {
        if let Some(dp) = self.downloads.get_mut(piece) {
            dp.hashing = false;
            dp.passed_hash_check = false;
            dp.locked = true;
        }
        warn!(piece, "piece failed hash check");
    }

    /// Marks `block` as padding. Pad blocks count as finished and are never
    /// picked.
    pub fn mark_as_pad(&mut self, block: PieceBlock) {
        let piece = block.piece_index;
        debug_assert!(block.block_index < self.blocks_in_piece(piece));
        if !self.pad_blocks.insert(block) || self.have_piece(piece) {
            return;
        }
        if self.downloads.contains(piece) {
            self.finish_pad(block);
            self.reclassify(piece);
        } else {
            // The new entry picks up every pad of the piece.
            self.add_download(piece, false);
        }
    }

    /// Forgets `peer` as the downloader of any block.
    ///
    /// Reference counts are not touched; the peer's outstanding requests
    /// must be aborted first.
    pub fn clear_peer(&mut self, peer: PeerKey) {
        let slots: Vec<u32> = self.downloads.iter().map(|dp| dp.ledger_slot).collect();
        for slot in slots {
            for info in self.ledger.blocks_mut(slot) {
                if info.peer == Some(peer) {
                    info.peer = None;
                }
            }
        }
    }

    /// Creates the download entry of `piece`, with any pad blocks finished.
    pub(super) fn add_download(&mut self, piece: u32, reverse: bool) {
        debug_assert!(!self.have_piece(piece));
        let prev = self.rank_of(piece);
        let slot = self.ledger.allocate();
        let queue = if reverse {
            DownloadQueue::DownloadingReverse
        } else {
            DownloadQueue::Downloading
        };
        self.downloads.insert(piece, slot, queue, reverse);
        self.piece_map[piece as usize].state = queue.into();

        let pads: Vec<PieceBlock> = self.pads_of(piece).copied().collect();
        for pad in pads {
            self.finish_pad(pad);
        }
        self.sync_queue(piece);
        self.rerank(piece, prev);
    }

    /// Drops the download entry of `piece`, which goes back to `Open`.
    pub(super) fn erase_download(&mut self, piece: u32) {
        let prev = self.rank_of(piece);
        if let Some(dp) = self.downloads.remove(piece) {
            self.ledger.release(dp.ledger_slot);
        }
        self.piece_map[piece as usize].state = PieceState::Open;
        self.rerank(piece, prev);
    }

    /// Recreates the entry holding the pad blocks of a piece that has none.
    pub(super) fn install_pads(&mut self, piece: u32) {
        if self.have_piece(piece)
            || self.downloads.contains(piece)
            || self.pads_of(piece).next().is_none()
        {
            return;
        }
        self.add_download(piece, false);
    }

    fn finish_pad(&mut self, block: PieceBlock) {
        let Some(dp) = self.downloads.get_mut(block.piece_index) else {
            return;
        };
        let info = &mut self.ledger.blocks_mut(dp.ledger_slot)[block.block_index as usize];
        debug_assert_eq!(info.state, BlockState::None, "pad block {block} in use");
        if info.state != BlockState::None {
            return;
        }
        info.state = BlockState::Finished;
        dp.finished += 1;
        dp.pad_blocks += 1;
    }
}
