use tracing::{debug, trace};

use crate::constants::{DEFAULT_REQUEST_QUEUE, SNUBBED_REQUEST_QUEUE};
use crate::peer::{Bitfield, PeerKey};
use crate::picker::{PickOptions, PieceBlock, PieceLayout, PiecePicker};
use crate::settings::SchedulerSettings;

/// A block held in one of a peer's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlock {
    pub block: PieceBlock,
    /// Requested while another peer already had it requested.
    pub busy: bool,
    /// Cancelled after it was sent; the peer may still deliver it.
    pub not_wanted: bool,
    /// The peer took too long; the picker no longer counts this request.
    pub timed_out: bool,
}

impl PendingBlock {
    fn new(block: PieceBlock, busy: bool) -> Self {
        Self {
            block,
            busy,
            not_wanted: false,
            timed_out: false,
        }
    }

    /// Whether the picker still counts this request against the block.
    pub fn is_live(&self) -> bool {
        !self.not_wanted && !self.timed_out
    }
}

/// How a block is added to a peer's request queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Allow a second requester for a block another peer has requested.
    pub busy: bool,
    /// Queue ahead of ordinary requests.
    pub time_critical: bool,
}

impl RequestFlags {
    pub const BUSY: Self = Self {
        busy: true,
        time_critical: false,
    };

    pub const TIME_CRITICAL: Self = Self {
        busy: false,
        time_critical: true,
    };
}

/// Result of [`PeerRequests::cancel_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The block was not queued for this peer.
    NotQueued,
    /// The request had not been sent yet and was dropped.
    Dropped,
    /// The request was sent; a CANCEL message must go out. The entry stays
    /// in the download queue until the peer answers.
    CancelSent,
    /// The sent request was removed without waiting for the peer.
    ForceRemoved,
}

/// Request bookkeeping for one connected peer.
///
/// Blocks move from the request queue (picked, not yet sent) to the
/// download queue (sent, awaiting data). Every live entry holds one
/// reference on the block in the picker.
#[derive(Debug)]
pub struct PeerRequests {
    key: PeerKey,
    download_queue: Vec<PendingBlock>,
    request_queue: Vec<PendingBlock>,
    /// Time-critical entries at the front of the request queue.
    queued_time_critical: usize,
    desired_queue_size: usize,
    /// Bytes per second.
    download_rate: u64,
    endgame: bool,
    on_parole: bool,
    snubbed: bool,
    choked: bool,
    allowed_fast: Vec<u32>,
    suggested: Vec<u32>,
}

impl PeerRequests {
    pub fn new(key: PeerKey, settings: &SchedulerSettings) -> Self {
        Self {
            key,
            download_queue: Vec::new(),
            request_queue: Vec::new(),
            queued_time_critical: 0,
            desired_queue_size: DEFAULT_REQUEST_QUEUE
                .clamp(settings.min_request_queue, settings.max_out_request_queue),
            download_rate: 0,
            endgame: false,
            on_parole: false,
            snubbed: false,
            choked: true,
            allowed_fast: Vec::new(),
            suggested: Vec::new(),
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Requests sent to the peer, oldest first.
    pub fn download_queue(&self) -> &[PendingBlock] {
        &self.download_queue
    }

    /// Requests picked but not yet sent, in send order.
    pub fn request_queue(&self) -> &[PendingBlock] {
        &self.request_queue
    }

    pub fn desired_queue_size(&self) -> usize {
        self.desired_queue_size
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn on_parole(&self) -> bool {
        self.on_parole
    }

    pub fn is_snubbed(&self) -> bool {
        self.snubbed
    }

    /// Whether the remote peer is choking us.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn allowed_fast(&self) -> &[u32] {
        &self.allowed_fast
    }

    pub fn suggested(&self) -> &[u32] {
        &self.suggested
    }

    /// Whether `block` is in either queue, live or not.
    pub fn has_block(&self, block: PieceBlock) -> bool {
        self.download_queue.iter().any(|p| p.block == block)
            || self.request_queue.iter().any(|p| p.block == block)
    }

    /// Whether this peer holds a live request for `block`.
    pub fn is_requesting(&self, block: PieceBlock) -> bool {
        self.request_queue.iter().any(|p| p.block == block)
            || self
                .download_queue
                .iter()
                .any(|p| p.block == block && p.is_live())
    }

    pub(super) fn set_endgame(&mut self, endgame: bool) {
        if self.endgame != endgame {
            self.endgame = endgame;
            debug!(peer = %self.key, endgame, "end-game mode changed");
        }
    }

    pub fn set_parole(&mut self, on_parole: bool) {
        if self.on_parole != on_parole {
            self.on_parole = on_parole;
            debug!(peer = %self.key, on_parole, "parole changed");
        }
    }

    pub fn set_snubbed(&mut self, snubbed: bool, settings: &SchedulerSettings, block_size: u32) {
        self.snubbed = snubbed;
        self.update_desired_queue_size(settings, block_size);
    }

    pub fn set_download_rate(&mut self, rate: u64, settings: &SchedulerSettings, block_size: u32) {
        self.download_rate = rate;
        self.update_desired_queue_size(settings, block_size);
    }

    pub fn set_allowed_fast(&mut self, pieces: Vec<u32>) {
        self.allowed_fast = pieces;
    }

    pub fn add_suggested(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            self.suggested.push(piece);
        }
    }

    pub fn remove_suggested(&mut self, piece: u32) {
        self.suggested.retain(|&p| p != piece);
    }

    /// Recomputes how many requests to keep outstanding: enough to cover
    /// `request_queue_time` at the current rate.
    pub fn update_desired_queue_size(&mut self, settings: &SchedulerSettings, block_size: u32) {
        if self.snubbed {
            self.desired_queue_size = SNUBBED_REQUEST_QUEUE;
            return;
        }
        let bytes = self.download_rate as f64 * settings.request_queue_time.as_secs_f64();
        let blocks = (bytes / f64::from(block_size.max(1))) as usize;
        self.desired_queue_size =
            blocks.clamp(settings.min_request_queue, settings.max_out_request_queue);
        trace!(peer = %self.key, desired = self.desired_queue_size, "request queue size");
    }

    /// The pick policy for this peer.
    pub fn picker_options(&self, settings: &SchedulerSettings, num_have: u32) -> PickOptions {
        let mut options = PickOptions::default();
        if settings.sequential_download {
            options.sequential = true;
        } else if num_have >= settings.initial_picker_threshold {
            options.rarest_first = true;
        }
        if self.snubbed {
            options.reverse = true;
        }
        if self.on_parole {
            options.on_parole = true;
            options.prioritize_partials = true;
        }
        if settings.prioritize_partial_pieces {
            options.prioritize_partials = true;
        }
        if settings.piece_extent_affinity {
            options.piece_extent_affinity = true;
        }
        options
    }

    /// How many contiguous blocks to ask the picker for. Peers on parole and
    /// peers fast enough to fetch a piece within `whole_pieces_threshold` get
    /// whole pieces.
    pub fn prefer_contiguous_blocks(
        &self,
        settings: &SchedulerSettings,
        layout: &PieceLayout,
    ) -> usize {
        let whole = layout.blocks_per_piece() as usize;
        if self.on_parole {
            return whole;
        }
        let per_threshold = self.download_rate as f64 * settings.whole_pieces_threshold.as_secs_f64();
        if self.download_rate > 0 && per_threshold > f64::from(layout.piece_length()) {
            whole
        } else {
            0
        }
    }

    /// Pieces the peer has that we may request while choked.
    pub(super) fn allowed_fast_mask(&self, pieces: &Bitfield) -> Bitfield {
        Bitfield::from_pieces(pieces.len(), self.allowed_fast.iter().copied())
            .intersection(pieces)
    }

    /// Claims `block` in the picker and queues it for sending.
    ///
    /// Fails if the block is already queued here, already received, or held
    /// by another peer without [`RequestFlags::busy`].
    pub fn add_request(
        &mut self,
        picker: &mut PiecePicker,
        block: PieceBlock,
        flags: RequestFlags,
    ) -> bool {
        if self.has_block(block) {
            return false;
        }
        if !flags.busy && picker.is_requested(block) {
            return false;
        }
        let options = PickOptions {
            reverse: self.snubbed,
            ..PickOptions::default()
        };
        if !picker.mark_as_downloading(block, self.key, options) {
            return false;
        }

        let pending = PendingBlock::new(block, flags.busy);
        if flags.time_critical {
            self.request_queue.insert(self.queued_time_critical, pending);
            self.queued_time_critical += 1;
        } else {
            self.request_queue.push(pending);
        }
        trace!(peer = %self.key, %block, busy = flags.busy, "request queued");
        true
    }

    /// Withdraws this peer's request for `block`.
    ///
    /// The picker reference is released immediately. A request still in the
    /// download queue stays there, marked not wanted, unless `force` is set.
    pub fn cancel_request(
        &mut self,
        picker: &mut PiecePicker,
        block: PieceBlock,
        force: bool,
    ) -> CancelOutcome {
        if let Some(i) = self.request_queue.iter().position(|p| p.block == block) {
            self.remove_queued(i);
            picker.abort_download(block, self.key);
            return CancelOutcome::Dropped;
        }

        let Some(i) = self.download_queue.iter().position(|p| p.block == block) else {
            return CancelOutcome::NotQueued;
        };
        let pending = self.download_queue[i];
        if pending.is_live() {
            picker.abort_download(block, self.key);
        }
        if force {
            self.download_queue.remove(i);
            CancelOutcome::ForceRemoved
        } else if pending.not_wanted {
            CancelOutcome::NotQueued
        } else {
            self.download_queue[i].not_wanted = true;
            CancelOutcome::CancelSent
        }
    }

    /// Cancels every request. Returns the sent requests that need a CANCEL
    /// message.
    pub fn cancel_all(&mut self, picker: &mut PiecePicker) -> Vec<PieceBlock> {
        for pending in self.request_queue.drain(..) {
            picker.abort_download(pending.block, self.key);
        }
        self.queued_time_critical = 0;

        let mut sent = Vec::new();
        for pending in &mut self.download_queue {
            if pending.is_live() {
                picker.abort_download(pending.block, self.key);
            }
            if !pending.not_wanted {
                pending.not_wanted = true;
                sent.push(pending.block);
            }
        }
        sent
    }

    /// Drops every unsent request for a block of `piece`, and removes sent
    /// ones without waiting for the peer.
    pub(super) fn force_cancel_piece(&mut self, picker: &mut PiecePicker, piece: u32) {
        let blocks: Vec<PieceBlock> = self
            .request_queue
            .iter()
            .chain(&self.download_queue)
            .filter(|p| p.block.piece_index == piece)
            .map(|p| p.block)
            .collect();
        for block in blocks {
            self.cancel_request(picker, block, true);
        }
    }

    /// Drops the unsent requests that a choke made pointless. Requests in
    /// allowed-fast pieces stay queued.
    pub(super) fn drop_choked_requests(&mut self, picker: &mut PiecePicker) -> Vec<PieceBlock> {
        let mut dropped = Vec::new();
        let mut i = 0;
        while i < self.request_queue.len() {
            let block = self.request_queue[i].block;
            if self.allowed_fast.contains(&block.piece_index) {
                i += 1;
                continue;
            }
            self.remove_queued(i);
            picker.abort_download(block, self.key);
            dropped.push(block);
        }
        dropped
    }

    pub(super) fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    /// Moves requests from the request queue to the download queue until
    /// the desired depth is reached. Returns the blocks to send.
    pub(super) fn take_sendable(&mut self) -> Vec<PieceBlock> {
        let room = self
            .desired_queue_size
            .saturating_sub(self.download_queue.len())
            .min(self.request_queue.len());
        let sent: Vec<PendingBlock> = self.request_queue.drain(..room).collect();
        self.queued_time_critical = self.queued_time_critical.saturating_sub(room);
        let blocks = sent.iter().map(|p| p.block).collect();
        self.download_queue.extend(sent);
        blocks
    }

    /// Removes `block` from whichever queue holds it.
    pub(super) fn take_block(&mut self, block: PieceBlock) -> Option<PendingBlock> {
        if let Some(i) = self.download_queue.iter().position(|p| p.block == block) {
            return Some(self.download_queue.remove(i));
        }
        let i = self.request_queue.iter().position(|p| p.block == block)?;
        Some(self.remove_queued(i))
    }

    /// Marks the oldest outstanding request as timed out and releases its
    /// picker reference so other peers can pick the block.
    pub(super) fn time_out_oldest(&mut self, picker: &mut PiecePicker) -> Option<PieceBlock> {
        let pending = self.download_queue.iter_mut().find(|p| p.is_live())?;
        pending.timed_out = true;
        let block = pending.block;
        picker.abort_download(block, self.key);
        Some(block)
    }

    fn remove_queued(&mut self, i: usize) -> PendingBlock {
        if i < self.queued_time_critical {
            self.queued_time_critical -= 1;
        }
        self.request_queue.remove(i)
    }
}
