use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::constants::{FILTER_PRIORITY, TOP_PRIORITY};
use crate::peer::{Bitfield, BlockRequest, PeerKey};
use crate::picker::{PickerError, PieceBlock, PiecePicker};
use crate::settings::SchedulerSettings;

use super::error::SchedulerError;
use super::fill::FillContext;
use super::peer_requests::{CancelOutcome, PeerRequests};

/// Per-peer state held by the download.
#[derive(Debug)]
struct PeerEntry {
    requests: PeerRequests,
    pieces: Bitfield,
    /// Counted through the picker's seed counter rather than per piece.
    seed: bool,
}

/// Outcome of [`Download::block_received`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlock {
    pub block: PieceBlock,
    /// The block was already received from another peer.
    pub duplicate: bool,
    /// CANCEL messages for peers that were sent the same request.
    pub cancels: Vec<(PeerKey, BlockRequest)>,
}

/// Block scheduling for one torrent.
///
/// Owns the [`PiecePicker`] and the request state of every connected peer,
/// and routes the connection and disk layers' events into both. Every
/// method runs to completion on the caller's thread.
#[derive(Debug)]
pub struct Download {
    picker: PiecePicker,
    settings: SchedulerSettings,
    peers: HashMap<PeerKey, PeerEntry>,
    next_key: u32,
    /// Top-priority pieces not yet had.
    time_critical: BTreeSet<u32>,
}

impl Download {
    pub fn new(picker: PiecePicker, settings: SchedulerSettings) -> Result<Self, SchedulerError> {
        settings.validate()?;
        let time_critical = (0..picker.num_pieces())
            .filter(|&p| picker.piece_priority(p) == TOP_PRIORITY && !picker.have_piece(p))
            .collect();
        Ok(Self {
            picker,
            settings,
            peers: HashMap::new(),
            next_key: 0,
            time_critical,
        })
    }

    pub fn picker(&self) -> &PiecePicker {
        &self.picker
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, key: PeerKey) -> Option<&PeerRequests> {
        self.peers.get(&key).map(|entry| &entry.requests)
    }

    pub fn peer_keys(&self) -> impl Iterator<Item = PeerKey> + '_ {
        self.peers.keys().copied()
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Registers a new peer under a fresh key.
    pub fn add_peer(&mut self) -> PeerKey {
        let mut key = PeerKey(self.next_key);
        while self.peers.contains_key(&key) {
            self.next_key = self.next_key.wrapping_add(1);
            key = PeerKey(self.next_key);
        }
        self.next_key = self.next_key.wrapping_add(1);
        self.register(key);
        key
    }

    /// Registers a peer under a key chosen by the caller.
    pub fn insert_peer(&mut self, key: PeerKey) -> Result<(), SchedulerError> {
        if self.peers.contains_key(&key) {
            return Err(SchedulerError::DuplicatePeer(key));
        }
        self.register(key);
        Ok(())
    }

    fn register(&mut self, key: PeerKey) {
        let entry = PeerEntry {
            requests: PeerRequests::new(key, &self.settings),
            pieces: Bitfield::new(self.picker.num_pieces() as usize),
            seed: false,
        };
        self.peers.insert(key, entry);
        debug!(peer = %key, peers = self.peers.len(), "peer added");
    }

    /// Drops a peer: its requests are released, its pieces no longer count
    /// towards availability and the picker forgets it.
    pub fn remove_peer(&mut self, key: PeerKey) -> Result<(), SchedulerError> {
        let mut entry = self
            .peers
            .remove(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        entry.requests.cancel_all(&mut self.picker);
        Self::release_availability(&mut self.picker, &mut entry, key)?;
        self.picker.clear_peer(key);
        debug!(peer = %key, peers = self.peers.len(), "peer removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Availability
    // ------------------------------------------------------------------

    /// The peer sent its BITFIELD. Returns whether it has anything we want.
    pub fn peer_bitfield(&mut self, key: PeerKey, pieces: Bitfield) -> Result<bool, SchedulerError> {
        let expected = self.picker.num_pieces() as usize;
        if pieces.len() != expected {
            return Err(PickerError::BitfieldLength {
                expected,
                actual: pieces.len(),
            }
            .into());
        }
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        Self::release_availability(&mut self.picker, entry, key)?;
        if pieces.is_all_set() {
            self.picker.inc_refcount_all(key);
            entry.seed = true;
        } else {
            self.picker.inc_refcount_bitfield(&pieces, key)?;
        }
        entry.pieces = pieces;
        Ok(Self::wants_any(&self.picker, &entry.pieces))
    }

    /// The peer sent HAVE ALL.
    pub fn peer_have_all(&mut self, key: PeerKey) -> Result<(), SchedulerError> {
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        if entry.seed {
            return Ok(());
        }
        Self::release_availability(&mut self.picker, entry, key)?;
        self.picker.inc_refcount_all(key);
        entry.seed = true;
        entry.pieces = Bitfield::full(self.picker.num_pieces() as usize);
        Ok(())
    }

    /// The peer sent HAVE for `piece`. Returns whether the piece is one we
    /// want.
    pub fn peer_has(&mut self, key: PeerKey, piece: u32) -> Result<bool, SchedulerError> {
        self.check_piece(piece)?;
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        if entry.pieces.has(piece as usize) {
            return Ok(false);
        }
        entry.pieces.set(piece as usize);
        self.picker.inc_refcount(piece, key);
        Ok(!self.picker.have_piece(piece) && self.picker.piece_priority(piece) > FILTER_PRIORITY)
    }

    /// The peer no longer has `piece`.
    pub fn peer_lost(&mut self, key: PeerKey, piece: u32) -> Result<(), SchedulerError> {
        self.check_piece(piece)?;
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        if !entry.pieces.has(piece as usize) {
            return Ok(());
        }
        entry.pieces.clear(piece as usize);
        entry.requests.remove_suggested(piece);
        if entry.seed {
            // No longer a seed: count the rest piece by piece.
            self.picker.dec_refcount_all(key);
            self.picker.inc_refcount_bitfield(&entry.pieces, key)?;
            entry.seed = false;
        } else {
            self.picker.dec_refcount(piece, key);
        }
        Ok(())
    }

    /// Whether the peer has a piece we want.
    pub fn is_interesting(&self, key: PeerKey) -> Result<bool, SchedulerError> {
        let entry = self.peers.get(&key).ok_or(SchedulerError::UnknownPeer(key))?;
        Ok(Self::wants_any(&self.picker, &entry.pieces))
    }

    /// The peer suggested `piece`.
    pub fn suggest_piece(&mut self, key: PeerKey, piece: u32) -> Result<(), SchedulerError> {
        self.check_piece(piece)?;
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        if !self.picker.have_piece(piece) {
            entry.requests.add_suggested(piece);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer conditions
    // ------------------------------------------------------------------

    /// The peer choked us. Returns the unsent requests that were dropped.
    pub fn peer_choked(&mut self, key: PeerKey) -> Result<Vec<PieceBlock>, SchedulerError> {
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        entry.requests.set_choked(true);
        let dropped = entry.requests.drop_choked_requests(&mut self.picker);
        debug!(peer = %key, dropped = dropped.len(), "peer choked us");
        Ok(dropped)
    }

    pub fn peer_unchoked(&mut self, key: PeerKey) -> Result<(), SchedulerError> {
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        entry.requests.set_choked(false);
        debug!(peer = %key, "peer unchoked us");
        Ok(())
    }

    /// Pieces the peer lets us request while choked.
    pub fn set_allowed_fast(&mut self, key: PeerKey, pieces: Vec<u32>) -> Result<(), SchedulerError> {
        for &piece in &pieces {
            self.check_piece(piece)?;
        }
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        entry.requests.set_allowed_fast(pieces);
        Ok(())
    }

    pub fn set_snubbed(&mut self, key: PeerKey, snubbed: bool) -> Result<(), SchedulerError> {
        let block_size = self.picker.layout().block_size();
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        entry.requests.set_snubbed(snubbed, &self.settings, block_size);
        debug!(peer = %key, snubbed, "peer snub state changed");
        Ok(())
    }

    /// New payload rate estimate, in bytes per second.
    pub fn update_download_rate(&mut self, key: PeerKey, rate: u64) -> Result<(), SchedulerError> {
        let block_size = self.picker.layout().block_size();
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        entry.requests.set_download_rate(rate, &self.settings, block_size);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Picks blocks for the peer up to its desired queue depth. Returns the
    /// number of blocks queued.
    pub fn fill_queue(&mut self, key: PeerKey) -> Result<usize, SchedulerError> {
        let picker = &self.picker;
        self.time_critical.retain(|&p| !picker.have_piece(p));
        let num_peers = self.peers.len();
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        let ctx = FillContext {
            pieces: &entry.pieces,
            settings: &self.settings,
            num_peers,
            time_critical: !self.time_critical.is_empty(),
        };
        Ok(entry.requests.fill_queue(&mut self.picker, &ctx))
    }

    /// Moves queued requests into the peer's download queue. Returns the
    /// requests to put on the wire.
    pub fn send_requests(&mut self, key: PeerKey) -> Result<Vec<BlockRequest>, SchedulerError> {
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        let layout = self.picker.layout();
        Ok(entry
            .requests
            .take_sendable()
            .into_iter()
            .map(|block| layout.block_request(block))
            .collect())
    }

    /// Withdraws the peer's request for `block`.
    pub fn cancel_request(
        &mut self,
        key: PeerKey,
        block: PieceBlock,
        force: bool,
    ) -> Result<CancelOutcome, SchedulerError> {
        self.check_block(block)?;
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        Ok(entry.requests.cancel_request(&mut self.picker, block, force))
    }

    /// The peer answered a request with REJECT.
    pub fn request_rejected(
        &mut self,
        key: PeerKey,
        request: &BlockRequest,
    ) -> Result<(), SchedulerError> {
        let block = self.picker.layout().block_for(request)?;
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        if let Some(pending) = entry.requests.take_block(block) {
            if pending.is_live() {
                self.picker.abort_download(block, key);
            }
            debug!(peer = %key, %block, "request rejected");
        }
        Ok(())
    }

    /// The peer's oldest request went unanswered for too long. The block is
    /// released for other peers and the peer is snubbed. Returns the block.
    pub fn request_timed_out(&mut self, key: PeerKey) -> Result<Option<PieceBlock>, SchedulerError> {
        let block_size = self.picker.layout().block_size();
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        let block = entry.requests.time_out_oldest(&mut self.picker);
        if let Some(block) = block {
            entry.requests.set_snubbed(true, &self.settings, block_size);
            warn!(peer = %key, %block, "request timed out");
        }
        Ok(block)
    }

    // ------------------------------------------------------------------
    // Block and piece completion
    // ------------------------------------------------------------------

    /// The peer delivered a block. The block is handed to the disk layer
    /// unless it is a duplicate; other peers' requests for it are
    /// cancelled.
    pub fn block_received(
        &mut self,
        key: PeerKey,
        request: &BlockRequest,
    ) -> Result<ReceivedBlock, SchedulerError> {
        let block = self.picker.layout().block_for(request)?;
        let entry = self
            .peers
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownPeer(key))?;
        let pending = entry.requests.take_block(block);

        if self.picker.have_piece(block.piece_index) || self.picker.is_downloaded(block) {
            if pending.is_some_and(|p| p.is_live()) {
                self.picker.abort_download(block, key);
            }
            debug!(peer = %key, %block, "duplicate block");
            return Ok(ReceivedBlock {
                block,
                duplicate: true,
                cancels: Vec::new(),
            });
        }

        self.picker.mark_as_writing(block, key);

        let layout = *self.picker.layout();
        let mut cancels = Vec::new();
        for (&other, entry) in self.peers.iter_mut() {
            if other == key || !entry.requests.has_block(block) {
                continue;
            }
            if entry.requests.cancel_request(&mut self.picker, block, false)
                == CancelOutcome::CancelSent
            {
                cancels.push((other, layout.block_request(block)));
            }
        }
        cancels.sort_by_key(|(peer, _)| *peer);

        Ok(ReceivedBlock {
            block,
            duplicate: false,
            cancels,
        })
    }

    /// The disk layer wrote `block`. Returns true if its piece is now
    /// complete on disk and waiting for verification.
    ///
    /// If the piece already passed its hash check, the last write makes it
    /// had and this returns false.
    pub fn block_written(&mut self, block: PieceBlock) -> Result<bool, SchedulerError> {
        self.check_block(block)?;
        let piece = block.piece_index;
        let had = self.picker.have_piece(piece);
        self.picker.mark_as_finished(block, None);
        if self.picker.have_piece(piece) {
            if !had {
                self.piece_complete(piece);
            }
            return Ok(false);
        }
        Ok(self.picker.is_piece_finished(piece))
    }

    /// The disk layer failed to write `block`. The piece stays locked until
    /// restored.
    pub fn write_failed(&mut self, block: PieceBlock) -> Result<(), SchedulerError> {
        self.check_block(block)?;
        self.picker.write_failed(block);
        Ok(())
    }

    pub fn hash_started(&mut self, piece: u32) -> Result<(), SchedulerError> {
        self.check_piece(piece)?;
        self.picker.mark_hashing(piece);
        Ok(())
    }

    /// `piece` passed its hash check. Returns true if it is now had.
    ///
    /// A peer on parole that downloaded every block of the piece is
    /// released.
    pub fn piece_passed(&mut self, piece: u32) -> Result<bool, SchedulerError> {
        self.check_piece(piece)?;
        let downloaders = self.picker.downloaders(piece);
        let had = self.picker.piece_passed(piece);

        let mut contributors = downloaders.iter().flatten();
        if let Some(&first) = contributors.next() {
            if contributors.all(|&peer| peer == first) {
                if let Some(entry) = self.peers.get_mut(&first) {
                    entry.requests.set_parole(false);
                }
            }
        }
        if had {
            self.piece_complete(piece);
        }
        Ok(had)
    }

    /// `piece` failed its hash check. The piece is locked and every peer
    /// that contributed to it goes on parole. Returns those peers.
    ///
    /// Once outstanding disk work is done the caller restores the piece
    /// with [`restore_piece`](Self::restore_piece).
    pub fn piece_failed(&mut self, piece: u32) -> Result<Vec<PeerKey>, SchedulerError> {
        self.check_piece(piece)?;
        let contributors: BTreeSet<PeerKey> =
            self.picker.downloaders(piece).into_iter().flatten().collect();
        self.picker.piece_failed(piece);
        for key in &contributors {
            if let Some(entry) = self.peers.get_mut(key) {
                entry.requests.set_parole(true);
            }
        }
        Ok(contributors.into_iter().collect())
    }

    /// Discards everything downloaded for `piece` so it can be picked again.
    /// Requests peers still hold for it are removed first.
    pub fn restore_piece(&mut self, piece: u32) -> Result<(), SchedulerError> {
        self.check_piece(piece)?;
        for entry in self.peers.values_mut() {
            entry.requests.force_cancel_piece(&mut self.picker, piece);
        }
        self.picker.restore_piece(piece);
        Ok(())
    }

    /// Marks `piece` as had without downloading it, as when resuming.
    pub fn we_have(&mut self, piece: u32) -> Result<(), SchedulerError> {
        self.check_piece(piece)?;
        if self.picker.have_piece(piece) {
            return Ok(());
        }
        for entry in self.peers.values_mut() {
            entry.requests.force_cancel_piece(&mut self.picker, piece);
        }
        self.picker.we_have(piece);
        self.piece_complete(piece);
        Ok(())
    }

    /// Sets the priority of `piece`. Returns true if the piece went from
    /// filtered to wanted or back.
    pub fn set_piece_priority(&mut self, piece: u32, priority: u8) -> Result<bool, SchedulerError> {
        self.check_piece(piece)?;
        if priority > TOP_PRIORITY {
            return Err(PickerError::InvalidPriority(priority).into());
        }
        if priority == TOP_PRIORITY && !self.picker.have_piece(piece) {
            self.time_critical.insert(piece);
        } else {
            self.time_critical.remove(&piece);
        }
        Ok(self.picker.set_piece_priority(piece, priority))
    }

    /// Marks padding blocks. A piece made up entirely of padding is had
    /// right away.
    pub fn mark_pad_blocks(&mut self, blocks: &[PieceBlock]) -> Result<(), SchedulerError> {
        for &block in blocks {
            self.check_block(block)?;
        }
        let mut pieces = BTreeSet::new();
        for &block in blocks {
            self.picker.mark_as_pad(block);
            pieces.insert(block.piece_index);
        }
        for piece in pieces {
            let all_pads =
                self.picker.pad_blocks_in_piece(piece) == self.picker.blocks_in_piece(piece);
            if all_pads && !self.picker.have_piece(piece) {
                self.picker.we_have(piece);
                self.piece_complete(piece);
            }
        }
        Ok(())
    }

    fn piece_complete(&mut self, piece: u32) {
        self.time_critical.remove(&piece);
        for entry in self.peers.values_mut() {
            entry.requests.remove_suggested(piece);
        }
    }

    fn release_availability(
        picker: &mut PiecePicker,
        entry: &mut PeerEntry,
        key: PeerKey,
    ) -> Result<(), SchedulerError> {
        if entry.seed {
            picker.dec_refcount_all(key);
            entry.seed = false;
        } else if !entry.pieces.is_empty() {
            picker.dec_refcount_bitfield(&entry.pieces, key)?;
        }
        entry.pieces = Bitfield::new(picker.num_pieces() as usize);
        Ok(())
    }

    fn wants_any(picker: &PiecePicker, pieces: &Bitfield) -> bool {
        pieces
            .iter_set()
            .any(|p| !picker.have_piece(p) && picker.piece_priority(p) > FILTER_PRIORITY)
    }

    fn check_piece(&self, piece: u32) -> Result<(), SchedulerError> {
        if piece >= self.picker.num_pieces() {
            return Err(PickerError::InvalidPieceIndex(piece).into());
        }
        Ok(())
    }

    fn check_block(&self, block: PieceBlock) -> Result<(), SchedulerError> {
        self.check_piece(block.piece_index)?;
        if block.block_index >= self.picker.blocks_in_piece(block.piece_index) {
            let layout = self.picker.layout();
            return Err(PickerError::InvalidBlock {
                piece: block.piece_index,
                offset: block.block_index.saturating_mul(layout.block_size()),
                length: layout.block_size(),
            }
            .into());
        }
        Ok(())
    }
}
