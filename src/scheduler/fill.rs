use tracing::{debug, trace};

use crate::peer::Bitfield;
use crate::picker::{PickOptions, PickRequest, PieceBlock, PiecePicker};
use crate::settings::SchedulerSettings;

use super::peer_requests::{PeerRequests, RequestFlags};

/// What [`PeerRequests::fill_queue`] needs to know about the torrent.
#[derive(Debug, Clone, Copy)]
pub struct FillContext<'a> {
    /// Pieces the peer has.
    pub pieces: &'a Bitfield,
    pub settings: &'a SchedulerSettings,
    /// Connected peers.
    pub num_peers: usize,
    /// Whether unfinished top-priority pieces exist.
    pub time_critical: bool,
}

impl PeerRequests {
    /// Tops up the request queue to the desired depth. Returns the number of
    /// blocks added.
    ///
    /// When the pick comes up short the peer enters end-game, and if its
    /// queues are empty it gets one block already requested from someone
    /// else.
    pub fn fill_queue(&mut self, picker: &mut PiecePicker, ctx: &FillContext<'_>) -> usize {
        let queued = self.download_queue().len() + self.request_queue().len();
        let Some(budget) = self.desired_queue_size().checked_sub(queued).filter(|&b| b > 0) else {
            return 0;
        };

        let masked;
        let pieces = if self.is_choked() {
            masked = self.allowed_fast_mask(ctx.pieces);
            if masked.is_empty() {
                return 0;
            }
            &masked
        } else {
            ctx.pieces
        };

        let mut options = self.picker_options(ctx.settings, picker.num_have());
        if ctx.time_critical {
            options.piece_extent_affinity = false;
        }
        let mut added = 0;
        let mut busy = None;

        if ctx.time_critical {
            let request = PickRequest::new(pieces, budget, self.key())
                .with_options(PickOptions {
                    time_critical: true,
                    ..options
                })
                .with_num_peers(ctx.num_peers);
            let picks = picker.pick_pieces(&request);
            added += self.add_picks(picker, &picks, budget, RequestFlags::TIME_CRITICAL, &mut busy);
        }

        if added < budget {
            let contiguous = self.prefer_contiguous_blocks(ctx.settings, picker.layout());
            let suggested = self.suggested().to_vec();
            let request = PickRequest::new(pieces, budget - added, self.key())
                .with_options(options)
                .with_contiguous(contiguous)
                .with_suggested(&suggested)
                .with_num_peers(ctx.num_peers);
            let picks = picker.pick_pieces(&request);
            let limit = if contiguous > 0 { usize::MAX } else { budget - added };
            added += self.add_picks(picker, &picks, limit, RequestFlags::default(), &mut busy);
        }

        if added >= budget {
            self.set_endgame(false);
            return added;
        }

        // Allowed-fast pieces running out while choked is not end-game.
        if !self.is_choked() {
            self.set_endgame(true);
        }

        let strict_hold =
            ctx.settings.strict_end_game_mode && picker.num_downloading() < picker.num_want_left() as usize;
        let queues_empty = self.download_queue().is_empty() && self.request_queue().is_empty();
        if let Some(block) = busy {
            if !self.is_choked() && queues_empty && !strict_hold {
                if self.add_request(picker, block, RequestFlags::BUSY) {
                    debug!(peer = %self.key(), %block, "requesting busy block");
                    added += 1;
                }
            }
        }

        trace!(peer = %self.key(), budget, added, "request queue filled");
        added
    }

    /// Queues the free blocks among `picks`. The first block another peer
    /// already has requested is kept in `busy`.
    fn add_picks(
        &mut self,
        picker: &mut PiecePicker,
        picks: &[PieceBlock],
        limit: usize,
        flags: RequestFlags,
        busy: &mut Option<PieceBlock>,
    ) -> usize {
        let mut added = 0;
        for &block in picks {
            if added >= limit {
                break;
            }
            if self.has_block(block) {
                continue;
            }
            if picker.is_requested(block) {
                busy.get_or_insert(block);
                continue;
            }
            if self.add_request(picker, block, flags) {
                added += 1;
            }
        }
        added
    }
}
