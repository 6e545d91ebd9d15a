//! Scheduler settings.
//!
//! [`SchedulerSettings`] holds the knobs a session exposes to users. The
//! defaults come from [`constants`](crate::constants).

use std::time::Duration;

use crate::constants::{
    INITIAL_PICKER_THRESHOLD, MAX_REQUESTS_PER_PEER, MIN_REQUEST_QUEUE, REQUEST_QUEUE_TIME,
    WHOLE_PIECES_THRESHOLD,
};
use crate::scheduler::SchedulerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Upper bound of a peer's request queue depth.
    pub max_out_request_queue: usize,
    /// Lower bound of a peer's request queue depth, unless it is snubbed.
    pub min_request_queue: usize,
    /// Seconds of data, at a peer's current rate, to keep requested.
    pub request_queue_time: Duration,
    /// Peers that would download a whole piece faster than this are asked
    /// for whole pieces.
    pub whole_pieces_threshold: Duration,
    /// Only send duplicate requests once every missing piece is in flight.
    pub strict_end_game_mode: bool,
    /// Prefer pieces close to the ones recently started.
    pub piece_extent_affinity: bool,
    /// Always finish partial pieces before starting new ones.
    pub prioritize_partial_pieces: bool,
    /// Download pieces in index order.
    pub sequential_download: bool,
    /// Pick at random until this many pieces are had, then rarest first.
    pub initial_picker_threshold: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_out_request_queue: MAX_REQUESTS_PER_PEER,
            min_request_queue: MIN_REQUEST_QUEUE,
            request_queue_time: REQUEST_QUEUE_TIME,
            whole_pieces_threshold: WHOLE_PIECES_THRESHOLD,
            strict_end_game_mode: true,
            piece_extent_affinity: false,
            prioritize_partial_pieces: false,
            sequential_download: false,
            initial_picker_threshold: INITIAL_PICKER_THRESHOLD,
        }
    }
}

impl SchedulerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_out_request_queue(mut self, max: usize) -> Self {
        self.max_out_request_queue = max;
        self
    }

    pub fn with_min_request_queue(mut self, min: usize) -> Self {
        self.min_request_queue = min;
        self
    }

    pub fn with_request_queue_time(mut self, time: Duration) -> Self {
        self.request_queue_time = time;
        self
    }

    pub fn with_whole_pieces_threshold(mut self, threshold: Duration) -> Self {
        self.whole_pieces_threshold = threshold;
        self
    }

    pub fn with_strict_end_game_mode(mut self, enabled: bool) -> Self {
        self.strict_end_game_mode = enabled;
        self
    }

    pub fn with_piece_extent_affinity(mut self, enabled: bool) -> Self {
        self.piece_extent_affinity = enabled;
        self
    }

    pub fn with_prioritize_partial_pieces(mut self, enabled: bool) -> Self {
        self.prioritize_partial_pieces = enabled;
        self
    }

    pub fn with_sequential_download(mut self, enabled: bool) -> Self {
        self.sequential_download = enabled;
        self
    }

    pub fn with_initial_picker_threshold(mut self, pieces: u32) -> Self {
        self.initial_picker_threshold = pieces;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.min_request_queue == 0 {
            return Err(SchedulerError::InvalidSettings(
                "min_request_queue must be at least 1".into(),
            ));
        }
        if self.max_out_request_queue < self.min_request_queue {
            return Err(SchedulerError::InvalidSettings(format!(
                "max_out_request_queue {} is below min_request_queue {}",
                self.max_out_request_queue, self.min_request_queue
            )));
        }
        if self.request_queue_time.is_zero() {
            return Err(SchedulerError::InvalidSettings(
                "request_queue_time must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
