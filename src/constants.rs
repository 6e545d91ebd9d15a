//! Scheduler constants and tuning parameters.
//!
//! This module contains the constants used by the piece picker and the
//! request scheduler: block geometry, the piece priority scale, the rank
//! arithmetic and default request queue bounds.
//!
//! Defaults follow the values used by libtorrent and qBittorrent, so a
//! swarm sees the same request behavior it would from those clients.

use std::time::Duration;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum number of blocks a single piece may be split into.
/// Per-block reference counts are stored in 16 bits.
pub const MAX_BLOCKS_PER_PIECE: u32 = 1 << 15;

/// Bytes covered by one piece extent when piece-extent affinity is enabled.
pub const PIECE_EXTENT_BYTES: u64 = 4 * 1024 * 1024;

/// Number of recently started extents the picker keeps affinity for.
pub const MAX_RECENT_EXTENTS: usize = 5;

// ============================================================================
// Piece priorities
// ============================================================================

/// Priority meaning "do not download"
pub const FILTER_PRIORITY: u8 = 0;

/// Priority every piece starts out with
pub const DEFAULT_PRIORITY: u8 = 4;

/// Highest priority. Pieces at this level are time critical.
pub const TOP_PRIORITY: u8 = 7;

/// Number of priority levels (0 through 7)
pub const PRIORITY_LEVELS: u32 = 8;

/// Multiplier separating availability levels in a piece's rank.
/// Leaves room for the three download-state adjustments below it.
pub const RANK_FACTOR: u32 = 3;

// ============================================================================
// Request queue
// ============================================================================

/// Maximum outstanding block requests per peer (libtorrent default: 500)
pub const MAX_REQUESTS_PER_PEER: usize = 500;

/// Minimum request queue depth for a peer that is not snubbed
pub const MIN_REQUEST_QUEUE: usize = 2;

/// Request queue depth before the peer's download rate is known
pub const DEFAULT_REQUEST_QUEUE: usize = 4;

/// Queue depth used for a snubbed peer
pub const SNUBBED_REQUEST_QUEUE: usize = 1;

/// Seconds of data at the peer's current rate we keep requested
pub const REQUEST_QUEUE_TIME: Duration = Duration::from_secs(3);

/// A peer that downloads a whole piece faster than this is asked for
/// whole pieces (libtorrent default: 20s)
pub const WHOLE_PIECES_THRESHOLD: Duration = Duration::from_secs(20);

// ============================================================================
// Partial pieces
// ============================================================================

/// Partial pieces are prioritized once more than `numerator / denominator`
/// pieces per connected peer are in flight.
pub const PARTIALS_PER_PEER_NUMERATOR: usize = 3;

/// See [`PARTIALS_PER_PEER_NUMERATOR`].
pub const PARTIALS_PER_PEER_DENOMINATOR: usize = 2;

/// Pieces picked at random before switching to rarest first
pub const INITIAL_PICKER_THRESHOLD: u32 = 4;
