use std::fmt;

use crate::peer::PeerKey;

/// Identifies one block: a piece index and the block's index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceBlock {
    pub piece_index: u32,
    pub block_index: u32,
}

impl PieceBlock {
    pub const fn new(piece_index: u32, block_index: u32) -> Self {
        Self {
            piece_index,
            block_index,
        }
    }
}

impl fmt::Display for PieceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.piece_index, self.block_index)
    }
}

/// Download state of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    /// Nobody has been asked for the block.
    #[default]
    None,
    /// Requested from one or more peers.
    Requested,
    /// Received and handed to the disk layer.
    Writing,
    /// Written to disk.
    Finished,
}

/// Per-block bookkeeping kept in the [`BlockLedger`](super::ledger::BlockLedger).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    /// Last peer that requested or delivered the block.
    pub peer: Option<PeerKey>,
    /// Number of peers the block is currently requested from.
    pub num_peers: u16,
    pub state: BlockState,
}
