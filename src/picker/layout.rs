use crate::constants::{BLOCK_SIZE, MAX_BLOCKS_PER_PIECE, PIECE_EXTENT_BYTES};
use crate::peer::BlockRequest;

use super::block::PieceBlock;
use super::error::PickerError;

/// Piece and block geometry of a torrent.
///
/// Every piece but the last is `piece_length` bytes long; every block but
/// the last of a piece is `block_size` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    total_length: u64,
    piece_length: u32,
    block_size: u32,
    num_pieces: u32,
    blocks_per_piece: u32,
    blocks_in_last_piece: u32,
}

impl PieceLayout {
    /// Layout with the standard 16 KiB block size.
    pub fn new(total_length: u64, piece_length: u32) -> Result<Self, PickerError> {
        Self::with_block_size(total_length, piece_length, BLOCK_SIZE)
    }

    pub fn with_block_size(
        total_length: u64,
        piece_length: u32,
        block_size: u32,
    ) -> Result<Self, PickerError> {
        if total_length == 0 {
            return Err(PickerError::InvalidLayout("torrent has no data".into()));
        }
        if piece_length == 0 || block_size == 0 {
            return Err(PickerError::InvalidLayout(format!(
                "piece length {piece_length} and block size {block_size} must be non-zero"
            )));
        }

        let num_pieces = total_length.div_ceil(piece_length as u64);
        if num_pieces >= u32::MAX as u64 {
            return Err(PickerError::InvalidLayout(format!(
                "{num_pieces} pieces is too many"
            )));
        }
        let num_pieces = num_pieces as u32;

        // A piece shorter than a block is a single block.
        let block_size = block_size.min(piece_length);
        let blocks_per_piece = block_count(piece_length as u64, block_size);
        if blocks_per_piece > MAX_BLOCKS_PER_PIECE {
            return Err(PickerError::InvalidLayout(format!(
                "{blocks_per_piece} blocks per piece exceeds {MAX_BLOCKS_PER_PIECE}"
            )));
        }

        let last_piece_length = total_length - (num_pieces as u64 - 1) * piece_length as u64;
        let blocks_in_last_piece = block_count(last_piece_length, block_size);

        Ok(Self {
            total_length,
            piece_length,
            block_size,
            num_pieces,
            blocks_per_piece,
            blocks_in_last_piece,
        })
    }

    /// Layout of `num_pieces` pieces of exactly `blocks_per_piece`
    /// standard-size blocks.
    pub fn with_blocks(num_pieces: u32, blocks_per_piece: u32) -> Result<Self, PickerError> {
        let piece_length = blocks_per_piece
            .checked_mul(BLOCK_SIZE)
            .ok_or_else(|| PickerError::InvalidLayout("piece length overflows".into()))?;
        Self::new(num_pieces as u64 * piece_length as u64, piece_length)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn blocks_per_piece(&self) -> u32 {
        self.blocks_per_piece
    }

    pub fn blocks_in_last_piece(&self) -> u32 {
        self.blocks_in_last_piece
    }

    /// Size of `piece` in bytes. Only the last piece may be short.
    pub fn piece_size(&self, piece: u32) -> u32 {
        debug_assert!(piece < self.num_pieces);
        if piece + 1 == self.num_pieces {
            (self.total_length - piece as u64 * self.piece_length as u64) as u32
        } else {
            self.piece_length
        }
    }

    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        debug_assert!(piece < self.num_pieces);
        if piece + 1 == self.num_pieces {
            self.blocks_in_last_piece
        } else {
            self.blocks_per_piece
        }
    }

    pub fn block_length(&self, block: PieceBlock) -> u32 {
        block_length(
            self.piece_size(block.piece_index) as u64,
            block.block_index,
            self.block_size,
        )
    }

    /// The wire request for `block`.
    pub fn block_request(&self, block: PieceBlock) -> BlockRequest {
        BlockRequest::new(
            block.piece_index,
            block.block_index * self.block_size,
            self.block_length(block),
        )
    }

    /// Maps a wire request back to the block it names.
    ///
    /// The request must start on a block boundary and cover exactly one
    /// block.
    pub fn block_for(&self, request: &BlockRequest) -> Result<PieceBlock, PickerError> {
        if request.piece >= self.num_pieces {
            return Err(PickerError::InvalidPieceIndex(request.piece));
        }
        let invalid = PickerError::InvalidBlock {
            piece: request.piece,
            offset: request.offset,
            length: request.length,
        };
        if request.offset % self.block_size != 0 {
            return Err(invalid);
        }
        let block = PieceBlock::new(request.piece, request.offset / self.block_size);
        if block.block_index >= self.blocks_in_piece(request.piece)
            || request.length != self.block_length(block)
        {
            return Err(invalid);
        }
        Ok(block)
    }

    /// Number of pieces in one piece extent, at least one.
    pub fn extent_pieces(&self) -> u32 {
        (PIECE_EXTENT_BYTES / self.piece_length as u64).max(1) as u32
    }

    /// Extent containing `piece`.
    pub fn extent_of(&self, piece: u32) -> u32 {
        piece / self.extent_pieces()
    }
}

fn block_count(piece_length: u64, block_size: u32) -> u32 {
    piece_length.div_ceil(block_size as u64) as u32
}

fn block_length(piece_length: u64, block_index: u32, block_size: u32) -> u32 {
    let offset = block_index as u64 * block_size as u64;
    let remaining = piece_length.saturating_sub(offset);
    remaining.min(block_size as u64) as u32
}
