use thiserror::Error;

/// Errors reported by the picker for input it cannot trust.
///
/// Caller bugs (marking a block twice, calling `we_have` on a piece we
/// already have) are debug assertions instead; these variants cover values
/// that arrive from the wire or from user configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickerError {
    /// Piece index past the end of the torrent.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// Offset and length do not describe a block of the piece.
    #[error("invalid block: piece {piece}, offset {offset}, length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    /// Piece priority outside 0..=7.
    #[error("invalid piece priority: {0}")]
    InvalidPriority(u8),

    /// A piece set sized for a different torrent.
    #[error("bitfield length mismatch: expected {expected} pieces, got {actual}")]
    BitfieldLength { expected: usize, actual: usize },

    /// Torrent geometry the picker cannot represent.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}
