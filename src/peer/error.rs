use thiserror::Error;

/// Errors raised while interpreting what a peer told us.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    /// The BITFIELD payload has the wrong size for this torrent.
    #[error("bitfield length mismatch: expected {expected} bytes, got {actual}")]
    BitfieldLength { expected: usize, actual: usize },

    /// The BITFIELD payload has bits set past the last piece.
    #[error("bitfield has spare bits set")]
    SpareBitsSet,
}
