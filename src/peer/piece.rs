use std::fmt;

/// A block request as it appears on the wire (REQUEST, CANCEL, REJECT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Offset one past the last byte covered by the request.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} [{}..{})", self.piece, self.offset, self.end())
    }
}
