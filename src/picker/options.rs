/// Per-call switches for [`PiecePicker::pick_pieces`](super::PiecePicker::pick_pieces).
///
/// `rarest_first` and `sequential` are mutually exclusive. With neither set
/// the picker starts at a random piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PickOptions {
    pub rarest_first: bool,
    /// Pick the most common pieces first, or walk sequential order
    /// backwards. Used for slow peers so they stay off the pieces fast
    /// peers are working on.
    pub reverse: bool,
    /// Only pieces no other peer has touched.
    pub on_parole: bool,
    /// Finish partial pieces before starting new ones.
    pub prioritize_partials: bool,
    pub sequential: bool,
    /// Only top-priority pieces.
    pub time_critical: bool,
    /// Prefer pieces in recently started extents.
    pub piece_extent_affinity: bool,
    /// Align whole-piece runs on multiples of their length.
    pub align_expanded_pieces: bool,
}

impl PickOptions {
    pub const RAREST_FIRST: u16 = 0x01;
    pub const REVERSE: u16 = 0x02;
    pub const ON_PAROLE: u16 = 0x04;
    pub const PRIORITIZE_PARTIALS: u16 = 0x08;
    pub const SEQUENTIAL: u16 = 0x10;
    pub const TIME_CRITICAL: u16 = 0x20;
    pub const PIECE_EXTENT_AFFINITY: u16 = 0x40;
    pub const ALIGN_EXPANDED_PIECES: u16 = 0x80;

    pub fn rarest_first() -> Self {
        Self {
            rarest_first: true,
            ..Self::default()
        }
    }

    pub fn sequential() -> Self {
        Self {
            sequential: true,
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.rarest_first && self.sequential)
    }

    pub fn from_bits(b: u16) -> Self {
        Self {
            rarest_first: (b & Self::RAREST_FIRST) != 0,
            reverse: (b & Self::REVERSE) != 0,
            on_parole: (b & Self::ON_PAROLE) != 0,
            prioritize_partials: (b & Self::PRIORITIZE_PARTIALS) != 0,
            sequential: (b & Self::SEQUENTIAL) != 0,
            time_critical: (b & Self::TIME_CRITICAL) != 0,
            piece_extent_affinity: (b & Self::PIECE_EXTENT_AFFINITY) != 0,
            align_expanded_pieces: (b & Self::ALIGN_EXPANDED_PIECES) != 0,
        }
    }

    pub fn to_bits(self) -> u16 {
        let mut b = 0u16;
        if self.rarest_first {
            b |= Self::RAREST_FIRST;
        }
        if self.reverse {
            b |= Self::REVERSE;
        }
        if self.on_parole {
            b |= Self::ON_PAROLE;
        }
        if self.prioritize_partials {
            b |= Self::PRIORITIZE_PARTIALS;
        }
        if self.sequential {
            b |= Self::SEQUENTIAL;
        }
        if self.time_critical {
            b |= Self::TIME_CRITICAL;
        }
        if self.piece_extent_affinity {
            b |= Self::PIECE_EXTENT_AFFINITY;
        }
        if self.align_expanded_pieces {
            b |= Self::ALIGN_EXPANDED_PIECES;
        }
        b
    }
}
