use bytes::Bytes;

use super::error::PeerError;

/// A bitfield representing which pieces a peer has.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte, matching the
/// BITFIELD message of the peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a full bitfield, as announced by a seed or a HAVE_ALL message.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield with exactly the listed pieces set.
    ///
    /// Indices past `piece_count` are ignored.
    pub fn from_pieces<I>(piece_count: usize, pieces: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let mut bf = Self::new(piece_count);
        for piece in pieces {
            bf.set(piece as usize);
        }
        bf
    }

    /// Decodes the payload of a BITFIELD message.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes long and the
    /// spare bits at the end must be zero.
    pub fn from_bytes(bytes: Bytes, piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::BitfieldLength {
                expected,
                actual: bytes.len(),
            });
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        if bf.spare_bits_set() {
            return Err(PeerError::SpareBitsSet);
        }
        Ok(bf)
    }

    /// Encodes the bitfield as a BITFIELD message payload.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Returns true if the piece at the given index is set.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    /// Clears the bit for the piece at the given index.
    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Returns the number of set pieces.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if every piece is set.
    pub fn is_all_set(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no piece is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the total number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Iterates over the indices of set pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.piece_count)
            .filter(move |&i| self.has(i))
            .map(|i| i as u32)
    }

    /// Returns a copy with only the pieces present in both bitfields set.
    pub fn intersection(&self, other: &Bitfield) -> Bitfield {
        let bits = self
            .bits
            .iter()
            .zip(other.bits.iter().chain(std::iter::repeat(&0)))
            .map(|(a, b)| a & b)
            .collect();
        Bitfield {
            bits,
            piece_count: self.piece_count,
        }
    }

    fn spare_bits(&self) -> u8 {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare == 0 {
            0
        } else {
            !(0xFFu8 << spare)
        }
    }

    fn spare_bits_set(&self) -> bool {
        match self.bits.last() {
            Some(last) => last & self.spare_bits() != 0,
            None => false,
        }
    }

    fn clear_spare_bits(&mut self) {
        let mask = self.spare_bits();
        if let Some(last) = self.bits.last_mut() {
            *last &= !mask;
        }
    }
}
