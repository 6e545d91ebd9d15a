use super::block::BlockInfo;

/// Fixed-size, reusable storage for the block state of partial pieces.
///
/// Every downloading piece owns one slot of `blocks_per_piece` entries.
/// Released slots are reset and go on a free list, so the backing vector
/// only ever grows to the peak number of pieces in flight.
#[derive(Debug)]
pub(crate) struct BlockLedger {
    blocks: Vec<BlockInfo>,
    blocks_per_piece: usize,
    free: Vec<u32>,
}

impl BlockLedger {
    pub fn new(blocks_per_piece: u32) -> Self {
        Self {
            blocks: Vec::new(),
            blocks_per_piece: blocks_per_piece as usize,
            free: Vec::new(),
        }
    }

    /// Hands out a slot whose blocks are all in the `None` state.
    pub fn allocate(&mut self) -> u32 {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        let slot = (self.blocks.len() / self.blocks_per_piece) as u32;
        self.blocks
            .resize(self.blocks.len() + self.blocks_per_piece, BlockInfo::default());
        slot
    }

    pub fn release(&mut self, slot: u32) {
        debug_assert!(!self.free.contains(&slot), "slot {slot} released twice");
        self.blocks_mut(slot).fill(BlockInfo::default());
        self.free.push(slot);
    }

    pub fn blocks(&self, slot: u32) -> &[BlockInfo] {
        let start = slot as usize * self.blocks_per_piece;
        &self.blocks[start..start + self.blocks_per_piece]
    }

    pub fn blocks_mut(&mut self, slot: u32) -> &mut [BlockInfo] {
        let start = slot as usize * self.blocks_per_piece;
        &mut self.blocks[start..start + self.blocks_per_piece]
    }

    /// Number of slots currently handed out.
    pub fn slots_in_use(&self) -> usize {
        self.blocks.len() / self.blocks_per_piece - self.free.len()
    }
}
