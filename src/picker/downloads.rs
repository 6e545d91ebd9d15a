use super::index::PieceState;

/// Sub-bucket a partially downloaded piece lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadQueue {
    /// Some blocks are still unrequested.
    Downloading,
    /// Like `Downloading`, but every requester so far asked in reverse order.
    DownloadingReverse,
    /// Every block is requested, writing or finished.
    Full,
    /// `Full`, requested by reverse pickers.
    FullReverse,
    /// Every block is writing or finished.
    Finished,
    /// The piece was filtered while partially downloaded.
    ZeroPriority,
}

const QUEUE_COUNT: usize = 6;
const NO_ENTRY: u32 = u32::MAX;

impl DownloadQueue {
    pub const ALL: [DownloadQueue; QUEUE_COUNT] = [
        DownloadQueue::Downloading,
        DownloadQueue::DownloadingReverse,
        DownloadQueue::Full,
        DownloadQueue::FullReverse,
        DownloadQueue::Finished,
        DownloadQueue::ZeroPriority,
    ];

    fn slot(self) -> usize {
        match self {
            DownloadQueue::Downloading => 0,
            DownloadQueue::DownloadingReverse => 1,
            DownloadQueue::Full => 2,
            DownloadQueue::FullReverse => 3,
            DownloadQueue::Finished => 4,
            DownloadQueue::ZeroPriority => 5,
        }
    }
}

impl From<DownloadQueue> for PieceState {
    fn from(queue: DownloadQueue) -> Self {
        match queue {
            DownloadQueue::Downloading => PieceState::Downloading,
            DownloadQueue::DownloadingReverse => PieceState::DownloadingReverse,
            DownloadQueue::Full => PieceState::Full,
            DownloadQueue::FullReverse => PieceState::FullReverse,
            DownloadQueue::Finished => PieceState::Finished,
            DownloadQueue::ZeroPriority => PieceState::ZeroPriority,
        }
    }
}

/// A piece with at least one block that is not in the `None` state.
#[derive(Debug, Clone)]
pub(crate) struct DownloadingPiece {
    pub index: u32,
    /// Slot in the block ledger holding this piece's blocks.
    pub ledger_slot: u32,
    pub finished: u32,
    pub writing: u32,
    pub requested: u32,
    pub pad_blocks: u32,
    pub queue: DownloadQueue,
    queue_pos: u32,
    /// Every outstanding request came from a reverse picker.
    pub reverse: bool,
    /// No new requests until unlocked or restored.
    pub locked: bool,
    pub hashing: bool,
    pub passed_hash_check: bool,
}

impl DownloadingPiece {
    /// The sub-bucket the counters put this piece in.
    pub fn classify(&self, blocks_in_piece: u32, priority: u8) -> DownloadQueue {
        let done = self.finished + self.writing;
        if priority == 0 {
            DownloadQueue::ZeroPriority
        } else if done + self.requested < blocks_in_piece {
            if self.reverse {
                DownloadQueue::DownloadingReverse
            } else {
                DownloadQueue::Downloading
            }
        } else if self.requested > 0 {
            if self.reverse {
                DownloadQueue::FullReverse
            } else {
                DownloadQueue::Full
            }
        } else {
            DownloadQueue::Finished
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finished + self.writing + self.requested == 0
    }

    /// Blocks nobody has asked for yet.
    pub fn unrequested(&self, blocks_in_piece: u32) -> u32 {
        blocks_in_piece.saturating_sub(self.finished + self.writing + self.requested)
    }
}

/// Index of partially downloaded pieces.
///
/// Entries are stored densely and looked up by piece through `slot_of`.
/// Each entry is also listed in exactly one [`DownloadQueue`] bucket, and
/// moving between buckets is O(1).
#[derive(Debug)]
pub(crate) struct DownloadRegistry {
    slot_of: Vec<u32>,
    entries: Vec<DownloadingPiece>,
    queues: [Vec<u32>; QUEUE_COUNT],
}

impl DownloadRegistry {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            slot_of: vec![NO_ENTRY; num_pieces as usize],
            entries: Vec::new(),
            queues: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.slot_of[piece as usize] != NO_ENTRY
    }

    pub fn get(&self, piece: u32) -> Option<&DownloadingPiece> {
        match self.slot_of[piece as usize] {
            NO_ENTRY => None,
            slot => Some(&self.entries[slot as usize]),
        }
    }

    /// Counter updates through this reference must be followed by a
    /// [`set_queue`](Self::set_queue) if they change the classification.
    pub fn get_mut(&mut self, piece: u32) -> Option<&mut DownloadingPiece> {
        match self.slot_of[piece as usize] {
            NO_ENTRY => None,
            slot => Some(&mut self.entries[slot as usize]),
        }
    }

    pub fn insert(
        &mut self,
        piece: u32,
        ledger_slot: u32,
        queue: DownloadQueue,
        reverse: bool,
    ) -> &mut DownloadingPiece {
        debug_assert!(!self.contains(piece), "piece {piece} already downloading");
        let bucket = &mut self.queues[queue.slot()];
        let queue_pos = bucket.len() as u32;
        bucket.push(piece);

        let slot = self.entries.len();
        self.slot_of[piece as usize] = slot as u32;
        self.entries.push(DownloadingPiece {
            index: piece,
            ledger_slot,
            finished: 0,
            writing: 0,
            requested: 0,
            pad_blocks: 0,
            queue,
            queue_pos,
            reverse,
            locked: false,
            hashing: false,
            passed_hash_check: false,
        });
        &mut self.entries[slot]
    }

    pub fn remove(&mut self, piece: u32) -> Option<DownloadingPiece> {
        let slot = self.slot_of[piece as usize];
        if slot == NO_ENTRY {
            return None;
        }
        let (queue, pos) = {
            let entry = &self.entries[slot as usize];
            (entry.queue, entry.queue_pos)
        };
        self.unlink(queue, pos);

        self.slot_of[piece as usize] = NO_ENTRY;
        let entry = self.entries.swap_remove(slot as usize);
        if let Some(moved) = self.entries.get(slot as usize) {
            self.slot_of[moved.index as usize] = slot;
        }
        Some(entry)
    }

    /// Moves `piece` to the `queue` bucket.
    pub fn set_queue(&mut self, piece: u32, queue: DownloadQueue) {
        let slot = self.slot_of[piece as usize];
        if slot == NO_ENTRY {
            return;
        }
        let (old, pos) = {
            let entry = &self.entries[slot as usize];
            (entry.queue, entry.queue_pos)
        };
        if old == queue {
            return;
        }
        self.unlink(old, pos);

        let bucket = &mut self.queues[queue.slot()];
        let entry = &mut self.entries[slot as usize];
        entry.queue = queue;
        entry.queue_pos = bucket.len() as u32;
        bucket.push(piece);
    }

    /// Pieces currently in the `queue` bucket.
    pub fn queue(&self, queue: DownloadQueue) -> &[u32] {
        &self.queues[queue.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &DownloadingPiece> {
        self.entries.iter()
    }

    fn unlink(&mut self, queue: DownloadQueue, pos: u32) {
        let bucket = &mut self.queues[queue.slot()];
        bucket.swap_remove(pos as usize);
        if let Some(&moved) = bucket.get(pos as usize) {
            let slot = self.slot_of[moved as usize];
            self.entries[slot as usize].queue_pos = pos;
        }
    }

    #[cfg(test)]
    pub fn check_invariant(&self) {
        let mut listed = 0;
        for queue in DownloadQueue::ALL {
            for (pos, &piece) in self.queue(queue).iter().enumerate() {
                let entry = self.get(piece).expect("queued piece has an entry");
                assert_eq!(entry.queue, queue);
                assert_eq!(entry.queue_pos as usize, pos);
                listed += 1;
            }
        }
        assert_eq!(listed, self.entries.len());
        for (slot, entry) in self.entries.iter().enumerate() {
            assert_eq!(self.slot_of[entry.index as usize] as usize, slot);
        }
    }
}
