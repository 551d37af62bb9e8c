use crate::pool::Buffer;

/// State of one block inside a piece that is still being assembled.
#[derive(Debug, Default)]
pub enum BlockSlot {
    #[default]
    Missing,
    /// Received and written; the manager still owns its buffer
    Held(Buffer),
    /// Received and written; its buffer already went back to the caller
    Released,
}

impl BlockSlot {
    pub fn is_received(&self) -> bool {
        !matches!(self, BlockSlot::Missing)
    }

    pub fn is_held(&self) -> bool {
        matches!(self, BlockSlot::Held(_))
    }

    /// Hand the buffer out, leaving the block marked as received.
    fn release(&mut self) -> Option<Buffer> {
        match std::mem::replace(self, BlockSlot::Released) {
            BlockSlot::Held(buffer) => Some(buffer),
            BlockSlot::Released => None,
            BlockSlot::Missing => {
                *self = BlockSlot::Missing;
                None
            }
        }
    }
}

/// Completion record of one incomplete piece: a slot per block, sized to the piece.
#[derive(Debug)]
pub struct PieceBlocks {
    slots: Vec<BlockSlot>,
    received: u32,
}

impl PieceBlocks {
    pub fn new(num_blocks: u32) -> Self {
        let mut slots = Vec::with_capacity(num_blocks as usize);
        slots.resize_with(num_blocks as usize, BlockSlot::default);
        Self { slots, received: 0 }
    }

    pub fn num_blocks(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.num_blocks()
    }

    pub fn is_received(&self, block: u32) -> bool {
        self.slots
            .get(block as usize)
            .is_some_and(BlockSlot::is_received)
    }

    /// Number of buffers this record currently owns.
    pub fn held(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_held()).count()
    }

    /// Record `block` as received and keep its buffer.
    ///
    /// Hands the buffer straight back if the block is out of range or already received.
    pub fn store(&mut self, block: u32, buffer: Buffer) -> Result<(), Buffer> {
        match self.slots.get_mut(block as usize) {
            Some(slot) if !slot.is_received() => {
                *slot = BlockSlot::Held(buffer);
                self.received += 1;
                Ok(())
            }
            _ => Err(buffer),
        }
    }

    /// Release the buffer of a single received block.
    pub fn release(&mut self, block: u32) -> Option<Buffer> {
        self.slots.get_mut(block as usize)?.release()
    }

    /// Release every buffer still held, in ascending block order.
    pub fn release_all(&mut self) -> Vec<Buffer> {
        self.slots.iter_mut().filter_map(BlockSlot::release).collect()
    }

    pub fn slots(&self) -> &[BlockSlot] {
        &self.slots
    }
}
