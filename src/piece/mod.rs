use std::fmt;

use crate::error::{Error, Result};

// ED2K transfer unit: 190 KB blocks, 50 blocks per 9 728 000 byte piece
pub const BLOCK_SIZE: u32 = 190 * 1024;
pub const BLOCKS_PER_PIECE: u32 = 50;
pub const PIECE_SIZE: u64 = BLOCK_SIZE as u64 * BLOCKS_PER_PIECE as u64;

pub type PieceIndex = u32;

/// One block of a file: `block_in_piece` counts blocks inside piece `piece_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddress {
    pub piece_index: PieceIndex,
    pub block_in_piece: u32,
}

impl BlockAddress {
    pub fn new(piece_index: PieceIndex, block_in_piece: u32) -> Self {
        Self {
            piece_index,
            block_in_piece,
        }
    }

    /// Position of the block counted from the start of the file.
    pub fn global_index(&self, blocks_per_piece: u32) -> u64 {
        self.piece_index as u64 * blocks_per_piece as u64 + self.block_in_piece as u64
    }

    pub fn from_global_index(index: u64, blocks_per_piece: u32) -> Self {
        let per_piece = blocks_per_piece as u64;
        Self {
            piece_index: (index / per_piece) as PieceIndex,
            block_in_piece: (index % per_piece) as u32,
        }
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.piece_index, self.block_in_piece)
    }
}

/// Piece and block geometry of one file.
///
/// Every piece holds `blocks_per_piece` blocks except the last one, which holds
/// `blocks_in_last_piece`. The session layer supplies these numbers; the manager never
/// infers them from what is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    pub block_size: u32,
    pub blocks_per_piece: u32,
    pub piece_count: u32,
    pub blocks_in_last_piece: u32,
}

impl PieceLayout {
    pub fn new(piece_count: u32, blocks_in_last_piece: u32) -> Self {
        Self {
            block_size: BLOCK_SIZE,
            blocks_per_piece: BLOCKS_PER_PIECE,
            piece_count,
            blocks_in_last_piece,
        }
    }

    /// Geometry of a file of `total_size` bytes with default block and piece sizes.
    pub fn from_file_size(total_size: u64) -> Self {
        Self::from_file_size_with(total_size, BLOCK_SIZE, BLOCKS_PER_PIECE)
    }

    pub fn from_file_size_with(total_size: u64, block_size: u32, blocks_per_piece: u32) -> Self {
        if block_size == 0 || blocks_per_piece == 0 {
            // Left for validate() to reject.
            return Self {
                block_size,
                blocks_per_piece,
                piece_count: 0,
                blocks_in_last_piece: 0,
            };
        }

        let total_blocks = total_size.div_ceil(block_size as u64);
        let piece_count = total_blocks.div_ceil(blocks_per_piece as u64);
        let blocks_in_last_piece = if piece_count == 0 {
            0
        } else {
            total_blocks - (piece_count - 1) * blocks_per_piece as u64
        };

        Self {
            block_size,
            blocks_per_piece,
            piece_count: piece_count as u32,
            blocks_in_last_piece: blocks_in_last_piece as u32,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_blocks_per_piece(mut self, blocks_per_piece: u32) -> Self {
        self.blocks_per_piece = blocks_per_piece;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidLayout("block size must be positive".into()));
        }
        if self.blocks_per_piece == 0 {
            return Err(Error::InvalidLayout(
                "a piece must hold at least one block".into(),
            ));
        }
        if self.piece_count == 0 {
            return Err(Error::InvalidLayout("file has no pieces".into()));
        }
        if self.blocks_in_last_piece == 0 || self.blocks_in_last_piece > self.blocks_per_piece {
            return Err(Error::InvalidLayout(format!(
                "last piece holds {} blocks, expected 1..={}",
                self.blocks_in_last_piece, self.blocks_per_piece
            )));
        }
        Ok(())
    }

    /// Number of blocks in `piece`, 0 for pieces past the end of the file.
    pub fn blocks_in_piece(&self, piece: PieceIndex) -> u32 {
        if piece >= self.piece_count {
            0
        } else if piece == self.piece_count - 1 {
            self.blocks_in_last_piece
        } else {
            self.blocks_per_piece
        }
    }

    pub fn total_blocks(&self) -> u64 {
        if self.piece_count == 0 {
            return 0;
        }
        (self.piece_count as u64 - 1) * self.blocks_per_piece as u64
            + self.blocks_in_last_piece as u64
    }

    pub fn contains(&self, address: BlockAddress) -> bool {
        address.block_in_piece < self.blocks_in_piece(address.piece_index)
    }

    pub fn check(&self, address: BlockAddress) -> Result<()> {
        if self.contains(address) {
            Ok(())
        } else {
            Err(Error::InvalidAddress {
                address,
                pieces: self.piece_count,
            })
        }
    }

    pub fn global_index(&self, address: BlockAddress) -> u64 {
        address.global_index(self.blocks_per_piece)
    }

    pub fn address_of(&self, global_index: u64) -> BlockAddress {
        BlockAddress::from_global_index(global_index, self.blocks_per_piece)
    }

    /// Byte offset of the first byte of `address` in the file.
    pub fn block_offset(&self, address: BlockAddress) -> u64 {
        self.global_index(address) * self.block_size as u64
    }

    /// Global index of the first block of `piece`.
    pub fn first_block_of(&self, piece: PieceIndex) -> u64 {
        piece as u64 * self.blocks_per_piece as u64
    }

    /// Every block of the file in ascending global order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockAddress> + '_ {
        (0..self.total_blocks()).map(move |index| self.address_of(index))
    }
}

pub mod block_manager;
pub mod piece_manager;

pub use block_manager::{BlockSlot, PieceBlocks};
pub use piece_manager::{PieceManager, PieceState, Restored};
