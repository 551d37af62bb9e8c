//! Disk-backed assembly of files that arrive as out-of-order blocks.
//!
//! Blocks are staged in buffers drawn from a shared [`BufferPool`], written through to
//! [`Storage`] by a [`PieceManager`], and handed back for reuse once the release frontier or a
//! completed piece makes that safe. A manager can also rebuild its state from a partially
//! written file when a transfer resumes.

pub mod client;
pub mod error;
pub mod file;
pub mod piece;
pub mod pool;

pub use error::{Error, Rejected, Result};
pub use file::{DiskFile, MemoryStorage, Storage};
pub use piece::{
    BlockAddress, PieceLayout, PieceManager, PieceState, Restored, BLOCKS_PER_PIECE, BLOCK_SIZE,
    PIECE_SIZE,
};
pub use pool::{Buffer, BufferPool, PoolConfig};
