use std::io;

use crate::piece::BlockAddress;
use crate::pool::Buffer;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Block {address} is outside the file layout ({pieces} pieces)")]
    InvalidAddress { address: BlockAddress, pieces: u32 },

    #[error("Block {0} was already received")]
    DuplicateBlock(BlockAddress),

    #[error("Block {0} carries no data")]
    EmptyBlock(BlockAddress),

    #[error("Storage I/O failed at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("Buffer pool exhausted: {outstanding} buffers outstanding (limit {limit})")]
    PoolExhausted { outstanding: usize, limit: usize },

    #[error("Buffer was not issued by this pool")]
    ForeignBuffer,

    #[error("Block data of {len} bytes does not fit in {capacity} bytes")]
    BufferOverflow { len: usize, capacity: usize },

    #[error("Invalid piece layout: {0}")]
    InvalidLayout(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A block the piece manager refused, handed back together with its buffer.
///
/// Nothing was recorded for the block, so the caller owns the buffer again and decides whether
/// to retry or return it to the pool.
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct Rejected {
    #[source]
    pub error: Error,
    pub buffer: Buffer,
}

impl Rejected {
    pub(crate) fn new(error: Error, buffer: Buffer) -> Self {
        Self { error, buffer }
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}
