use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace, warn};

use super::block_manager::PieceBlocks;
use super::{BlockAddress, PieceIndex, PieceLayout};
use crate::error::{Error, Rejected, Result};
use crate::file::Storage;
use crate::pool::Buffer;

/// Where a piece stands in its Empty -> Partial -> Released progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Empty,
    Partial { received: u32 },
    Released,
}

/// Outcome of restoring one block from storage.
#[derive(Debug)]
pub enum Restored {
    /// Data was on disk and the block is now recorded; carries the buffers that became releasable
    Recorded(Vec<Buffer>),
    /// Nothing on disk for this block; the unused buffer goes back to the caller
    Absent(Buffer),
}

impl Restored {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Restored::Recorded(_))
    }
}

/// Assembles one file from blocks arriving in any order.
///
/// Every block is written through to storage as soon as it arrives. The manager then holds on
/// to the block's buffer until one of two things makes it safe to give back:
/// - the release frontier (the longest run of received blocks from the start of the file)
///   moves past the block, or
/// - the block's piece becomes complete.
///
/// Buffers are only ever handed back to the caller, who returns them to the pool.
pub struct PieceManager<S> {
    storage: S,
    layout: PieceLayout,
    /// Completion records of pieces that have some, but not all, blocks
    pieces: BTreeMap<PieceIndex, PieceBlocks>,
    /// Pieces released on completion that the frontier has not reached yet
    completed_ahead: BTreeSet<PieceIndex>,
    /// Global index of the first block not yet released by the frontier
    frontier: u64,
}

impl<S: Storage> PieceManager<S> {
    pub fn new(storage: S, layout: PieceLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self {
            storage,
            layout,
            pieces: BTreeMap::new(),
            completed_ahead: BTreeSet::new(),
            frontier: 0,
        })
    }

    /// Persist a freshly received block and record it.
    ///
    /// Returns the buffers that became releasable, usually none for an interior block of an
    /// unfinished piece. On failure nothing is recorded and the buffer comes back inside
    /// [`Rejected`].
    pub fn write_block(
        &mut self,
        address: BlockAddress,
        buffer: Buffer,
    ) -> Result<Vec<Buffer>, Rejected> {
        if buffer.is_empty() {
            return Err(Rejected::new(Error::EmptyBlock(address), buffer));
        }
        if let Err(error) = self.admit(address, buffer.len()) {
            return Err(Rejected::new(error, buffer));
        }

        let offset = self.layout.block_offset(address);
        if let Err(source) = self.storage.write_at(offset, &buffer) {
            warn!("Failed to write block {} at offset {}: {}", address, offset, source);
            return Err(Rejected::new(Error::Io { offset, source }, buffer));
        }
        trace!("Block {} written at offset {}", address, offset);

        self.record(address, buffer)
    }

    /// Recover a block that may already be on disk from an earlier session.
    ///
    /// Reads the block's range, clamped to `expected_total_size`, into `buffer`. If anything
    /// was read the block is recorded exactly as if it had just been written. Storage is never
    /// written.
    pub fn restore_block(
        &mut self,
        address: BlockAddress,
        mut buffer: Buffer,
        expected_total_size: u64,
    ) -> Result<Restored, Rejected> {
        if let Err(error) = self.admit(address, 0) {
            return Err(Rejected::new(error, buffer));
        }

        let offset = self.layout.block_offset(address);
        let len = expected_total_size
            .saturating_sub(offset)
            .min(self.layout.block_size as u64) as usize;
        if len == 0 {
            return Ok(Restored::Absent(buffer));
        }
        if len > buffer.capacity() {
            return Err(Rejected::new(
                Error::BufferOverflow {
                    len,
                    capacity: buffer.capacity(),
                },
                buffer,
            ));
        }

        let read = match self.storage.read_at(offset, buffer.read_window(len)) {
            Ok(read) => read,
            Err(source) => {
                buffer.clear();
                return Err(Rejected::new(Error::Io { offset, source }, buffer));
            }
        };
        buffer.truncate(read);
        if read == 0 {
            return Ok(Restored::Absent(buffer));
        }
        debug!("Restored {} bytes of block {}", read, address);

        self.record(address, buffer).map(Restored::Recorded)
    }

    /// Give back every buffer still held, whatever state the pieces are in.
    ///
    /// Used when the transfer pauses or stops. Afterwards the manager holds nothing and is
    /// back in its freshly constructed state.
    pub fn release_file(&mut self) -> Vec<Buffer> {
        let buffers: Vec<Buffer> = std::mem::take(&mut self.pieces)
            .into_values()
            .flat_map(|mut record| record.release_all())
            .collect();

        self.completed_ahead.clear();
        self.frontier = 0;

        info!("Released file, returning {} held buffers", buffers.len());
        buffers
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Take the storage back, together with every buffer the manager still held.
    pub fn into_storage(mut self) -> (S, Vec<Buffer>) {
        let held = self.release_file();
        (self.storage, held)
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Number of buffers currently owned by the manager.
    pub fn retained_buffers(&self) -> usize {
        self.pieces.values().map(PieceBlocks::held).sum()
    }

    pub fn is_block_received(&self, address: BlockAddress) -> bool {
        if !self.layout.contains(address) {
            return false;
        }
        if self.layout.global_index(address) < self.frontier
            || self.completed_ahead.contains(&address.piece_index)
        {
            return true;
        }
        self.pieces
            .get(&address.piece_index)
            .is_some_and(|record| record.is_received(address.block_in_piece))
    }

    pub fn piece_state(&self, piece: PieceIndex) -> PieceState {
        if let Some(record) = self.pieces.get(&piece) {
            return PieceState::Partial {
                received: record.received(),
            };
        }

        let blocks = self.layout.blocks_in_piece(piece) as u64;
        let below_frontier = self.layout.first_block_of(piece) + blocks <= self.frontier;
        if blocks > 0 && (below_frontier || self.completed_ahead.contains(&piece)) {
            PieceState::Released
        } else {
            PieceState::Empty
        }
    }

    fn admit(&self, address: BlockAddress, len: usize) -> Result<()> {
        self.layout.check(address)?;
        if len > self.layout.block_size as usize {
            return Err(Error::BufferOverflow {
                len,
                capacity: self.layout.block_size as usize,
            });
        }
        if self.is_block_received(address) {
            return Err(Error::DuplicateBlock(address));
        }
        Ok(())
    }

    /// Bookkeeping shared by write and restore once the data is known to be on disk.
    fn record(
        &mut self,
        address: BlockAddress,
        buffer: Buffer,
    ) -> Result<Vec<Buffer>, Rejected> {
        let piece = address.piece_index;
        let num_blocks = self.layout.blocks_in_piece(piece);
        let record = self
            .pieces
            .entry(piece)
            .or_insert_with(|| PieceBlocks::new(num_blocks));

        if let Err(buffer) = record.store(address.block_in_piece, buffer) {
            return Err(Rejected::new(Error::DuplicateBlock(address), buffer));
        }

        // Frontier first so the result stays in ascending global order.
        let mut released = self.advance_frontier();

        let completed = self
            .pieces
            .get(&piece)
            .is_some_and(PieceBlocks::is_complete);
        if completed {
            if let Some(mut record) = self.pieces.remove(&piece) {
                released.extend(record.release_all());
            }
            // Still ahead of the frontier, otherwise advance_frontier would have taken it.
            self.completed_ahead.insert(piece);
            info!("Piece {} complete ahead of frontier {}", piece, self.frontier);
        }

        if !released.is_empty() {
            debug!(
                "Block {} released {} buffers, frontier at {}",
                address,
                released.len(),
                self.frontier
            );
        }
        Ok(released)
    }

    /// Move the frontier over the longest run of received blocks starting at it.
    fn advance_frontier(&mut self) -> Vec<Buffer> {
        let total = self.layout.total_blocks();
        let start = self.frontier;
        let mut released = Vec::new();

        while self.frontier < total {
            let address = self.layout.address_of(self.frontier);
            let piece = address.piece_index;

            if self.completed_ahead.remove(&piece) {
                // Its buffers went out when it completed, just skip over it.
                self.frontier =
                    self.layout.first_block_of(piece) + self.layout.blocks_in_piece(piece) as u64;
                continue;
            }

            let Some(record) = self.pieces.get_mut(&piece) else {
                break;
            };
            if !record.is_received(address.block_in_piece) {
                break;
            }

            released.extend(record.release(address.block_in_piece));
            self.frontier += 1;

            if address.block_in_piece + 1 == record.num_blocks() {
                self.pieces.remove(&piece);
                info!("Piece {} passed by frontier", piece);
            }
        }

        if self.frontier > start {
            trace!("Frontier advanced {} -> {}", start, self.frontier);
        }
        released
    }
}

impl<S> std::fmt::Debug for PieceManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceManager")
            .field("layout", &self.layout)
            .field("frontier", &self.frontier)
            .field("pieces", &self.pieces.len())
            .field("completed_ahead", &self.completed_ahead)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryStorage;
    use crate::pool::BufferPool;
    use std::io;
    use std::time::Duration;

    const BLOCK: u32 = 8;

    fn layout(piece_count: u32, blocks_per_piece: u32, blocks_in_last_piece: u32) -> PieceLayout {
        PieceLayout::new(piece_count, blocks_in_last_piece)
            .with_block_size(BLOCK)
            .with_blocks_per_piece(blocks_per_piece)
    }

    fn block_buffer(pool: &BufferPool, layout: &PieceLayout, address: BlockAddress) -> Buffer {
        let mut buffer = pool.allocate().unwrap();
        let tag = layout.global_index(address) as u8;
        buffer.fill(&[tag; BLOCK as usize]).unwrap();
        buffer
    }

    fn tags(buffers: &[Buffer]) -> Vec<u8> {
        buffers.iter().map(|b| b[0]).collect()
    }

    fn write(
        manager: &mut PieceManager<MemoryStorage>,
        pool: &BufferPool,
        piece: u32,
        block: u32,
    ) -> Vec<Buffer> {
        let address = BlockAddress::new(piece, block);
        let buffer = block_buffer(pool, manager.layout(), address);
        manager.write_block(address, buffer).unwrap()
    }

    struct FailingStorage;

    impl Storage for FailingStorage {
        fn write_at(&mut self, _offset: u64, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "unreadable"))
        }
    }

    #[test]
    fn test_invalid_layout_is_rejected() {
        let result = PieceManager::new(MemoryStorage::new(), layout(0, 3, 3));
        assert!(matches!(result, Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_first_block_advances_frontier() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(3, 4, 4)).unwrap();

        let released = write(&mut manager, &pool, 0, 0);
        assert_eq!(tags(&released), vec![0]);
        assert_eq!(manager.frontier(), 1);
        assert_eq!(manager.retained_buffers(), 0);
        assert_eq!(manager.piece_state(0), PieceState::Partial { received: 1 });
    }

    #[test]
    fn test_block_ahead_of_gap_is_held() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(3, 4, 4)).unwrap();

        assert!(write(&mut manager, &pool, 0, 2).is_empty());
        assert!(write(&mut manager, &pool, 0, 1).is_empty());
        assert_eq!(manager.frontier(), 0);
        assert_eq!(manager.retained_buffers(), 2);

        // Filling the gap releases the whole run in order.
        let released = write(&mut manager, &pool, 0, 0);
        assert_eq!(tags(&released), vec![0, 1, 2]);
        assert_eq!(manager.frontier(), 3);
    }

    #[test]
    fn test_piece_completion_ahead_of_frontier() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(3, 3, 3)).unwrap();

        assert!(write(&mut manager, &pool, 1, 2).is_empty());
        assert!(write(&mut manager, &pool, 1, 0).is_empty());
        let released = write(&mut manager, &pool, 1, 1);

        assert_eq!(tags(&released), vec![3, 4, 5]);
        assert_eq!(manager.frontier(), 0);
        assert_eq!(manager.piece_state(1), PieceState::Released);
        assert_eq!(manager.retained_buffers(), 0);
    }

    #[test]
    fn test_frontier_skips_completed_piece() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(3, 2, 2)).unwrap();

        // Piece 1 completes first, then one block of piece 2 arrives.
        write(&mut manager, &pool, 1, 0);
        assert_eq!(write(&mut manager, &pool, 1, 1).len(), 2);
        assert!(write(&mut manager, &pool, 2, 0).is_empty());

        assert!(write(&mut manager, &pool, 0, 1).is_empty());
        let released = write(&mut manager, &pool, 0, 0);

        // Piece 0 via the frontier, piece 1 skipped, then block 2.0 crossed.
        assert_eq!(tags(&released), vec![0, 1, 4]);
        assert_eq!(manager.frontier(), 5);
        assert_eq!(manager.piece_state(0), PieceState::Released);
        assert_eq!(manager.piece_state(1), PieceState::Released);
        assert_eq!(manager.piece_state(2), PieceState::Partial { received: 1 });
        assert_eq!(manager.retained_buffers(), 0);
    }

    #[test]
    fn test_block_completing_piece_at_frontier_is_released_once() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(2, 3, 3)).unwrap();

        write(&mut manager, &pool, 0, 2);
        write(&mut manager, &pool, 0, 1);
        let released = write(&mut manager, &pool, 0, 0);

        assert_eq!(tags(&released), vec![0, 1, 2]);
        assert_eq!(manager.frontier(), 3);
        assert_eq!(manager.piece_state(0), PieceState::Released);
    }

    #[test]
    fn test_short_terminal_piece_completes() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(2, 4, 1)).unwrap();

        let released = write(&mut manager, &pool, 1, 0);
        assert_eq!(tags(&released), vec![4]);
        assert_eq!(manager.piece_state(1), PieceState::Released);
    }

    #[test]
    fn test_duplicate_block_is_rejected() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(2, 3, 3)).unwrap();

        write(&mut manager, &pool, 0, 1);
        let address = BlockAddress::new(0, 1);
        let rejected = manager
            .write_block(address, block_buffer(&pool, manager.layout(), address))
            .unwrap_err();
        assert!(matches!(rejected.error, Error::DuplicateBlock(a) if a == address));
        assert_eq!(manager.retained_buffers(), 1);

        // Blocks already behind the frontier count as received too.
        write(&mut manager, &pool, 0, 0);
        let address = BlockAddress::new(0, 0);
        let rejected = manager
            .write_block(address, block_buffer(&pool, manager.layout(), address))
            .unwrap_err();
        assert!(matches!(rejected.error, Error::DuplicateBlock(_)));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(2, 3, 1)).unwrap();

        let address = BlockAddress::new(1, 1);
        let rejected = manager
            .write_block(address, pool.allocate().unwrap())
            .unwrap_err();
        assert!(matches!(rejected.error, Error::InvalidAddress { .. }));
        assert!(manager.storage().is_empty(), "Nothing may be written");
    }

    #[test]
    fn test_oversized_block_is_rejected() {
        let pool = BufferPool::with_buffer_size(2 * BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(1, 2, 2)).unwrap();

        let mut buffer = pool.allocate().unwrap();
        buffer.fill(&[1; 2 * BLOCK as usize]).unwrap();
        let rejected = manager
            .write_block(BlockAddress::new(0, 0), buffer)
            .unwrap_err();
        assert!(matches!(rejected.error, Error::BufferOverflow { .. }));
    }

    #[test]
    fn test_empty_block_is_rejected() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(1, 2, 2)).unwrap();

        let rejected = manager
            .write_block(BlockAddress::new(0, 0), pool.allocate().unwrap())
            .unwrap_err();
        assert!(matches!(rejected.error, Error::EmptyBlock(_)));
        assert!(!manager.is_block_received(BlockAddress::new(0, 0)));
        assert_eq!(manager.frontier(), 0);
        assert!(manager.storage().is_empty());
    }

    #[test]
    fn test_write_failure_returns_buffer_unrecorded() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(FailingStorage, layout(1, 2, 2)).unwrap();
        let address = BlockAddress::new(0, 0);

        let mut buffer = pool.allocate().unwrap();
        buffer.fill(b"payload!").unwrap();
        let rejected = manager.write_block(address, buffer).unwrap_err();

        assert!(matches!(rejected.error, Error::Io { offset: 0, .. }));
        assert!(!manager.is_block_received(address));
        assert_eq!(&rejected.into_buffer()[..], b"payload!");
    }

    #[test]
    fn test_restore_reads_back_written_data() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let layout = layout(2, 2, 2);
        let mut storage = MemoryStorage::new();
        {
            let mut manager = PieceManager::new(&mut storage, layout).unwrap();
            let address = BlockAddress::new(1, 1);
            let mut buffer = pool.allocate().unwrap();
            buffer.fill(b"blockdat").unwrap();
            assert!(manager.write_block(address, buffer).unwrap().is_empty());
            manager.release_file();
        }

        let mut manager = PieceManager::new(&mut storage, layout).unwrap();
        let restored = manager
            .restore_block(BlockAddress::new(1, 1), pool.allocate().unwrap(), 4 * BLOCK as u64)
            .unwrap();
        assert!(restored.is_recorded());
        assert!(manager.is_block_received(BlockAddress::new(1, 1)));

        let held = manager.release_file();
        assert_eq!(held.len(), 1);
        assert_eq!(&held[0][..], b"blockdat");
    }

    #[test]
    fn test_restore_clamps_to_expected_size() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let storage = MemoryStorage::from_bytes(b"0123456789ABCDEF".to_vec());
        let mut manager = PieceManager::new(storage, layout(1, 2, 2)).unwrap();

        // The file is expected to end 3 bytes into the second block.
        let restored = manager
            .restore_block(BlockAddress::new(0, 1), pool.allocate().unwrap(), 11)
            .unwrap();
        let Restored::Recorded(released) = restored else {
            panic!("block should be recorded");
        };
        assert!(released.is_empty());

        let held = manager.release_file();
        assert_eq!(&held[0][..], b"89A");
    }

    #[test]
    fn test_restore_beyond_file_is_absent() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let storage = MemoryStorage::from_bytes(vec![7; BLOCK as usize]);
        let mut manager = PieceManager::new(storage, layout(1, 3, 3)).unwrap();

        // Past the expected size: nothing to read.
        let restored = manager
            .restore_block(BlockAddress::new(0, 2), pool.allocate().unwrap(), 2 * BLOCK as u64)
            .unwrap();
        assert!(matches!(restored, Restored::Absent(_)));

        // Inside the expected size but past the current end of storage.
        let restored = manager
            .restore_block(BlockAddress::new(0, 1), pool.allocate().unwrap(), 3 * BLOCK as u64)
            .unwrap();
        assert!(matches!(restored, Restored::Absent(ref b) if b.is_empty()));
        assert!(!manager.is_block_received(BlockAddress::new(0, 1)));
        assert_eq!(manager.retained_buffers(), 0);
    }

    #[test]
    fn test_restore_never_writes() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(1, 1, 1)).unwrap();
        let restored = manager
            .restore_block(BlockAddress::new(0, 0), pool.allocate().unwrap(), BLOCK as u64)
            .unwrap();
        assert!(!restored.is_recorded());
        assert!(manager.storage().is_empty());
    }

    #[test]
    fn test_restore_read_failure_is_reported() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(FailingStorage, layout(1, 1, 1)).unwrap();
        let rejected = manager
            .restore_block(BlockAddress::new(0, 0), pool.allocate().unwrap(), BLOCK as u64)
            .unwrap_err();
        assert!(matches!(rejected.error, Error::Io { .. }));
        assert!(rejected.buffer.is_empty());
    }

    #[test]
    fn test_release_file_returns_everything_and_resets() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(3, 3, 3)).unwrap();

        write(&mut manager, &pool, 2, 1);
        write(&mut manager, &pool, 0, 2);
        write(&mut manager, &pool, 1, 0);

        let buffers = manager.release_file();
        assert_eq!(tags(&buffers), vec![2, 3, 7]);
        assert_eq!(manager.retained_buffers(), 0);
        assert_eq!(manager.piece_state(0), PieceState::Empty);
        assert!(manager.release_file().is_empty());

        for buffer in buffers {
            pool.deallocate(buffer, Duration::from_secs(1)).unwrap();
        }
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_into_storage_hands_back_held_buffers() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout(2, 2, 2)).unwrap();

        write(&mut manager, &pool, 1, 1);
        write(&mut manager, &pool, 0, 1);

        let (storage, held) = manager.into_storage();
        assert_eq!(tags(&held), vec![1, 3]);
        assert_eq!(storage.len(), 4 * BLOCK as u64);
        assert_eq!(&storage.as_bytes()[..BLOCK as usize], &[0; BLOCK as usize]);
    }
}
