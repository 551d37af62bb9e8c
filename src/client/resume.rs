use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::state::ResumeReport;
use crate::error::Result;
use crate::file::Storage;
use crate::piece::{BlockAddress, PieceManager, Restored};
use crate::pool::BufferPool;

/// Rebuild a fresh manager's completion state from blocks an earlier session wrote.
///
/// Only the addresses in `written` are read back: storage cannot tell a block that was
/// written from a hole that reads as zeros. Each of them with data within `expected_size`
/// bytes is restored; every other block is reported missing. Every buffer used along the way
/// goes back to `pool`.
#[instrument(skip(manager, pool, written))]
pub fn restore_from_storage<S, I>(
    manager: &mut PieceManager<S>,
    pool: &BufferPool,
    written: I,
    expected_size: u64,
    linger: Duration,
) -> Result<ResumeReport>
where
    S: Storage,
    I: IntoIterator<Item = BlockAddress>,
{
    let layout = *manager.layout();
    let written: BTreeSet<BlockAddress> = written.into_iter().collect();
    let mut report = ResumeReport::default();

    for address in layout.blocks() {
        if manager.is_block_received(address) {
            report.present.push(address);
            continue;
        }
        if !written.contains(&address) {
            report.missing.push(address);
            continue;
        }

        let buffer = pool.allocate()?;
        match manager.restore_block(address, buffer, expected_size) {
            Ok(Restored::Recorded(released)) => {
                report.present.push(address);
                for buffer in released {
                    pool.deallocate(buffer, linger)?;
                }
            }
            Ok(Restored::Absent(buffer)) => {
                debug!("Block {} was recorded as written but has no data", address);
                report.missing.push(address);
                pool.deallocate(buffer, linger)?;
            }
            Err(rejected) => {
                let error = rejected.error;
                pool.deallocate(rejected.buffer, linger)?;
                return Err(error);
            }
        }
    }

    info!(
        "Restored {} of {} blocks, frontier at {}",
        report.present.len(),
        layout.total_blocks(),
        manager.frontier()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryStorage;
    use crate::piece::{PieceLayout, PieceState};

    const BLOCK: u32 = 4;
    const LINGER: Duration = Duration::from_millis(100);

    fn layout() -> PieceLayout {
        // 3 pieces of 2 blocks, 24 bytes in total
        PieceLayout::new(3, 2)
            .with_block_size(BLOCK)
            .with_blocks_per_piece(2)
    }

    #[test]
    fn test_full_file_is_restored() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let storage = MemoryStorage::from_bytes((0..24).collect());
        let mut manager = PieceManager::new(storage, layout()).unwrap();

        let report =
            restore_from_storage(&mut manager, &pool, layout().blocks(), 24, LINGER).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.present.len(), 6);
        assert_eq!(manager.frontier(), 6);
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_partial_file_reports_missing_tail() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        // Only the first 10 bytes made it to disk before the interruption.
        let storage = MemoryStorage::from_bytes(vec![1; 10]);
        let mut manager = PieceManager::new(storage, layout()).unwrap();

        let report =
            restore_from_storage(&mut manager, &pool, layout().blocks(), 24, LINGER).unwrap();

        assert_eq!(
            report.present,
            vec![
                BlockAddress::new(0, 0),
                BlockAddress::new(0, 1),
                BlockAddress::new(1, 0),
            ]
        );
        assert_eq!(report.missing.len(), 3);
        assert_eq!(manager.piece_state(0), PieceState::Released);
        assert_eq!(manager.piece_state(1), PieceState::Partial { received: 1 });
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_holes_before_a_written_block_stay_missing() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        // Only the last block was written; everything before it reads back as zeros.
        let mut storage = MemoryStorage::new();
        storage.write_at(20, &[9; 4]).unwrap();
        let mut manager = PieceManager::new(storage, layout()).unwrap();

        let last = BlockAddress::new(2, 1);
        let report = restore_from_storage(&mut manager, &pool, [last], 24, LINGER).unwrap();

        assert_eq!(report.present, vec![last]);
        assert_eq!(report.missing.len(), 5);
        assert_eq!(report.missing[0], BlockAddress::new(0, 0));
        assert_eq!(manager.frontier(), 0);
        assert_eq!(manager.piece_state(0), PieceState::Empty);
        assert_eq!(manager.retained_buffers(), 1);

        for buffer in manager.release_file() {
            pool.deallocate(buffer, LINGER).unwrap();
        }
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_written_block_without_data_is_missing() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::from_bytes(vec![1; 8]), layout()).unwrap();

        let report = restore_from_storage(
            &mut manager,
            &pool,
            [BlockAddress::new(0, 0), BlockAddress::new(2, 0)],
            24,
            LINGER,
        )
        .unwrap();

        assert_eq!(report.present, vec![BlockAddress::new(0, 0)]);
        assert_eq!(report.missing.len(), 5);
        assert_eq!(manager.frontier(), 1);
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_empty_storage_restores_nothing() {
        let pool = BufferPool::with_buffer_size(BLOCK as usize);
        let mut manager = PieceManager::new(MemoryStorage::new(), layout()).unwrap();

        let report =
            restore_from_storage(&mut manager, &pool, layout().blocks(), 24, LINGER).unwrap();

        assert!(report.present.is_empty());
        assert_eq!(report.missing.len(), 6);
        assert_eq!(manager.frontier(), 0);
    }
}
