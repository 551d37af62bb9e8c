use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::piece::BlockAddress;

/// Atomic counters for a running transfer, readable while the session task works.
pub struct TransferStats {
    blocks_written: AtomicU64,
    bytes_written: AtomicU64,
    buffers_released: AtomicU64,
    blocks_failed: AtomicU64,
    total_blocks: u64,
    start_time: Instant,
}

impl TransferStats {
    pub fn new(total_blocks: u64) -> Self {
        Self {
            blocks_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            buffers_released: AtomicU64::new(0),
            blocks_failed: AtomicU64::new(0),
            total_blocks,
            start_time: Instant::now(),
        }
    }

    pub fn add_written(&self, bytes: u64) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_released(&self, buffers: u64) {
        self.buffers_released.fetch_add(buffers, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.blocks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn buffers_released(&self) -> u64 {
        self.buffers_released.load(Ordering::Relaxed)
    }

    pub fn blocks_failed(&self) -> u64 {
        self.blocks_failed.load(Ordering::Relaxed)
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Write throughput in bytes per second.
    pub fn write_speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.bytes_written() as f64 / elapsed
    }
}

/// What a finished or aborted transfer left behind.
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    pub blocks_written: u64,
    pub bytes_written: u64,
    /// Buffers released by the frontier or by piece completion while running
    pub buffers_released: u64,
    /// Buffers still held when the session stopped, flushed back to the pool
    pub flushed_on_close: usize,
    /// Blocks the manager refused; the caller decides whether to fetch them again
    pub failed: Vec<BlockAddress>,
    /// Every block on storage when the session stopped, in file order. Persist it to resume
    /// with `restore_from_storage`.
    pub received: Vec<BlockAddress>,
    /// Release frontier reached before the final flush
    pub frontier: u64,
    pub aborted: bool,
    pub complete: bool,
}

/// Blocks found on, and missing from, storage after a resume scan.
#[derive(Debug, Clone, Default)]
pub struct ResumeReport {
    pub present: Vec<BlockAddress>,
    pub missing: Vec<BlockAddress>,
}

impl ResumeReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}
