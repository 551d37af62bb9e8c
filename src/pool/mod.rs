use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::piece::BLOCK_SIZE;

mod buffer;

pub use buffer::Buffer;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity in bytes of every buffer the pool hands out
    pub buffer_size: usize,
    /// Cap on buffers handed out and not yet returned; `None` lets the pool grow freely
    pub max_outstanding: Option<usize>,
    /// Most reclaimed buffers kept around for reuse
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: BLOCK_SIZE as usize,
            max_outstanding: None,
            max_idle: 256,
        }
    }
}

impl PoolConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = Some(max);
        self
    }

    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }
}

/// Reclaimed storage waiting for reuse until `expires`.
struct IdleBuffer {
    storage: Vec<u8>,
    expires: Instant,
}

/// Pool of fixed-capacity block buffers shared by every transfer in the process.
///
/// `allocate` never blocks. Buffers come back through `deallocate`, whose timeout bounds how
/// long the reclaimed memory may sit on the idle list before it is freed for real.
/// All methods take `&self`, so one pool can be shared behind an `Arc`.
pub struct BufferPool {
    id: u64,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleBuffer>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            idle: Mutex::new(VecDeque::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self::new(PoolConfig::default().with_buffer_size(buffer_size))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Hand out an empty buffer, reusing reclaimed storage when some is still warm.
    pub fn allocate(&self) -> Result<Buffer> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match self.config.max_outstanding {
                    Some(limit) if current >= limit => None,
                    _ => Some(current + 1),
                }
            });

        if let Err(current) = reserved {
            return Err(Error::PoolExhausted {
                outstanding: current,
                limit: self.config.max_outstanding.unwrap_or(current),
            });
        }

        let reused = {
            let mut idle = self.lock_idle();
            evict_expired(&mut idle, Instant::now());
            idle.pop_back().map(|entry| entry.storage)
        };

        let storage = match reused {
            Some(storage) => {
                trace!("Reusing idle buffer from pool {}", self.id);
                storage
            }
            None => Vec::with_capacity(self.config.buffer_size),
        };

        Ok(Buffer::new(storage, self.config.buffer_size, self.id))
    }

    /// Take a buffer back. The storage stays reusable for `timeout`, then becomes eligible
    /// for eviction.
    pub fn deallocate(&self, buffer: Buffer, timeout: Duration) -> Result<()> {
        if buffer.pool_id() != self.id {
            return Err(Error::ForeignBuffer);
        }

        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .map_err(|_| Error::ForeignBuffer)?;

        let now = Instant::now();
        let mut idle = self.lock_idle();
        evict_expired(&mut idle, now);

        if self.config.max_idle == 0 {
            return Ok(());
        }
        if idle.len() >= self.config.max_idle {
            // Oldest reclaimed storage goes first.
            idle.pop_front();
        }
        idle.push_back(IdleBuffer {
            storage: buffer.into_storage(),
            expires: now + timeout,
        });

        Ok(())
    }

    /// Number of buffers handed out and not yet returned.
    pub fn total_allocated_buffers(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of reclaimed buffers currently kept for reuse.
    pub fn idle_buffers(&self) -> usize {
        self.lock_idle().len()
    }

    /// Drop every idle buffer whose timeout has already elapsed.
    pub fn trim(&self) -> usize {
        let mut idle = self.lock_idle();
        let evicted = evict_expired(&mut idle, Instant::now());
        if evicted > 0 {
            debug!("Evicted {} idle buffers from pool {}", evicted, self.id);
        }
        evicted
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleBuffer>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("buffer_size", &self.config.buffer_size)
            .field("outstanding", &self.total_allocated_buffers())
            .field("idle", &self.idle_buffers())
            .finish()
    }
}

fn evict_expired(idle: &mut VecDeque<IdleBuffer>, now: Instant) -> usize {
    let before = idle.len();
    idle.retain(|entry| entry.expires > now);
    before - idle.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINGER: Duration = Duration::from_secs(1);

    #[test]
    fn test_allocate_counts_outstanding() {
        let pool = BufferPool::with_buffer_size(16);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.total_allocated_buffers(), 2);
        assert_eq!(a.capacity(), 16);

        pool.deallocate(a, LINGER).unwrap();
        assert_eq!(pool.total_allocated_buffers(), 1);
        pool.deallocate(b, LINGER).unwrap();
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_deallocated_buffer_is_reused() {
        let pool = BufferPool::with_buffer_size(16);
        let mut buffer = pool.allocate().unwrap();
        buffer.fill(b"stale").unwrap();
        pool.deallocate(buffer, LINGER).unwrap();
        assert_eq!(pool.idle_buffers(), 1);

        let buffer = pool.allocate().unwrap();
        assert_eq!(pool.idle_buffers(), 0);
        assert!(buffer.is_empty(), "Reused buffers must come back empty");
    }

    #[test]
    fn test_expired_idle_buffers_are_evicted() {
        let pool = BufferPool::with_buffer_size(16);
        let buffer = pool.allocate().unwrap();
        pool.deallocate(buffer, Duration::ZERO).unwrap();

        assert_eq!(pool.trim(), 1);
        assert_eq!(pool.idle_buffers(), 0);
    }

    #[test]
    fn test_idle_list_is_capped() {
        let pool = BufferPool::new(PoolConfig::default().with_buffer_size(8).with_max_idle(2));
        let buffers: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        for buffer in buffers {
            pool.deallocate(buffer, LINGER).unwrap();
        }
        assert_eq!(pool.idle_buffers(), 2);
        assert_eq!(pool.total_allocated_buffers(), 0);
    }

    #[test]
    fn test_max_outstanding_reports_exhaustion() {
        let pool = BufferPool::new(
            PoolConfig::default()
                .with_buffer_size(8)
                .with_max_outstanding(1),
        );
        let first = pool.allocate().unwrap();

        let result = pool.allocate();
        assert!(matches!(
            result,
            Err(Error::PoolExhausted {
                outstanding: 1,
                limit: 1
            })
        ));

        pool.deallocate(first, LINGER).unwrap();
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_foreign_buffer_is_rejected() {
        let pool = BufferPool::with_buffer_size(8);
        let other = BufferPool::with_buffer_size(8);
        let buffer = other.allocate().unwrap();

        let result = pool.deallocate(buffer, LINGER);
        assert!(matches!(result, Err(Error::ForeignBuffer)));
        assert_eq!(other.total_allocated_buffers(), 1);
        assert_eq!(pool.total_allocated_buffers(), 0);
    }
}
