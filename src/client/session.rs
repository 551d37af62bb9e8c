use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::file::Storage;
use crate::piece::{BlockAddress, PieceManager};
use crate::pool::{Buffer, BufferPool};

use super::config::TransferConfig;
use super::state::{TransferStats, TransferSummary};

/// A block handed over by the network layer, its data already in `buffer`.
#[derive(Debug)]
pub struct BlockDelivery {
    pub address: BlockAddress,
    pub buffer: Buffer,
}

/// Feeds blocks to a running [`TransferSession`] and stops it.
pub struct TransferHandle {
    blocks_tx: mpsc::Sender<BlockDelivery>,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<TransferStats>,
    pool: Arc<BufferPool>,
    linger: Duration,
    task: JoinHandle<TransferSummary>,
}

impl TransferHandle {
    /// Queue a received block for writing. Waits while the queue is full.
    pub async fn deliver(&self, address: BlockAddress, buffer: Buffer) -> Result<()> {
        if let Err(mpsc::error::SendError(delivery)) = self
            .blocks_tx
            .send(BlockDelivery { address, buffer })
            .await
        {
            self.pool
                .deallocate(delivery.buffer, self.linger)
                .context("Failed to return undelivered buffer")?;
            bail!("Transfer session stopped before block {} arrived", address);
        }
        Ok(())
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// No more blocks will come: let the session drain its queue, flush and stop.
    #[instrument(skip(self))]
    pub async fn finish(self) -> Result<TransferSummary> {
        let TransferHandle {
            blocks_tx,
            shutdown_tx,
            task,
            ..
        } = self;
        drop(blocks_tx);

        let summary = task.await.context("Transfer session task failed")?;
        drop(shutdown_tx);
        Ok(summary)
    }

    /// Pause or cancel: stop right away, dropping queued blocks and flushing held buffers.
    #[instrument(skip(self))]
    pub async fn abort(self) -> Result<TransferSummary> {
        // Err only means the session already stopped on its own.
        let _ = self.shutdown_tx.send(());
        self.task.await.context("Transfer session task failed")
    }
}

/// Owns the piece manager of one file for the lifetime of a transfer.
///
/// Blocks are fed through a [`TransferHandle`]; released buffers go straight back to the shared
/// pool. However the session ends, every buffer the manager still holds is flushed back too.
pub struct TransferSession<S> {
    manager: PieceManager<S>,
    pool: Arc<BufferPool>,
    config: TransferConfig,
}

impl<S> TransferSession<S>
where
    S: Storage + Send + 'static,
{
    pub fn new(manager: PieceManager<S>, pool: Arc<BufferPool>, config: TransferConfig) -> Self {
        Self {
            manager,
            pool,
            config,
        }
    }

    /// Spawn the session task and return the handle used to feed it.
    pub fn start(self) -> TransferHandle {
        let (blocks_tx, blocks_rx) = mpsc::channel::<BlockDelivery>(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let stats = Arc::new(TransferStats::new(self.manager.layout().total_blocks()));
        let pool = Arc::clone(&self.pool);
        let linger = self.config.buffer_linger;

        let task_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move { self.run(blocks_rx, shutdown_rx, task_stats).await });

        TransferHandle {
            blocks_tx,
            shutdown_tx,
            stats,
            pool,
            linger,
            task,
        }
    }

    async fn run(
        mut self,
        mut blocks_rx: mpsc::Receiver<BlockDelivery>,
        mut shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<TransferStats>,
    ) -> TransferSummary {
        let mut summary = TransferSummary::default();

        loop {
            tokio::select! {
                biased;

                // A closed channel means every handle is gone, which stops us as well.
                _ = shutdown_rx.recv() => {
                    debug!("Transfer received shutdown signal");
                    summary.aborted = true;
                    break;
                }

                delivery = blocks_rx.recv() => {
                    match delivery {
                        Some(delivery) => self.handle_block(delivery, &stats, &mut summary),
                        None => {
                            // All senders dropped, no more blocks will arrive
                            break;
                        }
                    }
                }
            }
        }

        // Blocks still queued were never written; their buffers go back untouched.
        blocks_rx.close();
        while let Ok(delivery) = blocks_rx.try_recv() {
            self.give_back(delivery.buffer);
        }

        summary.frontier = self.manager.frontier();
        summary.complete = summary.frontier == self.manager.layout().total_blocks();
        let layout = *self.manager.layout();
        summary.received = layout
            .blocks()
            .filter(|&address| self.manager.is_block_received(address))
            .collect();

        let held = self.manager.release_file();
        summary.flushed_on_close = held.len();
        for buffer in held {
            self.give_back(buffer);
        }

        summary.blocks_written = stats.blocks_written();
        summary.bytes_written = stats.bytes_written();
        summary.buffers_released = stats.buffers_released();

        info!(
            "Transfer stopped: {} blocks written, {} buffers flushed, frontier {}",
            summary.blocks_written, summary.flushed_on_close, summary.frontier
        );
        summary
    }

    fn handle_block(
        &mut self,
        delivery: BlockDelivery,
        stats: &TransferStats,
        summary: &mut TransferSummary,
    ) {
        let BlockDelivery { address, buffer } = delivery;
        let len = buffer.len() as u64;

        match self.manager.write_block(address, buffer) {
            Ok(released) => {
                stats.add_written(len);
                stats.add_released(released.len() as u64);
                for buffer in released {
                    self.give_back(buffer);
                }
            }
            Err(rejected) => {
                warn!("Block {} rejected: {}", address, rejected.error);
                stats.add_failed();
                summary.failed.push(address);
                self.give_back(rejected.into_buffer());
            }
        }
    }

    fn give_back(&self, buffer: Buffer) {
        if let Err(e) = self.pool.deallocate(buffer, self.config.buffer_linger) {
            error!("Failed to return buffer to pool: {}", e);
        }
    }
}
