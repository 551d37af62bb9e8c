use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use piece_store::client::{restore_from_storage, TransferConfig, TransferHandle, TransferSession};
use piece_store::{
    BlockAddress, BufferPool, DiskFile, PieceLayout, PieceManager, PieceState, BLOCKS_PER_PIECE,
    BLOCK_SIZE,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Assemble files from out-of-order blocks, resumably.")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy SOURCE into DEST as shuffled blocks, resuming from whatever DEST already holds
    Assemble {
        source: PathBuf,
        dest: PathBuf,

        /// Seed for the delivery order (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value_t = BLOCK_SIZE)]
        block_size: u32,

        #[arg(long, default_value_t = BLOCKS_PER_PIECE)]
        blocks_per_piece: u32,

        /// Milliseconds a released buffer stays warm in the pool
        #[arg(long, default_value_t = 1000)]
        linger_ms: u64,
    },
    /// Report which blocks of FILE already match SOURCE
    Scan {
        file: PathBuf,
        source: PathBuf,

        #[arg(long, default_value_t = BLOCK_SIZE)]
        block_size: u32,

        #[arg(long, default_value_t = BLOCKS_PER_PIECE)]
        blocks_per_piece: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Assemble {
            source,
            dest,
            seed,
            block_size,
            blocks_per_piece,
            linger_ms,
        } => {
            assemble(
                &source,
                &dest,
                seed,
                block_size,
                blocks_per_piece,
                Duration::from_millis(linger_ms),
            )
            .await
        }
        Command::Scan {
            file,
            source,
            block_size,
            blocks_per_piece,
        } => scan(&file, &source, block_size, blocks_per_piece),
    }
}

async fn assemble(
    source: &Path,
    dest: &Path,
    seed: Option<u64>,
    block_size: u32,
    blocks_per_piece: u32,
    linger: Duration,
) -> Result<()> {
    let mut source_file =
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
    let total_size = source_file
        .metadata()
        .context("Failed to read source metadata")?
        .len();

    let layout = PieceLayout::from_file_size_with(total_size, block_size, blocks_per_piece);
    let pool = Arc::new(BufferPool::with_buffer_size(block_size as usize));
    let storage =
        DiskFile::open(dest).with_context(|| format!("Failed to open {}", dest.display()))?;
    let mut manager =
        PieceManager::new(storage, layout).context("Failed to create piece manager")?;

    let written = matching_blocks(&mut source_file, dest, &layout, total_size)?;
    let report = restore_from_storage(&mut manager, &pool, written, total_size, linger)
        .context("Failed to restore existing blocks")?;
    let mut pending = report.missing;

    println!("Source:  {}", source.display());
    println!(
        "Size:    {} ({} pieces, {} blocks)",
        format_bytes(total_size),
        layout.piece_count,
        layout.total_blocks()
    );
    println!("On disk: {} blocks", report.present.len());
    println!();

    if pending.is_empty() {
        for buffer in manager.release_file() {
            pool.deallocate(buffer, linger)?;
        }
        println!("Nothing to do, {} is complete", dest.display());
        return Ok(());
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    pending.shuffle(&mut rng);

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} blocks  {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );

    let session = TransferSession::new(
        manager,
        Arc::clone(&pool),
        TransferConfig::default().with_buffer_linger(linger),
    );
    let handle = session.start();

    let delivered = tokio::select! {
        result = feed_blocks(&handle, &pool, &mut source_file, &layout, total_size, &pending, &pb) => {
            result?;
            true
        }
        _ = tokio::signal::ctrl_c() => false,
    };

    let summary = if delivered {
        handle.finish().await?
    } else {
        pb.finish_and_clear();
        eprintln!("\nInterrupted, flushing held buffers...");
        handle.abort().await?
    };
    pb.finish_with_message(format!("{} written", format_bytes(summary.bytes_written)));

    println!(
        "\nWrote {} blocks, released {} buffers early, flushed {} on close",
        summary.blocks_written, summary.buffers_released, summary.flushed_on_close
    );
    if !summary.failed.is_empty() {
        warn!("{} blocks were rejected", summary.failed.len());
    }
    if pool.total_allocated_buffers() != 0 {
        bail!(
            "{} buffers were never returned to the pool",
            pool.total_allocated_buffers()
        );
    }
    if summary.complete {
        println!("{} is complete", dest.display());
    } else {
        println!("{} is partial, run again to resume", dest.display());
    }

    Ok(())
}

async fn feed_blocks(
    handle: &TransferHandle,
    pool: &BufferPool,
    source: &mut File,
    layout: &PieceLayout,
    total_size: u64,
    pending: &[BlockAddress],
    pb: &ProgressBar,
) -> Result<()> {
    let mut chunk = vec![0u8; layout.block_size as usize];

    for &address in pending {
        let offset = layout.block_offset(address);
        let len = (total_size - offset).min(layout.block_size as u64) as usize;

        source.seek(SeekFrom::Start(offset))?;
        source
            .read_exact(&mut chunk[..len])
            .with_context(|| format!("Failed to read block {} from source", address))?;

        let mut buffer = pool.allocate()?;
        buffer.fill(&chunk[..len])?;
        handle.deliver(address, buffer).await?;

        pb.inc(1);
        let stats = handle.stats();
        pb.set_message(format!("{}/s", format_bytes(stats.write_speed() as u64)));
    }

    Ok(())
}

fn scan(file: &Path, source: &Path, block_size: u32, blocks_per_piece: u32) -> Result<()> {
    if !file.exists() {
        bail!("{} does not exist", file.display());
    }
    let mut source_file =
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
    let expected_size = source_file
        .metadata()
        .context("Failed to read source metadata")?
        .len();

    let layout = PieceLayout::from_file_size_with(expected_size, block_size, blocks_per_piece);
    let written = matching_blocks(&mut source_file, file, &layout, expected_size)?;

    let storage = DiskFile::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    let pool = BufferPool::with_buffer_size(block_size as usize);
    let mut manager =
        PieceManager::new(storage, layout).context("Failed to create piece manager")?;

    let report = restore_from_storage(&mut manager, &pool, written, expected_size, Duration::ZERO)
        .context("Failed to scan file")?;

    let released = (0..layout.piece_count)
        .filter(|&piece| manager.piece_state(piece) == PieceState::Released)
        .count();

    for buffer in manager.release_file() {
        pool.deallocate(buffer, Duration::ZERO)?;
    }

    info!("Scanned {}", file.display());
    println!("File:     {}", file.display());
    println!("Size:     {}", format_bytes(expected_size));
    println!(
        "Blocks:   {} present, {} missing",
        report.present.len(),
        report.missing.len()
    );
    println!("Pieces:   {}/{} complete", released, layout.piece_count);
    if let Some(first) = report.missing.first() {
        println!("First gap at block {}", first);
    }

    Ok(())
}

/// Blocks of `dest` whose bytes already equal the same range of `source`.
///
/// A bare file keeps no record of which blocks were written, and holes read back as zeros,
/// so only content that matches the source counts as written.
fn matching_blocks(
    source: &mut File,
    dest: &Path,
    layout: &PieceLayout,
    total_size: u64,
) -> Result<Vec<BlockAddress>> {
    let mut dest_file = match File::open(dest) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", dest.display())),
    };
    let dest_len = dest_file.metadata().context("Failed to read dest metadata")?.len();

    let mut expected = vec![0u8; layout.block_size as usize];
    let mut actual = vec![0u8; layout.block_size as usize];
    let mut written = Vec::new();

    for address in layout.blocks() {
        let offset = layout.block_offset(address);
        let len = (total_size - offset).min(layout.block_size as u64) as usize;
        if offset + len as u64 > dest_len {
            continue;
        }

        source.seek(SeekFrom::Start(offset))?;
        source
            .read_exact(&mut expected[..len])
            .with_context(|| format!("Failed to read block {} from source", address))?;
        dest_file.seek(SeekFrom::Start(offset))?;
        dest_file
            .read_exact(&mut actual[..len])
            .with_context(|| format!("Failed to read block {} from {}", address, dest.display()))?;

        if expected[..len] == actual[..len] {
            written.push(address);
        }
    }

    debug!("{} of {} blocks already match the source", written.len(), layout.total_blocks());
    Ok(written)
}

/// Format byte count as human-readable string (e.g. "631.0 MB").
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
