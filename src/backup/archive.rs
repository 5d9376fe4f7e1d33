// postgres-s3-backup/src/backup/archive.rs
//! Block-parallel gzip writer.
//!
//! Input is cut into fixed-size blocks. Every full block is raw-DEFLATE
//! compressed on the blocking pool by its own `flate2::Compress`, ending in a
//! sync flush so the pieces concatenate into one valid DEFLATE stream. The
//! result is a single standard gzip member that any gzip reader accepts.
//!
//! Blocks complete out of order but are written strictly in input order: the
//! in-flight queue holds `(block_index, handle)` pairs and is always drained
//! from the front.

use chrono::{DateTime, Utc};
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// Block size, and the input size below which no worker is engaged.
pub const DEFAULT_BLOCK_SIZE: usize = 5 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const CM_DEFLATE: u8 = 8;
const FNAME: u8 = 8;
const OS_UNIX: u8 = 3;

/// Metadata stored in the gzip header. Informational only.
#[derive(Debug, Clone)]
pub struct GzipHeader {
    pub name: String,
    pub modified: DateTime<Utc>,
}

impl GzipHeader {
    fn encode(&self) -> Vec<u8> {
        let mtime = u32::try_from(self.modified.timestamp()).unwrap_or(0);
        let mut header = Vec::with_capacity(10 + self.name.len() + 1);
        header.extend_from_slice(&GZIP_MAGIC);
        header.push(CM_DEFLATE);
        header.push(FNAME);
        header.extend_from_slice(&mtime.to_le_bytes());
        header.push(0);
        header.push(OS_UNIX);
        // FNAME is zero-terminated, so interior NULs are dropped.
        header.extend(self.name.bytes().filter(|b| *b != 0));
        header.push(0);
        header
    }
}

/// Byte totals of a finished archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzipTotals {
    pub uncompressed: u64,
    pub compressed: u64,
}

struct CompressedBlock {
    data: Vec<u8>,
    crc: Crc,
}

pub struct ParallelGzipWriter<W> {
    sink: W,
    level: Compression,
    block_size: usize,
    concurrency: usize,
    header: Option<Vec<u8>>,
    buffer: Vec<u8>,
    pending: VecDeque<(u64, JoinHandle<io::Result<CompressedBlock>>)>,
    next_block: u64,
    next_to_write: u64,
    crc: Crc,
    total_in: u64,
    total_out: u64,
}

impl<W: AsyncWrite + Unpin> ParallelGzipWriter<W> {
    pub fn new(sink: W, header: GzipHeader) -> Self {
        ParallelGzipWriter {
            sink,
            level: Compression::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            concurrency: 1,
            header: Some(header.encode()),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            next_block: 0,
            next_to_write: 0,
            crc: Crc::new(),
            total_in: 0,
            total_out: 0,
        }
    }

    /// Sets the block size and the number of blocks compressed at once.
    /// Both are clamped to at least 1.
    pub fn with_concurrency(mut self, block_size: usize, concurrency: usize) -> Self {
        self.block_size = block_size.max(1);
        self.concurrency = concurrency.max(1);
        self
    }

    /// Bytes accepted so far.
    #[cfg(test)]
    pub fn uncompressed_size(&self) -> u64 {
        self.total_in
    }

    /// Number of blocks handed to the worker pool.
    #[cfg(test)]
    pub fn parallel_blocks(&self) -> u64 {
        self.next_block
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            if self.buffer.capacity() == 0 {
                self.buffer.reserve_exact(self.block_size);
            }
            let take = (self.block_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            self.total_in += take as u64;
            data = &data[take..];

            if self.buffer.len() == self.block_size {
                self.dispatch_block().await?;
            }
        }
        Ok(())
    }

    /// Drains every in-flight block, writes the final block and the trailer,
    /// flushes the sink and hands it back.
    pub async fn finish(mut self) -> io::Result<(W, GzipTotals)> {
        while !self.pending.is_empty() {
            self.write_front().await?;
        }

        // The tail never reaches the pool; small inputs compress inline.
        let tail = std::mem::take(&mut self.buffer);
        let last = compress_block(&tail, self.level, true)?;
        self.emit(last).await?;

        let mut trailer = [0u8; 8];
        trailer[..4].copy_from_slice(&self.crc.sum().to_le_bytes());
        // ISIZE is the input length modulo 2^32.
        trailer[4..].copy_from_slice(&(self.total_in as u32).to_le_bytes());
        self.sink.write_all(&trailer).await?;
        self.total_out += trailer.len() as u64;
        self.sink.flush().await?;

        debug!(
            blocks = self.next_block,
            uncompressed = self.total_in,
            compressed = self.total_out,
            "gzip stream finished"
        );

        let totals = GzipTotals {
            uncompressed: self.total_in,
            compressed: self.total_out,
        };
        Ok((self.sink, totals))
    }

    async fn dispatch_block(&mut self) -> io::Result<()> {
        if self.pending.len() >= self.concurrency {
            self.write_front().await?;
        }

        let block = std::mem::take(&mut self.buffer);
        let level = self.level;
        let index = self.next_block;
        self.next_block += 1;

        let handle = tokio::task::spawn_blocking(move || compress_block(&block, level, false));
        self.pending.push_back((index, handle));
        Ok(())
    }

    async fn write_front(&mut self) -> io::Result<()> {
        let Some((index, handle)) = self.pending.pop_front() else {
            return Ok(());
        };
        debug_assert_eq!(index, self.next_to_write);
        let block = handle.await.map_err(io::Error::other)??;
        self.next_to_write = index + 1;
        self.emit(block).await
    }

    async fn emit(&mut self, block: CompressedBlock) -> io::Result<()> {
        if let Some(header) = self.header.take() {
            self.sink.write_all(&header).await?;
            self.total_out += header.len() as u64;
        }
        self.sink.write_all(&block.data).await?;
        self.total_out += block.data.len() as u64;
        self.crc.combine(&block.crc);
        Ok(())
    }
}

/// Compresses one block as raw DEFLATE. Non-final blocks end with a sync
/// flush, the final one with the end-of-stream marker.
fn compress_block(data: &[u8], level: Compression, last: bool) -> io::Result<CompressedBlock> {
    let mut crc = Crc::new();
    crc.update(data);

    let flush = if last {
        FlushCompress::Finish
    } else {
        FlushCompress::Sync
    };
    let mut encoder = Compress::new(level, false);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(4096));
        }
        let consumed = encoder.total_in() as usize;
        let status = encoder
            .compress_vec(&data[consumed..], &mut out, flush)
            .map_err(io::Error::other)?;
        let input_done = encoder.total_in() as usize == data.len();

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError if !last && input_done && out.len() < out.capacity() => {
                break;
            }
            Status::Ok | Status::BufError => {}
        }
    }

    Ok(CompressedBlock { data: out, crc })
}
