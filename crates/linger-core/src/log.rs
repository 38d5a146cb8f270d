//! Append-only per-session output log.
//!
//! Every byte a session's process writes is appended here before it reaches
//! any observer, so the log is the complete history of a session and the only
//! one left once the process is gone. Reads work on byte offsets so followers
//! can tail a log incrementally.

use crate::error::LingerResult;
use crate::text;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Writing end of a session log. Owned by the session's output pump.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
    size: u64,
}

impl LogSink {
    /// Open (creating parent directories and the file if needed) for append.
    pub async fn create(path: impl Into<PathBuf>) -> LingerResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();
        debug!(path = %path.display(), size, "log opened");
        Ok(Self { path, file, size })
    }

    /// Append bytes. Bytes already written are never touched again.
    pub async fn append(&mut self, data: &[u8]) -> LingerResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush file contents to disk.
    pub async fn sync(&mut self) -> LingerResult<()> {
        self.file.sync_data().await?;
        Ok(())
    }
}

/// Current size of a log file; a missing log is empty.
pub async fn size(path: &Path) -> LingerResult<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Read up to `len` bytes starting at `offset`.
pub async fn read_range(path: &Path, offset: u64, len: u64) -> LingerResult<Vec<u8>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Read everything from `offset` to the current end of the log.
pub async fn read_from(path: &Path, offset: u64) -> LingerResult<Vec<u8>> {
    read_range(path, offset, u64::MAX).await
}

/// Plain-text history of a log, filtered by `search` and cut to the last
/// `tail` lines.
pub async fn tail_lines(
    path: &Path,
    tail: Option<usize>,
    search: Option<&str>,
) -> LingerResult<Vec<String>> {
    let raw = read_from(path, 0).await?;
    Ok(text::select_lines(text::plain_lines(&raw), tail, search))
}

/// Incremental reader that remembers how far into a log it has read.
#[derive(Debug, Clone)]
pub struct LogCursor {
    path: PathBuf,
    offset: u64,
}

impl LogCursor {
    /// Start at the current end of the log.
    pub async fn at_end(path: impl Into<PathBuf>) -> LingerResult<Self> {
        let path = path.into();
        let offset = size(&path).await?;
        Ok(Self { path, offset })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Return bytes appended since the last call.
    pub async fn read_new(&mut self) -> LingerResult<Vec<u8>> {
        let current = size(&self.path).await?;
        if current < self.offset {
            // Logs are append-only; a shrink means the file was replaced.
            debug!(path = %self.path.display(), "log shrank, restarting from 0");
            self.offset = 0;
        }
        let data = read_from(&self.path, self.offset).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }
}
