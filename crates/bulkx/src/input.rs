//! 📂 The NDJSON input reader: one document per line, read in chunks, split with `memchr`.
//!
//! 🧠 Knowledge graph:
//! - Reads fixed-size chunks, hands back every COMPLETE line in them, and carries the partial
//!   tail over to the next read. A document never gets cut in half at a chunk boundary.
//! - Blank lines are skipped, `\r\n` is tolerated, the last line may skip its `\n`.
//! - Lines are not parsed here; `BulkOperation` validates the JSON when it is added.
//!
//! "He who reads the entire file into one String, OOMs in production." -- Ancient proverb 📜

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::trace;

const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// 📄 What one read produced: the complete lines, and how many raw bytes it took off the disk.
#[derive(Debug)]
pub(crate) struct Page {
    pub(crate) lines: Vec<String>,
    pub(crate) bytes_read: usize,
}

pub(crate) struct NdjsonReader {
    file: File,
    file_name: PathBuf,
    file_size: u64,
    /// 🧺 Bytes read but not yet handed out: at most one partial line between calls.
    carry: Vec<u8>,
    chunk_size: usize,
    eof: bool,
}

impl std::fmt::Debug for NdjsonReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdjsonReader")
            .field("file_name", &self.file_name)
            .field("file_size", &self.file_size)
            .field("carried", &self.carry.len())
            .field("eof", &self.eof)
            .finish()
    }
}

impl NdjsonReader {
    pub(crate) async fn open(file_name: &Path) -> Result<Self> {
        let file = File::open(file_name).await.context(format!(
            "💀 The door to '{}' would not budge. We knocked. We pleaded. \
             It might not exist. The permissions might be wrong. We remain outside.",
            file_name.display()
        ))?;
        // 📏 0 = unknown; the progress bar copes
        let file_size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            file,
            file_name: file_name.to_path_buf(),
            file_size,
            carry: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            eof: false,
        })
    }

    #[cfg(test)]
    fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    /// 📖 The next batch of complete lines, or `None` once the file is drained.
    pub(crate) async fn next_page(&mut self) -> Result<Option<Page>> {
        let mut bytes_read = 0;
        loop {
            if !self.eof {
                let filled = self.carry.len();
                self.carry.resize(filled + self.chunk_size, 0);
                let read = self
                    .file
                    .read(&mut self.carry[filled..])
                    .await
                    .context(format!("💀 Reading '{}' failed mid-sentence", self.file_name.display()))?;
                self.carry.truncate(filled + read);
                self.eof = read == 0;
                bytes_read += read;
            }

            let complete = match memchr::memrchr(b'\n', &self.carry) {
                Some(last_newline) => last_newline + 1,
                // 🏁 no newline left and nothing more coming: the tail is the last line
                None if self.eof => self.carry.len(),
                None => continue,
            };
            if complete == 0 {
                return Ok(None);
            }

            let chunk: Vec<u8> = self.carry.drain(..complete).collect();
            let lines = split_lines(&chunk)
                .with_context(|| format!("💀 '{}' is not valid NDJSON text", self.file_name.display()))?;
            trace!("📖 read {} bytes, {} complete line(s)", bytes_read, lines.len());
            return Ok(Some(Page { lines, bytes_read }));
        }
    }
}

fn split_lines(chunk: &[u8]) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut line_start = 0;
    for line_end in memchr::memchr_iter(b'\n', chunk).chain(std::iter::once(chunk.len())) {
        let line = &chunk[line_start..line_end];
        line_start = line_end + 1;
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        lines.push(String::from_utf8(line.to_vec()).context("line is not UTF-8")?);
    }
    Ok(lines)
}
