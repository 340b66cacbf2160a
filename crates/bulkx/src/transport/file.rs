//! 💾 The file transport: every committed batch is appended to an NDJSON file on disk.
//!
//! Handy for dry runs ("what WOULD we have sent?") and for feeding a `_bulk` replay later with
//! curl. Every op is reported as a success, because the disk accepted it and the disk has no
//! opinions about mappings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::trace;

use super::{Transport, op_types_in_payload};
use crate::accumulator::BulkTarget;
use crate::error::TransportError;
use crate::response::BulkResponse;

#[derive(Debug, Deserialize, Clone)]
pub struct FileTransportConfig {
    pub file_name: String,
    /// 📎 Append to an existing file instead of truncating it.
    #[serde(default)]
    pub append: bool,
}

/// 💾 Payloads in, bytes on disk. One writer, shared by every worker behind a mutex.
#[derive(Debug)]
pub struct FileTransport {
    file_buf: Mutex<BufWriter<File>>,
    config: FileTransportConfig,
}

impl FileTransport {
    /// 🚀 Opens (or truncates, unless `append`) the output file.
    pub async fn new(config: FileTransportConfig) -> Result<Self> {
        let file_handle = OpenOptions::new()
            .create(true)
            .write(true)
            .append(config.append)
            .truncate(!config.append)
            .open(&config.file_name)
            .await
            .context(format!(
                "💀 The transport file '{}' could not be opened. We stared at the path. \
                 The path stared back. One of us was wrong about whether the parent directory existed.",
                config.file_name
            ))?;
        Ok(Self {
            file_buf: Mutex::new(BufWriter::new(file_handle)),
            config,
        })
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(&self, payload: String, _target: &BulkTarget) -> Result<BulkResponse, TransportError> {
        let op_types = op_types_in_payload(&payload)?;
        let mut file_buf = self.file_buf.lock().await;
        file_buf
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| TransportError::Io(format!("{}: {err}", self.config.file_name)))?;
        // 🚽 Flush per batch: a committed batch is on disk, not in a buffer we might never drain.
        file_buf
            .flush()
            .await
            .map_err(|err| TransportError::Io(format!("{}: {err}", self.config.file_name)))?;
        trace!(
            "📬 {} bytes walked into '{}' and were written down",
            payload.len(),
            self.config.file_name
        );
        Ok(BulkResponse::all_succeeded(op_types.iter().copied(), 0))
    }
}
