//! 🔌 Transports: where a finished batch actually leaves the building.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait -> concrete impls (`ElasticsearchTransport`, `FileTransport`,
//!   `InMemoryTransport`) -> `TransportBackend` enum -> `from_config` resolver.
//! - Transports are I/O only. They do not batch, they do not retry, they do not keep score.
//!   The worker does all of that and hands them a finished NDJSON payload.
//! - The response MUST line up with the payload, item for item. Transports without a server
//!   to ask (`File`, `InMemory`) synthesize an all-green response from the action lines.
//! - Shared by every worker behind an `Arc`, hence `&self`.
//!
//! Ancient proverb: "He who puts retry logic in the transport, retries twice." 🦆

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::accumulator::BulkTarget;
use crate::error::TransportError;
use crate::response::BulkResponse;

pub mod elasticsearch;
pub mod file;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchTransport, ElasticsearchTransportConfig};
pub use file::{FileTransport, FileTransportConfig};
pub use in_mem::InMemoryTransport;

/// 📡 Sends one batch, returns one verdict per operation.
///
/// # Contract 📜
/// - `payload` is complete NDJSON, trailing newline included.
/// - `Ok` items are positionally aligned with the operations in the payload.
/// - `Err(TransportError::Connection)` means "unreachable"; the worker will go check
///   `health_check` before taking more work.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, payload: String, target: &BulkTarget) -> Result<BulkResponse, TransportError>;

    /// 🩺 At least one healthy connection to the store?
    async fn health_check(&self) -> bool {
        true
    }
}

/// 🔧 Which transport to build, straight from config.
#[derive(Debug, Deserialize, Clone)]
pub enum TransportConfig {
    Elasticsearch(ElasticsearchTransportConfig),
    File(FileTransportConfig),
    /// 🧪 Unit variant: `transport = "InMemory"`.
    InMemory,
}

/// 🎭 The many faces of a transport. The worker never learns which one it got.
#[derive(Debug)]
pub enum TransportBackend {
    Elasticsearch(ElasticsearchTransport),
    File(FileTransport),
    InMemory(InMemoryTransport),
}

impl TransportBackend {
    /// 🏗️ Resolve and construct the transport named by the config.
    pub async fn from_config(config: TransportConfig) -> Result<Self> {
        Ok(match config {
            TransportConfig::Elasticsearch(es) => {
                TransportBackend::Elasticsearch(ElasticsearchTransport::new(es).await?)
            }
            TransportConfig::File(file) => TransportBackend::File(FileTransport::new(file).await?),
            TransportConfig::InMemory => TransportBackend::InMemory(InMemoryTransport::new()),
        })
    }
}

#[async_trait]
impl Transport for TransportBackend {
    async fn send(&self, payload: String, target: &BulkTarget) -> Result<BulkResponse, TransportError> {
        match self {
            TransportBackend::Elasticsearch(t) => t.send(payload, target).await,
            TransportBackend::File(t) => t.send(payload, target).await,
            TransportBackend::InMemory(t) => t.send(payload, target).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            TransportBackend::Elasticsearch(t) => t.health_check().await,
            TransportBackend::File(t) => t.health_check().await,
            TransportBackend::InMemory(t) => t.health_check().await,
        }
    }
}

/// 🔎 Walk the action lines of a bulk payload and report each op type, in order.
///
/// `index`, `create` and `update` are followed by a source line; `delete` is not. That is all
/// the grammar there is, so we can count ops without parsing a single document body.
pub(crate) fn op_types_in_payload(payload: &str) -> Result<Vec<&'static str>, TransportError> {
    let mut op_types = Vec::new();
    let mut expect_source_line = false;
    let mut line_start = 0;
    let line_ends = memchr::memchr_iter(b'\n', payload.as_bytes()).chain(std::iter::once(payload.len()));

    for line_end in line_ends {
        let line = &payload[line_start..line_end];
        line_start = line_end + 1;
        if line.trim().is_empty() {
            continue;
        }
        if expect_source_line {
            expect_source_line = false;
            continue;
        }
        let action: Map<String, Value> = serde_json::from_str(line)
            .map_err(|err| TransportError::Decode(format!("bad action line {line:?}: {err}")))?;
        let op_type = match action.keys().next().map(String::as_str) {
            Some("index") => "index",
            Some("create") => "create",
            Some("update") => "update",
            Some("delete") => "delete",
            other => {
                return Err(TransportError::Decode(format!(
                    "unknown bulk action {other:?} in line {line:?}"
                )));
            }
        };
        expect_source_line = op_type != "delete";
        op_types.push(op_type);
    }
    Ok(op_types)
}
