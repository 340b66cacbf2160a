//! 💀 Errors: the taxonomy of everything that can go sideways between `add()` and `_bulk`.
//!
//! 🧠 Knowledge graph:
//! - `SerializationError`: one operation refused to become NDJSON. Never retried. Retrying a
//!   document that cannot serialize is like re-reading a letter written in invisible ink.
//! - `TransportError`: the whole send failed. Retried as a batch through the backoff policy.
//!   Only `Connection` sends a worker into connection recovery.
//! - `BulkError`: what the worker and the processor hand back. `ItemsRetryable` is its own
//!   variant on purpose: "the cluster said 429 to three docs" is not "the network is on fire".
//!
//! 🦆 The duck reviewed every variant. The duck retries nothing.

use thiserror::Error;

/// 📦 An operation that could not be turned into wire lines.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("💀 operation could not be serialized into bulk lines: {reason}")]
pub struct SerializationError {
    pub reason: String,
}

impl SerializationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// 📡 The send itself failed. No per-item outcomes exist for this attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 🔌 Could not reach the store at all: refused, reset, DNS, timeout.
    #[error("💀 connection to the bulk endpoint failed: {0}")]
    Connection(String),
    /// 📬 Reached the store, but the envelope came back non-2xx.
    #[error("💀 bulk endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
    /// 🧩 Got a 2xx with a body we could not make sense of.
    #[error("💀 bulk response could not be decoded: {0}")]
    Decode(String),
    /// 💾 Local I/O failed (file transport, gzip encoder).
    #[error("💀 transport I/O failed: {0}")]
    Io(String),
}

impl TransportError {
    /// 🔌 Connectivity-classified errors park the worker until the store is healthy again.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }
}

/// 🎭 Everything a worker or the processor can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BulkError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// 🔄 Envelope succeeded, but `count` items carried a retryable status.
    #[error("🔄 {count} bulk response item(s) carry a retryable status and were re-queued")]
    ItemsRetryable { count: usize },
    /// 🪦 One item failed with a status outside the retryable set. Counted, never retried.
    #[error("💀 bulk item #{position} failed permanently with status {status}: {reason}")]
    ItemPermanent {
        position: usize,
        status: u16,
        reason: String,
    },
    /// 🚫 `add`/`flush` on a processor that is not running.
    #[error("🚫 bulk processor is not running; start it first, and never after stop")]
    NotRunning,
    /// 🪦 `start` on a processor that was already stopped.
    #[error("🪦 bulk processor was stopped and cannot be restarted; build a fresh one")]
    Stopped,
}

impl BulkError {
    /// 🔌 True when the error means "the backend is unreachable", not "the backend said no".
    pub fn is_connection(&self) -> bool {
        matches!(self, BulkError::Transport(transport) if transport.is_connection())
    }
}
