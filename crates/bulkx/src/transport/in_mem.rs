//! 🧪 The in-memory transport: no network, no disk, no heartbeat, no mortgage on the line.
//!
//! Every payload is kept in a shared `Vec` so callers can inspect what arrived, and every op is
//! answered with a cheerful 2xx. Great for assertions, great for dry runs, great for trust
//! issues.
//!
//! ⚠️ Not for production. If you're shipping this to prod, please also ship a therapist.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::trace;

use super::{Transport, op_types_in_payload};
use crate::accumulator::BulkTarget;
use crate::error::TransportError;
use crate::response::BulkResponse;

/// 📦 A transport that never forgets. Clone it before handing it off to keep a peephole.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTransport {
    received: Arc<Mutex<Vec<String>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📸 Every payload received so far, in arrival order.
    pub fn payloads(&self) -> Vec<String> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, payload: String, _target: &BulkTarget) -> Result<BulkResponse, TransportError> {
        let op_types = op_types_in_payload(&payload)?;
        trace!(
            "📥 in-memory transport swallowed {} ops in {} bytes",
            op_types.len(),
            payload.len()
        );
        self.received
            .lock()
            .map_err(|_| TransportError::Io("in-memory payload log is poisoned".into()))?
            .push(payload);
        Ok(BulkResponse::all_succeeded(op_types.iter().copied(), 0))
    }
}
