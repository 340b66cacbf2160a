//! 📦 The batch accumulator: a worker's private shopping cart of pending operations.
//!
//! 🧠 Knowledge graph:
//! - Order in = order on the wire = order of the response items. Never reorder. The response
//!   is correlated by position and the store does not leave forwarding addresses.
//! - The size estimate is memoized behind a cursor: polling `estimated_size()` after every
//!   `append` only measures the newcomers. The flush policy polls a LOT.
//! - `reset()` clears but keeps the allocation. One cart per worker, forever.
//!
//! 🦆 The duck sits in the child seat of the cart. Nobody knows who put it there.

use std::sync::Arc;

use crate::error::SerializationError;
use crate::operations::SharedRequest;

/// 🎯 Where a batch goes when its operations don't say otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkTarget {
    /// 📡 Default index (`/{index}/_bulk`). `None` means every op names its own.
    pub index: Option<String>,
}

/// 📦 Ordered pending operations plus a running byte estimate.
#[derive(Debug)]
pub struct BatchAccumulator {
    requests: Vec<SharedRequest>,
    size_in_bytes: usize,
    size_cursor: usize,
    target: Arc<BulkTarget>,
}

impl BatchAccumulator {
    pub fn new(target: Arc<BulkTarget>) -> Self {
        Self {
            requests: Vec::new(),
            size_in_bytes: 0,
            size_cursor: 0,
            target,
        }
    }

    /// ➕ Tail append. The size estimate catches up lazily.
    pub fn append(&mut self, request: SharedRequest) {
        self.requests.push(request);
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn target(&self) -> &Arc<BulkTarget> {
        &self.target
    }

    /// 📸 The pending ops, in order, for callbacks and response correlation.
    pub fn requests(&self) -> &[SharedRequest] {
        &self.requests
    }

    /// 📏 Cumulative serialized size: every line's length + 1 for its terminator.
    ///
    /// Only operations appended since the previous call are measured. An operation that cannot
    /// serialize weighs zero here and blows up in `payload()` instead, where it can be reported.
    pub fn estimated_size(&mut self) -> usize {
        if self.size_cursor == self.requests.len() {
            return self.size_in_bytes;
        }
        for request in &self.requests[self.size_cursor..] {
            self.size_in_bytes += estimate_size_in_bytes(request.as_ref());
        }
        self.size_cursor = self.requests.len();
        self.size_in_bytes
    }

    /// 📜 The NDJSON body: every line of every op, each terminated by `\n`.
    ///
    /// Pre-sized with `estimated_size()` so the buffer never regrows. If ANY op fails to
    /// serialize, nothing is returned and nothing gets sent.
    pub fn payload(&mut self) -> Result<String, SerializationError> {
        let mut payload = String::with_capacity(self.estimated_size());
        for request in &self.requests {
            for line in request.source()? {
                payload.push_str(&line);
                payload.push('\n');
            }
        }
        Ok(payload)
    }

    /// 🚚 Hand every pending op to the caller and reset. Used once a send has been dispatched;
    /// anything needing another go gets re-appended explicitly.
    pub fn take(&mut self) -> Vec<SharedRequest> {
        self.size_in_bytes = 0;
        self.size_cursor = 0;
        std::mem::take(&mut self.requests)
    }

    /// 🧹 Clear ops and the size cursor. Capacity stays.
    pub fn reset(&mut self) {
        self.requests.clear();
        self.size_in_bytes = 0;
        self.size_cursor = 0;
    }
}

fn estimate_size_in_bytes(request: &dyn crate::operations::BulkableRequest) -> usize {
    match request.source() {
        Ok(lines) => lines.iter().map(|line| line.len() + 1).sum(),
        Err(_) => 0,
    }
}
