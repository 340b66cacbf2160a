//! 📬 Bulk responses: what the store said about every line we sent it.
//!
//! The wire shape is the `_bulk` reply:
//!
//! ```text
//! {"took":30,"errors":true,"items":[{"index":{"_id":"1","status":201}},{"delete":{"status":404}}]}
//! ```
//!
//! Every item is a one-key map (`op type -> result`). We flatten that into `BulkResponseItem`
//! with the op type pulled out, because nobody wants to `.values().next()` their way through
//! a stats update. Items line up with the request positionally. That is the whole contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 📬 One commit attempt's outcome, never mutated after decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBulkResponse")]
pub struct BulkResponse {
    /// ⏱️ Server-side duration of the bulk call, in milliseconds.
    pub took: u64,
    /// 🚩 True when at least one item failed.
    pub errors: bool,
    pub items: Vec<BulkResponseItem>,
}

/// 🎯 One item's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkResponseItem {
    /// 🏷️ `index`, `create`, `update` or `delete`.
    pub op_type: String,
    pub status: u16,
    pub index: Option<String>,
    pub id: Option<String>,
    /// 📝 `created`, `updated`, `deleted`, `not_found`, `noop`...
    pub result: Option<String>,
    pub error: Option<BulkItemError>,
}

/// 💀 Why an item failed, in the store's own words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub reason: String,
}

impl BulkResponseItem {
    /// ✅ Anything 2xx.
    pub fn succeeded(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 🩺 Human-readable failure reason, falling back to the status itself.
    pub fn failure_reason(&self) -> String {
        match self.error {
            Some(ref error) => format!("{}: {}", error.kind, error.reason),
            None => format!("status {}", self.status),
        }
    }
}

impl BulkResponse {
    /// 🏗️ The "everything went fine" response transports synthesize when they have no server
    /// to ask, one item per op type.
    pub fn all_succeeded<'a>(op_types: impl IntoIterator<Item = &'a str>, took: u64) -> Self {
        let items = op_types
            .into_iter()
            .map(|op_type| BulkResponseItem {
                op_type: op_type.to_string(),
                status: if op_type == "create" { 201 } else { 200 },
                index: None,
                id: None,
                result: None,
                error: None,
            })
            .collect();
        Self {
            took,
            errors: false,
            items,
        }
    }

    pub fn by_op_type<'a>(&'a self, op_type: &'a str) -> impl Iterator<Item = &'a BulkResponseItem> {
        self.items.iter().filter(move |item| item.op_type == op_type)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &BulkResponseItem> {
        self.items.iter().filter(|item| item.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BulkResponseItem> {
        self.items.iter().filter(|item| !item.succeeded())
    }
}

// ===== Wire decoding =====

#[derive(Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, RawBulkResponseItem>>,
}

#[derive(Deserialize)]
struct RawBulkResponseItem {
    #[serde(default)]
    status: u16,
    #[serde(rename = "_index", default)]
    index: Option<String>,
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<BulkItemError>,
}

impl TryFrom<RawBulkResponse> for BulkResponse {
    type Error = String;

    fn try_from(raw: RawBulkResponse) -> Result<Self, Self::Error> {
        let mut items = Vec::with_capacity(raw.items.len());
        for (position, one_key_map) in raw.items.into_iter().enumerate() {
            // 🔒 Exactly one op type per item. Anything else means we can't correlate.
            if one_key_map.len() != 1 {
                return Err(format!(
                    "bulk response item #{position} has {} op types, expected exactly 1",
                    one_key_map.len()
                ));
            }
            if let Some((op_type, item)) = one_key_map.into_iter().next() {
                items.push(BulkResponseItem {
                    op_type,
                    status: item.status,
                    index: item.index,
                    id: item.id,
                    result: item.result,
                    error: item.error,
                });
            }
        }
        Ok(Self {
            took: raw.took,
            errors: raw.errors,
            items,
        })
    }
}
