//! 📡 Bulk operations: one document's worth of intent, serialized into the bulk API's two-line
//! dialect.
//!
//! 🎬 COLD OPEN: INT. BULK ENDPOINT, HIGH NOON
//!
//! The bulk API has rules. Action line first, source line second (unless you are deleting, in
//! which case the source stays home). Newline-delimited. Not commas. Not XML. NEWLINES.
//!
//! 🧠 Knowledge graph:
//! - `BulkableRequest` is the serializer boundary the worker talks to. Anything that can produce
//!   lines can ride the processor. It must be idempotent: the accumulator calls it once to
//!   measure and once more to build the payload.
//! - `BulkOperation` is the stock implementation: index / create / update / delete.
//! - `SharedRequest` is how an operation travels: `Arc`, so the before/after callbacks can see
//!   the batch without the worker giving it up.
//!
//! ⚠️ Trailing newlines are NOT produced here. The accumulator terminates every line. 🦆

use std::sync::Arc;

use serde::de::IgnoredAny;
use serde_json::{Map, Value};

use crate::error::SerializationError;

/// 📜 Anything that can be turned into one or more bulk NDJSON lines.
///
/// # Contract
/// - Returns the lines WITHOUT terminators.
/// - Same input, same output, every time. No side effects. The accumulator depends on it.
pub trait BulkableRequest: Send + Sync + std::fmt::Debug {
    fn source(&self) -> Result<Vec<String>, SerializationError>;
}

/// 📦 An operation on its way through the processor. Cheap to clone, impossible to mutate.
pub type SharedRequest = Arc<dyn BulkableRequest>;

/// 🎯 What the bulk API should do with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Index,
    Create,
    Update,
    Delete,
}

impl BulkAction {
    /// 🏷️ The key used both in the action line and in the response item map.
    pub fn as_str(self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Update => "update",
            BulkAction::Delete => "delete",
        }
    }
}

/// 📦 One index/create/update/delete against one document.
///
/// The document body is kept as the raw JSON string it arrived as. We check that it IS json
/// and otherwise pass it through untouched. Zero re-serialization of the body, because the body
/// already did its homework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOperation {
    action: BulkAction,
    index: Option<String>,
    id: Option<String>,
    routing: Option<String>,
    doc: Option<String>,
}

impl BulkOperation {
    /// 🚀 `{"index":{...}}` + the document. Creates or replaces.
    pub fn index(doc: impl Into<String>) -> Self {
        Self::with_action(BulkAction::Index, Some(doc.into()))
    }

    /// 🆕 `{"create":{...}}` + the document. Fails on the server if the id already exists.
    pub fn create(doc: impl Into<String>) -> Self {
        Self::with_action(BulkAction::Create, Some(doc.into()))
    }

    /// 🩹 `{"update":{...}}` + `{"doc": partial}`. Needs an id.
    pub fn update(id: impl Into<String>, partial_doc: impl Into<String>) -> Self {
        Self::with_action(BulkAction::Update, Some(partial_doc.into())).id(id)
    }

    /// 🗑️ `{"delete":{...}}`, no source line. Needs an id.
    pub fn delete(id: impl Into<String>) -> Self {
        Self::with_action(BulkAction::Delete, None).id(id)
    }

    fn with_action(action: BulkAction, doc: Option<String>) -> Self {
        Self {
            action,
            index: None,
            id: None,
            routing: None,
            doc,
        }
    }

    /// 📡 Target index for this one document. Overrides the processor's default target.
    pub fn index_name(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    pub fn action(&self) -> BulkAction {
        self.action
    }

    /// 🔒 Make sure the raw body is at least json-shaped before we vouch for it on the wire.
    fn checked_doc(&self) -> Result<&str, SerializationError> {
        let the_body = self.doc.as_deref().ok_or_else(|| {
            SerializationError::new(format!(
                "{} operation has no document body",
                self.action.as_str()
            ))
        })?;
        serde_json::from_str::<IgnoredAny>(the_body)
            .map_err(|err| SerializationError::new(format!("document is not valid JSON: {err}")))?;
        Ok(the_body)
    }
}

impl BulkableRequest for BulkOperation {
    fn source(&self) -> Result<Vec<String>, SerializationError> {
        // 🏗️ Action metadata: only the fields we actually know. Missing fields are omitted,
        // not nulled, and the cluster fills in the blanks.
        let mut the_action_metadata = Map::new();
        if let Some(ref index) = self.index {
            the_action_metadata.insert("_index".to_string(), Value::String(index.clone()));
        }
        if let Some(ref id) = self.id {
            the_action_metadata.insert("_id".to_string(), Value::String(id.clone()));
        }
        if let Some(ref routing) = self.routing {
            the_action_metadata.insert("routing".to_string(), Value::String(routing.clone()));
        }

        if matches!(self.action, BulkAction::Update | BulkAction::Delete) && self.id.is_none() {
            return Err(SerializationError::new(format!(
                "{} operation requires an _id",
                self.action.as_str()
            )));
        }

        let mut the_envelope = Map::new();
        the_envelope.insert(
            self.action.as_str().to_string(),
            Value::Object(the_action_metadata),
        );
        let the_action_line = Value::Object(the_envelope).to_string();

        match self.action {
            BulkAction::Delete => Ok(vec![the_action_line]),
            BulkAction::Index | BulkAction::Create => {
                Ok(vec![the_action_line, self.checked_doc()?.to_string()])
            }
            // 🩹 Partial docs are wrapped by hand; the body was validated so the frame stays json.
            BulkAction::Update => Ok(vec![
                the_action_line,
                format!("{{\"doc\":{}}}", self.checked_doc()?),
            ]),
        }
    }
}
