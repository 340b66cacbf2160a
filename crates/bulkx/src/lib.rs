//! 🚀 bulkx: a bulk processor for Elasticsearch-style `_bulk` endpoints.
//!
//! 🎬 *[narrator voice]* "Documents arrived one at a time. The cluster wanted them by the
//! thousand. Someone had to stand in between."
//!
//! 🧠 Knowledge graph:
//! - `operations`: what callers add (`BulkOperation`, or anything `BulkableRequest`).
//! - `accumulator`: a worker's pending batch and its memoized size.
//! - `processor`: builder, lifecycle, workers, the commit-and-retry protocol.
//! - `backoff`: retry policies and the driver that runs them.
//! - `transport`: where finished NDJSON payloads go (Elasticsearch, a file, memory).
//! - `response` / `stats` / `error`: what comes back, what gets counted, what goes wrong.
//! - `run`: the CLI pipeline. Read an NDJSON file, feed every line in, report the score.
//!
//! 🦆 The duck is load-bearing. Do not remove the duck.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

pub mod accumulator;
pub mod app_config;
pub mod backoff;
pub mod error;
mod input;
pub mod operations;
pub mod processor;
mod progress;
pub mod response;
pub mod stats;
pub mod transport;

pub use accumulator::{BatchAccumulator, BulkTarget};
pub use app_config::{AppConfig, InputConfig, load_config};
pub use backoff::{Backoff, ConstantBackoff, ExponentialBackoff, StopBackoff};
pub use error::{BulkError, SerializationError, TransportError};
pub use operations::{BulkAction, BulkOperation, BulkableRequest, SharedRequest};
pub use processor::{BulkProcessor, BulkProcessorBuilder, ProcessorConfig};
pub use progress::stats_table;
pub use response::{BulkResponse, BulkResponseItem};
pub use stats::{BulkProcessorStats, BulkProcessorWorkerStats};
pub use transport::{
    ElasticsearchTransport, FileTransport, InMemoryTransport, Transport, TransportBackend,
    TransportConfig,
};

use input::NdjsonReader;
use progress::LoadProgress;

/// 🚀 Bulk-load the configured input file through a freshly started processor.
///
/// Every non-blank line becomes an `index` op. The processor is always stopped, so whatever
/// was queued gets its final commit even when reading the input failed halfway.
pub async fn run(app_config: AppConfig) -> Result<BulkProcessorStats> {
    let transport = TransportBackend::from_config(app_config.transport.clone())
        .await
        .context("💀 The transport could not be built. Check the [transport] section and whether the other end is awake.")?;
    let processor = BulkProcessorBuilder::from_config(&app_config.processor, Arc::new(transport))
        .start()
        .await
        .context("💀 The bulk processor refused to start")?;

    let fed = feed(&processor, &app_config.input).await;
    processor
        .stop()
        .await
        .context("💀 The bulk processor did not stop cleanly")?;
    let docs_added = fed?;

    let stats = processor.stats();
    info!(
        "🏁 done: {} docs added, {} succeeded, {} failed",
        docs_added, stats.succeeded, stats.failed
    );
    Ok(stats)
}

async fn feed(processor: &BulkProcessor, input: &InputConfig) -> Result<u64> {
    let mut reader = NdjsonReader::open(&input.file_name).await?;
    let mut progress = LoadProgress::new(input.file_name.display().to_string(), reader.file_size());
    let mut docs_added = 0u64;

    while let Some(page) = reader.next_page().await? {
        let page_docs = page.lines.len() as u64;
        for line in page.lines {
            let operation = match input.index {
                Some(ref index) => BulkOperation::index(line).index_name(index.as_str()),
                None => BulkOperation::index(line),
            };
            processor
                .add(operation)
                .await
                .context("💀 The processor stopped taking documents mid-file")?;
        }
        docs_added += page_docs;
        progress.update(page.bytes_read as u64, page_docs, &processor.stats());
    }
    progress.finish();
    Ok(docs_added)
}
