//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where documents arrive one at a time..."
//! 🎬 "One processor dared to send them in bulk."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The BulkProcessor: hand it operations one by one, it hands the cluster batches.
//!
//! 🧠 Knowledge graph:
//! - `BulkProcessorBuilder` collects knobs, `build()` gives a not-yet-running processor,
//!   `start()` on the builder does both in one go.
//! - `start()` spawns N workers (private, see `worker.rs`) and, if configured, a flusher task
//!   that pokes every worker on an interval.
//! - `add()` is a hand-off: it returns once a worker has ACCEPTED the op. If every worker is
//!   busy committing, callers wait. That wait is the backpressure.
//! - `flush()` asks each worker in turn to commit what it holds and waits for each one.
//! - `stop()` (a.k.a. `close()`): interrupt connection waits, stop the flusher, close intake,
//!   let every worker commit its leftovers, wait for all of them. Idempotent.
//! - Once stopped, a processor stays stopped. Build a new one.
//!
//! ⚠️ Workers are the processor's private minions. Do not pub them. You have been warned.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::accumulator::BulkTarget;
use crate::backoff::Backoff;
use crate::error::BulkError;
use crate::operations::{BulkableRequest, SharedRequest};
use crate::response::BulkResponse;
use crate::stats::{BulkProcessorStats, StatsRegistry};
use crate::transport::Transport;

pub mod config;
mod worker;

#[cfg(test)]
mod tests;

pub use config::{BackoffConfig, ExponentialBackoffConfig, ProcessorConfig};
use worker::{BulkWorker, Worker};

/// 📣 Called right before a batch is sent: `(execution_id, ops)`.
pub type BeforeCommitFn = Arc<dyn Fn(i64, &[SharedRequest]) + Send + Sync>;
/// 📣 Called after a commit finished, successfully or not:
/// `(execution_id, ops, last response if any, error if any)`.
pub type AfterCommitFn =
    Arc<dyn Fn(i64, &[SharedRequest], Option<&BulkResponse>, Option<&BulkError>) + Send + Sync>;
/// 👀 Sees every error a worker swallows instead of returning: serialization failures,
/// permanent item failures, commits that ran out of retries.
pub type ErrorObserverFn = Arc<dyn Fn(&BulkError) + Send + Sync>;

/// 🤝 One op waiting to be accepted. The worker answers on `accepted` the moment it takes it.
pub(crate) struct Handoff {
    pub(crate) request: SharedRequest,
    pub(crate) accepted: oneshot::Sender<()>,
}

/// 🚽 A flush request carries its own "done" bell.
pub(crate) type FlushRequest = oneshot::Sender<()>;

/// 🧠 Everything every worker needs to read. Built once, shared by `Arc`, never mutated
/// except through its atomics and the stats lock.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) bulk_actions: i64,
    pub(crate) bulk_size: i64,
    pub(crate) retry_item_status_codes: HashSet<u16>,
    /// 🧬 Prototype policy. Every commit gets its own `box_clone()`.
    pub(crate) backoff: Box<dyn Backoff>,
    pub(crate) before: Option<BeforeCommitFn>,
    pub(crate) after: Option<AfterCommitFn>,
    pub(crate) on_error: Option<ErrorObserverFn>,
    pub(crate) stats: StatsRegistry,
    pub(crate) execution_id: AtomicI64,
    pub(crate) target: Arc<BulkTarget>,
    pub(crate) reconnect_interval: Duration,
}

impl Shared {
    pub(crate) fn observe(&self, err: &BulkError) {
        if let Some(ref on_error) = self.on_error {
            on_error(err);
        }
    }
}

/// 🔌 The sending ends of every channel a running processor owns.
struct Channels {
    intake: async_channel::Sender<Handoff>,
    flush: Vec<async_channel::Sender<FlushRequest>>,
}

/// ⏰ The periodic flusher and the doorbell used to stop it.
struct Flusher {
    stop: async_channel::Sender<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

struct Running {
    channels: Arc<Channels>,
    workers: Vec<JoinHandle<Result<()>>>,
    flusher: Option<Flusher>,
    reconnect_stop: watch::Sender<bool>,
}

enum Lifecycle {
    NotStarted,
    Started(Running),
    Stopped,
}

/// 🏗️ Knobs first, processor second.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use bulkx::{BulkOperation, BulkProcessorBuilder, InMemoryTransport};
/// # async fn demo() -> Result<(), bulkx::BulkError> {
/// let processor = BulkProcessorBuilder::new(Arc::new(InMemoryTransport::new()))
///     .name("ingest")
///     .workers(4)
///     .bulk_actions(500)
///     .flush_interval(Duration::from_secs(1))
///     .start()
///     .await?;
/// processor.add(BulkOperation::index(r#"{"hello":"world"}"#)).await?;
/// processor.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct BulkProcessorBuilder {
    transport: Arc<dyn Transport>,
    name: Option<String>,
    workers: usize,
    bulk_actions: i64,
    bulk_size: i64,
    flush_interval: Option<Duration>,
    want_stats: bool,
    backoff: Box<dyn Backoff>,
    retry_item_status_codes: HashSet<u16>,
    before: Option<BeforeCommitFn>,
    after: Option<AfterCommitFn>,
    on_error: Option<ErrorObserverFn>,
    index: Option<String>,
    reconnect_interval: Duration,
}

impl BulkProcessorBuilder {
    /// 🚀 Defaults: 1 worker, 1000 ops, 5 MiB, no periodic flush, no stats, exponential
    /// backoff 200ms..10s, retry items answering 408/429/503/507.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::from_config(&ProcessorConfig::default(), transport)
    }

    /// 🔧 Builder pre-loaded from config. Callbacks still have to be wired by hand, TOML
    /// being famously bad at closures.
    pub fn from_config(config: &ProcessorConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            name: config.name.clone(),
            workers: config.workers,
            bulk_actions: config.bulk_actions,
            bulk_size: config.bulk_size,
            flush_interval: config.flush_interval(),
            want_stats: config.stats,
            backoff: config.backoff.build(),
            retry_item_status_codes: config.retry_item_status_codes.iter().copied().collect(),
            before: None,
            after: None,
            on_error: None,
            index: config.index.clone(),
            reconnect_interval: config.reconnect_interval(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 🧵 Number of workers. 0 is quietly bumped to 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// 🔢 Commit once a worker holds this many ops. -1 disables the count threshold.
    pub fn bulk_actions(mut self, bulk_actions: i64) -> Self {
        self.bulk_actions = bulk_actions;
        self
    }

    /// 📏 Commit once a worker's estimated payload reaches this many bytes. -1 disables.
    pub fn bulk_size(mut self, bulk_size: i64) -> Self {
        self.bulk_size = bulk_size;
        self
    }

    /// ⏰ Flush every worker on this interval. `Duration::ZERO` disables it.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn stats(mut self, want_stats: bool) -> Self {
        self.want_stats = want_stats;
        self
    }

    /// ⏳ Retry policy. Cloned fresh for every commit, so state never leaks between commits.
    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// 🔄 Item statuses worth another try. An empty set means item failures are final.
    pub fn retry_item_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_item_status_codes = codes.into_iter().collect();
        self
    }

    pub fn before(mut self, before: impl Fn(i64, &[SharedRequest]) + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(before));
        self
    }

    pub fn after(
        mut self,
        after: impl Fn(i64, &[SharedRequest], Option<&BulkResponse>, Option<&BulkError>) + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(Arc::new(after));
        self
    }

    pub fn on_error(mut self, on_error: impl Fn(&BulkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// 📡 Default index for every batch this processor sends.
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// 🩺 How often a worker stuck on a dead connection re-checks health. Default 5s.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// 🏗️ A processor that is configured but not running yet.
    pub fn build(self) -> BulkProcessor {
        let name = self.name.unwrap_or_else(|| "bulkx".to_string());
        BulkProcessor {
            shared: Arc::new(Shared {
                name,
                transport: self.transport,
                bulk_actions: self.bulk_actions,
                bulk_size: self.bulk_size,
                retry_item_status_codes: self.retry_item_status_codes,
                backoff: self.backoff,
                before: self.before,
                after: self.after,
                on_error: self.on_error,
                stats: StatsRegistry::new(self.want_stats),
                execution_id: AtomicI64::new(0),
                target: Arc::new(BulkTarget { index: self.index }),
                reconnect_interval: self.reconnect_interval,
            }),
            workers: self.workers,
            flush_interval: self.flush_interval,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::NotStarted),
            channels: Mutex::new(None),
        }
    }

    /// 🚀 Build and start in one go.
    pub async fn start(self) -> Result<BulkProcessor, BulkError> {
        let processor = self.build();
        processor.start().await?;
        Ok(processor)
    }
}

impl fmt::Debug for BulkProcessorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkProcessorBuilder")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("bulk_actions", &self.bulk_actions)
            .field("bulk_size", &self.bulk_size)
            .field("flush_interval", &self.flush_interval)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// 📦 The bulk processor itself. Share it behind an `Arc`; every method takes `&self`.
pub struct BulkProcessor {
    shared: Arc<Shared>,
    workers: usize,
    flush_interval: Option<Duration>,
    /// 🔒 Serializes start/stop. Held across awaits, hence tokio's mutex.
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    /// 🔌 Fast path for add/flush. `Some` exactly while running.
    channels: Mutex<Option<Arc<Channels>>>,
}

impl BulkProcessor {
    /// 🚀 Spawn the workers (and the flusher, if configured). Starting a running processor
    /// is a no-op. Starting a stopped one is `BulkError::Stopped`.
    pub async fn start(&self) -> Result<(), BulkError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Started(_) => return Ok(()),
            Lifecycle::Stopped => return Err(BulkError::Stopped),
            Lifecycle::NotStarted => {}
        }

        let workers = self.workers.max(1);
        self.shared.execution_id.store(0, std::sync::atomic::Ordering::SeqCst);
        self.shared.stats.reset(workers);

        // 🤝 Capacity 1 plus an accept-ack: the slot holds the op, the ack proves a worker took it.
        let (intake_tx, intake_rx) = async_channel::bounded::<Handoff>(1);
        let (reconnect_stop, reconnect_rx) = watch::channel(false);
        let mut flush = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for ordinal in 0..workers {
            let (flush_tx, flush_rx) = async_channel::bounded::<FlushRequest>(1);
            let worker = BulkWorker::new(
                ordinal,
                Arc::clone(&self.shared),
                intake_rx.clone(),
                flush_rx,
                reconnect_rx.clone(),
            );
            handles.push(worker.start());
            flush.push(flush_tx);
        }

        let channels = Arc::new(Channels {
            intake: intake_tx,
            flush,
        });
        let flusher = self
            .flush_interval
            .map(|interval| Flusher::spawn(interval, Arc::clone(&channels), Arc::clone(&self.shared)));

        *self.lock_channels() = Some(Arc::clone(&channels));
        *lifecycle = Lifecycle::Started(Running {
            channels,
            workers: handles,
            flusher,
            reconnect_stop,
        });
        info!(
            "🚀 bulk processor {:?} started with {} worker(s)",
            self.shared.name, workers
        );
        Ok(())
    }

    /// 📥 Hand one op to the workers. Returns once a worker has accepted it, which may mean
    /// waiting for one to finish a commit.
    ///
    /// The hand-off parks the op in a one-slot mailbox before a worker acks it. Dropping this
    /// future after that point does not take the op back: a worker still picks it up and
    /// commits it.
    pub async fn add(&self, request: impl BulkableRequest + 'static) -> Result<(), BulkError> {
        self.add_shared(Arc::new(request)).await
    }

    /// 📥 Same as `add`, for ops already behind an `Arc`.
    pub async fn add_shared(&self, request: SharedRequest) -> Result<(), BulkError> {
        let channels = self.running_channels()?;
        let (accepted, acceptance) = oneshot::channel();
        channels
            .intake
            .send(Handoff { request, accepted })
            .await
            .map_err(|_| BulkError::NotRunning)?;
        acceptance.await.map_err(|_| BulkError::NotRunning)
    }

    /// 🚽 Ask every worker, one after another, to commit whatever it holds. Returns when the
    /// last one is done. Workers with nothing queued answer right away.
    pub async fn flush(&self) -> Result<(), BulkError> {
        let channels = self.running_channels()?;
        flush_workers(&self.shared, &channels).await
    }

    /// 🛑 Stop accepting ops, commit everything still queued, wait for every worker.
    /// Calling it again (or on a never-started processor) is a no-op.
    pub async fn stop(&self) -> Result<(), BulkError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Started(running) => running,
            Lifecycle::NotStarted => {
                *lifecycle = Lifecycle::NotStarted;
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };
        self.lock_channels().take();
        debug!("🛑 bulk processor {:?} stopping", self.shared.name);

        // 🩺 Wake anyone parked on a dead connection. Ignored if every worker already left.
        let _ = running.reconnect_stop.send(true);
        if let Some(flusher) = running.flusher {
            flusher.stop().await;
        }
        running.channels.intake.close();

        for joined in futures::future::join_all(running.workers).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("💀 bulk worker exited with an error: {err:#}"),
                Err(err) => error!("💀 bulk worker panicked or was cancelled: {err}"),
            }
        }
        info!("🏁 bulk processor {:?} stopped", self.shared.name);
        Ok(())
    }

    /// 🛑 Alias for `stop`.
    pub async fn close(&self) -> Result<(), BulkError> {
        self.stop().await
    }

    /// 📸 A snapshot of the counters. Cheap enough to poll for a progress bar.
    pub fn stats(&self) -> BulkProcessorStats {
        self.shared.stats.snapshot()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, Option<Arc<Channels>>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running_channels(&self) -> Result<Arc<Channels>, BulkError> {
        self.lock_channels().clone().ok_or(BulkError::NotRunning)
    }
}

impl fmt::Debug for BulkProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkProcessor")
            .field("name", &self.shared.name)
            .field("workers", &self.workers)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl Drop for BulkProcessor {
    /// 🧹 Dropped without `stop()`: close the intake and silence the flusher so workers drain
    /// what they hold and exit on their own. Nobody waits for them.
    fn drop(&mut self) {
        if let Lifecycle::Started(running) = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped) {
            warn!(
                "⚠️ bulk processor {:?} dropped while running; workers will drain in the background",
                self.shared.name
            );
            let _ = running.reconnect_stop.send(true);
            if let Some(flusher) = running.flusher {
                flusher.handle.abort();
            }
            running.channels.intake.close();
        }
    }
}

async fn flush_workers(shared: &Shared, channels: &Channels) -> Result<(), BulkError> {
    shared.stats.record_flush();
    for flush in &channels.flush {
        let (done, finished) = oneshot::channel();
        // 🏁 A closed mailbox means the worker already drained and clocked out during `stop`.
        if flush.send(done).await.is_err() {
            continue;
        }
        if finished.await.is_err() {
            debug!("🏁 a bulk worker of {:?} clocked out before acking a flush", shared.name);
        }
    }
    Ok(())
}

impl Flusher {
    fn spawn(interval: Duration, channels: Arc<Channels>, shared: Arc<Shared>) -> Self {
        let (stop, stop_requests) = async_channel::bounded::<oneshot::Sender<()>>(1);
        let handle = tokio::spawn(async move {
            // ⏰ First tick one interval from now, not immediately.
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = flush_workers(&shared, &channels).await {
                            warn!("⚠️ periodic flush of {:?} failed: {err}", shared.name);
                        }
                    }
                    request = stop_requests.recv() => {
                        if let Ok(done) = request {
                            let _ = done.send(());
                        }
                        return;
                    }
                }
            }
        });
        Self { stop, handle }
    }

    async fn stop(self) {
        let (done, stopped) = oneshot::channel();
        if self.stop.send(done).await.is_ok() {
            let _ = stopped.await;
        }
        let _ = self.handle.await;
    }
}
