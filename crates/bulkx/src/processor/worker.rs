//! 🎬 *[a channel fills with ops. somewhere, a worker waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🧵 The BulkWorker: accepts ops, piles them into a batch, and commits the batch when it gets
//! big enough, when someone asks for a flush, or when the intake closes. It is the only part of
//! this crate that retries, and it is deeply unbothered by the chaos upstream.
//!
//! Commit, step by step:
//! 1. next execution id, `before` callback with the ops about to go out
//! 2. attempt under the backoff policy: build payload, send, sort the verdicts
//!    - transport blew up: the whole batch stays queued, try again
//!    - items came back: final ones get tallied right away, retryable ones go back in the
//!      batch and the attempt counts as failed so the policy decides if there's another go
//! 3. out of retries: whatever is still queued is dropped and counted as failed
//! 4. stats, `after` callback, done
//!
//! 🦆 (the duck has no comment at this time)

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use async_channel::Receiver;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, trace, warn};

use super::{FlushRequest, Handoff, Shared};
use crate::accumulator::BatchAccumulator;
use crate::backoff::{Attempt, UnitOfWork, retry_notify};
use crate::error::BulkError;
use crate::operations::SharedRequest;
use crate::response::BulkResponse;

/// 🧵 A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

pub(crate) struct BulkWorker {
    ordinal: usize,
    shared: Arc<Shared>,
    accumulator: BatchAccumulator,
    intake: Receiver<Handoff>,
    flush_requests: Receiver<FlushRequest>,
    reconnect_stop: watch::Receiver<bool>,
}

impl BulkWorker {
    pub(crate) fn new(
        ordinal: usize,
        shared: Arc<Shared>,
        intake: Receiver<Handoff>,
        flush_requests: Receiver<FlushRequest>,
        reconnect_stop: watch::Receiver<bool>,
    ) -> Self {
        let accumulator = BatchAccumulator::new(Arc::clone(&shared.target));
        Self {
            ordinal,
            shared,
            accumulator,
            intake,
            flush_requests,
            reconnect_stop,
        }
    }

    async fn work(&mut self) {
        debug!(
            "📥 bulk worker {} of {:?} started",
            self.ordinal, self.shared.name
        );
        loop {
            let mut draining = false;
            let outcome = tokio::select! {
                handoff = self.intake.recv() => match handoff {
                    Ok(Handoff { request, accepted }) => {
                        // 🤝 The caller may have given up waiting; the op is ours either way.
                        let _ = accepted.send(());
                        self.receive(request).await
                    }
                    Err(_) => {
                        // 🏁 intake is empty and closed: commit leftovers and clock out
                        draining = true;
                        self.commit_if_pending().await
                    }
                },
                Ok(done) = self.flush_requests.recv() => {
                    let outcome = self.commit_if_pending().await;
                    let _ = done.send(());
                    outcome
                }
            };

            if let Err(err) = outcome {
                if matches!(err, BulkError::ItemsRetryable { .. }) {
                    warn!(
                        "⚠️ bulk worker {} of {:?} gave up on throttled items: {err}",
                        self.ordinal, self.shared.name
                    );
                } else {
                    error!(
                        "💀 bulk worker {} of {:?} was unable to perform work: {err}",
                        self.ordinal, self.shared.name
                    );
                }
                self.shared.observe(&err);
                if !draining && err.is_connection() {
                    self.wait_for_active_connection().await;
                }
            }
            if draining {
                self.release_pending_flushes();
                debug!(
                    "🏁 bulk worker {} of {:?}: intake closed, clocking out",
                    self.ordinal, self.shared.name
                );
                return;
            }
        }
    }

    /// 🚿 Close the flush mailbox and ack whatever is still sitting in it. Everything this
    /// worker held is already committed, so those flushes are done.
    fn release_pending_flushes(&self) {
        self.flush_requests.close();
        while let Ok(done) = self.flush_requests.try_recv() {
            let _ = done.send(());
        }
    }

    async fn receive(&mut self, request: SharedRequest) -> Result<(), BulkError> {
        // 🚪 Unserializable ops are refused at the door instead of poisoning a whole batch later.
        request.source()?;
        self.accumulator.append(request);
        if self.commit_required() {
            self.commit().await
        } else {
            Ok(())
        }
    }

    async fn commit_if_pending(&mut self) -> Result<(), BulkError> {
        if self.accumulator.is_empty() {
            return Ok(());
        }
        self.commit().await
    }

    fn commit_required(&mut self) -> bool {
        let bulk_actions = self.shared.bulk_actions;
        if bulk_actions >= 0 && self.accumulator.count() as i64 >= bulk_actions {
            return true;
        }
        let bulk_size = self.shared.bulk_size;
        bulk_size >= 0 && self.accumulator.estimated_size() as i64 >= bulk_size
    }

    async fn commit(&mut self) -> Result<(), BulkError> {
        let shared = Arc::clone(&self.shared);
        let ordinal = self.ordinal;
        let execution_id = shared.execution_id.fetch_add(1, Ordering::SeqCst) + 1;
        let ops: Vec<SharedRequest> = self.accumulator.requests().to_vec();

        shared.stats.record_queued(ordinal, ops.len());
        if let Some(ref before) = shared.before {
            before(execution_id, &ops);
        }

        let mut backoff = shared.backoff.box_clone();
        let mut attempt = CommitAttempt {
            accumulator: &mut self.accumulator,
            shared: &shared,
            last_response: None,
        };
        let name = &shared.name;
        let outcome = retry_notify(backoff.as_mut(), &mut attempt, |err: &BulkError, delay: Duration| {
            warn!("🔄 bulk worker {ordinal} of {name:?} commit failed, retrying in {delay:?}: {err}");
        })
        .await;
        let last_response = attempt.last_response;

        // 🪦 out of retries: nobody gets a second chance after this
        let abandoned = self.accumulator.count();
        if outcome.is_err() && abandoned > 0 {
            warn!("🪦 bulk worker {ordinal} of {name:?} dropping {abandoned} op(s) after the last retry");
            shared.stats.record_abandoned(abandoned);
        }
        self.accumulator.reset();

        shared.stats.record_commit(
            ordinal,
            self.accumulator.count(),
            last_response
                .as_ref()
                .map(|response| Duration::from_millis(response.took)),
        );
        if let Some(ref after) = shared.after {
            after(execution_id, &ops, last_response.as_ref(), outcome.as_ref().err());
        }
        trace!("📬 bulk worker {ordinal} of {name:?} finished commit #{execution_id}");
        outcome
    }

    /// 🩺 Park until the transport says it's healthy again, checking every reconnect
    /// interval. `stop()` cuts the wait short.
    async fn wait_for_active_connection(&mut self) {
        error!(
            "🔌 bulk worker {} of {:?} is waiting for an active connection",
            self.ordinal, self.shared.name
        );
        let interval = self.shared.reconnect_interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        loop {
            let stopping = *self.reconnect_stop.borrow();
            if stopping {
                warn!(
                    "🛑 bulk worker {} of {:?} stopped waiting for a connection",
                    self.ordinal, self.shared.name
                );
                return;
            }
            tokio::select! {
                changed = self.reconnect_stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if self.shared.transport.health_check().await {
                        info!(
                            "✅ bulk worker {} of {:?} has an active connection again",
                            self.ordinal, self.shared.name
                        );
                        return;
                    }
                }
            }
        }
    }
}

impl Worker for BulkWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            self.work().await;
            Ok(())
        })
    }
}

/// 🎯 One commit's worth of attempts. Carries the batch from attempt to attempt, shrinking it
/// as items come back final.
struct CommitAttempt<'a> {
    accumulator: &'a mut BatchAccumulator,
    shared: &'a Shared,
    last_response: Option<BulkResponse>,
}

#[async_trait]
impl UnitOfWork for CommitAttempt<'_> {
    type Output = ();
    type Error = BulkError;

    async fn attempt(&mut self) -> Result<(), Attempt<BulkError>> {
        let payload = self
            .accumulator
            .payload()
            .map_err(|err| Attempt::Permanent(err.into()))?;
        let target = Arc::clone(self.accumulator.target());

        // 📡 Envelope failure: nothing is final, the whole batch stays queued.
        let response = self
            .shared
            .transport
            .send(payload, &target)
            .await
            .map_err(|err| Attempt::Transient(err.into()))?;

        let sent = self.accumulator.take();
        if response.items.len() != sent.len() {
            warn!(
                "⚠️ bulk response has {} item(s) for {} op(s); unmatched ops get no verdict",
                response.items.len(),
                sent.len()
            );
        }

        let mut requeued = 0;
        let mut final_items = Vec::with_capacity(response.items.len());
        for (position, item) in response.items.iter().enumerate() {
            if !item.succeeded() && self.shared.retry_item_status_codes.contains(&item.status) {
                if let Some(request) = sent.get(position) {
                    self.accumulator.append(Arc::clone(request));
                    requeued += 1;
                    continue;
                }
            }
            if !item.succeeded() {
                self.shared.observe(&BulkError::ItemPermanent {
                    position,
                    status: item.status,
                    reason: item.failure_reason(),
                });
            }
            final_items.push(item);
        }
        self.shared.stats.record_items(final_items);
        self.last_response = Some(response);

        if requeued > 0 {
            Err(Attempt::Transient(BulkError::ItemsRetryable { count: requeued }))
        } else {
            Ok(())
        }
    }
}
