//! 🧪 End-to-end processor behavior against a transport that does exactly what it's told.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use super::*;
use crate::backoff::{ConstantBackoff, StopBackoff};
use crate::error::{SerializationError, TransportError};
use crate::operations::BulkOperation;
use crate::response::{BulkItemError, BulkResponseItem};
use crate::transport::op_types_in_payload;

/// 🎬 What the next `send` should do. When the script runs dry, everything succeeds.
#[derive(Debug)]
enum Scripted {
    Fail(TransportError),
    Statuses(Vec<u16>),
    /// ⏸️ Block until the gate opens, then succeed.
    Gated(Arc<Notify>),
}

#[derive(Debug)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<String>>,
    calls: mpsc::UnboundedSender<String>,
    healthy: AtomicBool,
    health_checks: AtomicUsize,
}

impl ScriptedTransport {
    fn new(script: Vec<Scripted>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (calls, call_log) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
            calls,
            healthy: AtomicBool::new(true),
            health_checks: AtomicUsize::new(0),
        });
        (transport, call_log)
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// 🔢 Ops per send, in send order.
    fn batch_sizes(&self) -> Vec<usize> {
        self.sent()
            .iter()
            .map(|payload| op_types_in_payload(payload).unwrap().len())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, payload: String, _target: &BulkTarget) -> Result<BulkResponse, TransportError> {
        self.sent.lock().unwrap().push(payload.clone());
        let _ = self.calls.send(payload.clone());
        let op_types = op_types_in_payload(&payload)?;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Statuses(statuses)) => Ok(BulkResponse {
                took: 3,
                errors: statuses.iter().any(|status| !(200..300).contains(status)),
                items: op_types
                    .iter()
                    .zip(statuses)
                    .map(|(op_type, status)| BulkResponseItem {
                        op_type: op_type.to_string(),
                        status,
                        index: None,
                        id: None,
                        result: None,
                        error: (!(200..300).contains(&status)).then(|| BulkItemError {
                            kind: "es_rejected_execution_exception".into(),
                            reason: "queue full".into(),
                        }),
                    })
                    .collect(),
            }),
            Some(Scripted::Gated(gate)) => {
                gate.notified().await;
                Ok(BulkResponse::all_succeeded(op_types.iter().copied(), 1))
            }
            None => Ok(BulkResponse::all_succeeded(op_types.iter().copied(), 1)),
        }
    }

    async fn health_check(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

/// ☠️ Cannot be turned into NDJSON, no matter how nicely you ask.
#[derive(Debug)]
struct CursedRequest;

impl BulkableRequest for CursedRequest {
    fn source(&self) -> Result<Vec<String>, SerializationError> {
        Err(SerializationError::new("the doc is haunted"))
    }
}

fn doc(n: usize) -> BulkOperation {
    BulkOperation::index(format!("{{\"n\":{n}}}")).id(n.to_string())
}

fn builder(transport: &Arc<ScriptedTransport>) -> BulkProcessorBuilder {
    BulkProcessorBuilder::new(transport.clone())
        .stats(true)
        .bulk_size(-1)
        .backoff(ConstantBackoff::new(Duration::from_millis(10)))
}

#[tokio::test]
async fn the_one_where_seven_ops_at_three_per_batch_make_three_sends() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport).bulk_actions(3).start().await?;

    for n in 0..7 {
        processor.add(doc(n)).await?;
    }
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![3, 3, 1]);
    let stats = processor.stats();
    assert_eq!(stats.committed, 3);
    assert_eq!(stats.indexed, 7);
    assert_eq!(stats.succeeded, 7);
    assert_eq!(stats.failed, 0);
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_second_op_pulls_the_trigger() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport).bulk_actions(2).start().await?;

    processor.add(doc(1)).await?;
    processor.add(doc(2)).await?;
    // 🤝 a single worker only accepts #3 after it finished committing #1 and #2
    processor.add(doc(3)).await?;
    assert_eq!(transport.batch_sizes(), vec![2]);
    assert!(transport.sent()[0].contains("\"n\":1") && transport.sent()[0].contains("\"n\":2"));

    processor.flush().await?;
    assert_eq!(transport.batch_sizes(), vec![2, 1]);
    assert!(transport.sent()[1].contains("\"n\":3"));
    processor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn the_one_where_only_the_throttled_item_goes_around_again() -> Result<(), BulkError> {
    let gate = Arc::new(Notify::new());
    let (transport, mut calls) = ScriptedTransport::new(vec![
        Scripted::Statuses(vec![200, 429, 200]),
        Scripted::Gated(Arc::clone(&gate)),
    ]);
    let processor = builder(&transport).bulk_actions(3).start().await?;

    processor.add(doc(0)).await?;
    processor.add(doc(1)).await?;
    processor.add(doc(2)).await?;

    let first = calls.recv().await.unwrap();
    assert_eq!(op_types_in_payload(&first).unwrap().len(), 3);
    let retry = calls.recv().await.unwrap();
    assert_eq!(op_types_in_payload(&retry).unwrap().len(), 1);
    assert!(retry.contains("\"n\":1"));

    // ⏸️ the retry is parked at the gate; the two finished items are already counted
    let mid_flight = processor.stats();
    assert_eq!(mid_flight.succeeded, 2);
    assert_eq!(mid_flight.committed, 0);

    gate.notify_one();
    processor.stop().await?;
    let stats = processor.stats();
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.committed, 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_non_retryable_item_is_counted_and_reported() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![Scripted::Statuses(vec![201, 400])]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let processor = builder(&transport)
        .bulk_actions(2)
        .on_error(move |err| observed.lock().unwrap().push(err.clone()))
        .start()
        .await?;

    processor.add(doc(0)).await?;
    processor.add(doc(1)).await?;
    processor.stop().await?;

    assert_eq!(transport.sent().len(), 1);
    let stats = processor.stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[BulkError::ItemPermanent {
            position: 1,
            status: 400,
            reason: "es_rejected_execution_exception: queue full".into(),
        }]
    );
    Ok(())
}

#[tokio::test]
async fn the_one_where_flushing_nothing_still_counts_as_a_flush() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport).workers(3).start().await?;

    processor.flush().await?;
    processor.stop().await?;

    assert!(transport.sent().is_empty());
    let stats = processor.stats();
    assert_eq!(stats.flushed, 1);
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.workers.len(), 3);
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_envelope_fails_once_and_then_lands() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![Scripted::Fail(TransportError::Status {
        status: 500,
        body: "shard on fire".into(),
    })]);
    let processor = builder(&transport).bulk_actions(2).start().await?;

    processor.add(doc(0)).await?;
    processor.add(doc(1)).await?;
    processor.stop().await?;

    // 📡 same batch, sent twice
    assert_eq!(transport.batch_sizes(), vec![2, 2]);
    let stats = processor.stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 0);
    Ok(())
}

#[tokio::test]
async fn the_one_where_stop_sends_the_leftovers() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport).bulk_actions(10).start().await?;

    for n in 0..3 {
        processor.add(doc(n)).await?;
    }
    assert!(transport.sent().is_empty());
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![3]);
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_byte_threshold_fires_before_the_count() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    // 📏 each op weighs exactly 30 bytes (22 + 8), so 60 trips on every second op
    let processor = builder(&transport)
        .bulk_actions(-1)
        .bulk_size(60)
        .start()
        .await?;

    for n in 0..4 {
        processor.add(doc(n)).await?;
    }
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![2, 2]);
    Ok(())
}

#[tokio::test]
async fn the_one_where_retries_run_out_and_the_worker_keeps_going() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![Scripted::Fail(TransportError::Status {
        status: 503,
        body: "nope".into(),
    })]);
    let afters = Arc::new(Mutex::new(Vec::new()));
    let after_log = Arc::clone(&afters);
    let processor = builder(&transport)
        .bulk_actions(2)
        .backoff(StopBackoff)
        .after(move |execution_id, ops, response, err| {
            after_log
                .lock()
                .unwrap()
                .push((execution_id, ops.len(), response.is_some(), err.cloned()));
        })
        .start()
        .await?;

    processor.add(doc(0)).await?;
    processor.add(doc(1)).await?;
    processor.add(doc(2)).await?;
    processor.add(doc(3)).await?;
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![2, 2]);
    let stats = processor.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.committed, 2);

    let afters = afters.lock().unwrap();
    assert_eq!(afters.len(), 2);
    assert_eq!(afters[0].0, 1);
    assert!(!afters[0].2);
    assert!(matches!(afters[0].3, Some(BulkError::Transport(TransportError::Status { status: 503, .. }))));
    assert_eq!(afters[1], (2, 2, true, None));
    Ok(())
}

#[tokio::test]
async fn the_one_where_throttled_items_run_out_of_chances() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![Scripted::Statuses(vec![201, 429])]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let processor = builder(&transport)
        .bulk_actions(2)
        .backoff(StopBackoff)
        .on_error(move |err| observed.lock().unwrap().push(err.clone()))
        .start()
        .await?;

    processor.add(doc(0)).await?;
    processor.add(doc(1)).await?;
    processor.flush().await?;
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![2]);
    let stats = processor.stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(seen.lock().unwrap().as_slice(), &[BulkError::ItemsRetryable { count: 1 }]);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_cursed_op_is_turned_away_at_the_door() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let processor = builder(&transport)
        .bulk_actions(2)
        .on_error(move |err| observed.lock().unwrap().push(err.clone()))
        .start()
        .await?;

    processor.add(doc(0)).await?;
    processor.add(CursedRequest).await?;
    processor.add(doc(1)).await?;
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![2]);
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[BulkError::Serialization(SerializationError::new("the doc is haunted"))]
    );
    Ok(())
}

#[tokio::test]
async fn the_one_where_before_and_after_bracket_every_commit() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let before_log = Arc::clone(&log);
    let after_log = Arc::clone(&log);
    let processor = builder(&transport)
        .bulk_actions(1)
        .before(move |execution_id, ops| before_log.lock().unwrap().push(format!("before {execution_id} {}", ops.len())))
        .after(move |execution_id, ops, response, err| {
            after_log.lock().unwrap().push(format!(
                "after {execution_id} {} {} {}",
                ops.len(),
                response.map(|r| r.items.len()).unwrap_or(0),
                err.is_some()
            ))
        })
        .start()
        .await?;

    processor.add(doc(0)).await?;
    processor.add(doc(1)).await?;
    processor.stop().await?;

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            "before 1 1".to_string(),
            "after 1 1 1 false".to_string(),
            "before 2 1".to_string(),
            "after 2 1 1 false".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn the_one_where_the_flusher_sends_what_the_thresholds_would_not() -> Result<(), BulkError> {
    let (transport, mut calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport)
        .bulk_actions(100)
        .flush_interval(Duration::from_secs(1))
        .start()
        .await?;

    processor.add(doc(0)).await?;
    let payload = calls.recv().await.unwrap();
    assert!(payload.contains("\"n\":0"));
    assert!(processor.stats().flushed >= 1);

    processor.stop().await?;
    assert_eq!(transport.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_busy_worker_makes_callers_wait() -> Result<(), BulkError> {
    let gate = Arc::new(Notify::new());
    let (transport, mut calls) = ScriptedTransport::new(vec![Scripted::Gated(Arc::clone(&gate))]);
    let processor = builder(&transport).bulk_actions(1).start().await?;

    processor.add(doc(0)).await?;
    calls.recv().await.unwrap();

    // 🧱 the only worker is stuck at the gate, so nobody accepts the next op
    let blocked = tokio::time::timeout(Duration::from_millis(100), processor.add(doc(1))).await;
    assert!(blocked.is_err());

    gate.notify_one();
    processor.stop().await?;
    // 📦 the op that was waiting in the hand-off slot still made it out
    assert_eq!(transport.batch_sizes(), vec![1, 1]);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_flush_caught_in_a_stop_still_comes_home() -> Result<(), BulkError> {
    // 🎲 the worker picks between the closed intake and the queued flush at random; go a few rounds
    for _ in 0..10 {
        let gate = Arc::new(Notify::new());
        let (transport, mut calls) = ScriptedTransport::new(vec![Scripted::Gated(Arc::clone(&gate))]);
        let processor = Arc::new(builder(&transport).bulk_actions(1).start().await?);

        processor.add(doc(0)).await?;
        calls.recv().await.unwrap();

        // ⏸️ the worker is parked mid-send; the flush request lands in its mailbox
        let flushing = tokio::spawn({
            let processor = Arc::clone(&processor);
            async move { processor.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopping = tokio::spawn({
            let processor = Arc::clone(&processor);
            async move { processor.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        tokio::time::timeout(Duration::from_secs(2), flushing)
            .await
            .expect("💀 flush hung after stop")
            .unwrap()?;
        tokio::time::timeout(Duration::from_secs(2), stopping)
            .await
            .expect("💀 stop hung")
            .unwrap()?;
        assert_eq!(transport.batch_sizes(), vec![1]);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn the_one_where_a_worker_waits_out_a_dead_connection() -> Result<(), BulkError> {
    let (transport, mut calls) =
        ScriptedTransport::new(vec![Scripted::Fail(TransportError::Connection("refused".into()))]);
    transport.healthy.store(false, Ordering::SeqCst);
    let processor = builder(&transport)
        .bulk_actions(1)
        .backoff(StopBackoff)
        .reconnect_interval(Duration::from_secs(5))
        .start()
        .await?;

    processor.add(doc(0)).await?;
    calls.recv().await.unwrap();

    // 🩺 a few failed health checks go by while the cluster sulks
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(transport.health_checks.load(Ordering::SeqCst) >= 2);

    transport.healthy.store(true, Ordering::SeqCst);
    processor.add(doc(1)).await?;
    processor.stop().await?;

    assert_eq!(transport.batch_sizes(), vec![1, 1]);
    let stats = processor.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn the_one_where_stop_interrupts_the_wait_for_a_connection() -> Result<(), BulkError> {
    let (transport, mut calls) =
        ScriptedTransport::new(vec![Scripted::Fail(TransportError::Connection("refused".into()))]);
    transport.healthy.store(false, Ordering::SeqCst);
    let processor = builder(&transport)
        .bulk_actions(1)
        .backoff(StopBackoff)
        .reconnect_interval(Duration::from_secs(3600))
        .start()
        .await?;

    processor.add(doc(0)).await?;
    calls.recv().await.unwrap();
    processor.stop().await?;

    assert_eq!(transport.health_checks.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_lifecycle_only_goes_forward() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport).build();

    assert_eq!(processor.add(doc(0)).await, Err(BulkError::NotRunning));
    assert_eq!(processor.flush().await, Err(BulkError::NotRunning));
    processor.stop().await?;

    processor.start().await?;
    processor.start().await?;
    processor.add(doc(0)).await?;
    processor.stop().await?;
    processor.close().await?;

    assert_eq!(processor.start().await, Err(BulkError::Stopped));
    assert_eq!(processor.add(doc(1)).await, Err(BulkError::NotRunning));
    assert_eq!(transport.batch_sizes(), vec![1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn the_one_where_many_workers_share_the_load_without_losing_a_thing() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = Arc::new(builder(&transport).workers(4).bulk_actions(10).start().await?);

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                for n in 0..25 {
                    processor.add(doc(producer * 100 + n)).await?;
                }
                Ok::<_, BulkError>(())
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap()?;
    }
    processor.stop().await?;

    let sizes = transport.batch_sizes();
    assert_eq!(sizes.iter().sum::<usize>(), 100);
    assert!(sizes.iter().all(|size| *size <= 10));
    let stats = processor.stats();
    assert_eq!(stats.succeeded, 100);
    assert_eq!(stats.workers.len(), 4);
    assert!(stats.workers.iter().all(|worker| worker.queued == 0));
    Ok(())
}

#[tokio::test]
async fn the_one_where_zero_workers_still_means_one() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let processor = builder(&transport).workers(0).start().await?;
    processor.add(doc(0)).await?;
    processor.stop().await?;
    assert_eq!(processor.stats().workers.len(), 1);
    assert_eq!(transport.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_config_drives_the_builder() -> Result<(), BulkError> {
    let (transport, _calls) = ScriptedTransport::new(vec![]);
    let config = ProcessorConfig {
        name: Some("from-config".into()),
        workers: 2,
        bulk_actions: 2,
        stats: true,
        backoff: BackoffConfig::Stop,
        ..ProcessorConfig::default()
    };
    let processor = BulkProcessorBuilder::from_config(&config, transport.clone())
        .start()
        .await?;

    assert_eq!(processor.name(), "from-config");
    for n in 0..4 {
        processor.add(doc(n)).await?;
    }
    processor.stop().await?;
    assert_eq!(transport.batch_sizes().iter().sum::<usize>(), 4);
    assert_eq!(processor.stats().workers.len(), 2);
    Ok(())
}
