use async_trait::async_trait;
use domain::{FieldValue, RawMessage};
use mqf_encode::{EncoderConfig, SeriesEncoder};
use mqf_pipeline::{
    BackpressurePolicy, DispatchMode, Pipeline, PipelineConfig, PipelineError, PipelineHandle,
    PipelineStatus, PushOutcome,
};
use mqf_sink::{InMemorySink, PointBatch, PointSink, SinkError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn encoder() -> Arc<SeriesEncoder> {
    Arc::new(SeriesEncoder::new(EncoderConfig::default()).expect("encoder"))
}

fn reading(i: i64) -> RawMessage {
    RawMessage::new("sensors/temp", format!("{{\"v\":{}}}", i))
}

fn config(tick_ms: u64) -> PipelineConfig {
    PipelineConfig {
        database: "test".to_string(),
        batch_size: 10,
        buffer_capacity: 20,
        tick: Duration::from_millis(tick_ms),
        write_timeout: Duration::from_millis(tick_ms / 2),
        ..PipelineConfig::default()
    }
}

fn spawn(config: PipelineConfig, sink: &Arc<InMemorySink>) -> PipelineHandle {
    Pipeline::spawn(config, encoder(), sink.clone())
}

fn values(sink: &InMemorySink) -> Vec<FieldValue> {
    sink.points()
        .into_iter()
        .filter_map(|point| point.fields.get("v").cloned())
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn batch_mode_writes_in_arrival_order() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(20), &sink);
    for i in 0..5 {
        assert_eq!(pipeline.submit(reading(i)).await, PushOutcome::Queued);
    }
    pipeline.start().await.expect("start");

    wait_until(|| sink.len() == 5).await;
    assert_eq!(sink.batches().len(), 1);
    assert_eq!(
        values(&sink),
        (0..5).map(|i| FieldValue::F64(i as f64)).collect::<Vec<_>>()
    );
    let batch = &sink.batches()[0];
    assert_eq!(batch.database, "test");
    assert_eq!(batch.points[0].series, "sensors.temp");
}

#[tokio::test]
async fn batch_size_bounds_each_flush() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(
        PipelineConfig {
            batch_size: 2,
            ..config(20)
        },
        &sink,
    );
    for i in 0..5 {
        pipeline.submit(reading(i)).await;
    }
    pipeline.start().await.expect("start");

    wait_until(|| sink.len() == 5).await;
    let sizes: Vec<usize> = sink.batches().iter().map(PointBatch::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn undecodable_messages_are_skipped() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(20), &sink);
    pipeline
        .submit(RawMessage::new("sensors/temp", "not a reading"))
        .await;
    pipeline.submit(reading(7)).await;
    pipeline.start().await.expect("start");

    wait_until(|| sink.len() == 1).await;
    assert_eq!(values(&sink), vec![FieldValue::F64(7.0)]);
    assert!(pipeline.buffer().is_empty());
}

#[tokio::test]
async fn flush_command_writes_without_waiting_for_tick() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(10_000), &sink);
    pipeline.start().await.expect("start");
    for i in 0..3 {
        pipeline.submit(reading(i)).await;
    }

    pipeline.flush().await.expect("flush");
    assert_eq!(sink.len(), 3);
}

#[tokio::test]
async fn flush_while_stopped_is_a_no_op() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(20), &sink);
    pipeline.submit(reading(1)).await;

    pipeline.flush().await.expect("flush");
    assert_eq!(sink.attempts(), 0);
    assert_eq!(pipeline.buffer().len(), 1);
}

#[tokio::test]
async fn failed_batch_is_retried_on_next_tick() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_next(1);
    let pipeline = spawn(config(20), &sink);
    for i in 0..2 {
        pipeline.submit(reading(i)).await;
    }
    pipeline.start().await.expect("start");

    wait_until(|| sink.len() == 2).await;
    assert_eq!(sink.attempts(), 2);
    assert_eq!(pipeline.state().status, PipelineStatus::Started);
    assert_eq!(values(&sink), vec![FieldValue::F64(0.0), FieldValue::F64(1.0)]);
}

#[tokio::test]
async fn consecutive_failures_fail_the_pipeline() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_next(100);
    let pipeline = spawn(
        PipelineConfig {
            max_write_failures: 3,
            ..config(20)
        },
        &sink,
    );
    pipeline.submit(reading(1)).await;
    pipeline.start().await.expect("start");

    let err = tokio::time::timeout(Duration::from_secs(3), pipeline.wait_terminal())
        .await
        .expect("pipeline failed in time");
    match err {
        PipelineError::SinkFatal(reason) => assert!(reason.contains("3 consecutive")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(sink.attempts(), 3);
    assert!(sink.is_empty());

    let state = pipeline.state();
    assert_eq!(state.status, PipelineStatus::Failed);
    assert!(state.fatal_error.is_some());
    assert_eq!(pipeline.start().await, Err(PipelineError::AlreadyFailed));
}

struct SlowSink;

#[async_trait]
impl PointSink for SlowSink {
    async fn write_batch(&self, _batch: &PointBatch) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

#[tokio::test]
async fn slow_write_counts_as_failure() {
    let pipeline = Pipeline::spawn(
        PipelineConfig {
            max_write_failures: 1,
            write_timeout: Duration::from_millis(10),
            ..config(40)
        },
        encoder(),
        Arc::new(SlowSink),
    );
    pipeline.submit(reading(1)).await;
    pipeline.start().await.expect("start");

    let err = tokio::time::timeout(Duration::from_secs(3), pipeline.wait_terminal())
        .await
        .expect("pipeline failed in time");
    match err {
        PipelineError::SinkFatal(reason) => assert!(reason.contains("timed out")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stop_keeps_buffered_messages_for_restart() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(20), &sink);
    pipeline.start().await.expect("start");
    pipeline.stop().await.expect("stop");
    assert_eq!(pipeline.state().status, PipelineStatus::Stopped);

    for i in 0..3 {
        pipeline.submit(reading(i)).await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(sink.attempts(), 0);
    assert_eq!(pipeline.buffer().len(), 3);

    pipeline.start().await.expect("restart");
    wait_until(|| sink.len() == 3).await;
}

#[tokio::test]
async fn stop_keeps_failed_batch_for_restart() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_next(1);
    let pipeline = spawn(config(10_000), &sink);
    pipeline.submit(reading(42)).await;
    pipeline.start().await.expect("start");

    pipeline.flush().await.expect("flush");
    assert_eq!(sink.attempts(), 1);
    assert!(sink.is_empty());

    pipeline.stop().await.expect("stop");
    assert!(pipeline.buffer().is_empty());

    pipeline.start().await.expect("restart");
    pipeline.flush().await.expect("flush");
    assert_eq!(values(&sink), vec![FieldValue::F64(42.0)]);
}

#[tokio::test]
async fn immediate_mode_writes_each_message() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(
        PipelineConfig {
            mode: DispatchMode::Immediate,
            ..config(20)
        },
        &sink,
    );
    pipeline.start().await.expect("start");
    for i in 0..3 {
        pipeline.submit(reading(i)).await;
    }

    wait_until(|| sink.len() == 3).await;
    assert!(sink.batches().iter().all(|batch| batch.len() == 1));
    assert_eq!(
        values(&sink),
        vec![
            FieldValue::F64(0.0),
            FieldValue::F64(1.0),
            FieldValue::F64(2.0)
        ]
    );
}

#[tokio::test]
async fn immediate_mode_retries_after_delay() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_next(1);
    let pipeline = spawn(
        PipelineConfig {
            mode: DispatchMode::Immediate,
            ..config(20)
        },
        &sink,
    );
    pipeline.start().await.expect("start");
    pipeline.submit(reading(5)).await;

    wait_until(|| sink.len() == 1).await;
    assert_eq!(sink.attempts(), 2);
    assert_eq!(pipeline.state().status, PipelineStatus::Started);
}

#[tokio::test]
async fn block_policy_holds_producer_until_flushed() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(
        PipelineConfig {
            batch_size: 2,
            buffer_capacity: 2,
            backpressure: BackpressurePolicy::Block,
            ..config(20)
        },
        &sink,
    );
    pipeline.submit(reading(0)).await;
    pipeline.submit(reading(1)).await;

    let producer = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.submit(reading(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());

    pipeline.start().await.expect("start");
    let outcome = tokio::time::timeout(Duration::from_secs(3), producer)
        .await
        .expect("producer resumed")
        .expect("join");
    assert_eq!(outcome, PushOutcome::Queued);
    wait_until(|| sink.len() == 3).await;
    assert_eq!(pipeline.buffer().dropped(), 0);
}

#[tokio::test]
async fn drop_newest_policy_counts_dropped_messages() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(
        PipelineConfig {
            batch_size: 2,
            buffer_capacity: 2,
            backpressure: BackpressurePolicy::DropNewest,
            ..config(20)
        },
        &sink,
    );
    let mut dropped = 0;
    for i in 0..5 {
        if pipeline.submit(reading(i)).await == PushOutcome::Dropped {
            dropped += 1;
        }
    }
    assert_eq!(dropped, 3);
    assert_eq!(pipeline.buffer().dropped(), 3);

    pipeline.start().await.expect("start");
    wait_until(|| sink.len() == 2).await;
    assert_eq!(values(&sink), vec![FieldValue::F64(0.0), FieldValue::F64(1.0)]);
}

#[tokio::test]
async fn source_status_is_published() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(20), &sink);
    assert!(!pipeline.state().source_connected);

    pipeline.source_status(true).await.expect("status");
    wait_until(|| pipeline.state().source_connected).await;

    pipeline.source_status(false).await.expect("status");
    wait_until(|| !pipeline.state().source_connected).await;
    assert_eq!(pipeline.state().status, PipelineStatus::Stopped);
}

#[tokio::test]
async fn wait_for_status_observes_start() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(20), &sink);
    let waiter = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.wait_for_status(PipelineStatus::Started).await })
    };
    pipeline.start().await.expect("start");
    tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .expect("observed")
        .expect("join")
        .expect("status");
}

/// 先拒绝 `reject` 个批次（HTTP 400），之后正常写入。
struct RejectingSink {
    reject: std::sync::atomic::AtomicUsize,
    accepted: InMemorySink,
}

#[async_trait]
impl PointSink for RejectingSink {
    async fn write_batch(&self, batch: &PointBatch) -> Result<(), SinkError> {
        let rejected = self
            .reject
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        if rejected {
            return Err(SinkError::Status {
                status: 400,
                body: "unable to parse".to_string(),
            });
        }
        self.accepted.write_batch(batch).await
    }
}

#[tokio::test]
async fn rejected_batch_is_dropped_without_failing_the_pipeline() {
    let sink = Arc::new(RejectingSink {
        reject: std::sync::atomic::AtomicUsize::new(2),
        accepted: InMemorySink::new(),
    });
    let pipeline = Pipeline::spawn(
        PipelineConfig {
            max_write_failures: 1,
            ..config(10_000)
        },
        encoder(),
        sink.clone(),
    );
    pipeline.start().await.expect("start");
    let abandoned_before = mqf_telemetry::metrics().snapshot().points_abandoned;

    for round in 0..2 {
        pipeline.submit(reading(round)).await;
        pipeline.flush().await.expect("flush");
        assert_eq!(pipeline.state().status, PipelineStatus::Started);
    }
    assert!(sink.accepted.is_empty());
    assert!(mqf_telemetry::metrics().snapshot().points_abandoned >= abandoned_before + 2);

    pipeline.submit(reading(9)).await;
    pipeline.flush().await.expect("flush");
    assert_eq!(values(&sink.accepted), vec![FieldValue::F64(9.0)]);
    assert_eq!(pipeline.state().status, PipelineStatus::Started);
}

#[tokio::test]
async fn shutdown_writes_everything_buffered() {
    let sink = Arc::new(InMemorySink::new());
    let pipeline = spawn(config(10_000), &sink);
    pipeline.start().await.expect("start");
    for i in 0..15 {
        pipeline.submit(reading(i)).await;
    }

    let abandoned = pipeline.shutdown().await.expect("shutdown");
    assert_eq!(abandoned, 0);
    assert_eq!(sink.len(), 15);
    let sizes: Vec<usize> = sink.batches().iter().map(PointBatch::len).collect();
    assert_eq!(sizes, vec![10, 5]);
    assert!(pipeline.buffer().is_empty());
    assert_eq!(pipeline.state().status, PipelineStatus::Stopped);
}

#[tokio::test]
async fn shutdown_counts_what_cannot_be_written() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_next(100);
    let pipeline = spawn(config(10_000), &sink);
    pipeline.start().await.expect("start");
    for i in 0..15 {
        pipeline.submit(reading(i)).await;
    }
    let abandoned_before = mqf_telemetry::metrics().snapshot().points_abandoned;

    let abandoned = pipeline.shutdown().await.expect("shutdown");
    assert_eq!(abandoned, 15);
    assert_eq!(sink.attempts(), 1);
    assert!(sink.is_empty());
    assert!(pipeline.buffer().is_empty());
    assert!(mqf_telemetry::metrics().snapshot().points_abandoned >= abandoned_before + 15);
}
