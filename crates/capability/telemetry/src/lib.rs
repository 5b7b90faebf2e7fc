//! 日志初始化与转发计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 转发计数快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub decode_failures: u64,
    pub encode_skipped: u64,
    pub points_encoded: u64,
    pub buffer_dropped: u64,
    pub backpressure_waits: u64,
    pub batches_written: u64,
    pub points_written: u64,
    pub write_failures: u64,
    pub points_abandoned: u64,
    pub write_latency_ms_total: u64,
    pub write_latency_ms_count: u64,
    pub source_disconnects: u64,
}

/// 进程级转发计数器。
pub struct TelemetryMetrics {
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    encode_skipped: AtomicU64,
    points_encoded: AtomicU64,
    buffer_dropped: AtomicU64,
    backpressure_waits: AtomicU64,
    batches_written: AtomicU64,
    points_written: AtomicU64,
    write_failures: AtomicU64,
    points_abandoned: AtomicU64,
    write_latency_ms_total: AtomicU64,
    write_latency_ms_count: AtomicU64,
    source_disconnects: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            encode_skipped: AtomicU64::new(0),
            points_encoded: AtomicU64::new(0),
            buffer_dropped: AtomicU64::new(0),
            backpressure_waits: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            points_abandoned: AtomicU64::new(0),
            write_latency_ms_total: AtomicU64::new(0),
            write_latency_ms_count: AtomicU64::new(0),
            source_disconnects: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            encode_skipped: self.encode_skipped.load(Ordering::Relaxed),
            points_encoded: self.points_encoded.load(Ordering::Relaxed),
            buffer_dropped: self.buffer_dropped.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            points_abandoned: self.points_abandoned.load(Ordering::Relaxed),
            write_latency_ms_total: self.write_latency_ms_total.load(Ordering::Relaxed),
            write_latency_ms_count: self.write_latency_ms_count.load(Ordering::Relaxed),
            source_disconnects: self.source_disconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局计数器实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info，debug 开启时为 debug；RUST_LOG 优先）。
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录采集源投递的消息数。
pub fn record_message_received() {
    metrics().messages_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录 payload 无法解码的消息数。
pub fn record_decode_failure() {
    metrics().decode_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录解码成功但无法组成数据点的消息数（无字段、空 series）。
pub fn record_encode_skipped() {
    metrics().encode_skipped.fetch_add(1, Ordering::Relaxed);
}

/// 记录编码出的数据点数。
pub fn record_point_encoded() {
    metrics().points_encoded.fetch_add(1, Ordering::Relaxed);
}

/// 记录缓冲区满时丢弃的消息数。
pub fn record_buffer_dropped() {
    metrics().buffer_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录生产者因缓冲区满而等待的次数。
pub fn record_backpressure_wait() {
    metrics().backpressure_waits.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次成功的批量写入。
pub fn record_batch_written(points: usize, latency_ms: u64) {
    let metrics = metrics();
    metrics.batches_written.fetch_add(1, Ordering::Relaxed);
    metrics
        .points_written
        .fetch_add(points as u64, Ordering::Relaxed);
    metrics
        .write_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .write_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录批量写入失败次数。
pub fn record_write_failure() {
    metrics().write_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录放弃写入的数据点数。
pub fn record_points_abandoned(points: usize) {
    metrics()
        .points_abandoned
        .fetch_add(points as u64, Ordering::Relaxed);
}

/// 记录采集源断线次数。
pub fn record_source_disconnect() {
    metrics().source_disconnects.fetch_add(1, Ordering::Relaxed);
}
