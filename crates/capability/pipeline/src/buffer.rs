//! 有界消息缓冲
//!
//! 采集任务与刷写任务之间唯一的共享资源：带容量上限的 FIFO 双端队列，
//! 内部自带同步，调用方无需额外加锁。缓冲区满时的行为由 [`BackpressurePolicy`] 决定。

use domain::RawMessage;
use mqf_telemetry::{record_backpressure_wait, record_buffer_dropped};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

/// 缓冲区满时的处理策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// 生产者等待，直到刷写任务腾出空间（不丢数据，上游可能被阻塞）。
    Block,
    /// 丢弃新到达的消息。
    DropNewest,
    /// 丢弃最早的消息，为新消息腾出位置。
    DropOldest,
}

/// 默认背压策略：阻塞生产者。
pub const DEFAULT_BACKPRESSURE: BackpressurePolicy = BackpressurePolicy::Block;

/// 单次入队结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 新消息被丢弃（DropNewest）。
    Dropped,
    /// 新消息入队，最早的一条被丢弃（DropOldest）。
    Evicted,
}

/// 有界消息缓冲。
pub struct MessageBuffer {
    queue: Mutex<VecDeque<RawMessage>>,
    capacity: usize,
    policy: BackpressurePolicy,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl MessageBuffer {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 因缓冲区满而丢弃的消息数。
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 入队；`Block` 策略下缓冲区满时挂起等待。
    pub async fn push(&self, message: RawMessage) -> PushOutcome {
        let mut message = message;
        let mut waited = false;
        loop {
            let mut notified = std::pin::pin!(self.not_full.notified());
            notified.as_mut().enable();
            match self.try_push(message) {
                Ok(outcome) => return outcome,
                Err(returned) => {
                    message = returned;
                    if !waited {
                        waited = true;
                        record_backpressure_wait();
                    }
                    notified.await;
                }
            }
        }
    }

    /// 非阻塞入队；`Block` 策略下缓冲区满时原样退回消息。
    pub fn try_push(&self, message: RawMessage) -> Result<PushOutcome, RawMessage> {
        let mut queue = self.lock();
        if queue.len() < self.capacity {
            queue.push_back(message);
            drop(queue);
            self.not_empty.notify_one();
            return Ok(PushOutcome::Queued);
        }
        match self.policy {
            BackpressurePolicy::Block => Err(message),
            BackpressurePolicy::DropNewest => {
                drop(queue);
                self.record_drop(&message.topic, "drop_newest");
                Ok(PushOutcome::Dropped)
            }
            BackpressurePolicy::DropOldest => {
                let evicted = queue.pop_front();
                queue.push_back(message);
                drop(queue);
                if let Some(evicted) = evicted {
                    self.record_drop(&evicted.topic, "drop_oldest");
                }
                self.not_empty.notify_one();
                Ok(PushOutcome::Evicted)
            }
        }
    }

    /// 按到达顺序取出至多 `max` 条消息。
    pub fn drain(&self, max: usize) -> Vec<RawMessage> {
        let mut queue = self.lock();
        let count = max.min(queue.len());
        let drained: Vec<RawMessage> = queue.drain(..count).collect();
        drop(queue);
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    /// 取出最早的一条消息。
    pub fn pop(&self) -> Option<RawMessage> {
        self.drain(1).pop()
    }

    /// 等待缓冲区非空。
    pub async fn wait_non_empty(&self) {
        loop {
            let mut notified = std::pin::pin!(self.not_empty.notified());
            notified.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn record_drop(&self, topic: &str, policy: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        record_buffer_dropped();
        warn!(
            target: "mqf.pipeline",
            topic = %topic,
            policy,
            capacity = self.capacity,
            "buffer_full_message_dropped"
        );
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RawMessage>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
