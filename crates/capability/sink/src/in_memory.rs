//! 内存写入器
//!
//! 用于本地测试与演练：记录每次写入的批次，可注入失败。

use crate::error::SinkError;
use crate::traits::{PointBatch, PointSink};
use async_trait::async_trait;
use domain::Point;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 内存写入器。
#[derive(Default)]
pub struct InMemorySink {
    batches: Mutex<Vec<PointBatch>>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `count` 次写入失败。
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// 写入调用次数（含失败）。
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 已成功写入的批次。
    pub fn batches(&self) -> Vec<PointBatch> {
        self.batches
            .lock()
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }

    /// 已成功写入的全部数据点（按写入顺序）。
    pub fn points(&self) -> Vec<Point> {
        self.batches()
            .into_iter()
            .flat_map(|batch| batch.points)
            .collect()
    }

    /// 获取当前累计的数据点数量（用于测试）。
    pub fn len(&self) -> usize {
        self.batches
            .lock()
            .map(|batches| batches.iter().map(PointBatch::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PointSink for InMemorySink {
    async fn write_batch(&self, batch: &PointBatch) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::Injected("injected write failure".to_string()));
        }
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| SinkError::Injected("lock failed".to_string()))?;
        batches.push(batch.clone());
        Ok(())
    }
}
