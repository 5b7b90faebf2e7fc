//! 转发流水线
//!
//! 采集任务把原始消息放入有界缓冲；刷写任务按节拍（或逐条）取出、编码、写入 sink。
//! 控制任务串行处理启停、立即刷写与采集源状态命令，并通过 watch 通道发布流水线状态。

mod buffer;
mod dispatch;

pub use buffer::{BackpressurePolicy, DEFAULT_BACKPRESSURE, MessageBuffer, PushOutcome};
pub use dispatch::{ControlCommand, Pipeline, PipelineHandle, PipelineState, PipelineStatus};

use std::str::FromStr;
use std::time::Duration;

/// 刷写节拍的默认值（秒）。
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// 连续写入失败达到该次数后流水线进入失败状态。
pub const DEFAULT_MAX_WRITE_FAILURES: u32 = 3;

/// Pipeline 错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline closed")]
    Closed,
    #[error("pipeline already failed")]
    AlreadyFailed,
    #[error("sink failed permanently: {0}")]
    SinkFatal(String),
    #[error("invalid {key}: {value}")]
    InvalidSetting { key: &'static str, value: String },
}

/// 分发方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// 每个节拍取出至多 `batch_size` 条消息合并写入。
    Batch,
    /// 消息到达即单独写入。
    Immediate,
}

impl FromStr for DispatchMode {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(Self::Batch),
            "immediate" => Ok(Self::Immediate),
            _ => Err(PipelineError::InvalidSetting {
                key: "dispatch mode",
                value: value.to_string(),
            }),
        }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop-newest" | "drop_newest" => Ok(Self::DropNewest),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            _ => Err(PipelineError::InvalidSetting {
                key: "backpressure policy",
                value: value.to_string(),
            }),
        }
    }
}

/// Pipeline 参数。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 写入的目标库名。
    pub database: String,
    pub mode: DispatchMode,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub tick: Duration,
    /// 单次写入超时，必须小于 `tick`。
    pub write_timeout: Duration,
    pub backpressure: BackpressurePolicy,
    pub max_write_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: "mqforward".to_string(),
            mode: DispatchMode::Batch,
            batch_size: 100,
            buffer_capacity: 200,
            tick: DEFAULT_TICK,
            write_timeout: Duration::from_millis(750),
            backpressure: DEFAULT_BACKPRESSURE,
            max_write_failures: DEFAULT_MAX_WRITE_FAILURES,
        }
    }
}

impl PipelineConfig {
    pub fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        if self.buffer_capacity < self.batch_size {
            self.buffer_capacity = self.batch_size;
        }
        if self.tick.is_zero() {
            self.tick = Duration::from_millis(1);
        }
        if self.write_timeout.is_zero() || self.write_timeout >= self.tick {
            self.write_timeout = self.tick / 2;
        }
        if self.max_write_failures == 0 {
            self.max_write_failures = 1;
        }
        self
    }
}
