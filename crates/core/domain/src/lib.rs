//! 转发链路共享的领域模型。

pub mod data;

pub use data::{FieldSet, FieldValue, Point, RawMessage, TagSet};

/// topic 层级分隔符。
pub const TOPIC_SEPARATOR: char = '/';

/// 当前 Unix 时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
