//! 写入接口定义

use crate::error::SinkError;
use async_trait::async_trait;
use domain::Point;

/// 写入时间精度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Seconds,
    Milliseconds,
}

impl Precision {
    /// HTTP 写入接口的 precision 参数。
    pub fn as_query(&self) -> &'static str {
        match self {
            Precision::Seconds => "s",
            Precision::Milliseconds => "ms",
        }
    }

    /// 将毫秒时间戳换算到当前精度。
    pub fn scale_ms(&self, ts_ms: i64) -> i64 {
        match self {
            Precision::Seconds => ts_ms.div_euclid(1000),
            Precision::Milliseconds => ts_ms,
        }
    }
}

/// 一次写入调用的批次。
#[derive(Debug, Clone, PartialEq)]
pub struct PointBatch {
    /// 目标数据库 / bucket。
    pub database: String,
    pub precision: Precision,
    pub points: Vec<Point>,
}

impl PointBatch {
    pub fn new(database: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            database: database.into(),
            precision: Precision::Seconds,
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 批次首个数据点的 series 名（日志用）。
    pub fn first_series(&self) -> &str {
        self.points
            .first()
            .map(|point| point.series.as_str())
            .unwrap_or("")
    }
}

/// 时序写入接口。
#[async_trait]
pub trait PointSink: Send + Sync {
    /// 批量写入；任一错误都表示整批未确认写入。
    async fn write_batch(&self, batch: &PointBatch) -> Result<(), SinkError>;
}
