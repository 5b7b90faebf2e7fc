//! 数据接入
//!
//! 采集源把外部消息转换为 [`RawMessage`] 交给 [`RawMessageHandler`]，
//! 连接状态变化通过 `source_status` 上报，而不是作为终止错误返回。

mod mqtt;

pub use mqtt::{MQTT_TLS_PORT, MqttSource, MqttSourceConfig, strip_topic_root, subscription_filter};

use async_trait::async_trait;
use domain::RawMessage;
use std::sync::Arc;

/// 采集错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source error: {0}")]
    Source(String),
    #[error("handler error: {0}")]
    Handler(String),
}

/// 原始消息处理器。
#[async_trait]
pub trait RawMessageHandler: Send + Sync {
    async fn handle(&self, message: RawMessage) -> Result<(), IngestError>;

    /// 采集源连接状态变化。
    async fn source_status(&self, _connected: bool) {}
}

/// 采集源抽象。
#[async_trait]
pub trait Source: Send + Sync {
    async fn run(&self, handler: Arc<dyn RawMessageHandler>) -> Result<(), IngestError>;
}

/// 空采集源（用于接线与测试），立即返回。
#[derive(Debug, Default)]
pub struct NoopSource;

#[async_trait]
impl Source for NoopSource {
    async fn run(&self, _handler: Arc<dyn RawMessageHandler>) -> Result<(), IngestError> {
        Ok(())
    }
}
