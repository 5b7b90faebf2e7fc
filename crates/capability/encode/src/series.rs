//! 原始消息 -> 数据点的组装
//!
//! tag 的来源与覆盖顺序（后者覆盖前者）：
//! 1. topic 本身（`topic` tag，可关闭）
//! 2. 配置为提升的字符串字段
//! 3. 首个匹配模板的捕获结果
//!
//! 与任一 tag 同名的字段会从字段集合中移除。

use crate::decode::{DecodeError, decode};
use crate::matcher::{MatchConfigError, TopicMatcherSet};
use domain::{Point, RawMessage, TOPIC_SEPARATOR, TagSet, now_epoch_ms};

/// topic tag 的键名。
pub const TOPIC_TAG: &str = "topic";

/// 编码参数。
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// series 名覆盖；为空时由 topic 推导。
    pub series: Option<String>,
    /// topic 推导 series 名时替换分隔符所用的字符。
    pub series_delimiter: char,
    /// 是否写入 `topic` tag。
    pub topic_tag: bool,
    /// 需要提升为 tag 的字段名（仅字符串值会被提升）。
    pub promote_tags: Vec<String>,
    /// topic 模板，按顺序尝试。
    pub topic_map: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            series: None,
            series_delimiter: '.',
            topic_tag: true,
            promote_tags: Vec::new(),
            topic_map: Vec::new(),
        }
    }
}

/// 单条消息编码失败原因。
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("empty series name")]
    EmptySeries,
    #[error("no fields left for series `{0}`")]
    NoFields(String),
}

/// series 编码器：模板在构造时编译一次。
#[derive(Debug, Clone)]
pub struct SeriesEncoder {
    config: EncoderConfig,
    matchers: TopicMatcherSet,
}

impl SeriesEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self, MatchConfigError> {
        let matchers = TopicMatcherSet::compile(config.topic_map.as_slice())?;
        Ok(Self { config, matchers })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// 以当前时间编码。
    pub fn encode(&self, msg: &RawMessage) -> Result<Point, EncodeError> {
        self.encode_at(msg, now_epoch_ms())
    }

    /// 以指定时间戳（毫秒）编码。
    pub fn encode_at(&self, msg: &RawMessage, ts_ms: i64) -> Result<Point, EncodeError> {
        let mut fields = decode(&msg.payload)?;

        let series = self.series_name(&msg.topic);
        if series.is_empty() {
            return Err(EncodeError::EmptySeries);
        }

        let mut tags = TagSet::new();
        if self.config.topic_tag {
            tags.insert(TOPIC_TAG.to_string(), msg.topic.clone());
        }

        for name in &self.config.promote_tags {
            let Some(value) = fields.get(name).and_then(|value| value.as_str()) else {
                continue;
            };
            let value = value.to_string();
            fields.remove(name);
            tags.insert(name.clone(), value);
        }

        if let Some(captured) = self.matchers.first_match(&msg.topic) {
            tags.extend(captured);
        }

        // 同名键只保留 tag
        fields.retain(|key, _| !tags.contains_key(key));

        if fields.is_empty() {
            return Err(EncodeError::NoFields(series));
        }

        Ok(Point {
            series,
            tags,
            fields,
            ts_ms,
        })
    }

    fn series_name(&self, topic: &str) -> String {
        match self.config.series.as_deref() {
            Some(series) if !series.is_empty() => series.to_string(),
            _ => topic.replace(TOPIC_SEPARATOR, &self.config.series_delimiter.to_string()),
        }
    }
}
