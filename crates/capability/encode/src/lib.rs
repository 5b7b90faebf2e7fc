//! 原始消息编码：payload 解码、topic 模板匹配与数据点组装。

pub mod decode;
pub mod matcher;
pub mod series;

pub use decode::{DecodeError, decode};
pub use matcher::{MatchConfigError, Segment, TopicMatcherSet, TopicTemplate};
pub use series::{EncodeError, EncoderConfig, SeriesEncoder, TOPIC_TAG};
