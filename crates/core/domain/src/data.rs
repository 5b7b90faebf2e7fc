use std::collections::BTreeMap;

/// 采集源投递的原始消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// 字段值的数据类型。
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    /// 仅字符串值可以提升为 tag。
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::I64(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// 字段集合：字段名 -> 标量值（按键排序）。
pub type FieldSet = BTreeMap<String, FieldValue>;

/// 标签集合：标签名 -> 字符串值（按键排序）。
pub type TagSet = BTreeMap<String, String>;

/// 编码完成、待写入时序库的数据点。
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub series: String,
    pub tags: TagSet,
    pub fields: FieldSet,
    pub ts_ms: i64,
}

impl Point {
    /// 忽略时间戳比较两个数据点。
    pub fn same_content(&self, other: &Point) -> bool {
        self.series == other.series && self.tags == other.tags && self.fields == other.fields
    }
}
