//! payload 解码
//!
//! 按顺序尝试三种格式，首个成功者生效：
//! 1. MessagePack map
//! 2. JSON 对象
//! 3. 裸数字（含小数点按 f64，否则按 i64），包装为 `{"value": n}`
//!
//! 解码结果中的保留键 `time` 一律改名为 `_time`。

use domain::{FieldSet, FieldValue};
use tracing::debug;

/// 裸数字包装后的字段名。
pub const VALUE_FIELD: &str = "value";
/// 保留键，解码后不会以原名出现在字段集合中。
pub const RESERVED_TIME_KEY: &str = "time";
/// 保留键改名后的字段名。
pub const RENAMED_TIME_KEY: &str = "_time";

/// payload 无法按任何支持的格式解码。
#[derive(Debug, thiserror::Error)]
#[error("payload is neither a msgpack map, a json object nor a bare number ({len} bytes)")]
pub struct DecodeError {
    pub len: usize,
}

/// 将原始 payload 解码为字段集合。
pub fn decode(payload: &[u8]) -> Result<FieldSet, DecodeError> {
    let mut fields = decode_msgpack(payload)
        .or_else(|| decode_json(payload))
        .or_else(|| decode_bare_number(payload))
        .ok_or(DecodeError { len: payload.len() })?;

    if let Some(value) = fields.remove(RESERVED_TIME_KEY) {
        fields.insert(RENAMED_TIME_KEY.to_string(), value);
    }
    Ok(fields)
}

/// 整个 payload 必须恰好是一个键全为字符串的 map。
fn decode_msgpack(payload: &[u8]) -> Option<FieldSet> {
    let mut cursor = payload;
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    if !cursor.is_empty() {
        return None;
    }
    let rmpv::Value::Map(entries) = value else {
        return None;
    };

    let mut fields = FieldSet::new();
    for (key, value) in entries {
        let key = key.as_str()?.to_string();
        match msgpack_to_field_value(&value) {
            Some(field) => {
                fields.insert(key, field);
            }
            None => debug!(target: "mqf.encode", field = %key, "msgpack_field_skipped"),
        }
    }
    Some(fields)
}

fn msgpack_to_field_value(value: &rmpv::Value) -> Option<FieldValue> {
    match value {
        rmpv::Value::Integer(n) => match n.as_i64() {
            Some(v) => Some(FieldValue::I64(v)),
            None => n.as_f64().map(FieldValue::F64),
        },
        rmpv::Value::F32(v) => Some(FieldValue::F64(f64::from(*v))),
        rmpv::Value::F64(v) => Some(FieldValue::F64(*v)),
        rmpv::Value::Boolean(v) => Some(FieldValue::Bool(*v)),
        rmpv::Value::String(s) => s.as_str().map(|s| FieldValue::String(s.to_string())),
        // nil、数组、嵌套 map、二进制与扩展类型都不是标量
        _ => None,
    }
}

/// JSON 数字统一按 f64 处理。
fn decode_json(payload: &[u8]) -> Option<FieldSet> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(payload).ok()?;

    let mut fields = FieldSet::new();
    for (key, value) in object {
        match json_to_field_value(&value) {
            Some(field) => {
                fields.insert(key, field);
            }
            None => debug!(target: "mqf.encode", field = %key, "json_field_skipped"),
        }
    }
    Some(fields)
}

fn json_to_field_value(value: &serde_json::Value) -> Option<FieldValue> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(FieldValue::F64),
        serde_json::Value::String(s) => Some(FieldValue::String(s.clone())),
        serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
        serde_json::Value::Null | serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            None
        }
    }
}

fn decode_bare_number(payload: &[u8]) -> Option<FieldSet> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let value = if text.contains('.') {
        FieldValue::F64(text.parse::<f64>().ok()?)
    } else {
        FieldValue::I64(text.parse::<i64>().ok()?)
    };
    let mut fields = FieldSet::new();
    fields.insert(VALUE_FIELD.to_string(), value);
    Some(fields)
}
