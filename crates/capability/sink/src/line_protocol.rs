//! InfluxDB line protocol 编码
//!
//! ```text
//! series,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp
//! ```
//!
//! tag 与字段按键排序输出；空 tag 值与非有限浮点数不可表示，直接跳过。
//! 换行符会截断一行，统一替换为空格；紧邻分隔符或位于末尾的反斜杠会再转义一次。

use crate::traits::{PointBatch, Precision};
use domain::{FieldValue, Point};
use tracing::debug;

/// 编码单个数据点；没有可表示的字段时返回 `None`。
pub fn encode_point(point: &Point, precision: Precision) -> Option<String> {
    let mut fields = String::new();
    for (key, value) in &point.fields {
        let Some(encoded) = encode_field_value(value) else {
            debug!(target: "mqf.sink", series = %point.series, field = %key, "field_not_representable");
            continue;
        };
        if !fields.is_empty() {
            fields.push(',');
        }
        fields.push_str(&escape_key(key));
        fields.push('=');
        fields.push_str(&encoded);
    }
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_series(&point.series);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    line.push(' ');
    line.push_str(&fields);
    line.push(' ');
    line.push_str(&precision.scale_ms(point.ts_ms).to_string());
    Some(line)
}

/// 编码整个批次，返回请求体与实际编码的数据点数。
pub fn encode_batch(batch: &PointBatch) -> (String, usize) {
    let mut body = String::new();
    let mut encoded = 0;
    for point in &batch.points {
        if let Some(line) = encode_point(point, batch.precision) {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&line);
            encoded += 1;
        }
    }
    (body, encoded)
}

fn encode_field_value(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::F64(v) if v.is_finite() => Some(format!("{}", v)),
        FieldValue::F64(_) => None,
        FieldValue::I64(v) => Some(format!("{}i", v)),
        FieldValue::Bool(v) => Some(v.to_string()),
        FieldValue::String(v) => Some(format!("\"{}\"", escape_string(v))),
    }
}

/// series 名：逗号与空格需转义。
fn escape_series(s: &str) -> String {
    escape_with(s, &[',', ' '])
}

/// tag 键、tag 值与字段键：逗号、等号与空格需转义。
fn escape_key(s: &str) -> String {
    escape_with(s, &[',', '=', ' '])
}

fn escape_with(s: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        let ch = if is_newline(ch) { ' ' } else { ch };
        if ch == '\\' {
            out.push('\\');
            match chars.peek() {
                None => out.push('\\'),
                Some(&next) if is_newline(next) || specials.contains(&next) => out.push('\\'),
                Some(_) => {}
            }
            continue;
        }
        if specials.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// 字符串字段值：反斜杠与双引号需转义。
fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            ch if is_newline(ch) => out.push(' '),
            ch => out.push(ch),
        }
    }
    out
}

fn is_newline(ch: char) -> bool {
    ch == '\n' || ch == '\r'
}
