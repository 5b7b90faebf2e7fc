//! 写入层错误类型
//!
//! 批量写入失败由流水线决定重试或放弃；被 sink 拒绝的批次不可重试。

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(String),
    #[error("sink rejected batch with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("write timed out after {0} ms")]
    Timeout(u64),
    #[error("sink config error: {0}")]
    Config(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("{0}")]
    Injected(String),
}

impl SinkError {
    /// 重试能否成功：4xx（408/429 除外）表示批次内容本身被拒绝，重试无意义。
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Status { status, .. } => {
                !(400..500).contains(status) || matches!(*status, 408 | 429)
            }
            SinkError::Encode(_) => false,
            _ => true,
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
