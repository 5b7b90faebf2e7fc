//! 时序写入层
//!
//! 提供写入接口与两种实现：
//! - InfluxSink：InfluxDB HTTP 写入（line protocol）
//! - InMemorySink：内存实现（测试与演练）

pub mod error;
pub mod in_memory;
pub mod influx;
pub mod line_protocol;
pub mod traits;

pub use error::SinkError;
pub use in_memory::InMemorySink;
pub use influx::{InfluxConfig, InfluxSink, PING_TIMEOUT};
pub use line_protocol::{encode_batch, encode_point};
pub use traits::{PointBatch, PointSink, Precision};
