//! InfluxDB HTTP 写入
//!
//! - 配置了 org 或 token：使用 v2 接口 `POST /api/v2/write?org=&bucket=&precision=`
//! - 否则：使用 v1 接口 `POST /write?db=&precision=`

use crate::error::SinkError;
use crate::line_protocol::encode_batch;
use crate::traits::{PointBatch, PointSink};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// 启动期连通性检查超时。
pub const PING_TIMEOUT: Duration = Duration::from_millis(500);

/// InfluxDB 连接配置。
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// 基础地址，例如 `http://127.0.0.1:8086`。
    pub url: String,
    /// v2 bucket；为空时使用批次中的 database。
    pub bucket: Option<String>,
    pub org: Option<String>,
    pub token: Option<String>,
    /// 额外信任的 CA 证书（PEM 文件路径）。
    pub ca_certs: Vec<String>,
    /// 跳过证书校验。
    pub insecure: bool,
    /// HTTP 请求超时。
    pub request_timeout: Duration,
}

/// InfluxDB 写入器。
#[derive(Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxSink {
    /// 构建 HTTP 客户端（加载 CA 证书，不发起网络请求）。
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let base = reqwest::Url::parse(&config.url)
            .map_err(|err| SinkError::Config(format!("invalid url {}: {}", config.url, err)))?;
        if base.cannot_be_a_base() {
            return Err(SinkError::Config(format!("invalid url {}", config.url)));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure);
        for path in &config.ca_certs {
            debug!(target: "mqf.sink", path = %path, "loading_ca_certificate");
            let pem = std::fs::read(path)
                .map_err(|err| SinkError::Config(format!("read {}: {}", path, err)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| SinkError::Config(format!("parse {}: {}", path, err)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build()?;
        info!(target: "mqf.sink", url = %config.url, "influxdb_sink_configured");
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &InfluxConfig {
        &self.config
    }

    /// 连通性检查；启动时调用，地址错误时尽早失败。
    pub async fn ping(&self) -> Result<(), SinkError> {
        let url = self.endpoint("ping");
        let response = self
            .client
            .get(url)
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!(target: "mqf.sink", url = %self.config.url, "influxdb_connected");
        Ok(())
    }

    fn uses_v2(&self) -> bool {
        self.config.org.is_some() || self.config.token.is_some()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn write_request(&self, batch: &PointBatch) -> reqwest::RequestBuilder {
        let precision = batch.precision.as_query();
        let request = if self.uses_v2() {
            let bucket = self
                .config
                .bucket
                .clone()
                .unwrap_or_else(|| batch.database.clone());
            let org = self.config.org.clone().unwrap_or_default();
            self.client.post(self.endpoint("api/v2/write")).query(&[
                ("org", org.as_str()),
                ("bucket", bucket.as_str()),
                ("precision", precision),
            ])
        } else {
            self.client.post(self.endpoint("write")).query(&[
                ("db", batch.database.as_str()),
                ("precision", precision),
            ])
        };
        match self.config.token.as_deref() {
            Some(token) => request.header("Authorization", format!("Token {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    async fn write_batch(&self, batch: &PointBatch) -> Result<(), SinkError> {
        let (body, encoded) = encode_batch(batch);
        if encoded == 0 {
            debug!(target: "mqf.sink", points = batch.len(), "batch_empty_after_encoding");
            return Ok(());
        }
        let response = self
            .write_request(batch)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(target: "mqf.sink", points = encoded, database = %batch.database, "batch_written");
        Ok(())
    }
}
