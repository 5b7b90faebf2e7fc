//! MQTT 采集源（rumqttc）
//!
//! 订阅 `<root>#`，把 topic 根剥离后交给处理器。
//! 每次 ConnAck 后重新订阅；连接错误上报断开并暂停一秒后继续 poll，由 rumqttc 重连。
//! 配置了证书或使用 8883 端口时走 TLS（rustls）。

use crate::{IngestError, RawMessageHandler, Source};
use async_trait::async_trait;
use domain::RawMessage;
use mqf_telemetry::record_message_received;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CLIENT_ID_PREFIX: &str = "mqforward-";
/// MQTT over TLS 的标准端口。
pub const MQTT_TLS_PORT: u16 = 8883;

/// MQTT 采集源配置。
#[derive(Debug, Clone)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 订阅根，例如 `mqforward/`；消息 topic 中的该前缀会被剥离。
    pub topic: String,
    /// broker CA 证书（PEM 文件路径）。
    pub ca_file: Option<String>,
    pub client_cert: Option<String>,
    pub private_key: Option<String>,
}

/// 已加载的 TLS 材料。
#[derive(Debug, Clone)]
struct TlsMaterial {
    ca: Option<Vec<u8>>,
    client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterial {
    fn load(config: &MqttSourceConfig) -> Result<Option<Self>, IngestError> {
        let client_auth = match (&config.client_cert, &config.private_key) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            (None, Some(_)) => {
                return Err(IngestError::Source(
                    "private key configured without client certificate".to_string(),
                ));
            }
            (Some(_), None) => {
                return Err(IngestError::Source(
                    "client certificate configured without private key".to_string(),
                ));
            }
            (None, None) => None,
        };
        let ca = config.ca_file.as_deref().map(read_pem).transpose()?;
        if ca.is_none() && client_auth.is_some() {
            return Err(IngestError::Source(
                "client certificate requires a broker CA file".to_string(),
            ));
        }
        if ca.is_none() && config.port != MQTT_TLS_PORT {
            return Ok(None);
        }
        Ok(Some(Self { ca, client_auth }))
    }

    fn transport(&self) -> Transport {
        match &self.ca {
            Some(ca) => Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: self.client_auth.clone(),
            }),
            // 未指定 CA 时使用系统根证书
            None => Transport::tls_with_default_config(),
        }
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, IngestError> {
    std::fs::read(path).map_err(|err| IngestError::Source(format!("read {}: {}", path, err)))
}

/// MQTT 采集源。
#[derive(Debug, Clone)]
pub struct MqttSource {
    config: MqttSourceConfig,
    tls: Option<TlsMaterial>,
}

impl MqttSource {
    /// 加载 TLS 证书；证书缺失或不成对时启动期直接失败。
    pub fn new(config: MqttSourceConfig) -> Result<Self, IngestError> {
        let tls = TlsMaterial::load(&config)?;
        Ok(Self { config, tls })
    }

    pub fn config(&self) -> &MqttSourceConfig {
        &self.config
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("{}{}", CLIENT_ID_PREFIX, uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = self.config.username.as_ref() {
            let password = self.config.password.clone().unwrap_or_default();
            options.set_credentials(username, password);
        }
        if let Some(tls) = &self.tls {
            options.set_transport(tls.transport());
        }
        options
    }
}

#[async_trait]
impl Source for MqttSource {
    async fn run(&self, handler: Arc<dyn RawMessageHandler>) -> Result<(), IngestError> {
        let options = self.options();
        let filter = subscription_filter(&self.config.topic);
        info!(
            target: "mqf.ingest",
            host = %self.config.host,
            port = self.config.port,
            client_id = %options.client_id(),
            tls = self.uses_tls(),
            filter = %filter,
            "mqtt_connecting"
        );

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut connected = false;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    client
                        .try_subscribe(filter.clone(), QoS::AtMostOnce)
                        .map_err(|err| IngestError::Source(err.to_string()))?;
                    info!(target: "mqf.ingest", filter = %filter, "mqtt_subscribed");
                    connected = true;
                    handler.source_status(true).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    record_message_received();
                    let topic = strip_topic_root(&self.config.topic, &publish.topic);
                    debug!(target: "mqf.ingest", topic = %topic, bytes = publish.payload.len(), "mqtt_message");
                    let message = RawMessage::new(topic, publish.payload.to_vec());
                    if let Err(err) = handler.handle(message).await {
                        warn!(target: "mqf.ingest", topic = %publish.topic, error = %err, "raw_message_handler_failed");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if connected {
                        connected = false;
                        handler.source_status(false).await;
                    }
                    warn!(target: "mqf.ingest", error = %err, "mqtt_connection_error");
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }
}

/// 订阅过滤器：根后追加多级通配符 `#`（已有则保留）。
pub fn subscription_filter(root: &str) -> String {
    if root.ends_with('#') {
        root.to_string()
    } else {
        format!("{}#", root)
    }
}

/// 剥离订阅根；topic 不以根开头时原样返回。
pub fn strip_topic_root(root: &str, topic: &str) -> String {
    let root = root.trim_end_matches('#');
    topic.strip_prefix(root).unwrap_or(topic).to_string()
}
