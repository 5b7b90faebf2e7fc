//! 转发链路装配
//!
//! 把配置映射为各组件参数，并把采集源接到流水线缓冲上。

use async_trait::async_trait;
use domain::RawMessage;
use mqf_config::ForwardConfig;
use mqf_encode::EncoderConfig;
use mqf_ingest::{IngestError, MqttSourceConfig, RawMessageHandler, Source};
use mqf_pipeline::{PipelineConfig, PipelineError, PipelineHandle, PushOutcome};
use mqf_sink::InfluxConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 把采集到的消息放入流水线缓冲。
pub struct PipelineHandler {
    pipeline: PipelineHandle,
}

impl PipelineHandler {
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl RawMessageHandler for PipelineHandler {
    async fn handle(&self, message: RawMessage) -> Result<(), IngestError> {
        let topic = message.topic.clone();
        match self.pipeline.submit(message).await {
            PushOutcome::Queued => {}
            PushOutcome::Dropped => {
                debug!(target: "mqf.ingest", topic = %topic, "message_dropped_buffer_full");
            }
            PushOutcome::Evicted => {
                debug!(target: "mqf.ingest", topic = %topic, "oldest_message_evicted");
            }
        }
        Ok(())
    }

    async fn source_status(&self, connected: bool) {
        if let Err(err) = self.pipeline.source_status(connected).await {
            warn!(target: "mqf.ingest", connected, error = %err, "source_status_not_delivered");
        }
    }
}

/// 启动采集任务。
pub fn spawn_ingest(
    source: Arc<dyn Source>,
    pipeline: PipelineHandle,
) -> tokio::task::JoinHandle<()> {
    let handler: Arc<dyn RawMessageHandler> = Arc::new(PipelineHandler::new(pipeline));
    tokio::spawn(async move {
        if let Err(err) = source.run(handler).await {
            warn!(target: "mqf.ingest", error = %err, "ingest_stopped");
        }
    })
}

pub fn encoder_config(config: &ForwardConfig) -> EncoderConfig {
    EncoderConfig {
        series: config.series.clone(),
        series_delimiter: config.series_delimiter,
        topic_tag: !config.no_topic_tag,
        promote_tags: config.tags_attributes.clone(),
        topic_map: config.topic_map.clone(),
    }
}

pub fn pipeline_config(config: &ForwardConfig) -> Result<PipelineConfig, PipelineError> {
    Ok(PipelineConfig {
        database: config.influx_db.clone(),
        mode: config.dispatch_mode.parse()?,
        batch_size: config.batch_size,
        buffer_capacity: config.buffer_capacity,
        tick: Duration::from_millis(config.tick_ms),
        write_timeout: Duration::from_millis(config.write_timeout_ms),
        backpressure: config.backpressure.parse()?,
        max_write_failures: config.max_write_failures,
    }
    .sanitized())
}

pub fn influx_config(config: &ForwardConfig) -> InfluxConfig {
    InfluxConfig {
        url: config.influx_url.clone(),
        bucket: config.influx_bucket.clone(),
        org: config.influx_org.clone(),
        token: config.influx_token.clone(),
        ca_certs: config.influx_ca_certs.clone(),
        insecure: config.influx_insecure,
        request_timeout: Duration::from_millis(config.write_timeout_ms),
    }
}

pub fn mqtt_config(config: &ForwardConfig) -> MqttSourceConfig {
    MqttSourceConfig {
        host: config.mqtt_host.clone(),
        port: config.mqtt_port,
        username: config.mqtt_username.clone(),
        password: config.mqtt_password.clone(),
        topic: config.mqtt_topic.clone(),
        ca_file: config.mqtt_ca_file.clone(),
        client_cert: config.mqtt_client_cert.clone(),
        private_key: config.mqtt_private_key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::FieldValue;
    use mqf_encode::SeriesEncoder;
    use mqf_pipeline::{BackpressurePolicy, DispatchMode, Pipeline, PipelineStatus};
    use mqf_sink::InMemorySink;

    fn sample_config() -> ForwardConfig {
        ForwardConfig {
            debug: false,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic: "mqforward/".to_string(),
            mqtt_ca_file: None,
            mqtt_client_cert: None,
            mqtt_private_key: None,
            influx_url: "http://127.0.0.1:8086".to_string(),
            influx_db: "telemetry".to_string(),
            influx_bucket: None,
            influx_org: None,
            influx_token: None,
            influx_ca_certs: Vec::new(),
            influx_insecure: false,
            topic_map: vec!["weather/{loc}/{sensor}".to_string()],
            tags_attributes: vec!["unit".to_string()],
            no_topic_tag: true,
            series: None,
            series_delimiter: '.',
            dispatch_mode: "batch".to_string(),
            batch_size: 10,
            tick_ms: 10_000,
            buffer_capacity: 20,
            write_timeout_ms: 750,
            backpressure: "drop-oldest".to_string(),
            max_write_failures: 3,
        }
    }

    struct ScriptedSource(Vec<RawMessage>);

    #[async_trait]
    impl Source for ScriptedSource {
        async fn run(&self, handler: Arc<dyn RawMessageHandler>) -> Result<(), IngestError> {
            handler.source_status(true).await;
            for message in &self.0 {
                handler.handle(message.clone()).await?;
            }
            Ok(())
        }
    }

    #[test]
    fn maps_config_to_components() {
        let config = sample_config();

        let encoder = encoder_config(&config);
        assert!(!encoder.topic_tag);
        assert_eq!(encoder.promote_tags, vec!["unit".to_string()]);

        let pipeline = pipeline_config(&config).expect("pipeline config");
        assert_eq!(pipeline.database, "telemetry");
        assert_eq!(pipeline.mode, DispatchMode::Batch);
        assert_eq!(pipeline.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(pipeline.tick, Duration::from_secs(10));

        assert_eq!(influx_config(&config).url, "http://127.0.0.1:8086");
        let mqtt = mqtt_config(&config);
        assert_eq!(mqtt.topic, "mqforward/");
        assert!(mqtt.ca_file.is_none());
    }

    #[test]
    fn maps_tls_files_to_source() {
        let config = ForwardConfig {
            mqtt_ca_file: Some("/etc/mqf/ca.pem".to_string()),
            mqtt_client_cert: Some("/etc/mqf/client.pem".to_string()),
            mqtt_private_key: Some("/etc/mqf/client.key".to_string()),
            ..sample_config()
        };
        let mqtt = mqtt_config(&config);
        assert_eq!(mqtt.ca_file.as_deref(), Some("/etc/mqf/ca.pem"));
        assert_eq!(mqtt.client_cert.as_deref(), Some("/etc/mqf/client.pem"));
        assert_eq!(mqtt.private_key.as_deref(), Some("/etc/mqf/client.key"));
    }

    #[test]
    fn private_key_without_certificate_fails_source_construction() {
        let config = ForwardConfig {
            mqtt_private_key: Some("/etc/mqf/client.key".to_string()),
            ..sample_config()
        };
        assert!(mqf_ingest::MqttSource::new(mqtt_config(&config)).is_err());
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let config = ForwardConfig {
            dispatch_mode: "eventually".to_string(),
            ..sample_config()
        };
        assert!(matches!(
            pipeline_config(&config),
            Err(PipelineError::InvalidSetting { .. })
        ));
    }

    #[tokio::test]
    async fn ingested_messages_reach_the_sink() {
        let config = sample_config();
        let sink = Arc::new(InMemorySink::new());
        let encoder = Arc::new(SeriesEncoder::new(encoder_config(&config)).expect("encoder"));
        let pipeline = Pipeline::spawn(
            pipeline_config(&config).expect("pipeline config"),
            encoder,
            sink.clone(),
        );
        pipeline.start().await.expect("start");

        let source: Arc<dyn Source> = Arc::new(ScriptedSource(vec![
            RawMessage::new("weather/home/temp", r#"{"value":21.5,"unit":"C"}"#),
            RawMessage::new("weather/home/humidity", "40"),
        ]));
        spawn_ingest(source, pipeline.clone())
            .await
            .expect("ingest task");

        pipeline.flush().await.expect("flush");
        let points = sink.points();
        assert_eq!(points.len(), 2);

        let temp = &points[0];
        assert_eq!(temp.series, "weather.home.temp");
        assert_eq!(temp.tags.get("loc").map(String::as_str), Some("home"));
        assert_eq!(temp.tags.get("sensor").map(String::as_str), Some("temp"));
        assert_eq!(temp.tags.get("unit").map(String::as_str), Some("C"));
        assert!(!temp.tags.contains_key("topic"));
        assert_eq!(temp.fields.get("value"), Some(&FieldValue::F64(21.5)));

        assert_eq!(points[1].fields.get("value"), Some(&FieldValue::I64(40)));
        assert_eq!(sink.batches()[0].database, "telemetry");
        assert_eq!(pipeline.state().status, PipelineStatus::Started);
    }

    #[tokio::test]
    async fn shutdown_writes_buffered_messages_before_exit() {
        let config = sample_config();
        let sink = Arc::new(InMemorySink::new());
        let encoder = Arc::new(SeriesEncoder::new(encoder_config(&config)).expect("encoder"));
        let pipeline = Pipeline::spawn(
            pipeline_config(&config).expect("pipeline config"),
            encoder,
            sink.clone(),
        );
        pipeline.start().await.expect("start");

        let messages = (0..15)
            .map(|i| RawMessage::new("weather/home/temp", i.to_string()))
            .collect();
        spawn_ingest(Arc::new(ScriptedSource(messages)), pipeline.clone())
            .await
            .expect("ingest task");

        let abandoned = pipeline.shutdown().await.expect("shutdown");
        assert_eq!(abandoned, 0);
        assert_eq!(sink.points().len(), 15);
    }
}
