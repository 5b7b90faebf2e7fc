//! MQTT → 时序库转发进程。

mod forward;

use forward::{encoder_config, influx_config, mqtt_config, pipeline_config, spawn_ingest};
use mqf_config::ForwardConfig;
use mqf_encode::SeriesEncoder;
use mqf_ingest::{MqttSource, Source};
use mqf_pipeline::Pipeline;
use mqf_sink::InfluxSink;
use mqf_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = ForwardConfig::from_env()?;
    // 初始化结构化日志
    init_tracing(config.debug);

    // 模板与 sink 地址错误在启动期直接失败
    let encoder = Arc::new(SeriesEncoder::new(encoder_config(&config))?);
    let sink = InfluxSink::new(influx_config(&config))?;
    sink.ping().await?;

    let pipeline = Pipeline::spawn(pipeline_config(&config)?, encoder, Arc::new(sink));
    pipeline.start().await?;

    let source: Arc<dyn Source> = Arc::new(MqttSource::new(mqtt_config(&config))?);
    let ingest = spawn_ingest(source, pipeline.clone());
    info!(target: "mqf", topic = %config.mqtt_topic, database = %config.influx_db, "forwarder_started");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!(target: "mqf", "shutdown_requested");
            Ok(())
        }
        err = pipeline.wait_terminal() => Err(err),
    };
    ingest.abort();

    // 退出前写出缓冲中的剩余数据，写不出的部分计入放弃数
    let abandoned = pipeline.shutdown().await?;

    let snapshot = metrics().snapshot();
    info!(
        target: "mqf",
        received = snapshot.messages_received,
        points_written = snapshot.points_written,
        decode_failures = snapshot.decode_failures,
        buffer_dropped = snapshot.buffer_dropped,
        write_failures = snapshot.write_failures,
        points_abandoned = snapshot.points_abandoned,
        "forwarder_metrics"
    );

    match outcome {
        Ok(()) => {
            info!(target: "mqf", abandoned, "forwarder_stopped");
            Ok(())
        }
        Err(err) => {
            error!(target: "mqf", error = %err, abandoned, "forwarder_failed");
            Err(err.into())
        }
    }
}
