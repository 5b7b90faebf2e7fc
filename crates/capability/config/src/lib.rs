//! 转发进程运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 转发进程运行配置。
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub debug: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// 订阅根（收到的 topic 会剥离该前缀）。
    pub mqtt_topic: String,
    /// broker CA 证书（PEM 文件路径）。
    pub mqtt_ca_file: Option<String>,
    /// 客户端证书与私钥（PEM 文件路径），必须成对配置。
    pub mqtt_client_cert: Option<String>,
    pub mqtt_private_key: Option<String>,
    pub influx_url: String,
    pub influx_db: String,
    pub influx_bucket: Option<String>,
    pub influx_org: Option<String>,
    pub influx_token: Option<String>,
    pub influx_ca_certs: Vec<String>,
    pub influx_insecure: bool,
    /// topic 模板（按配置顺序尝试，首个匹配生效）。
    pub topic_map: Vec<String>,
    /// 需要从字段提升为 tag 的字段名。
    pub tags_attributes: Vec<String>,
    pub no_topic_tag: bool,
    /// series 名覆盖（为空时由 topic 推导）。
    pub series: Option<String>,
    pub series_delimiter: char,
    pub dispatch_mode: String,
    pub batch_size: usize,
    pub tick_ms: u64,
    pub buffer_capacity: usize,
    pub write_timeout_ms: u64,
    pub backpressure: String,
    pub max_write_failures: u32,
}

const DISPATCH_MODES: &[&str] = &["batch", "immediate"];
const BACKPRESSURE_POLICIES: &[&str] = &["block", "drop-newest", "drop-oldest"];

impl ForwardConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let debug = read_bool_with_default("MQF_DEBUG", false);
        let mqtt_host = env::var("MQF_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("MQF_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("MQF_MQTT_USERNAME");
        let mqtt_password = read_optional("MQF_MQTT_PASSWORD");
        let mqtt_topic = env::var("MQF_MQTT_TOPIC").unwrap_or_else(|_| "mqforward/".to_string());
        let mqtt_ca_file = read_optional("MQF_MQTT_CA_FILE");
        let mqtt_client_cert = read_optional("MQF_MQTT_CLIENT_CERT");
        let mqtt_private_key = read_optional("MQF_MQTT_PRIVATE_KEY");
        match (&mqtt_client_cert, &mqtt_private_key) {
            (None, Some(key)) => {
                return Err(ConfigError::Invalid(
                    "MQF_MQTT_PRIVATE_KEY".to_string(),
                    format!("{} (requires MQF_MQTT_CLIENT_CERT)", key),
                ));
            }
            (Some(cert), None) => {
                return Err(ConfigError::Invalid(
                    "MQF_MQTT_CLIENT_CERT".to_string(),
                    format!("{} (requires MQF_MQTT_PRIVATE_KEY)", cert),
                ));
            }
            _ => {}
        }

        let influx_db =
            env::var("MQF_INFLUX_DB").map_err(|_| ConfigError::Missing("MQF_INFLUX_DB".to_string()))?;
        let influx_url = match read_optional("MQF_INFLUX_URL") {
            Some(url) => url,
            None => {
                let scheme =
                    env::var("MQF_INFLUX_SCHEME").unwrap_or_else(|_| "http".to_string());
                let host =
                    env::var("MQF_INFLUX_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = read_u16_with_default("MQF_INFLUX_PORT", 8086)?;
                format!("{}://{}:{}", scheme, host, port)
            }
        };
        let influx_bucket = read_optional("MQF_INFLUX_BUCKET");
        let influx_org = read_optional("MQF_INFLUX_ORG");
        let influx_token = read_optional("MQF_INFLUX_TOKEN");
        let influx_ca_certs = read_list("MQF_INFLUX_CA_CERTS", ',');
        let influx_insecure = read_bool_with_default("MQF_INFLUX_INSECURE", false);

        let topic_map = read_list("MQF_TOPIC_MAP", ';');
        let tags_attributes = read_list("MQF_TAGS_ATTRIBUTES", ',');
        let no_topic_tag = read_bool_with_default("MQF_NO_TOPIC_TAG", false);
        let series = read_optional("MQF_SERIES");
        let series_delimiter = read_char_with_default("MQF_SERIES_DELIMITER", '.')?;

        let dispatch_mode = read_choice_with_default("MQF_DISPATCH_MODE", "batch", DISPATCH_MODES)?;
        let batch_size = read_usize_with_default("MQF_BATCH_SIZE", 100)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid(
                "MQF_BATCH_SIZE".to_string(),
                "0".to_string(),
            ));
        }
        let tick_ms = read_u64_with_default("MQF_TICK_MS", 1000)?;
        if tick_ms == 0 {
            return Err(ConfigError::Invalid("MQF_TICK_MS".to_string(), "0".to_string()));
        }
        let buffer_capacity =
            read_usize_with_default("MQF_BUFFER_CAPACITY", batch_size.saturating_mul(2))?;
        let write_timeout_ms = read_u64_with_default("MQF_WRITE_TIMEOUT_MS", 750)?;
        let backpressure =
            read_choice_with_default("MQF_BACKPRESSURE", "block", BACKPRESSURE_POLICIES)?;
        let max_write_failures = read_u32_with_default("MQF_MAX_WRITE_FAILURES", 3)?;

        Ok(Self {
            debug,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic,
            mqtt_ca_file,
            mqtt_client_cert,
            mqtt_private_key,
            influx_url,
            influx_db,
            influx_bucket,
            influx_org,
            influx_token,
            influx_ca_certs,
            influx_insecure,
            topic_map,
            tags_attributes,
            no_topic_tag,
            series,
            series_delimiter,
            dispatch_mode,
            batch_size,
            tick_ms,
            buffer_capacity,
            write_timeout_ms,
            backpressure,
            max_write_failures,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_char_with_default(key: &str, default: char) -> Result<char, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(ch),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}

/// 读取枚举型取值（大小写不敏感）。
fn read_choice_with_default(
    key: &str,
    default: &str,
    choices: &[&str],
) -> Result<String, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value.trim().to_ascii_lowercase(),
        Err(_) => return Ok(default.to_string()),
    };
    if choices.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid(key.to_string(), value))
    }
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// 读取分隔列表，忽略空白项。
fn read_list(key: &str, separator: char) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value
            .split(separator)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
