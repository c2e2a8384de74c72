use crate::config::{LogFormat, LoggingConfig};
use chrono::{DateTime, Utc};
use hyper::{Method, StatusCode};
use log::Record;
use serde_json::json;
use std::io::Write;
use std::time::Duration;

pub const ACCESS_LOG_TARGET: &str = "access_log";

/// Installs the global logger. `RUST_LOG`, when set, wins over the
/// configured level.
pub fn init(config: &LoggingConfig) -> Result<(), log::SetLoggerError> {
    let level = config.level.to_string();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if config.format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record, Utc::now())));
    }

    builder.try_init()
}

fn format_json(record: &Record, timestamp: DateTime<Utc>) -> String {
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

/// One line per answered request.
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub status: StatusCode,
    pub bytes: Option<u64>,
    pub encoding: Option<&'a str>,
    pub elapsed: Duration,
}

impl std::fmt::Display for AccessRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}ms",
            self.method,
            self.path,
            self.status.as_u16(),
            self.bytes.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string()),
            self.encoding.unwrap_or("identity"),
            self.elapsed.as_millis()
        )
    }
}

pub fn log_access(record: &AccessRecord<'_>) {
    log::info!(target: ACCESS_LOG_TARGET, "{}", record);
}
