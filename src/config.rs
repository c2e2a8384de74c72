use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "STATIC_";
const HTML_REPLACE_PREFIX: &str = "STATIC_HTML_REPLACE_";
const RESPONSE_HEADER_PREFIX: &str = "STATIC_RESPONSE_HEADER_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage location; the scheme selects the backend.
    pub storage: String,
    pub listen_addr: SocketAddr,
    #[serde(with = "humantime_secs")]
    pub timeout: Duration,
    /// Bodies shorter than this are never compressed. Zero disables
    /// compression.
    pub compress_min_length: u64,
    /// Regex over the content type. Unset means the built-in text-like filter.
    pub compress_content_type: Option<String>,
    pub index_file: String,
    pub autoindex: bool,
    /// Cache-Control for non-HTML assets.
    pub cache_control: String,
    /// Total response cache weight in bytes.
    pub cache_size: u64,
    #[serde(with = "humantime_secs")]
    pub cache_ttl: Duration,
    /// Capped by `cache_ttl`.
    #[serde(with = "humantime_secs")]
    pub html_cache_ttl: Duration,
    /// Objects above this size are streamed and never cached.
    pub cache_max_entry_size: u64,
    #[serde(with = "humantime_secs")]
    pub cache_sweep_interval: Duration,
    pub fallback_index_404: bool,
    pub fallback_html_404: bool,
    pub allow_hidden: bool,
    /// Token (e.g. `{{HOST}}`) to replacement.
    pub html_replaces: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    /// Extension (without dot, lowercase) to MIME type.
    pub custom_mime_types: HashMap<String, String>,
    pub worker_threads: Option<usize>,
    pub metrics_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: "/static".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            timeout: Duration::from_secs(30),
            compress_min_length: 256,
            compress_content_type: None,
            index_file: "index.html".to_string(),
            autoindex: false,
            cache_control: "public, max-age=31536000, immutable".to_string(),
            cache_size: 64 * 1024 * 1024,
            cache_ttl: Duration::from_secs(600),
            html_cache_ttl: Duration::from_secs(10),
            cache_max_entry_size: 2 * 1024 * 1024,
            cache_sweep_interval: Duration::from_secs(60),
            fallback_index_404: false,
            fallback_html_404: false,
            allow_hidden: false,
            html_replaces: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            custom_mime_types: HashMap::new(),
            worker_threads: None,
            metrics_addr: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlays the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(std::env::vars())
    }

    /// Overlays `STATIC_*` variables. Unknown keys are ignored; a typed key
    /// with an unparseable value is an error.
    pub fn apply_vars<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            if !key.starts_with(ENV_PREFIX) {
                continue;
            }

            if let Some(name) = key.strip_prefix(HTML_REPLACE_PREFIX) {
                self.html_replaces.insert(format!("{{{{{}}}}}", name), value.to_string());
                continue;
            }
            if let Some(name) = key.strip_prefix(RESPONSE_HEADER_PREFIX) {
                self.response_headers.insert(name.replace('_', "-"), value.to_string());
                continue;
            }

            match key {
                "STATIC_PATH" => self.storage = value.to_string(),
                "STATIC_LISTEN_ADDR" => self.listen_addr = parse(key, value)?,
                "STATIC_TIMEOUT" => self.timeout = parse_duration(key, value)?,
                "STATIC_COMPRESS_MIN_LENGTH" => self.compress_min_length = parse(key, value)?,
                "STATIC_COMPRESS_CONTENT_TYPE" => {
                    self.compress_content_type = Some(value.to_string()).filter(|v| !v.is_empty())
                }
                "STATIC_INDEX_FILE" => self.index_file = value.to_string(),
                "STATIC_AUTOINDEX" => self.autoindex = parse_bool(key, value)?,
                "STATIC_CACHE_CONTROL" => self.cache_control = value.to_string(),
                "STATIC_CACHE_SIZE" => self.cache_size = parse(key, value)?,
                "STATIC_CACHE_TTL" => self.cache_ttl = parse_duration(key, value)?,
                "STATIC_HTML_CACHE_TTL" => self.html_cache_ttl = parse_duration(key, value)?,
                "STATIC_CACHE_MAX_ENTRY_SIZE" => self.cache_max_entry_size = parse(key, value)?,
                "STATIC_CACHE_SWEEP_INTERVAL" => self.cache_sweep_interval = parse_duration(key, value)?,
                "STATIC_FALLBACK_INDEX_404" => self.fallback_index_404 = parse_bool(key, value)?,
                "STATIC_FALLBACK_HTML_404" => self.fallback_html_404 = parse_bool(key, value)?,
                "STATIC_ALLOW_HIDDEN" => self.allow_hidden = parse_bool(key, value)?,
                "STATIC_THREADS" => self.worker_threads = Some(parse(key, value)?),
                "STATIC_METRICS_ADDR" => {
                    self.metrics_addr = if value.is_empty() { None } else { Some(parse(key, value)?) }
                }
                "STATIC_LOG_LEVEL" => self.logging.level = parse(key, value)?,
                "STATIC_LOG_FORMAT" => self.logging.format = parse(key, value)?,
                _ => log::debug!("Ignoring unknown configuration variable {}", key),
            }
        }
        Ok(())
    }

    pub fn add_custom_mime_type(&mut self, extension: &str, mime_type: &str) {
        let clean_ext = extension.strip_prefix('.').unwrap_or(extension).to_lowercase();
        self.custom_mime_types.insert(clean_ext, mime_type.to_string());
    }

    /// TTL for HTML entries: never longer than the general TTL.
    pub fn effective_html_cache_ttl(&self) -> Duration {
        self.html_cache_ttl.min(self.cache_ttl)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}': {}", value, e),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}' is not a boolean", value),
        }),
    }
}

/// A humantime duration (`500ms`, `1m30s`, `1h 30m`) or bare seconds.
fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_secs::parse(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}': {}", value, e),
    })
}

/// Serde adapter: durations are written as humantime strings and read from
/// either a humantime string or a number of seconds.
mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn parse(value: &str) -> Result<Duration, humantime::DurationError> {
        let value = value.trim();
        match value.parse::<u64>() {
            Ok(secs) => Ok(Duration::from_secs(secs)),
            Err(_) => humantime::parse_duration(value),
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
