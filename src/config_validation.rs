//! Startup validation of a fully layered [`Config`].
//!
//! Errors abort startup; warnings are logged and serving proceeds.

use crate::config::Config;
use hyper::header::{HeaderName, HeaderValue};
use regex::Regex;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_storage(config, &mut result);
    validate_addresses(config, &mut result);
    validate_serving(config, &mut result);
    validate_headers(config, &mut result);
    validate_cache(config, &mut result);

    result
}

fn validate_storage(config: &Config, result: &mut ValidationResult) {
    let location = config.storage.trim();
    if location.is_empty() {
        result.add_error("Storage location (STATIC_PATH) must not be empty".to_string());
        return;
    }

    let remote = ["http://", "https://", "ftp://", "mongodb://", "mongodb+srv://"]
        .iter()
        .any(|scheme| location.starts_with(scheme));
    if remote {
        if let Err(e) = url::Url::parse(location) {
            result.add_error(format!("Storage location is not a valid URL: {}", e));
        }
    } else if !std::path::Path::new(location).is_dir() {
        result.add_warning(format!(
            "Storage directory '{}' does not exist yet; requests will answer 404 until it does",
            location
        ));
    }
}

fn validate_addresses(config: &Config, result: &mut ValidationResult) {
    if config.listen_addr.port() == 0 {
        result.add_warning("Listen port 0 picks a random port".to_string());
    }

    if let Some(metrics_addr) = config.metrics_addr {
        let same_port = metrics_addr.port() == config.listen_addr.port();
        let overlapping_ip = metrics_addr.ip() == config.listen_addr.ip()
            || metrics_addr.ip().is_unspecified()
            || config.listen_addr.ip().is_unspecified();
        if same_port && overlapping_ip && metrics_addr.port() != 0 {
            result.add_error(format!(
                "Metrics address {} conflicts with listen address {}",
                metrics_addr, config.listen_addr
            ));
        }
    }

    if config.worker_threads == Some(0) {
        result.add_error("worker_threads must be greater than 0".to_string());
    }
}

fn validate_serving(config: &Config, result: &mut ValidationResult) {
    if config.timeout.is_zero() {
        result.add_error("Request timeout must be greater than 0".to_string());
    }

    let index = config.index_file.as_str();
    if index.is_empty() {
        if config.fallback_index_404 {
            result.add_error("fallback_index_404 requires an index file".to_string());
        }
    } else if index.contains('/') || index.contains('\\') || index.starts_with('.') {
        result.add_error(format!("Index file '{}' must be a plain, non-hidden file name", index));
    }

    if let Some(pattern) = &config.compress_content_type {
        if let Err(e) = Regex::new(pattern) {
            result.add_error(format!("Invalid compress_content_type regex '{}': {}", pattern, e));
        }
    }

    for token in config.html_replaces.keys() {
        if token.is_empty() || token == "{{}}" {
            result.add_error("HTML replacement tokens must not be empty".to_string());
        }
    }
}

fn validate_headers(config: &Config, result: &mut ValidationResult) {
    if HeaderValue::from_str(&config.cache_control).is_err() {
        result.add_error(format!("Invalid Cache-Control value '{}'", config.cache_control));
    }

    for (name, value) in &config.response_headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            result.add_error(format!("Invalid response header name '{}'", name));
        }
        if HeaderValue::from_str(value).is_err() {
            result.add_error(format!("Invalid value for response header '{}'", name));
        }
    }

    for (extension, mime) in &config.custom_mime_types {
        if HeaderValue::from_str(mime).is_err() {
            result.add_error(format!("Invalid MIME type '{}' for extension '{}'", mime, extension));
        }
    }
}

fn validate_cache(config: &Config, result: &mut ValidationResult) {
    if config.cache_size == 0 {
        result.add_warning("Response cache disabled (cache_size = 0)".to_string());
        return;
    }
    if config.cache_ttl.is_zero() {
        result.add_warning("cache_ttl is 0: nothing will be cached".to_string());
    }
    if config.cache_max_entry_size > config.cache_size {
        result.add_warning(format!(
            "cache_max_entry_size ({}) exceeds cache_size ({}); such entries can never be stored",
            config.cache_max_entry_size, config.cache_size
        ));
    }
}
