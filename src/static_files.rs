//! The serving pipeline.
//!
//! ```text
//! RESOLVE -> CACHE_LOOKUP -> hit ---------------------------------> FRESHNESS -> 200 | 304
//!                         -> miss -> FETCH -> REWRITE -> COMPRESS -> STORE ---^
//! ```
//!
//! Path validation happens before any cache or backend access. Misses run
//! inside a single flight keyed by (request key, variant) so concurrent
//! requests for the same cold object cause one backend read. The whole
//! request is bounded by the configured timeout.

use crate::cache::{CacheEntry, CacheKey, ResponseCache};
use crate::common::{NO_CACHE, ResponseBuilder, ServeBody, empty_body, full_body, stream_body};
use crate::compression::{CompressionPolicy, Encoder, Encoding};
use crate::config::Config;
use crate::error::{ConfigError, ServeError};
use crate::freshness::{self, Freshness};
use crate::monitoring::Metrics;
use crate::resolver::{ContentResolver, FallbackPolicy, ObjectKey, Resolved};
use crate::rewrite::HtmlRewriter;
use crate::single_flight::SingleFlight;
use crate::storage::{Backend, ByteStream, ObjectMetadata, Storage, guess_content_type};
use bytes::Bytes;
use futures::StreamExt;
use hyper::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, HeaderName,
    HeaderValue, LAST_MODIFIED, VARY,
};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;

/// What a request is answered from once resolution succeeded.
#[derive(Clone)]
enum Prepared {
    /// Fully prepared body, cached or not.
    Entry(Arc<CacheEntry>),
    /// Object too large to buffer: streamed from the backend per request.
    Passthrough(Arc<Passthrough>),
}

struct Passthrough {
    key: String,
    metadata: ObjectMetadata,
    content_type: String,
    etag: String,
    cache_control: String,
}

type FlightResult = Result<Prepared, ServeError>;

#[derive(Clone)]
pub struct StaticFileHandler {
    pipeline: Arc<Pipeline>,
}

struct Pipeline {
    storage: Storage,
    resolver: ContentResolver,
    cache: Arc<ResponseCache>,
    flights: SingleFlight<CacheKey, FlightResult>,
    compression: CompressionPolicy,
    rewriter: HtmlRewriter,
    metrics: Arc<Metrics>,
    cache_control: String,
    response_headers: Vec<(HeaderName, HeaderValue)>,
    custom_mime_types: HashMap<String, String>,
    cache_ttl: Duration,
    html_cache_ttl: Duration,
    max_entry_size: u64,
    allow_hidden: bool,
    timeout: Duration,
}

impl StaticFileHandler {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let storage = Storage::from_location(&config.storage)?;
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: &Config, storage: Storage) -> Result<Self, ConfigError> {
        let content_type_filter = match &config.compress_content_type {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
                key: "compress_content_type".to_string(),
                message: e.to_string(),
            })?),
            None => None,
        };

        let mut response_headers = Vec::with_capacity(config.response_headers.len());
        for (name, value) in &config.response_headers {
            let invalid = |message: String| ConfigError::InvalidValue {
                key: format!("response header {}", name),
                message,
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            response_headers.push((header_name, header_value));
        }

        let rewriter = HtmlRewriter::new(&config.html_replaces).map_err(|e| ConfigError::InvalidValue {
            key: "html_replaces".to_string(),
            message: e.to_string(),
        })?;
        let metrics = Metrics::new().map_err(|e| ConfigError::Invalid(format!("metrics registry: {}", e)))?;
        let fallback = FallbackPolicy::from_flags(config.fallback_html_404, config.fallback_index_404);

        log::info!(
            "Serving {} storage, cache {} bytes, compression threshold {} bytes",
            storage.scheme(),
            config.cache_size,
            config.compress_min_length
        );

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                storage,
                resolver: ContentResolver::new(config.index_file.clone(), config.autoindex, fallback),
                cache: Arc::new(ResponseCache::new(config.cache_size)),
                flights: SingleFlight::new(),
                compression: CompressionPolicy::new(config.compress_min_length, content_type_filter),
                rewriter,
                metrics: Arc::new(metrics),
                cache_control: config.cache_control.clone(),
                response_headers,
                custom_mime_types: config.custom_mime_types.clone(),
                cache_ttl: config.cache_ttl,
                html_cache_ttl: config.effective_html_cache_ttl(),
                max_entry_size: config.cache_max_entry_size,
                allow_hidden: config.allow_hidden,
                timeout: config.timeout,
            }),
        })
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.pipeline.cache
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.pipeline.metrics
    }

    pub fn storage(&self) -> &Storage {
        &self.pipeline.storage
    }

    /// Misses currently being prepared.
    pub fn in_flight(&self) -> usize {
        self.pipeline.flights.in_flight()
    }

    pub async fn handle_request<B>(&self, req: &Request<B>) -> Response<ServeBody> {
        let response = self.serve(req).await;
        self.pipeline.metrics.record_request(response.status());
        response
    }

    async fn serve<B>(&self, req: &Request<B>) -> Response<ServeBody> {
        let is_head = req.method() == Method::HEAD;
        if req.method() != Method::GET && !is_head {
            return ResponseBuilder::method_not_allowed();
        }

        let pipeline = &self.pipeline;
        let key = match ObjectKey::parse(req.uri().path(), pipeline.allow_hidden) {
            Ok(key) => key,
            Err(e) => return pipeline.error_response(&e, is_head),
        };

        let accept_encoding = req.headers().get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok());
        let variant = pipeline.cache_variant(&key, pipeline.compression.preferred(accept_encoding));

        let served = tokio::time::timeout(pipeline.timeout, async {
            let prepared = Pipeline::lookup(pipeline, key, variant).await?;
            pipeline.respond(prepared, req.headers(), is_head).await
        })
        .await
        .unwrap_or(Err(ServeError::Timeout));

        match served {
            Ok(response) => response,
            Err(e) => pipeline.error_response(&e, is_head),
        }
    }

    /// Starts the background TTL sweeper. The task holds only a weak
    /// reference and stops once the handler is dropped.
    pub fn spawn_cache_sweeper(&self, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() || !self.pipeline.cache.is_enabled() {
            return None;
        }

        let pipeline = Arc::downgrade(&self.pipeline);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pipeline) = pipeline.upgrade() else {
                    break;
                };
                let purged = pipeline.cache.purge_expired();
                pipeline.metrics.set_cache_weight(pipeline.cache.weight());
                if purged > 0 {
                    debug!("cache sweep removed {} expired entries", purged);
                }
            }
        }))
    }
}

impl Pipeline {
    async fn lookup(this: &Arc<Self>, key: ObjectKey, variant: Encoding) -> FlightResult {
        let cache_key = CacheKey::new(key.request_key(), variant);
        if let Some(entry) = this.cache.get(&cache_key) {
            this.metrics.record_cache_hit();
            debug!("cache hit: {} ({})", key, variant);
            return Ok(Prepared::Entry(entry));
        }
        this.metrics.record_cache_miss();
        debug!("cache miss: {} ({})", key, variant);

        let pipeline = Arc::clone(this);
        let flight_key = cache_key.clone();
        let (result, joined) = this
            .flights
            .run(flight_key, async move { pipeline.prepare(key, cache_key).await })
            .await;
        if joined {
            this.metrics.record_single_flight_join();
        }
        result
    }

    /// FETCH, REWRITE, COMPRESS and STORE for one (request key, variant).
    async fn prepare(&self, key: ObjectKey, cache_key: CacheKey) -> FlightResult {
        // A flight that finished just before this one started may have filled the slot
        if let Some(entry) = self.cache.get(&cache_key) {
            return Ok(Prepared::Entry(entry));
        }

        let (object_key, metadata) = match self.resolver.resolve(&self.storage, &key).await {
            Ok(Resolved::Object { key, metadata, .. }) => (key, metadata),
            Ok(Resolved::Listing { body }) => return self.prepare_listing(body, cache_key.variant),
            Err(e) => {
                if !e.is_not_found() {
                    warn!("Failed to resolve {}: {}", key, e);
                }
                return Err(e);
            }
        };

        let content_type = self.content_type_for(&object_key, &metadata);
        let is_html = content_type.starts_with("text/html");
        let cache_control = if is_html { NO_CACHE.to_string() } else { self.cache_control.clone() };

        // Rewritten HTML must be buffered whatever its size
        if metadata.size > self.max_entry_size && !self.rewriter.applies_to(&content_type) {
            debug!("{} is {} bytes, streaming without caching", object_key, metadata.size);
            let etag = freshness::metadata_etag(metadata.etag.as_deref(), metadata.size, metadata.last_modified);
            return Ok(Prepared::Passthrough(Arc::new(Passthrough {
                key: object_key,
                metadata,
                content_type,
                etag,
                cache_control,
            })));
        }

        self.metrics.record_backend_fetch();
        let stream = self.storage.read(&object_key).await.map_err(|e| {
            warn!("Failed to read {}: {}", object_key, e);
            ServeError::from(e)
        })?;

        let (body, encoding) = if self.rewriter.applies_to(&content_type) {
            let raw = collect(stream, metadata.size).await?;
            let rewritten = self.rewriter.rewrite(&content_type, raw);
            let encoding = self.negotiate(cache_key.variant, rewritten.len() as u64, &content_type);
            (encode_all(encoding, &rewritten)?, encoding)
        } else {
            let encoding = self.negotiate(cache_key.variant, metadata.size, &content_type);
            (encode_stream(encoding, stream, metadata.size).await?, encoding)
        };

        let body = Bytes::from(body);
        let cacheable = metadata.size <= self.max_entry_size;
        let entry = Arc::new(CacheEntry {
            etag: freshness::content_etag(&body),
            body,
            encoding,
            content_type,
            cache_control,
            metadata,
            stored_at: Instant::now(),
            ttl: if is_html { self.html_cache_ttl } else { self.cache_ttl },
        });

        if cacheable && self.cache.is_enabled() {
            let outcome = self.cache.insert(cache_key, Arc::clone(&entry));
            if outcome.evicted > 0 {
                self.metrics.record_evictions(outcome.evicted);
            }
            self.metrics.set_cache_weight(self.cache.weight());
        }

        Ok(Prepared::Entry(entry))
    }

    /// Listings are regenerated on every miss and never stored.
    fn prepare_listing(&self, body: String, variant: Encoding) -> FlightResult {
        let content_type = "text/html; charset=utf-8".to_string();
        let encoding = self.negotiate(variant, body.len() as u64, &content_type);
        let body = Bytes::from(encode_all(encoding, body.as_bytes())?);

        Ok(Prepared::Entry(Arc::new(CacheEntry {
            etag: freshness::content_etag(&body),
            body,
            encoding,
            content_type,
            cache_control: NO_CACHE.to_string(),
            metadata: ObjectMetadata::directory(),
            stored_at: Instant::now(),
            ttl: Duration::ZERO,
        })))
    }

    fn negotiate(&self, variant: Encoding, length: u64, content_type: &str) -> Encoding {
        self.compression.settle(variant, length, content_type)
    }

    fn content_type_for(&self, key: &str, metadata: &ObjectMetadata) -> String {
        self.custom_mime_type(key).unwrap_or_else(|| metadata.content_type.clone())
    }

    fn custom_mime_type(&self, key: &str) -> Option<String> {
        Path::new(key)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.custom_mime_types.get(&ext.to_lowercase()))
            .cloned()
    }

    /// Types that never get compressed share one identity entry whatever the
    /// client accepts. Keys without an extension are typed only after
    /// resolution, so they keep the client's preferred variant.
    fn cache_variant(&self, key: &ObjectKey, preferred: Encoding) -> Encoding {
        if preferred == Encoding::Identity || key.has_trailing_slash() {
            return preferred;
        }
        if Path::new(key.as_str()).extension().is_none() {
            return preferred;
        }
        let content_type = self
            .custom_mime_type(key.as_str())
            .unwrap_or_else(|| guess_content_type(key.as_str()));
        if self.compression.allows_content_type(&content_type) {
            preferred
        } else {
            Encoding::Identity
        }
    }

    async fn respond(&self, prepared: Prepared, request_headers: &HeaderMap, is_head: bool) -> Result<Response<ServeBody>, ServeError> {
        match prepared {
            Prepared::Entry(entry) => Ok(self.respond_entry(&entry, request_headers, is_head)),
            Prepared::Passthrough(object) => self.respond_passthrough(&object, request_headers, is_head).await,
        }
    }

    fn respond_entry(&self, entry: &CacheEntry, request_headers: &HeaderMap, is_head: bool) -> Response<ServeBody> {
        let freshness = freshness::evaluate(request_headers, &entry.etag, entry.last_modified());
        let mut response = Response::new(empty_body());
        self.common_headers(
            response.headers_mut(),
            &entry.etag,
            entry.last_modified(),
            &entry.cache_control,
            &entry.content_type,
        );

        if freshness == Freshness::NotModified {
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            return response;
        }

        let headers = response.headers_mut();
        if let Some(token) = entry.encoding.content_encoding() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(token));
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(entry.body.len()));
        if !is_head {
            *response.body_mut() = full_body(entry.body.clone());
        }
        response
    }

    async fn respond_passthrough(
        &self,
        object: &Passthrough,
        request_headers: &HeaderMap,
        is_head: bool,
    ) -> Result<Response<ServeBody>, ServeError> {
        let last_modified = object.metadata.last_modified;
        let freshness = freshness::evaluate(request_headers, &object.etag, last_modified);
        let mut response = Response::new(empty_body());
        self.common_headers(
            response.headers_mut(),
            &object.etag,
            last_modified,
            &object.cache_control,
            &object.content_type,
        );
        // Always identity, so the representation does not vary by encoding
        response.headers_mut().remove(VARY);

        if freshness == Freshness::NotModified {
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            return Ok(response);
        }

        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(object.metadata.size));
        if !is_head {
            self.metrics.record_backend_fetch();
            let stream = self.storage.read(&object.key).await.map_err(|e| {
                warn!("Failed to stream {}: {}", object.key, e);
                ServeError::from(e)
            })?;
            *response.body_mut() = stream_body(stream);
        }
        Ok(response)
    }

    fn common_headers(
        &self,
        headers: &mut HeaderMap,
        etag: &str,
        last_modified: Option<SystemTime>,
        cache_control: &str,
        content_type: &str,
    ) {
        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.insert(ETAG, value);
        }
        if let Some(modified) = last_modified {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                headers.insert(LAST_MODIFIED, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(cache_control) {
            headers.insert(CACHE_CONTROL, value);
        }
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        if self.compression.is_enabled() && self.compression.allows_content_type(content_type) {
            headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
        }
        for (name, value) in &self.response_headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    fn error_response(&self, error: &ServeError, is_head: bool) -> Response<ServeBody> {
        match error.status() {
            StatusCode::NOT_FOUND => ResponseBuilder::not_found(is_head),
            status => {
                if status.is_server_error() {
                    warn!("Request failed: {}", error);
                } else {
                    debug!("Request rejected: {}", error);
                }
                ResponseBuilder::error(status, is_head)
            }
        }
    }
}

async fn collect(mut stream: ByteStream, size_hint: u64) -> Result<Vec<u8>, ServeError> {
    let mut buffer = Vec::with_capacity(size_hint as usize);
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer)
}

/// Compresses chunk by chunk as the backend delivers them.
async fn encode_stream(encoding: Encoding, mut stream: ByteStream, size_hint: u64) -> Result<Vec<u8>, ServeError> {
    let mut encoder = Encoder::new(encoding, size_hint as usize).map_err(encoder_error)?;
    while let Some(chunk) = stream.next().await {
        encoder.write(&chunk?).map_err(encoder_error)?;
    }
    encoder.finish().map_err(encoder_error)
}

fn encode_all(encoding: Encoding, data: &[u8]) -> Result<Vec<u8>, ServeError> {
    crate::compression::encode(encoding, data).map_err(encoder_error)
}

fn encoder_error(e: std::io::Error) -> ServeError {
    ServeError::Internal(format!("compression failed: {}", e))
}
