use crate::common::{ResponseBuilder, ServeBody, full_body};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

const NAMESPACE: &str = "static";

/// Serving counters, exported in the Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_evictions: IntCounter,
    backend_fetches: IntCounter,
    single_flight_joins: IntCounter,
    cache_weight: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests answered, by status code").namespace(NAMESPACE),
            &["status"],
        )?;
        let cache_hits = counter("cache_hits_total", "Requests answered from the response cache")?;
        let cache_misses = counter("cache_misses_total", "Requests that missed the response cache")?;
        let cache_evictions = counter("cache_evictions_total", "Entries evicted to stay within capacity")?;
        let backend_fetches = counter("backend_fetches_total", "Object bodies read from the storage backend")?;
        let single_flight_joins = counter(
            "single_flight_joins_total",
            "Requests that awaited an in-flight fetch instead of starting one",
        )?;
        let cache_weight = IntGauge::with_opts(
            Opts::new("cache_weight_bytes", "Total body bytes held by the response cache").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(backend_fetches.clone()))?;
        registry.register(Box::new(single_flight_joins.clone()))?;
        registry.register(Box::new(cache_weight.clone()))?;

        Ok(Self {
            registry,
            requests,
            cache_hits,
            cache_misses,
            cache_evictions,
            backend_fetches,
            single_flight_joins,
            cache_weight,
        })
    }

    pub fn record_request(&self, status: StatusCode) {
        self.requests.with_label_values(&[status.as_str()]).inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_evictions(&self, count: usize) {
        self.cache_evictions.inc_by(count as u64);
    }

    pub fn record_backend_fetch(&self) {
        self.backend_fetches.inc();
    }

    pub fn record_single_flight_join(&self) {
        self.single_flight_joins.inc();
    }

    pub fn set_cache_weight(&self, bytes: u64) {
        self.cache_weight.set(bytes as i64);
    }

    pub fn requests(&self, status: StatusCode) -> u64 {
        self.requests.with_label_values(&[status.as_str()]).get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.get()
    }

    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.get()
    }

    pub fn backend_fetches(&self) -> u64 {
        self.backend_fetches.get()
    }

    pub fn single_flight_joins(&self) -> u64 {
        self.single_flight_joins.get()
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

/// Listener exposing `/metrics`, kept apart from the asset listener so
/// scrapes never compete with static traffic.
pub struct MonitoringServer {
    listener: TcpListener,
    metrics: Arc<Metrics>,
}

impl MonitoringServer {
    pub async fn bind(addr: SocketAddr, metrics: Arc<Metrics>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            log::info!("Monitoring server listening on http://{}/metrics", addr);
        }

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, Infallible>(route(&metrics, req)) }
                });
                if let Err(err) = ServerBuilder::new().serve_connection(io, service).await {
                    log::error!("Monitoring connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

fn route(metrics: &Metrics, req: Request<Incoming>) -> Response<ServeBody> {
    match req.uri().path() {
        "/metrics" => handle_metrics(metrics),
        _ => ResponseBuilder::error(StatusCode::NOT_FOUND, false),
    }
}

fn handle_metrics(metrics: &Metrics) -> Response<ServeBody> {
    match metrics.encode() {
        Ok(payload) => {
            let mut response = Response::new(full_body(payload));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            log::error!("Failed to encode Prometheus metrics: {}", e);
            ResponseBuilder::internal_server_error()
        }
    }
}
