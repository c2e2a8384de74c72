use crate::common::{ResponseBuilder, ServeBody};
use crate::config::Config;
use crate::error::ConfigError;
use crate::logging::{self, AccessRecord};
use crate::monitoring::MonitoringServer;
use crate::static_files::StaticFileHandler;
use hyper::body::Incoming;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// How long open connections get to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The asset listener plus, optionally, the metrics listener.
pub struct Server {
    listener: TcpListener,
    handler: StaticFileHandler,
    monitoring: Option<MonitoringServer>,
    sweep_interval: Duration,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self, ConfigError> {
        let handler = StaticFileHandler::new(config)?;
        Self::bind_with(config, handler).await
    }

    /// Binds both listeners up front so address conflicts fail startup
    /// instead of the first request.
    pub async fn bind_with(config: &Config, handler: StaticFileHandler) -> Result<Self, ConfigError> {
        info!("Binding HTTP listener to: {}", config.listen_addr);
        let listener = TcpListener::bind(config.listen_addr).await?;

        let monitoring = match config.metrics_addr {
            Some(addr) => Some(MonitoringServer::bind(addr, handler.metrics().clone()).await?),
            None => None,
        };

        Ok(Self {
            listener,
            handler,
            monitoring,
            sweep_interval: config.cache_sweep_interval,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.monitoring.as_ref().and_then(|m| m.local_addr().ok())
    }

    pub fn handler(&self) -> &StaticFileHandler {
        &self.handler
    }

    /// Serves until Ctrl+C or SIGTERM.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serves until `shutdown` resolves, then stops accepting and drains
    /// open connections.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            handler,
            monitoring,
            sweep_interval,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!("HTTP static file server listening on: http://{}", addr);
        }

        let monitoring_task = monitoring.map(|server| {
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Monitoring server stopped: {}", e);
                }
            })
        });
        let sweeper = handler.spawn_cache_sweeper(sweep_interval);

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!("Accepted connection from {}", remote_addr);

                    let handler = handler.clone();
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(route(&handler, req).await) }
                    });
                    let connection = ServerBuilder::new()
                        .keep_alive(true)
                        .serve_connection(TokioIo::new(stream), service);
                    let connection = graceful.watch(connection);

                    tokio::spawn(async move {
                        if let Err(err) = connection.await {
                            debug!("Error serving HTTP connection from {}: {}", remote_addr, err);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, draining connections");
                    break;
                }
            }
        }

        drop(listener);
        if let Some(task) = sweeper {
            task.abort();
        }
        if let Some(task) = monitoring_task {
            task.abort();
        }

        tokio::select! {
            _ = graceful.shutdown() => info!("All connections closed"),
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                warn!("Timed out after {:?} waiting for connections to close", DRAIN_TIMEOUT);
            }
        }
        Ok(())
    }
}

async fn route(handler: &StaticFileHandler, req: Request<Incoming>) -> Response<ServeBody> {
    let started = Instant::now();
    // The body of a GET or HEAD is never read
    let (parts, _body) = req.into_parts();
    let req = Request::from_parts(parts, ());

    let is_head = req.method() == Method::HEAD;
    let response = match req.uri().path() {
        "/ping" if is_head || req.method() == Method::GET => ResponseBuilder::pong(is_head),
        _ => handler.handle_request(&req).await,
    };

    let headers = response.headers();
    logging::log_access(&AccessRecord {
        method: req.method(),
        path: req.uri().path(),
        status: response.status(),
        bytes: headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        encoding: headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()),
        elapsed: started.elapsed(),
    });
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
