use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};
use static_serve::config::{Config, LogFormat, LogLevel};
use static_serve::config_validation::validate_config;
use static_serve::{Server, logging};
use std::net::SocketAddr;
use std::path::Path;

#[derive(Parser)]
#[clap(
    version,
    about = "Static asset server with in-memory caching, compression and pluggable storage backends"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 0.0.0.0:3000)")]
    listen: Option<SocketAddr>,

    #[clap(short, long, value_name = "LOCATION", help = "Directory or storage URL (s3, ftp, mongodb)")]
    storage: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "NUM", help = "Number of runtime worker threads")]
    worker_threads: Option<usize>,

    #[clap(long, value_name = "ADDR", help = "Expose Prometheus metrics on this address")]
    metrics: Option<SocketAddr>,

    #[clap(long, value_name = "EXT:MIME", help = "Custom MIME type mapping (e.g., mjs:application/javascript), can be used multiple times")]
    mime_type: Vec<String>,

    #[clap(long, value_name = "FILE", help = "Write the default configuration to FILE and exit")]
    generate_config: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default()
            .to_file(config_file)
            .with_context(|| format!("Failed to write {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    logging::init(&config.logging).context("Failed to initialize logging")?;

    let validation = validate_config(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid {
        bail!("Invalid configuration:\n  {}", validation.errors.join("\n  "));
    }

    let worker_threads = config.worker_threads.unwrap_or_else(num_cpus::get);
    info!("Starting runtime with {} worker threads", worker_threads);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("static-worker")
        .enable_all()
        .build()
        .context("Failed to build the Tokio runtime")?;

    runtime.block_on(async move {
        let server = Server::bind(&config).await.context("Failed to start server")?;
        server.run().await.context("Server error")?;
        info!("Static server stopped");
        Ok(())
    })
}

/// Defaults, then the config file, then `STATIC_*` variables, then flags.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file).with_context(|| format!("Failed to load {}", config_file))?
        }
        None => Config::default(),
    };

    config.apply_env().context("Invalid environment configuration")?;

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(storage) = &args.storage {
        config.storage = storage.clone();
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if args.worker_threads.is_some() {
        config.worker_threads = args.worker_threads;
    }
    if args.metrics.is_some() {
        config.metrics_addr = args.metrics;
    }
    for mime_spec in &args.mime_type {
        let Some((extension, mime_type)) = mime_spec.split_once(':') else {
            bail!("Invalid MIME type specification: '{}'. Use format 'EXT:MIME'", mime_spec);
        };
        config.add_custom_mime_type(extension.trim(), mime_type.trim());
    }

    Ok(config)
}
