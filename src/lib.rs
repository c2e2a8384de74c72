pub mod cache;
pub mod common;
pub mod compression;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod freshness;
pub mod logging;
pub mod monitoring;
pub mod resolver;
pub mod rewrite;
pub mod server;
pub mod single_flight;
pub mod static_files;
pub mod storage;

pub use config::Config;
pub use error::{ConfigError, ServeError, StorageError};
pub use server::Server;
pub use static_files::StaticFileHandler;
