pub mod allocator;
pub mod cache;
pub mod cohort;
pub mod commands;
pub mod config;
pub mod errors;
pub mod import;
pub mod models;
pub mod partition;
pub mod registry;
pub mod repair;
pub mod search;
pub mod stats;
pub mod store;

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;

pub use crate::commands::RegistryHandle;
pub use crate::config::RegistryConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::registry::Registry;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// JSON logs to a daily rolling file. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "cohort-registry.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
