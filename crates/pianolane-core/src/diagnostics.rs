use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

pub const DEFAULT_LOG_FILTER: &str = "info,pianolane_core=debug,pianolane_app=debug";
pub const DEFAULT_LOG_PREFIX: &str = "pianolane";

/// Holds the file writer open. Logs written after it drops are lost.
pub struct TelemetryGuard {
    pub session_id: Uuid,
    pub log_file: PathBuf,
    _file_guard: WorkerGuard,
}

pub fn init_tracing(log_dir: impl AsRef<Path>) -> anyhow::Result<TelemetryGuard> {
    init_tracing_with_options(log_dir, DEFAULT_LOG_PREFIX, DEFAULT_LOG_FILTER)
}

/// Human-readable events go to stderr, leaving stdout to command output, and
/// JSON lines go to `<prefix>-<utc timestamp>.log` under `log_dir`.
/// `RUST_LOG` takes precedence over `filter`.
pub fn init_tracing_with_options(
    log_dir: impl AsRef<Path>,
    file_prefix: &str,
    filter: &str,
) -> anyhow::Result<TelemetryGuard> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(filter)
            .with_context(|| format!("invalid log filter '{filter}'"))?,
    };

    let log_dir = log_dir.as_ref();
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;
    let file_name = format!("{file_prefix}-{}.log", Utc::now().format("%Y%m%d-%H%M%S"));
    let log_file = log_dir.join(&file_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let console = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(io::stderr);
    let json_file = tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_current_span(true)
        .with_writer(file_writer);

    let session_id = Uuid::new_v4();
    match tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(json_file)
        .try_init()
    {
        Ok(()) => info!(%session_id, log_file = %log_file.display(), "logging to file"),
        Err(error) => warn!(?error, "tracing subscriber was already installed"),
    }

    Ok(TelemetryGuard {
        session_id,
        log_file,
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_created_with_prefix() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let log_dir = temp.path().join("logs");
        let guard = init_tracing_with_options(&log_dir, "pianolane-test", "off")
            .expect("tracing init should work");
        let log_file = guard.log_file.clone();
        drop(guard);

        assert!(log_file.starts_with(&log_dir));
        assert!(log_file.is_file());
        let name = log_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(name.starts_with("pianolane-test-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn malformed_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir should work");
        let result = init_tracing_with_options(temp.path(), "bad", "pianolane_core=loud");
        assert!(result.is_err());
    }
}
