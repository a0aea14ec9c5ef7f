//! 观测性初始化：控制台输出与可选的滚动文件日志。

pub mod events;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::TelemetryConfig;

pub const LOG_FILE_PREFIX: &str = "voxgate.log";

/// Installs the global subscriber. Keep the returned guard alive for as long
/// as file logging should keep flushing.
pub fn init_tracing(config: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level `{}`", config.level))?;

    let console = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default().with(env_filter).with(console).with(file);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global subscriber")?;

    Ok(guard)
}
