//! Logging initialization using the `tracing` ecosystem.
//!
//! Console output is human-readable by default or JSON lines when
//! [`LogConfig::json`] is set. A daily-rotating file layer is added when a log
//! directory is configured. `RUST_LOG` always overrides the configured level.

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Initialize the global tracing subscriber.
///
/// Should be called once at program start. Returns an error if a global
/// subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = if config.json {
        fmt::layer().json().with_target(true).with_thread_ids(true).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(true)
            .boxed()
    };

    let file_layer = config.dir.as_ref().map(|dir| {
        let file_appender = tracing_appender::rolling::daily(dir, &config.module_name);
        fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
