use std::io;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::meshport::config;

/// Keeps the non-blocking log worker alive; dropping it flushes buffered lines.
#[derive(Debug)]
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Wire the config file's `logging` block into a tracing subscriber.
///
/// `RUST_LOG` wins over the configured level, so operators can raise
/// verbosity per target without touching the route config. The configured
/// level is passed through as a filter directive, which also permits full
/// directives like `meshport=debug` in the config file.
pub fn init(cfg: &config::LoggingConfig) -> anyhow::Result<LogGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(env) => env,
        Err(_) => {
            let level = cfg.level.trim();
            let directive = if level.is_empty() { "info" } else { level };
            EnvFilter::try_new(directive)
                .with_context(|| format!("logging: bad level {directive:?}"))?
        }
    };

    let (writer, worker) = match cfg.output.trim() {
        "" | "stderr" => tracing_appender::non_blocking(io::stderr()),
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {path}"))?;
            tracing_appender::non_blocking(file)
        }
    };

    let base = tracing_subscriber::registry().with(filter);
    if cfg.format.trim().eq_ignore_ascii_case("json") {
        base.with(fmt::layer().json().with_writer(writer)).init();
    } else {
        base.with(fmt::layer().with_writer(writer)).init();
    }

    Ok(LogGuard { _worker: worker })
}
