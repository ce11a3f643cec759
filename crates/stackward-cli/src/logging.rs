use std::io;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub(crate) const LOG_ENV: &str = "STACKWARD_LOG";
const DEFAULT_DIRECTIVES: &str = "info";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Directives from `STACKWARD_LOG`, falling back to `info` when unset or
/// unparsable.
pub(crate) fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
pub(crate) fn init_logging(format: LogFormat) -> Result<()> {
    let filter = env_filter(std::env::var(LOG_ENV).ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init(),
    }
    .context("failed to install log subscriber")
}
