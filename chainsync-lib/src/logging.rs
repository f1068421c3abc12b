use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";
pub const ENV_VAR_LOG_FILE: &str = "CHAINSYNC_LOG_FILE";
pub const DEFAULT_LOG_FILE: &str = "/var/log/chainsync.log";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Unable to swap log file layer: {0}")]
    Reload(#[from] reload::Error),
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Formatting layer appending to `log_path`, without ANSI colors.
///
/// Also used to reopen the file after an external tool rotated it.
pub fn make_file_fmt_layer(log_path: &Path) -> Result<FileFmtLayer, Error> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|source| Error::Open {
            path: log_path.to_path_buf(),
            source,
        })?;

    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Installs the global subscriber writing to `log_path`.
///
/// The returned handle swaps the file layer at runtime, see [`reopen`].
pub fn setup_log_file(log_path: &Path) -> Result<LogReloadHandle, Error> {
    let (reload_layer, reload_handle): (
        reload::Layer<FileFmtLayer, tracing_subscriber::Registry>,
        LogReloadHandle,
    ) = reload::Layer::new(make_file_fmt_layer(log_path)?);
    tracing_subscriber::registry().with(reload_layer).with(filter()).init();
    tracing::debug!(path = %log_path.display(), "logging initialized with file output");
    Ok(reload_handle)
}

/// Reopens the log file, typically on `SIGHUP` after rotation.
pub fn reopen(handle: &LogReloadHandle, log_path: &Path) -> Result<(), Error> {
    let layer = make_file_fmt_layer(log_path)?;
    handle.reload(layer)?;
    tracing::info!(path = %log_path.display(), "log file reopened");
    Ok(())
}

/// Installs the global subscriber writing to stdout.
pub fn setup_stdout() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter())
        .init();
    tracing::debug!("logging initialized with stdout output");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_creates_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chainsync.log");
        make_file_fmt_layer(&path)?;
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn file_layer_reports_unwritable_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let res = make_file_fmt_layer(&dir.path().join("missing").join("chainsync.log"));
        assert!(matches!(res, Err(Error::Open { .. })));
        Ok(())
    }
}
