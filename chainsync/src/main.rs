use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use std::path::Path;
use std::process;

use chainsync_lib::config::{self, Config};
use chainsync_lib::logging::{self, LogReloadHandle};

mod cli;
mod tables;

use tables::Tables;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn ctrlc_channel() -> Result<mpsc::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(()).await.is_err() {
                        tracing::warn!("sigint: receiver closed");
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(()).await.is_err() {
                        tracing::warn!("sigterm: receiver closed");
                        break;
                    }
                },
                else => {
                    tracing::warn!("sigint and sigterm streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

async fn hangup_channel() -> Result<mpsc::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(4);
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            tracing::debug!("received SIGHUP");
            if sender.send(()).await.is_err() {
                break;
            }
        }
    });

    Ok(receiver)
}

async fn config_channel(
    param_config_path: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<notify::Event>), exitcode::ExitCode> {
    match param_config_path.try_exists() {
        Ok(true) => (),
        Ok(false) => {
            tracing::error!(config_file = %param_config_path.display(), "cannot find configuration file");
            return Err(exitcode::NOINPUT);
        }
        Err(e) => {
            tracing::error!(error = ?e, "error checking configuration file path");
            return Err(exitcode::IOERR);
        }
    };

    let config_path = match param_config_path.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = ?e, "error canonicalizing config path");
            return Err(exitcode::IOERR);
        }
    };

    let Some(parent) = config_path.parent() else {
        tracing::error!("config path has no parent");
        return Err(exitcode::UNAVAILABLE);
    };

    let (sender, receiver) = mpsc::channel(32);
    let mut watcher = match notify::recommended_watcher(move |res| match res {
        Ok(event) => {
            let _ = sender.blocking_send(event).map_err(|e| {
                tracing::error!(error = ?e, "error sending config watch event");
            });
        }
        Err(e) => tracing::error!(error = ?e, "config watch error"),
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = ?e, "error creating config watcher");
            return Err(exitcode::IOERR);
        }
    };

    // editors replace files, so watch the directory
    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
        tracing::error!(error = ?e, "error watching config directory");
        return Err(exitcode::IOERR);
    }

    Ok((watcher, receiver))
}

fn incoming_config_fs_event(event: notify::Event, config_path: &Path) -> bool {
    tracing::debug!(?event, ?config_path, "incoming config event");
    let concerns_config =
        event.paths.is_empty() || event.paths.iter().any(|p| p.file_name() == config_path.file_name());
    if !concerns_config {
        return false;
    }
    match event.kind {
        kind @ (notify::event::EventKind::Create(notify::event::CreateKind::File)
        | notify::event::EventKind::Remove(notify::event::RemoveKind::File)
        | notify::event::EventKind::Modify(notify::event::ModifyKind::Data(_))) => {
            tracing::debug!(?kind, "config file change detected");
            true
        }
        _ => false,
    }
}

async fn read_config(path: &Path) -> Result<Config, exitcode::ExitCode> {
    config::read(path).await.map_err(|e| {
        tracing::error!(error = %e, config_file = %path.display(), "error reading configuration");
        match e {
            config::Error::NoFile => exitcode::NOINPUT,
            config::Error::IO(_) => exitcode::IOERR,
            _ => exitcode::CONFIG,
        }
    })
}

/// Engine options are only read on startup, the ruleset follows the file.
fn engine_options_changed(current: &Config, next: &Config) -> bool {
    current.backend != next.backend
        || current.command_timeout != next.command_timeout
        || current.lock != next.lock
        || current.tables != next.tables
        || current.defaults != next.defaults
}

async fn reload_config(path: &Path, current: &mut Config, tables: &mut Tables) {
    let next = match config::read(path).await {
        Ok(next) => next,
        Err(config::Error::NoFile) => {
            tracing::warn!(config_file = %path.display(), "configuration file removed, keeping current ruleset");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "error reading changed configuration, keeping current ruleset");
            return;
        }
    };
    if engine_options_changed(current, &next) {
        tracing::warn!("engine options changed, restart to apply them");
    }
    match tables.reload(&next) {
        Ok(()) => *current = next,
        Err(e) => tracing::error!(error = %e, "invalid ruleset in changed configuration, keeping current one"),
    }
}

async fn daemon(args: cli::Cli, log_handle: Option<LogReloadHandle>) -> Result<(), exitcode::ExitCode> {
    let mut ctrlc_receiver = ctrlc_channel().await?;
    let mut hangup_receiver = hangup_channel().await?;

    let mut config = read_config(&args.config_path).await?;
    let (_watcher, mut config_receiver) = config_channel(&args.config_path).await?;

    let mut tables = Tables::build(&config).await.map_err(|e| {
        tracing::error!(error = %e, "error setting up tables");
        exitcode::CONFIG
    })?;

    loop {
        let delay = tables.apply().await.map_err(|e| {
            tracing::error!(error = %e, "dataplane synchronization failed");
            exitcode::TEMPFAIL
        })?;

        if args.once {
            tables.log_stats();
            return Ok(());
        }

        let recheck = delay.unwrap_or_default();
        tokio::select! {
            Some(_) = ctrlc_receiver.recv() => {
                tracing::info!("shutting down");
                tables.log_stats();
                return Ok(());
            }
            Some(_) = hangup_receiver.recv() => {
                if let (Some(handle), Some(path)) = (&log_handle, &args.log_file) {
                    if let Err(e) = logging::reopen(handle, path) {
                        tracing::error!(error = %e, "error reopening log file");
                    }
                }
            }
            Some(event) = config_receiver.recv() => {
                if incoming_config_fs_event(event, &args.config_path) {
                    reload_config(&args.config_path, &mut config, &mut tables).await;
                }
            }
            _ = tokio::time::sleep(recheck), if delay.is_some() => {
                tracing::trace!(recheck = %humantime::format_duration(recheck), "recheck due");
            }
            else => {
                tracing::error!("all event sources closed");
                return Err(exitcode::SOFTWARE);
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();

    let log_handle = match &args.log_file {
        Some(path) => match logging::setup_log_file(path) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("{e}");
                process::exit(exitcode::CANTCREAT);
            }
        },
        None => {
            logging::setup_stdout();
            None
        }
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args, log_handle).await {
        Ok(_) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
