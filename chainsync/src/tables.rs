//! The set of tables the daemon keeps in sync.

use thiserror::Error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chainsync_lib::clock::SystemClock;
use chainsync_lib::cmd::TokioRunner;
use chainsync_lib::config::{Backend, Config, TableSpec};
use chainsync_lib::features::{self, BackendMode, EngineInfo, PathLocator};
use chainsync_lib::lock::{DataplaneLock, FileLock};
use chainsync_lib::ruleset::{self, DesiredTable};
use chainsync_lib::table::{self, Table};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Table {table}: {source}")]
    Table { table: String, source: table::Error },
    #[error(transparent)]
    Ruleset(#[from] ruleset::Error),
}

type DaemonTable = Table<TokioRunner, SystemClock, dyn DataplaneLock>;

struct Managed {
    spec: TableSpec,
    table: DaemonTable,
    desired: DesiredTable,
}

pub struct Tables {
    managed: Vec<Managed>,
}

async fn probe(runner: &TokioRunner, ip_version: u8) -> Option<EngineInfo> {
    match features::detect(runner, ip_version).await {
        Ok(info) => {
            tracing::info!(ip_version, version = %info.version, mode = ?info.mode, "engine detected");
            Some(info)
        }
        Err(e) => {
            tracing::warn!(ip_version, error = %e, "unable to query engine version");
            None
        }
    }
}

fn resolve_backend(choice: Backend, info: Option<&EngineInfo>) -> BackendMode {
    match choice {
        Backend::Fixed(mode) => mode,
        Backend::Auto => info.and_then(|i| i.mode).unwrap_or_default(),
    }
}

/// Engines whose restore binary waits for the shared lock only need our own lock.
fn lock_path(config: &Config, info: Option<&EngineInfo>) -> PathBuf {
    if info.is_some_and(|i| i.features().restore_supports_lock) {
        config.lock.path.clone()
    } else {
        config.lock.xtables_path.clone()
    }
}

fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Tables {
    pub async fn build(config: &Config) -> Result<Self, Error> {
        let mut locks: HashMap<PathBuf, Arc<dyn DataplaneLock>> = HashMap::new();
        let mut managed = Vec::with_capacity(config.tables.len());

        for spec in &config.tables {
            let runner = TokioRunner::new(config.command_timeout);
            let info = probe(&runner, spec.ip_version).await;
            let backend = resolve_backend(config.backend, info.as_ref());

            let path = lock_path(config, info.as_ref());
            let lock = match locks.get(&path) {
                Some(lock) => lock.clone(),
                None => {
                    let lock: Arc<dyn DataplaneLock> =
                        Arc::new(FileLock::new(&path, config.lock.timeout, config.lock.probe_interval));
                    locks.insert(path.clone(), lock.clone());
                    lock
                }
            };

            let options = config.table_options(spec, backend);
            let mut table = Table::new(options, runner, SystemClock, lock, &PathLocator).map_err(|source| {
                Error::Table {
                    table: spec.to_string(),
                    source,
                }
            })?;
            let desired = config.ruleset.desired(&spec.name, spec.ip_version)?;
            desired.sync_into(&DesiredTable::default(), &mut table);

            tracing::info!(
                table = %spec,
                %backend,
                lock = %path.display(),
                chains = desired.chains.len(),
                hooks = desired.inserts.len() + desired.appends.len(),
                "table ready"
            );
            managed.push(Managed {
                spec: spec.clone(),
                table,
                desired,
            });
        }
        Ok(Self { managed })
    }

    /// Swaps in the ruleset of `config`. A ruleset that fails to convert leaves every table as is.
    pub fn reload(&mut self, config: &Config) -> Result<(), Error> {
        let next = self
            .managed
            .iter()
            .map(|m| config.ruleset.desired(&m.spec.name, m.spec.ip_version))
            .collect::<Result<Vec<_>, _>>()?;
        for (m, desired) in self.managed.iter_mut().zip(next) {
            if desired != m.desired {
                tracing::info!(table = %m.spec, "desired ruleset changed");
                desired.sync_into(&m.desired, &mut m.table);
                m.desired = desired;
            }
        }
        Ok(())
    }

    /// Applies every table and returns the earliest recheck any of them asked for.
    pub async fn apply(&mut self) -> Result<Option<Duration>, Error> {
        let mut next = None;
        for m in self.managed.iter_mut() {
            let delay = m.table.apply().await.map_err(|source| Error::Table {
                table: m.spec.to_string(),
                source,
            })?;
            next = earliest(next, delay);
        }
        Ok(next)
    }

    pub fn log_stats(&self) {
        for m in &self.managed {
            let stats = m.table.stats();
            tracing::info!(
                table = %m.spec,
                loads = stats.loads,
                writes = stats.writes,
                unexpected_inserts = stats.unexpected_inserts,
                drift_repairs = stats.drift_repairs,
                "table statistics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chainsync_lib::features::Version;

    fn info(mode: Option<BackendMode>, minor: u32) -> EngineInfo {
        EngineInfo {
            version: Version::new(1, minor, 0),
            mode,
        }
    }

    #[test]
    fn auto_backend_follows_engine() {
        let nft = info(Some(BackendMode::Nft), 8);
        assert_eq!(resolve_backend(Backend::Auto, Some(&nft)), BackendMode::Nft);
        assert_eq!(resolve_backend(Backend::Auto, None), BackendMode::Legacy);
        assert_eq!(
            resolve_backend(Backend::Fixed(BackendMode::Legacy), Some(&nft)),
            BackendMode::Legacy
        );
    }

    #[test]
    fn old_engines_use_the_shared_lock() -> anyhow::Result<()> {
        let config = chainsync_lib::config::parse("version = 1\n")?;
        assert_eq!(lock_path(&config, Some(&info(None, 4))), config.lock.xtables_path);
        assert_eq!(lock_path(&config, None), config.lock.xtables_path);
        assert_eq!(lock_path(&config, Some(&info(Some(BackendMode::Legacy), 8))), config.lock.path);
        Ok(())
    }

    #[test]
    fn earliest_delay_wins() {
        let ms = Duration::from_millis;
        assert_eq!(earliest(None, None), None);
        assert_eq!(earliest(Some(ms(50)), None), Some(ms(50)));
        assert_eq!(earliest(Some(ms(50)), Some(ms(20))), Some(ms(20)));
    }
}
