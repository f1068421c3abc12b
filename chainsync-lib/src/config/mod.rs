use thiserror::Error;
use tokio::fs;

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::features::{self, BackendMode};
use crate::reconcile;
use crate::ruleset::Ruleset;
use crate::table::TableOptions;

mod v1;

pub const DEFAULT_PATH: &str = "/etc/chainsync/config.toml";
pub const ENV_VAR: &str = "CHAINSYNC_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(i64),
    #[error("Invalid insert mode: {0}")]
    InsertMode(#[from] reconcile::Error),
    #[error("Invalid backend: {0}")]
    Backend(#[from] features::Error),
    #[error("Unsupported IP version {0} for table {1}")]
    IpVersion(u8, String),
    #[error("No tables configured")]
    NoTables,
}

/// Which engine backend to drive. `Auto` asks the engine on startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Auto,
    Fixed(BackendMode),
}

impl FromStr for Backend {
    type Err = features::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "auto" => Ok(Backend::Auto),
            other => other.parse().map(Backend::Fixed),
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Fixed(mode) => write!(f, "{mode}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub ip_version: u8,
}

impl Display for TableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ipv{}", self.name, self.ip_version)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOptions {
    /// Our own lock, used when the restore binary takes the engine lock itself.
    pub path: PathBuf,
    /// The engine's shared lock, taken by us for engines that cannot wait for it.
    pub xtables_path: PathBuf,
    pub timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/run/chainsync.lock"),
            xtables_path: PathBuf::from("/run/xtables.lock"),
            timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    pub command_timeout: Duration,
    pub lock: LockOptions,
    pub tables: Vec<TableSpec>,
    /// Options shared by every table, `table`, `ip_version` and `backend` are set per table.
    pub defaults: TableOptions,
    pub ruleset: Ruleset,
}

impl Config {
    pub fn table_options(&self, spec: &TableSpec, backend: BackendMode) -> TableOptions {
        TableOptions {
            table: spec.name.clone(),
            ip_version: spec.ip_version,
            backend,
            ..self.defaults.clone()
        }
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<v1::Config>(content)?;
            let wrong_keys = v1::wrong_keys(&table);
            for key in wrong_keys.iter() {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            res.try_into()
        }
        _ => Err(Error::VersionMismatch(version)),
    }
}
