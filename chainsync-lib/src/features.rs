use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use crate::cmd::{self, CommandRunner, Invocation};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unrecognized version output: {0}")]
    UnrecognizedVersion(String),
    #[error("Unknown backend mode: {0}")]
    UnknownMode(String),
    #[error(transparent)]
    Command(#[from] cmd::Error),
}

/// Which packet-filter backend the save/restore binaries talk to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    #[default]
    Legacy,
    Nft,
}

impl BackendMode {
    fn binary_suffix(self) -> &'static str {
        match self {
            BackendMode::Legacy => "legacy",
            BackendMode::Nft => "nft",
        }
    }
}

impl Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary_suffix())
    }
}

impl FromStr for BackendMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(BackendMode::Legacy),
            "nft" | "nf_tables" => Ok(BackendMode::Nft),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

const LOCK_SUPPORT_SINCE: Version = Version::new(1, 6, 2);
const FULLY_RANDOM_SINCE: Version = Version::new(1, 6, 2);

/// Capabilities of the installed engine that change what gets rendered or how restore is invoked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// `iptables-restore` understands `--wait`.
    pub restore_supports_lock: bool,
    /// `--random-fully` is accepted on SNAT and MASQUERADE.
    pub fully_random: bool,
}

/// Result of parsing `iptables --version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineInfo {
    pub version: Version,
    pub mode: Option<BackendMode>,
}

impl EngineInfo {
    pub fn parse(output: &str) -> Result<Self, Error> {
        let re = Regex::new(r"v(\d+)\.(\d+)\.(\d+)(?:\s+\((legacy|nf_tables)\))?")
            .map_err(|_| Error::UnrecognizedVersion(output.to_string()))?;
        let caps = re
            .captures(output)
            .ok_or_else(|| Error::UnrecognizedVersion(output.to_string()))?;
        let num = |i: usize| -> Result<u32, Error> {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(|| Error::UnrecognizedVersion(output.to_string()))
        };
        let version = Version::new(num(1)?, num(2)?, num(3)?);
        let mode = caps.get(4).and_then(|m| m.as_str().parse().ok());
        Ok(Self { version, mode })
    }

    pub fn features(&self) -> Features {
        Features {
            restore_supports_lock: self.mode == Some(BackendMode::Nft) || self.version >= LOCK_SUPPORT_SINCE,
            fully_random: self.version >= FULLY_RANDOM_SINCE,
        }
    }
}

pub fn base_binary(ip_version: u8) -> &'static str {
    if ip_version == 6 { "ip6tables" } else { "iptables" }
}

/// Runs the engine's version command and parses the reply.
pub async fn detect<R: CommandRunner + ?Sized>(runner: &R, ip_version: u8) -> Result<EngineInfo, Error> {
    let invocation = Invocation::new(base_binary(ip_version)).arg("--version");
    let output = runner.run(invocation).await?;
    let stdout = output.success_stdout(base_binary(ip_version))?;
    EngineInfo::parse(&stdout)
}

/// Looks up executables on the search path.
pub trait BinaryLocator: Send + Sync {
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

pub struct PathLocator;

impl BinaryLocator for PathLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Save and restore commands for one address family and backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binaries {
    pub version: String,
    pub save: String,
    pub restore: String,
}

impl Binaries {
    /// Prefers the mode-suffixed names. In legacy mode the unsuffixed names are used when the
    /// suffixed variants are not installed.
    pub fn select<B: BinaryLocator + ?Sized>(locator: &B, ip_version: u8, mode: BackendMode) -> Self {
        let base = base_binary(ip_version);
        let pick = |op: &str| -> String {
            let suffixed = format!("{base}-{}-{op}", mode.binary_suffix());
            match mode {
                BackendMode::Nft => suffixed,
                BackendMode::Legacy => {
                    if locator.locate(&suffixed).is_some() {
                        suffixed
                    } else {
                        format!("{base}-{op}")
                    }
                }
            }
        };
        Self {
            version: base.to_string(),
            save: pick("save"),
            restore: pick("restore"),
        }
    }
}
