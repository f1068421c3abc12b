use serde::Deserialize;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, Backend, LockOptions, TableSpec};
use crate::naming::NamingOptions;
use crate::reconcile::InsertMode;
use crate::ruleset::{ChainSpec, HookSpec, Ruleset};
use crate::table::{RecheckOptions, TableOptions};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Config {
    pub version: u8,
    pub(super) engine: Option<Engine>,
    pub(super) naming: Option<Naming>,
    pub(super) lock: Option<Lock>,
    pub(super) recheck: Option<Recheck>,
    pub(super) retry: Option<Retry>,
    pub(super) tables: Option<Vec<Table>>,
    pub(super) chains: Option<Vec<ChainSpec>>,
    pub(super) inserts: Option<Vec<HookSpec>>,
    pub(super) appends: Option<Vec<HookSpec>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct Engine {
    backend: Option<String>,
    insert_mode: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    command_timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct Naming {
    chain_prefix: Option<String>,
    historic_prefixes: Option<Vec<String>>,
    hash_prefix: Option<String>,
    extra_cleanup_pattern: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct Lock {
    path: Option<PathBuf>,
    xtables_path: Option<PathBuf>,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    probe_interval: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct Recheck {
    #[serde(default, with = "humantime_serde::option")]
    refresh_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    initial_post_write_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    post_write_cutoff: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct Retry {
    save_retries: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    initial_save_backoff: Option<Duration>,
    restore_retries: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    initial_restore_backoff: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    max_backoff: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    restore_wait: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct Table {
    name: String,
    ip_version: Option<u8>,
}

const TABLE_KEYS: [&str; 2] = ["name", "ip_version"];
const CHAIN_KEYS: [&str; 4] = ["name", "table", "ip_version", "rules"];
const HOOK_KEYS: [&str; 4] = ["chain", "table", "ip_version", "rules"];
const RULE_KEYS: [&str; 3] = ["action", "match", "comment"];
const MATCH_KEYS: [&str; 10] = [
    "protocol",
    "source",
    "destination",
    "in_interface",
    "out_interface",
    "source_ports",
    "dest_ports",
    "mark",
    "conntrack_state",
    "raw",
];

fn section_keys(wrong_keys: &mut Vec<String>, prefix: &str, value: &toml::Value, known: &[&str]) {
    if let Some(section) = value.as_table() {
        for (k, _v) in section.iter() {
            if known.contains(&k.as_str()) {
                continue;
            }
            wrong_keys.push(format!("{prefix}.{k}"));
        }
    }
}

fn rule_keys(wrong_keys: &mut Vec<String>, prefix: &str, entry: &toml::Value) {
    let Some(rules) = entry.get("rules").and_then(|r| r.as_array()) else {
        return;
    };
    for (i, rule) in rules.iter().enumerate() {
        let rule_prefix = format!("{prefix}.rules[{i}]");
        section_keys(wrong_keys, &rule_prefix, rule, &RULE_KEYS);
        if let Some(m) = rule.get("match") {
            section_keys(wrong_keys, &format!("{rule_prefix}.match"), m, &MATCH_KEYS);
        }
    }
}

fn array_keys(wrong_keys: &mut Vec<String>, key: &str, value: &toml::Value, known: &[&str]) {
    if let Some(entries) = value.as_array() {
        for (i, entry) in entries.iter().enumerate() {
            let prefix = format!("{key}[{i}]");
            section_keys(wrong_keys, &prefix, entry, known);
            rule_keys(wrong_keys, &prefix, entry);
        }
    }
}

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let mut wrong_keys = Vec::new();
    for (key, value) in table.iter() {
        match key.as_str() {
            "version" => {}
            "engine" => section_keys(&mut wrong_keys, key, value, &["backend", "insert_mode", "command_timeout"]),
            "naming" => section_keys(
                &mut wrong_keys,
                key,
                value,
                &["chain_prefix", "historic_prefixes", "hash_prefix", "extra_cleanup_pattern"],
            ),
            "lock" => section_keys(
                &mut wrong_keys,
                key,
                value,
                &["path", "xtables_path", "timeout", "probe_interval"],
            ),
            "recheck" => section_keys(
                &mut wrong_keys,
                key,
                value,
                &["refresh_interval", "initial_post_write_interval", "post_write_cutoff"],
            ),
            "retry" => section_keys(
                &mut wrong_keys,
                key,
                value,
                &[
                    "save_retries",
                    "initial_save_backoff",
                    "restore_retries",
                    "initial_restore_backoff",
                    "max_backoff",
                    "restore_wait",
                ],
            ),
            "tables" => {
                if let Some(entries) = value.as_array() {
                    for (i, entry) in entries.iter().enumerate() {
                        section_keys(&mut wrong_keys, &format!("tables[{i}]"), entry, &TABLE_KEYS);
                    }
                }
            }
            "chains" => array_keys(&mut wrong_keys, key, value, &CHAIN_KEYS),
            "inserts" | "appends" => array_keys(&mut wrong_keys, key, value, &HOOK_KEYS),
            _ => wrong_keys.push(key.clone()),
        }
    }
    wrong_keys
}

impl TryFrom<Config> for config::Config {
    type Error = config::Error;

    fn try_from(value: Config) -> Result<Self, Self::Error> {
        let engine = value.engine.as_ref();
        let backend: Backend = match engine.and_then(|e| e.backend.as_deref()) {
            Some(b) => b.parse()?,
            None => Backend::default(),
        };
        let insert_mode: InsertMode = match engine.and_then(|e| e.insert_mode.as_deref()) {
            Some(m) => m.parse()?,
            None => InsertMode::default(),
        };
        let command_timeout = engine
            .and_then(|e| e.command_timeout)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let default_naming = NamingOptions::default();
        let naming = match value.naming {
            Some(n) => NamingOptions {
                chain_prefix: n.chain_prefix.unwrap_or(default_naming.chain_prefix),
                historic_prefixes: n.historic_prefixes.unwrap_or(default_naming.historic_prefixes),
                hash_prefix: n.hash_prefix.unwrap_or(default_naming.hash_prefix),
                extra_cleanup_pattern: n.extra_cleanup_pattern.or(default_naming.extra_cleanup_pattern),
            },
            None => default_naming,
        };

        let default_lock = LockOptions::default();
        let lock = match value.lock {
            Some(l) => LockOptions {
                path: l.path.unwrap_or(default_lock.path),
                xtables_path: l.xtables_path.unwrap_or(default_lock.xtables_path),
                timeout: l.timeout.unwrap_or(default_lock.timeout),
                probe_interval: l.probe_interval.unwrap_or(default_lock.probe_interval),
            },
            None => default_lock,
        };

        let default_recheck = RecheckOptions::default();
        let recheck = match value.recheck {
            Some(r) => RecheckOptions {
                refresh_interval: r.refresh_interval.unwrap_or(default_recheck.refresh_interval),
                initial_post_write_interval: r
                    .initial_post_write_interval
                    .unwrap_or(default_recheck.initial_post_write_interval),
                post_write_cutoff: r.post_write_cutoff.unwrap_or(default_recheck.post_write_cutoff),
            },
            None => default_recheck,
        };

        let base = TableOptions::default();
        let retry = value.retry;
        let defaults = TableOptions {
            naming,
            insert_mode,
            recheck,
            save_retries: retry.as_ref().and_then(|r| r.save_retries).unwrap_or(base.save_retries),
            initial_save_backoff: retry
                .as_ref()
                .and_then(|r| r.initial_save_backoff)
                .unwrap_or(base.initial_save_backoff),
            restore_retries: retry
                .as_ref()
                .and_then(|r| r.restore_retries)
                .unwrap_or(base.restore_retries),
            initial_restore_backoff: retry
                .as_ref()
                .and_then(|r| r.initial_restore_backoff)
                .unwrap_or(base.initial_restore_backoff),
            max_backoff: retry.as_ref().and_then(|r| r.max_backoff).unwrap_or(base.max_backoff),
            restore_wait: retry
                .as_ref()
                .and_then(|r| r.restore_wait)
                .unwrap_or(base.restore_wait),
            ..base.clone()
        };

        let tables = match value.tables {
            Some(tables) => tables
                .into_iter()
                .map(|t| {
                    let ip_version = t.ip_version.unwrap_or(4);
                    if ip_version != 4 && ip_version != 6 {
                        return Err(config::Error::IpVersion(ip_version, t.name));
                    }
                    Ok(TableSpec {
                        name: t.name,
                        ip_version,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![TableSpec {
                name: base.table.clone(),
                ip_version: base.ip_version,
            }],
        };
        if tables.is_empty() {
            return Err(config::Error::NoTables);
        }

        Ok(config::Config {
            backend,
            command_timeout,
            lock,
            tables,
            defaults,
            ruleset: Ruleset {
                chains: value.chains.unwrap_or_default(),
                inserts: value.inserts.unwrap_or_default(),
                appends: value.appends.unwrap_or_default(),
            },
        })
    }
}
