//! Desired ruleset as written in the configuration file.
//!
//! Entries are scoped to a table name and optionally to one address family. [`Ruleset::desired`]
//! narrows the file down to what a single [`Table`] should hold, and [`DesiredTable::sync_into`]
//! pushes the difference to a previous ruleset into that table.

use serde::Deserialize;
use thiserror::Error;

use std::collections::BTreeMap;

use crate::clock::Clock;
use crate::cmd::CommandRunner;
use crate::lock::DataplaneLock;
use crate::rule::{Action, Chain, MatchCriteria, Rule};
use crate::table::Table;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Chain {name} is defined more than once for table {table}")]
    DuplicateChain { table: String, name: String },
    #[error("Unsupported IP version {0}, expected 4 or 6")]
    IpVersion(u8),
}

fn default_table() -> String {
    "filter".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MarkSpec {
    pub mark: u32,
    pub mask: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MatchSpec {
    pub protocol: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    #[serde(default)]
    pub source_ports: Vec<u16>,
    #[serde(default)]
    pub dest_ports: Vec<u16>,
    pub mark: Option<MarkSpec>,
    pub conntrack_state: Option<String>,
    #[serde(default)]
    pub raw: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RuleSpec {
    pub action: Action,
    #[serde(rename = "match")]
    pub match_spec: Option<MatchSpec>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    #[serde(default = "default_table")]
    pub table: String,
    pub ip_version: Option<u8>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct HookSpec {
    pub chain: String,
    #[serde(default = "default_table")]
    pub table: String,
    pub ip_version: Option<u8>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub chains: Vec<ChainSpec>,
    #[serde(default)]
    pub inserts: Vec<HookSpec>,
    #[serde(default)]
    pub appends: Vec<HookSpec>,
}

/// The part of a ruleset one table is responsible for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredTable {
    pub chains: BTreeMap<String, Chain>,
    pub inserts: BTreeMap<String, Vec<Rule>>,
    pub appends: BTreeMap<String, Vec<Rule>>,
}

impl From<&MatchSpec> for MatchCriteria {
    fn from(spec: &MatchSpec) -> Self {
        let mut m = MatchCriteria::new();
        if let Some(protocol) = &spec.protocol {
            m = m.protocol(protocol);
        }
        if let Some(source) = &spec.source {
            m = m.source_net(source);
        }
        if let Some(destination) = &spec.destination {
            m = m.dest_net(destination);
        }
        if let Some(iface) = &spec.in_interface {
            m = m.in_interface(iface);
        }
        if let Some(iface) = &spec.out_interface {
            m = m.out_interface(iface);
        }
        if !spec.source_ports.is_empty() {
            m = m.source_ports(&spec.source_ports);
        }
        if !spec.dest_ports.is_empty() {
            m = m.dest_ports(&spec.dest_ports);
        }
        if let Some(mark) = &spec.mark {
            m = m.mark_matches(mark.mark, mark.mask);
        }
        if let Some(states) = &spec.conntrack_state {
            m = m.conntrack_state(states);
        }
        for fragment in &spec.raw {
            m = m.raw(fragment.as_str());
        }
        m
    }
}

impl From<&RuleSpec> for Rule {
    fn from(spec: &RuleSpec) -> Self {
        let mut rule = Rule::new(spec.action.clone());
        if let Some(m) = &spec.match_spec {
            rule = rule.with_match(m.into());
        }
        if let Some(comment) = &spec.comment {
            rule = rule.with_comment(comment.as_str());
        }
        rule
    }
}

fn in_scope(table: &str, ip_version: Option<u8>, want_table: &str, want_ip: u8) -> Result<bool, Error> {
    match ip_version {
        Some(v) if v != 4 && v != 6 => Err(Error::IpVersion(v)),
        Some(v) => Ok(table == want_table && v == want_ip),
        None => Ok(table == want_table),
    }
}

fn rules(specs: &[RuleSpec]) -> Vec<Rule> {
    specs.iter().map(Rule::from).collect()
}

impl Ruleset {
    pub fn desired(&self, table: &str, ip_version: u8) -> Result<DesiredTable, Error> {
        let mut desired = DesiredTable::default();
        for spec in &self.chains {
            if !in_scope(&spec.table, spec.ip_version, table, ip_version)? {
                continue;
            }
            if desired.chains.contains_key(&spec.name) {
                return Err(Error::DuplicateChain {
                    table: table.to_string(),
                    name: spec.name.clone(),
                });
            }
            desired
                .chains
                .insert(spec.name.clone(), Chain::new(spec.name.as_str(), rules(&spec.rules)));
        }
        // several entries for one hook chain are concatenated in file order
        for spec in &self.inserts {
            if in_scope(&spec.table, spec.ip_version, table, ip_version)? {
                desired
                    .inserts
                    .entry(spec.chain.clone())
                    .or_default()
                    .extend(rules(&spec.rules));
            }
        }
        for spec in &self.appends {
            if in_scope(&spec.table, spec.ip_version, table, ip_version)? {
                desired
                    .appends
                    .entry(spec.chain.clone())
                    .or_default()
                    .extend(rules(&spec.rules));
            }
        }
        Ok(desired)
    }
}

impl DesiredTable {
    /// Updates `table` so its model matches `self`, given that it currently holds `previous`.
    pub fn sync_into<R, C, L>(&self, previous: &DesiredTable, table: &mut Table<R, C, L>)
    where
        R: CommandRunner,
        C: Clock,
        L: DataplaneLock + ?Sized,
    {
        for name in previous.chains.keys().filter(|n| !self.chains.contains_key(*n)) {
            table.remove_chain_by_name(name);
        }
        table.update_chains(self.chains.values().cloned().collect());

        for hook in previous.inserts.keys().filter(|h| !self.inserts.contains_key(*h)) {
            table.insert_or_append_rules(hook, Vec::new());
        }
        for (hook, rules) in &self.inserts {
            table.insert_or_append_rules(hook, rules.clone());
        }

        for hook in previous.appends.keys().filter(|h| !self.appends.contains_key(*h)) {
            table.append_rules(hook, Vec::new());
        }
        for (hook, rules) in &self.appends {
            table.append_rules(hook, rules.clone());
        }
    }
}
