use thiserror::Error;

use std::collections::{BTreeMap, BTreeSet};

use crate::naming::Ownership;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Table is incompatible with the selected backend: {0}")]
    IncompatibleTable(String),
    #[error("Rule for undeclared chain {chain}: {line}")]
    UndeclaredChain { chain: String, line: String },
}

/// One rule as found in the dataplane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleLine {
    /// Our commitment hash, when the rule carries one.
    pub hash: Option<String>,
    /// Rule text without the leading `-A <chain>`.
    pub text: String,
}

impl RuleLine {
    pub fn new(ownership: &Ownership, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            hash: ownership.extract_hash(&text),
            text,
        }
    }
}

/// Cached view of one table of the dataplane.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub chains: BTreeMap<String, Vec<RuleLine>>,
}

impl Snapshot {
    /// Parses `iptables-save` output, keeping only the section for `table`.
    pub fn parse(output: &str, table: &str, ownership: &Ownership) -> Result<Self, Error> {
        let mut chains: BTreeMap<String, Vec<RuleLine>> = BTreeMap::new();
        let header = format!("*{table}");
        let mut in_table = false;

        for raw in output.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                if line.contains("is incompatible, use 'nft' tool") {
                    return Err(Error::IncompatibleTable(line.to_string()));
                }
                continue;
            }
            if line.starts_with('*') {
                in_table = line == header;
                continue;
            }
            if !in_table {
                continue;
            }
            if line == "COMMIT" {
                in_table = false;
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                if let Some(name) = decl.split_whitespace().next() {
                    chains.entry(name.to_string()).or_default();
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("-A ") {
                let (chain, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let Some(rules) = chains.get_mut(chain) else {
                    return Err(Error::UndeclaredChain {
                        chain: chain.to_string(),
                        line: line.to_string(),
                    });
                };
                rules.push(RuleLine::new(ownership, text.trim()));
                continue;
            }
            tracing::debug!(%line, "ignoring unrecognized save line");
        }

        Ok(Self { chains })
    }

    pub fn contains(&self, chain: &str) -> bool {
        self.chains.contains_key(chain)
    }

    pub fn rules(&self, chain: &str) -> &[RuleLine] {
        self.chains.get(chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chains referenced by any rule of `chain`.
    pub fn references(&self, chain: &str, ownership: &Ownership) -> BTreeSet<String> {
        self.rules(chain)
            .iter()
            .filter_map(|r| ownership.reference(&r.text))
            .collect()
    }
}
