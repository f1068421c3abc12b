use serde::Deserialize;

use std::fmt::{self, Display};

/// Ordered list of rendered match fragments.
///
/// The synchronizer does not interpret matches, it only needs a stable textual form to render
/// and hash. Builders append fragments in call order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MatchCriteria {
    fragments: Vec<String>,
}

impl MatchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(self, protocol: &str) -> Self {
        self.raw(format!("-p {protocol}"))
    }

    pub fn source_net(self, cidr: &str) -> Self {
        self.raw(format!("--source {cidr}"))
    }

    pub fn dest_net(self, cidr: &str) -> Self {
        self.raw(format!("--destination {cidr}"))
    }

    pub fn in_interface(self, iface: &str) -> Self {
        self.raw(format!("--in-interface {iface}"))
    }

    pub fn out_interface(self, iface: &str) -> Self {
        self.raw(format!("--out-interface {iface}"))
    }

    pub fn source_ports(self, ports: &[u16]) -> Self {
        self.raw(format!("-m multiport --source-ports {}", join_ports(ports)))
    }

    pub fn dest_ports(self, ports: &[u16]) -> Self {
        self.raw(format!("-m multiport --destination-ports {}", join_ports(ports)))
    }

    pub fn mark_matches(self, mark: u32, mask: u32) -> Self {
        self.raw(format!("-m mark --mark {mark:#x}/{mask:#x}"))
    }

    pub fn conntrack_state(self, states: &str) -> Self {
        self.raw(format!("-m conntrack --ctstate {states}"))
    }

    pub fn raw(mut self, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        let trimmed = fragment.trim();
        if !trimmed.is_empty() {
            self.fragments.push(trimmed.to_string());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn render(&self) -> String {
        self.fragments.join(" ")
    }
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

/// What happens to a packet once a rule matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Return,
    Jump(String),
    Goto(String),
    Log { prefix: String },
    SetMark { mark: u32, mask: u32 },
    ClearMark { mask: u32 },
    Masquerade,
    Snat { to: String },
    NoTrack,
}

impl Action {
    /// Chain referenced by this action, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::Jump(target) | Action::Goto(target) => Some(target),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rule {
    pub match_criteria: MatchCriteria,
    pub action: Action,
    pub comments: Vec<String>,
}

impl Rule {
    pub fn new(action: Action) -> Self {
        Self {
            match_criteria: MatchCriteria::default(),
            action,
            comments: Vec::new(),
        }
    }

    pub fn with_match(mut self, match_criteria: MatchCriteria) -> Self {
        self.match_criteria = match_criteria;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments.push(comment.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Chains referenced by jump or goto actions, in rule order.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().filter_map(|r| r.action.target())
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} rules)", self.name, self.rules.len())
    }
}
