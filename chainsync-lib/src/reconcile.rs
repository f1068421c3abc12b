use thiserror::Error;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::features::{BackendMode, Features};
use crate::hash;
use crate::naming::Ownership;
use crate::render;
use crate::rule::{Chain, Rule};
use crate::snapshot::{RuleLine, Snapshot};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown insert mode: {0}")]
    UnknownInsertMode(String),
}

/// Where inserted hook rules go relative to foreign rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InsertMode {
    #[default]
    Insert,
    Append,
}

impl FromStr for InsertMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "insert" => Ok(InsertMode::Insert),
            "append" => Ok(InsertMode::Append),
            other => Err(Error::UnknownInsertMode(other.to_string())),
        }
    }
}

impl Display for InsertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertMode::Insert => write!(f, "insert"),
            InsertMode::Append => write!(f, "append"),
        }
    }
}

/// Desired model, borrowed from the table for the duration of one planning run.
pub struct Desired<'a> {
    pub chains: &'a HashMap<String, Chain>,
    pub inserts: &'a HashMap<String, Vec<Rule>>,
    pub appends: &'a HashMap<String, Vec<Rule>>,
}

pub struct Context<'a> {
    pub ownership: &'a Ownership,
    pub features: &'a Features,
    pub backend: BackendMode,
    pub insert_mode: InsertMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope<'a> {
    Everything,
    /// Only the insert/append rules of one hook chain, nothing is created or deleted.
    HookChain(&'a str),
}

/// Restore commands for one chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainUpdate {
    pub chain: String,
    pub commands: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub new_chains: Vec<String>,
    pub owned_updates: Vec<ChainUpdate>,
    pub hook_updates: Vec<ChainUpdate>,
    pub deletions: Vec<String>,
    /// Chains that should go but are still referenced from outside.
    pub deferred: Vec<String>,
    /// Dataplane contents once the plan is written.
    pub expected: Snapshot,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.new_chains.is_empty()
            && self.owned_updates.is_empty()
            && self.hook_updates.is_empty()
            && self.deletions.is_empty()
    }

    /// Input for `iptables-restore --noflush`.
    pub fn render_restore(&self, table: &str) -> String {
        let mut out = format!("*{table}\n");
        for chain in &self.new_chains {
            out.push_str(&format!(":{chain} - -\n"));
        }
        for update in self.owned_updates.iter().chain(self.hook_updates.iter()) {
            for cmd in &update.commands {
                out.push_str(cmd);
                out.push('\n');
            }
        }
        for chain in &self.deletions {
            out.push_str(&format!("--flush {chain}\n"));
        }
        for chain in &self.deletions {
            out.push_str(&format!("--delete-chain {chain}\n"));
        }
        out.push_str("COMMIT\n");
        out
    }
}

/// Owned chains reachable from the hook rules, following jumps through desired chains.
pub fn reachable_chains(desired: &Desired<'_>, ownership: &Ownership) -> BTreeSet<String> {
    let mut reached = BTreeSet::new();
    let mut queue: VecDeque<&str> = desired
        .inserts
        .iter()
        .chain(desired.appends.iter())
        .filter(|(hook, _)| !ownership.is_owned(hook))
        .flat_map(|(_, rules)| rules.iter().filter_map(|r| r.action.target()))
        .collect();

    while let Some(name) = queue.pop_front() {
        if !ownership.is_owned(name) || reached.contains(name) {
            continue;
        }
        let Some(chain) = desired.chains.get(name) else {
            tracing::warn!(chain = %name, "referenced chain is not defined, not programming it");
            continue;
        };
        reached.insert(name.to_string());
        queue.extend(chain.references());
    }
    reached
}

pub fn plan(desired: &Desired<'_>, current: &Snapshot, ctx: &Context<'_>, scope: Scope<'_>) -> Plan {
    let mut plan = Plan::default();
    let mut expected: BTreeMap<String, Vec<RuleLine>> = BTreeMap::new();

    let hook_chains: BTreeSet<String> = match scope {
        Scope::Everything => hook_chains(desired, current, ctx.ownership),
        Scope::HookChain(chain) => BTreeSet::from([chain.to_string()]),
    };

    let reachable = match scope {
        Scope::Everything => reachable_chains(desired, ctx.ownership),
        Scope::HookChain(_) => BTreeSet::new(),
    };

    for name in &reachable {
        let Some(chain) = desired.chains.get(name) else {
            continue;
        };
        let (update, lines) = plan_owned_chain(chain, current, ctx);
        if !current.contains(name) {
            plan.new_chains.push(name.clone());
        }
        if let Some(update) = update {
            plan.owned_updates.push(update);
        }
        expected.insert(name.clone(), lines);
    }

    for name in &hook_chains {
        if !current.contains(name) {
            let wanted = desired.inserts.get(name).is_some_and(|r| !r.is_empty())
                || desired.appends.get(name).is_some_and(|r| !r.is_empty());
            if wanted {
                tracing::warn!(chain = %name, "hook chain missing from dataplane, skipping its rules");
            }
            continue;
        }
        let (update, lines) = plan_hook_chain(name, desired, current, ctx);
        if let Some(update) = update {
            plan.hook_updates.push(update);
        }
        expected.insert(name.clone(), lines);
    }

    let candidates: BTreeSet<String> = match scope {
        Scope::Everything => current
            .chains
            .keys()
            .filter(|name| ctx.ownership.is_ours_or_historic(name) && !reachable.contains(*name))
            .cloned()
            .collect(),
        Scope::HookChain(_) => BTreeSet::new(),
    };

    for (name, lines) in &current.chains {
        if !expected.contains_key(name) && !candidates.contains(name) {
            expected.insert(name.clone(), lines.clone());
        }
    }

    let kept = still_referenced(&candidates, &expected, current, ctx.ownership);
    for name in &candidates {
        if kept.contains(name) {
            tracing::warn!(chain = %name, "chain is still referenced from outside, deferring its deletion");
            plan.deferred.push(name.clone());
            expected.insert(name.clone(), current.rules(name).to_vec());
        } else {
            plan.deletions.push(name.clone());
        }
    }

    plan.expected = Snapshot { chains: expected };
    plan
}

/// Non-owned chains with desired rules or with our rules left in them.
fn hook_chains(desired: &Desired<'_>, current: &Snapshot, ownership: &Ownership) -> BTreeSet<String> {
    let mut hooks: BTreeSet<String> = BTreeSet::new();
    for (name, rules) in desired.inserts.iter().chain(desired.appends.iter()) {
        if !rules.is_empty() && !ownership.is_ours_or_historic(name) {
            hooks.insert(name.clone());
        }
    }
    for (name, lines) in &current.chains {
        if ownership.is_ours_or_historic(name) {
            continue;
        }
        if lines.iter().any(|l| is_ours(l, ownership)) {
            hooks.insert(name.clone());
        }
    }
    hooks
}

/// Same tag and same rule text. A rule edited in place keeps its tag, so both must match.
fn is_programmed(have: &RuleLine, want: &RuleLine) -> bool {
    have.hash.is_some() && have.hash == want.hash && render::same_rule(&have.text, &want.text)
}

fn is_ours(line: &RuleLine, ownership: &Ownership) -> bool {
    line.hash.is_some() || ownership.is_legacy_insert(&line.text)
}

fn tagged_lines(seed: &str, rules: &[Rule], ctx: &Context<'_>) -> Vec<RuleLine> {
    let prefix = ctx.ownership.hash_prefix();
    hash::rule_hashes(seed, rules, ctx.features)
        .into_iter()
        .zip(rules)
        .map(|(h, rule)| RuleLine {
            text: render::render_tagged(rule, prefix, &h, ctx.features),
            hash: Some(h),
        })
        .collect()
}

fn plan_owned_chain(chain: &Chain, current: &Snapshot, ctx: &Context<'_>) -> (Option<ChainUpdate>, Vec<RuleLine>) {
    let name = &chain.name;
    let desired = tagged_lines(name, &chain.rules, ctx);

    if !current.contains(name) {
        let commands = desired.iter().map(|l| format!("-A {name} {}", l.text)).collect();
        return (
            Some(ChainUpdate {
                chain: name.clone(),
                commands,
            }),
            desired,
        );
    }

    let existing = current.rules(name);
    let in_sync = existing.len() == desired.len()
        && existing
            .iter()
            .zip(&desired)
            .all(|(have, want)| is_programmed(have, want));
    if in_sync {
        return (None, existing.to_vec());
    }

    let mut commands = Vec::new();
    match ctx.backend {
        BackendMode::Nft => {
            // nft cannot replace by index reliably, rewrite the chain
            commands.push(format!("--flush {name}"));
            commands.extend(desired.iter().map(|l| format!("-A {name} {}", l.text)));
        }
        BackendMode::Legacy => {
            for (i, want) in desired.iter().enumerate() {
                match existing.get(i) {
                    Some(have) if is_programmed(have, want) => {}
                    Some(_) => commands.push(format!("-R {name} {} {}", i + 1, want.text)),
                    None => commands.push(format!("-A {name} {}", want.text)),
                }
            }
            for i in (desired.len()..existing.len()).rev() {
                commands.push(format!("-D {name} {}", i + 1));
            }
        }
    }
    (
        Some(ChainUpdate {
            chain: name.clone(),
            commands,
        }),
        desired,
    )
}

fn plan_hook_chain(
    name: &str,
    desired: &Desired<'_>,
    current: &Snapshot,
    ctx: &Context<'_>,
) -> (Option<ChainUpdate>, Vec<RuleLine>) {
    let no_rules: Vec<Rule> = Vec::new();
    let inserts = tagged_lines(name, desired.inserts.get(name).unwrap_or(&no_rules), ctx);
    let appends = tagged_lines(
        &hash::append_seed(name),
        desired.appends.get(name).unwrap_or(&no_rules),
        ctx,
    );

    let existing = current.rules(name);
    if hook_layout_matches(existing, &inserts, &appends, ctx) {
        return (None, existing.to_vec());
    }

    let mut commands = Vec::new();
    let mut foreign = Vec::new();
    for line in existing {
        if is_ours(line, ctx.ownership) {
            // deleting by text survives concurrent inserts that shift indices
            commands.push(format!("-D {name} {}", line.text));
        } else {
            foreign.push(line.clone());
        }
    }

    let mut lines = Vec::with_capacity(foreign.len() + inserts.len() + appends.len());
    match ctx.insert_mode {
        InsertMode::Insert => {
            for (i, l) in inserts.iter().enumerate() {
                commands.push(format!("-I {name} {} {}", i + 1, l.text));
            }
            lines.extend(inserts.iter().cloned());
            lines.extend(foreign);
        }
        InsertMode::Append => {
            for l in &inserts {
                commands.push(format!("-A {name} {}", l.text));
            }
            lines.extend(foreign);
            lines.extend(inserts.iter().cloned());
        }
    }
    for l in &appends {
        commands.push(format!("-A {name} {}", l.text));
    }
    lines.extend(appends);

    (
        Some(ChainUpdate {
            chain: name.to_string(),
            commands,
        }),
        lines,
    )
}

/// Our rules must sit exactly where the insert mode puts them, with nothing of ours elsewhere.
fn hook_layout_matches(existing: &[RuleLine], inserts: &[RuleLine], appends: &[RuleLine], ctx: &Context<'_>) -> bool {
    let ours = existing.iter().filter(|l| is_ours(l, ctx.ownership)).count();
    if ours != inserts.len() + appends.len() {
        return false;
    }
    let same = |have: &[RuleLine], want: &[RuleLine]| {
        have.len() == want.len() && have.iter().zip(want).all(|(h, w)| is_programmed(h, w))
    };
    let tail_start = existing.len() - appends.len();
    match ctx.insert_mode {
        InsertMode::Insert => same(&existing[..inserts.len()], inserts) && same(&existing[tail_start..], appends),
        InsertMode::Append => {
            let start = existing.len() - inserts.len() - appends.len();
            same(&existing[start..tail_start], inserts) && same(&existing[tail_start..], appends)
        }
    }
}

/// Deletion candidates that a surviving rule still jumps to, followed transitively.
fn still_referenced(
    candidates: &BTreeSet<String>,
    survivors: &BTreeMap<String, Vec<RuleLine>>,
    current: &Snapshot,
    ownership: &Ownership,
) -> BTreeSet<String> {
    let mut kept = BTreeSet::new();
    let mut queue: VecDeque<String> = survivors
        .values()
        .flatten()
        .filter_map(|l| ownership.reference(&l.text))
        .filter(|target| candidates.contains(target))
        .collect();
    while let Some(name) = queue.pop_front() {
        if !kept.insert(name.clone()) {
            continue;
        }
        queue.extend(
            current
                .references(&name, ownership)
                .into_iter()
                .filter(|target| candidates.contains(target) && !kept.contains(target)),
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NamingOptions;
    use crate::rule::Action;

    struct Fixture {
        chains: HashMap<String, Chain>,
        inserts: HashMap<String, Vec<Rule>>,
        appends: HashMap<String, Vec<Rule>>,
        ownership: Ownership,
        features: Features,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                chains: HashMap::new(),
                inserts: HashMap::new(),
                appends: HashMap::new(),
                ownership: Ownership::new(&NamingOptions {
                    extra_cleanup_pattern: Some("sneaky-rule".into()),
                    ..Default::default()
                })
                .expect("valid naming options"),
                features: Features::default(),
            }
        }

        fn chain(mut self, name: &str, rules: Vec<Rule>) -> Self {
            self.chains.insert(name.into(), Chain::new(name, rules));
            self
        }

        fn insert(mut self, hook: &str, rules: Vec<Rule>) -> Self {
            self.inserts.insert(hook.into(), rules);
            self
        }

        fn append(mut self, hook: &str, rules: Vec<Rule>) -> Self {
            self.appends.insert(hook.into(), rules);
            self
        }

        fn plan(&self, current: &Snapshot, backend: BackendMode, insert_mode: InsertMode) -> Plan {
            let desired = Desired {
                chains: &self.chains,
                inserts: &self.inserts,
                appends: &self.appends,
            };
            let ctx = Context {
                ownership: &self.ownership,
                features: &self.features,
                backend,
                insert_mode,
            };
            plan(&desired, current, &ctx, Scope::Everything)
        }

        fn snapshot(&self, chains: &[(&str, &[&str])]) -> Snapshot {
            Snapshot {
                chains: chains
                    .iter()
                    .map(|(name, lines)| {
                        (
                            name.to_string(),
                            lines.iter().map(|l| RuleLine::new(&self.ownership, *l)).collect(),
                        )
                    })
                    .collect(),
            }
        }
    }

    fn jump(target: &str) -> Rule {
        Rule::new(Action::Jump(target.into()))
    }

    #[test]
    fn insert_mode_parsing() {
        assert_eq!("".parse::<InsertMode>().ok(), Some(InsertMode::Insert));
        assert_eq!("append".parse::<InsertMode>().ok(), Some(InsertMode::Append));
        assert!("unknown".parse::<InsertMode>().is_err());
    }

    #[test]
    fn unreachable_chains_are_not_programmed() {
        let fx = Fixture::new()
            .chain("cali-foobar", vec![Rule::new(Action::Accept)])
            .chain("cali-FORWARD", vec![jump("cali-foobar")]);
        let current = fx.snapshot(&[("FORWARD", &[])]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        assert!(plan.is_empty());
    }

    #[test]
    fn reachability_follows_jumps_from_hooks() {
        let fx = Fixture::new()
            .chain("cali-foobar", vec![Rule::new(Action::Accept)])
            .chain("cali-FORWARD", vec![jump("cali-foobar")])
            .chain("cali-unused", vec![Rule::new(Action::Drop)])
            .insert("FORWARD", vec![jump("cali-FORWARD")]);
        let desired = Desired {
            chains: &fx.chains,
            inserts: &fx.inserts,
            appends: &fx.appends,
        };
        let reached = reachable_chains(&desired, &fx.ownership);
        assert_eq!(
            reached.into_iter().collect::<Vec<_>>(),
            vec!["cali-FORWARD".to_string(), "cali-foobar".to_string()]
        );
    }

    #[test]
    fn new_chains_are_declared_before_use() {
        let fx = Fixture::new()
            .chain("cali-foobar", vec![Rule::new(Action::Accept)])
            .insert("FORWARD", vec![jump("cali-foobar")]);
        let current = fx.snapshot(&[("FORWARD", &[])]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(plan.new_chains, vec!["cali-foobar"]);
        let restore = plan.render_restore("filter");
        let lines: Vec<&str> = restore.lines().collect();
        assert_eq!(lines[0], "*filter");
        assert_eq!(lines[1], ":cali-foobar - -");
        assert!(lines[2].starts_with("-A cali-foobar -m comment --comment \"cali:"));
        assert!(lines[3].starts_with("-I FORWARD 1 -m comment --comment \"cali:"));
        assert_eq!(lines[4], "COMMIT");
    }

    #[test]
    fn in_sync_dataplane_needs_no_write() {
        let fx = Fixture::new()
            .chain("cali-foobar", vec![Rule::new(Action::Accept)])
            .insert("FORWARD", vec![jump("cali-foobar")]);
        let first = fx.plan(&fx.snapshot(&[("FORWARD", &[])]), BackendMode::Nft, InsertMode::Insert);
        let second = fx.plan(&first.expected, BackendMode::Nft, InsertMode::Insert);
        assert!(second.is_empty());
        assert_eq!(second.expected, first.expected);
    }

    #[test]
    fn legacy_patches_only_differing_rules() {
        let fx = Fixture::new()
            .chain(
                "cali-foobar",
                vec![
                    Rule::new(Action::Accept),
                    Rule::new(Action::Drop),
                    Rule::new(Action::Return),
                ],
            )
            .insert("FORWARD", vec![jump("cali-foobar")]);
        let synced = fx
            .plan(&fx.snapshot(&[("FORWARD", &[])]), BackendMode::Legacy, InsertMode::Insert)
            .expected;
        let mut drifted = synced.clone();
        if let Some(lines) = drifted.chains.get_mut("cali-foobar") {
            lines[2] = RuleLine::new(&fx.ownership, "-m comment --comment \"cali:deadbeef09238384\" --jump RETURN");
            lines.push(RuleLine::new(&fx.ownership, "--jump ACCEPT"));
        }

        let legacy = fx.plan(&drifted, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(legacy.owned_updates.len(), 1);
        let cmds = &legacy.owned_updates[0].commands;
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].starts_with("-R cali-foobar 3 "));
        assert_eq!(cmds[1], "-D cali-foobar 4");

        let nft = fx.plan(&drifted, BackendMode::Nft, InsertMode::Insert);
        let cmds = &nft.owned_updates[0].commands;
        assert_eq!(cmds[0], "--flush cali-foobar");
        assert_eq!(cmds.len(), 4);
    }

    #[test]
    fn hook_rules_are_rewritten_around_foreign_rules() {
        let fx = Fixture::new().insert("FORWARD", vec![Rule::new(Action::Drop)]);
        let current = fx.snapshot(&[(
            "FORWARD",
            &["--jump RETURN", "-j felix-FORWARD", "--jump sneaky-rule", "--jump foo-bar"],
        )]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        let cmds = &plan.hook_updates[0].commands;
        assert_eq!(cmds[0], "-D FORWARD -j felix-FORWARD");
        assert_eq!(cmds[1], "-D FORWARD --jump sneaky-rule");
        assert!(cmds[2].starts_with("-I FORWARD 1 "));
        let texts: Vec<&str> = plan.expected.rules("FORWARD").iter().map(|l| l.text.as_str()).collect();
        assert_eq!(&texts[1..], &["--jump RETURN", "--jump foo-bar"]);
    }

    #[test]
    fn append_mode_places_inserts_after_foreign_rules() {
        let fx = Fixture::new()
            .insert("FORWARD", vec![Rule::new(Action::Drop)])
            .append("FORWARD", vec![Rule::new(Action::Return)]);
        let current = fx.snapshot(&[("FORWARD", &["--jump ACCEPT"])]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Append);
        let expected = plan.expected.rules("FORWARD");
        assert_eq!(expected[0].text, "--jump ACCEPT");
        assert!(expected[1].text.ends_with("--jump DROP"));
        assert!(expected[2].text.ends_with("--jump RETURN"));

        let again = fx.plan(&plan.expected, BackendMode::Legacy, InsertMode::Append);
        assert!(again.is_empty());
    }

    #[test]
    fn stray_tags_in_other_chains_are_removed() {
        let fx = Fixture::new();
        let current = fx.snapshot(&[(
            "unexpected-insert",
            &["--jump ACCEPT", "-m comment --comment \"cali:hecdSCslEjdBPfds\" --jump DROP"],
        )]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(
            plan.hook_updates[0].commands,
            vec!["-D unexpected-insert -m comment --comment \"cali:hecdSCslEjdBPfds\" --jump DROP"]
        );
    }

    #[test]
    fn stale_and_historic_chains_are_deleted() {
        let fx = Fixture::new();
        let current = fx.snapshot(&[
            ("FORWARD", &["-j felix-FORWARD"]),
            ("felix-FORWARD", &["--jump ACCEPT"]),
            ("cali-stale", &["--jump cali-stale2"]),
            ("cali-stale2", &[]),
            ("non-calico", &["--jump ACCEPT"]),
        ]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(plan.deletions, vec!["cali-stale", "cali-stale2", "felix-FORWARD"]);
        let restore = plan.render_restore("filter");
        let flush = restore.find("--flush cali-stale2").expect("flush present");
        let delete = restore.find("--delete-chain cali-stale\n").expect("delete present");
        assert!(flush < delete);
        assert!(plan.expected.contains("non-calico"));
        assert!(!plan.expected.contains("cali-stale"));
    }

    #[test]
    fn deletion_is_deferred_while_foreign_rules_reference_the_chain() {
        let fx = Fixture::new();
        let current = fx.snapshot(&[
            ("other", &["--jump cali-stale"]),
            ("cali-stale", &["--jump cali-leaf"]),
            ("cali-leaf", &[]),
            ("cali-gone", &[]),
        ]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(plan.deferred, vec!["cali-leaf", "cali-stale"]);
        assert_eq!(plan.deletions, vec!["cali-gone"]);
        assert!(plan.expected.contains("cali-stale"));
    }

    #[test]
    fn glue_chain_dropped_when_hook_jumps_directly() {
        let fx = Fixture::new()
            .chain("cali-foobar", vec![Rule::new(Action::Accept)])
            .chain("cali-FORWARD", vec![jump("cali-foobar")])
            .insert("FORWARD", vec![jump("cali-FORWARD")]);
        let synced = fx
            .plan(&fx.snapshot(&[("FORWARD", &[])]), BackendMode::Legacy, InsertMode::Insert)
            .expected;
        assert!(synced.contains("cali-FORWARD"));

        let fx = fx.insert("FORWARD", vec![jump("cali-foobar")]);
        let plan = fx.plan(&synced, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(plan.deletions, vec!["cali-FORWARD"]);
        assert!(plan.owned_updates.is_empty());
    }

    #[test]
    fn scoped_plan_touches_only_that_hook() {
        let fx = Fixture::new()
            .chain("cali-foobar", vec![Rule::new(Action::Accept)])
            .insert("FORWARD", vec![Rule::new(Action::Drop)])
            .insert("INPUT", vec![jump("cali-foobar")]);
        let current = fx.snapshot(&[("FORWARD", &["--jump ACCEPT"]), ("INPUT", &[]), ("cali-old", &[])]);
        let desired = Desired {
            chains: &fx.chains,
            inserts: &fx.inserts,
            appends: &fx.appends,
        };
        let ctx = Context {
            ownership: &fx.ownership,
            features: &fx.features,
            backend: BackendMode::Legacy,
            insert_mode: InsertMode::Insert,
        };
        let plan = plan(&desired, &current, &ctx, Scope::HookChain("FORWARD"));
        assert!(plan.new_chains.is_empty());
        assert!(plan.deletions.is_empty());
        assert_eq!(plan.hook_updates.len(), 1);
        assert_eq!(plan.hook_updates[0].chain, "FORWARD");
        assert!(plan.expected.contains("cali-old"));
        assert!(plan.expected.rules("INPUT").is_empty());
    }

    #[test]
    fn edited_rule_keeping_its_tag_is_replaced() {
        let fx = Fixture::new()
            .chain("cali-x", vec![Rule::new(Action::Drop)])
            .insert("FORWARD", vec![jump("cali-x")]);
        let synced = fx
            .plan(&fx.snapshot(&[("FORWARD", &[])]), BackendMode::Legacy, InsertMode::Insert)
            .expected;
        let mut edited = synced.clone();
        let mut programmed = String::new();
        if let Some(lines) = edited.chains.get_mut("cali-x") {
            programmed = lines[0].text.clone();
            lines[0] = RuleLine::new(&fx.ownership, programmed.replace("--jump DROP", "-j ACCEPT"));
        }

        let plan = fx.plan(&edited, BackendMode::Legacy, InsertMode::Insert);
        assert_eq!(plan.owned_updates[0].commands, vec![format!("-R cali-x 1 {programmed}")]);

        // the short form printed by the save binary is the same rule
        let mut saved = synced.clone();
        if let Some(lines) = saved.chains.get_mut("cali-x") {
            lines[0] = RuleLine::new(&fx.ownership, programmed.replace("--jump DROP", "-j DROP"));
        }
        assert!(fx.plan(&saved, BackendMode::Legacy, InsertMode::Insert).is_empty());
    }

    #[test]
    fn edited_hook_rule_is_reinserted() {
        let fx = Fixture::new().insert("FORWARD", vec![Rule::new(Action::Drop)]);
        let synced = fx
            .plan(&fx.snapshot(&[("FORWARD", &[])]), BackendMode::Nft, InsertMode::Insert)
            .expected;
        let programmed = synced.rules("FORWARD")[0].text.clone();
        let edited_text = programmed.replace("--jump DROP", "--jump ACCEPT");
        let edited = fx.snapshot(&[("FORWARD", &[edited_text.as_str()])]);

        let plan = fx.plan(&edited, BackendMode::Nft, InsertMode::Insert);
        assert_eq!(
            plan.hook_updates[0].commands,
            vec![format!("-D FORWARD {edited_text}"), format!("-I FORWARD 1 {programmed}")]
        );
    }

    #[test]
    fn jump_inside_a_comment_is_not_a_reference() {
        let fx = Fixture::new();
        let current = fx.snapshot(&[
            ("other", &[r#"-m comment --comment "was -j cali-old" -j ACCEPT"#]),
            ("cali-old", &[]),
        ]);
        let plan = fx.plan(&current, BackendMode::Legacy, InsertMode::Insert);
        assert!(plan.deferred.is_empty());
        assert_eq!(plan.deletions, vec!["cali-old"]);
    }
}
