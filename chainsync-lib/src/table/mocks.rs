//! Stateful mocks for the table's collaborators.
//!
//! `MockDataplane` keeps a real in-memory table that save dumps and restore mutates, so tests
//! assert on the resulting dataplane rather than on call sequences. It also serves as the clock:
//! time only moves when a test or a configured command duration moves it.

#![cfg(test)]

use async_trait::async_trait;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::cmd::{self, CommandRunner, Invocation, Output};
use crate::lock::{self, DataplaneLock};

pub type Chains = BTreeMap<String, Vec<String>>;
pub type Clobber = Box<dyn FnOnce(&mut Chains) + Send>;

#[derive(Default)]
pub struct DataplaneState {
    pub table: String,
    pub chains: Chains,
    pub version_output: String,
    /// Comment line printed before the table, as some engines do.
    pub prologue: Option<String>,

    /// Program names in call order.
    pub cmds: Vec<String>,
    pub restore_inputs: Vec<String>,
    pub restore_args: Vec<Vec<String>>,
    /// Rule positions (1-based) written by the last successful restore.
    pub touched: BTreeSet<(String, usize)>,

    pub fail_saves: u32,
    pub fail_all_saves: bool,
    pub fail_next_kill: bool,
    pub fail_restores: u32,
    pub fail_all_restores: bool,
    /// Runs against the dataplane right before the next restore applies.
    pub before_restore: Option<Clobber>,

    pub elapsed: Duration,
    pub slept: Duration,
    pub save_duration: Option<Duration>,
    pub restore_duration: Option<Duration>,
}

impl DataplaneState {
    pub fn new() -> Self {
        Self {
            table: "filter".to_string(),
            chains: ["INPUT", "FORWARD", "OUTPUT"]
                .into_iter()
                .map(|c| (c.to_string(), Vec::new()))
                .collect(),
            version_output: "iptables v1.8.4 (legacy)".to_string(),
            ..Default::default()
        }
    }

    fn render_save(&self) -> String {
        let mut out = String::new();
        if let Some(prologue) = &self.prologue {
            out.push_str(prologue);
            out.push('\n');
        }
        out.push_str(&format!("*{}\n", self.table));
        for name in self.chains.keys() {
            out.push_str(&format!(":{name} - [0:0]\n"));
        }
        for (name, rules) in &self.chains {
            for rule in rules {
                out.push_str(&format!("-A {name} {rule}\n"));
            }
        }
        out.push_str("COMMIT\n");
        out
    }

    fn save(&mut self, program: &str) -> Result<Output, cmd::Error> {
        if let Some(d) = self.save_duration.take() {
            self.elapsed += d;
        }
        if self.fail_all_saves || self.fail_saves > 0 {
            self.fail_saves = self.fail_saves.saturating_sub(1);
            if std::mem::take(&mut self.fail_next_kill) {
                return Err(cmd::Error::Kill {
                    program: program.to_string(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            return Ok(failed("save failed"));
        }
        Ok(Output {
            status: Some(0),
            stdout: self.render_save(),
            stderr: String::new(),
        })
    }

    fn restore(&mut self, args: Vec<String>, input: String) -> Output {
        self.restore_args.push(args);
        self.restore_inputs.push(input.clone());
        if let Some(clobber) = self.before_restore.take() {
            clobber(&mut self.chains);
        }
        if let Some(d) = self.restore_duration.take() {
            self.elapsed += d;
        }
        if self.fail_all_restores || self.fail_restores > 0 {
            self.fail_restores = self.fail_restores.saturating_sub(1);
            return failed("restore failed");
        }

        let mut chains = self.chains.clone();
        let mut touched = BTreeSet::new();
        for line in input.lines() {
            if let Err(msg) = apply_line(&mut chains, &mut touched, line) {
                return failed(&msg);
            }
        }
        self.chains = chains;
        self.touched = touched;
        Output {
            status: Some(0),
            ..Default::default()
        }
    }
}

fn failed(msg: &str) -> Output {
    Output {
        status: Some(1),
        stdout: String::new(),
        stderr: msg.to_string(),
    }
}

fn references(rule: &str, chain: &str) -> bool {
    let tokens: Vec<&str> = rule.split_whitespace().collect();
    tokens
        .windows(2)
        .any(|w| matches!(w[0], "-j" | "--jump" | "-g" | "--goto") && w[1] == chain)
}

fn position(arg: Option<&str>) -> Result<usize, String> {
    arg.and_then(|a| a.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("bad rule number {arg:?}"))
}

fn apply_line(chains: &mut Chains, touched: &mut BTreeSet<(String, usize)>, line: &str) -> Result<(), String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('*') || line == "COMMIT" {
        return Ok(());
    }
    if let Some(decl) = line.strip_prefix(':') {
        let name = decl.split_whitespace().next().unwrap_or_default();
        chains.insert(name.to_string(), Vec::new());
        return Ok(());
    }

    let (op, rest) = line.split_once(' ').ok_or_else(|| format!("bad line {line}"))?;
    let (chain, rest) = rest.split_once(' ').unwrap_or((rest, ""));
    if op == "--delete-chain" {
        if chains.get(chain).is_some_and(|r| !r.is_empty()) {
            return Err(format!("chain {chain} not empty"));
        }
        if chains.values().flatten().any(|r| references(r, chain)) {
            return Err(format!("chain {chain} still referenced"));
        }
        return chains
            .remove(chain)
            .map(|_| ())
            .ok_or_else(|| format!("no chain {chain}"));
    }

    let rules = chains.get_mut(chain).ok_or_else(|| format!("no chain {chain}"))?;
    match op {
        "--flush" => rules.clear(),
        "-A" => {
            rules.push(rest.to_string());
            touched.insert((chain.to_string(), rules.len()));
        }
        "-I" | "-R" => {
            let (num, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let n = position(Some(num))?;
            if op == "-I" {
                if n > rules.len() + 1 {
                    return Err(format!("index {n} out of range"));
                }
                rules.insert(n - 1, text.to_string());
            } else {
                let slot = rules.get_mut(n - 1).ok_or_else(|| format!("index {n} out of range"))?;
                *slot = text.to_string();
            }
            touched.insert((chain.to_string(), n));
        }
        "-D" => {
            if let Ok(n) = position(Some(rest)) {
                if n > rules.len() {
                    return Err(format!("index {n} out of range"));
                }
                rules.remove(n - 1);
            } else {
                let idx = rules
                    .iter()
                    .position(|r| r == rest)
                    .ok_or_else(|| format!("rule not found: {rest}"))?;
                rules.remove(idx);
            }
        }
        other => return Err(format!("unknown command {other}")),
    }
    Ok(())
}

#[derive(Clone)]
pub struct MockDataplane {
    pub state: Arc<Mutex<DataplaneState>>,
    start: Instant,
}

impl MockDataplane {
    pub fn new() -> Self {
        Self::with_state(DataplaneState::new())
    }

    pub fn with_state(state: DataplaneState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            start: Instant::now(),
        }
    }

    pub fn chain(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().chains.get(name).cloned()
    }

    pub fn set_chain(&self, name: &str, rules: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .chains
            .insert(name.to_string(), rules.iter().map(|r| r.to_string()).collect());
    }

    pub fn cmds(&self) -> Vec<String> {
        self.state.lock().unwrap().cmds.clone()
    }

    pub fn reset_cmds(&self) {
        self.state.lock().unwrap().cmds.clear();
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().unwrap().elapsed += by;
    }
}

#[async_trait]
impl CommandRunner for MockDataplane {
    async fn run(&self, invocation: Invocation) -> Result<Output, cmd::Error> {
        let mut state = self.state.lock().unwrap();
        state.cmds.push(invocation.program.clone());
        if invocation.args.iter().any(|a| a == "--version") {
            return Ok(Output {
                status: Some(0),
                stdout: state.version_output.clone(),
                stderr: String::new(),
            });
        }
        if invocation.program.ends_with("-save") {
            return state.save(&invocation.program);
        }
        if invocation.program.ends_with("-restore") {
            let input = invocation.stdin.clone().unwrap_or_default();
            return Ok(state.restore(invocation.args, input));
        }
        Err(cmd::Error::Spawn {
            program: invocation.program,
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }
}

#[async_trait]
impl Clock for MockDataplane {
    fn now(&self) -> Instant {
        self.start + self.state.lock().unwrap().elapsed
    }

    async fn sleep(&self, duration: Duration) {
        self.state.lock().unwrap().slept += duration;
    }
}

#[derive(Default)]
pub struct MockLock {
    held: AtomicBool,
    pub acquisitions: AtomicU32,
    /// Set when `lock` is called while already held.
    pub double_locked: AtomicBool,
}

impl MockLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataplaneLock for MockLock {
    async fn lock(&self) -> Result<(), lock::Error> {
        if self.held.swap(true, Ordering::SeqCst) {
            self.double_locked.store(true, Ordering::SeqCst);
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlock(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}
