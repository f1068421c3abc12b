//! The table synchronizer.
//!
//! A [`Table`] owns the desired model for one packet-filter table of one address family and
//! converges the dataplane towards it on every [`Table::apply`]. Mutations only touch memory, the
//! dataplane is read and written in bulk through the save and restore binaries.

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use thiserror::Error;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::cmd::{self, CommandRunner, Invocation};
use crate::features::{self, BackendMode, Binaries, BinaryLocator, Features};
use crate::hash;
use crate::lock::{self, DataplaneLock, LockGuard};
use crate::naming::{self, NamingOptions, Ownership};
use crate::reconcile::{self, Context, Desired, InsertMode, Plan, Scope};
use crate::rule::{Chain, Rule};
use crate::snapshot::{self, Snapshot};

pub mod schedule;

#[cfg(test)]
pub(crate) mod mocks;

pub use schedule::RecheckOptions;
use schedule::RecheckSchedule;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid naming configuration: {0}")]
    Naming(#[from] naming::Error),
    #[error("Chain {0} is owned by this table and cannot take inserted rules")]
    NotAHookChain(String),
    #[error("Chain {chain} does not exist in table {table}")]
    MissingHookChain { table: String, chain: String },
    #[error("Loading table {table} failed after {attempts} attempts: {source}")]
    LoadFailed {
        table: String,
        attempts: u32,
        source: cmd::Error,
    },
    #[error("Writing table {table} failed after {attempts} attempts: {source}")]
    WriteFailed {
        table: String,
        attempts: u32,
        source: cmd::Error,
    },
    #[error("Unrecoverable command failure: {0}")]
    Command(#[from] cmd::Error),
    #[error(transparent)]
    Snapshot(#[from] snapshot::Error),
    #[error(transparent)]
    Lock(#[from] lock::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableOptions {
    /// Name of the table, e.g. `filter`.
    pub table: String,
    pub ip_version: u8,
    pub naming: NamingOptions,
    pub insert_mode: InsertMode,
    pub backend: BackendMode,
    pub recheck: RecheckOptions,
    pub save_retries: u32,
    pub initial_save_backoff: Duration,
    pub restore_retries: u32,
    pub initial_restore_backoff: Duration,
    /// Upper bound for a single retry delay, for loads and writes.
    pub max_backoff: Duration,
    /// Passed to `--wait` when the restore binary takes the engine lock itself.
    pub restore_wait: Duration,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            table: "filter".to_string(),
            ip_version: 4,
            naming: NamingOptions::default(),
            insert_mode: InsertMode::default(),
            backend: BackendMode::default(),
            recheck: RecheckOptions::default(),
            save_retries: 3,
            initial_save_backoff: Duration::from_millis(100),
            restore_retries: 10,
            initial_restore_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_secs(10),
            restore_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub loads: u64,
    pub writes: u64,
    /// Hook chains found rewritten by someone else after we had synced them.
    pub unexpected_inserts: u64,
    /// Owned chains repaired after external modification.
    pub drift_repairs: u64,
}

/// Doubling delays without jitter, capped at `max`, bounded by retry count only.
fn retry_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max.max(initial),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

pub struct Table<R, C, L: ?Sized> {
    options: TableOptions,
    ownership: Ownership,
    binaries: Binaries,
    features: Features,

    runner: R,
    clock: C,
    lock: Arc<L>,

    chains: HashMap<String, Chain>,
    inserts: HashMap<String, Vec<Rule>>,
    appends: HashMap<String, Vec<Rule>>,
    dirty: bool,

    snapshot: Option<Snapshot>,
    synced_owned: HashSet<String>,
    synced_hooks: HashSet<String>,

    schedule: RecheckSchedule,
    stats: Stats,
}

impl<R, C, L> Table<R, C, L>
where
    R: CommandRunner,
    C: Clock,
    L: DataplaneLock + ?Sized,
{
    pub fn new(
        options: TableOptions,
        runner: R,
        clock: C,
        lock: Arc<L>,
        locator: &dyn BinaryLocator,
    ) -> Result<Self, Error> {
        let ownership = Ownership::new(&options.naming)?;
        let binaries = Binaries::select(locator, options.ip_version, options.backend);
        let schedule = RecheckSchedule::new(options.recheck, clock.now());
        tracing::info!(
            table = %options.table,
            ip_version = options.ip_version,
            backend = %options.backend,
            insert_mode = %options.insert_mode,
            save = %binaries.save,
            restore = %binaries.restore,
            "table created"
        );
        Ok(Self {
            options,
            ownership,
            binaries,
            features: Features::default(),
            runner,
            clock,
            lock,
            chains: HashMap::new(),
            inserts: HashMap::new(),
            appends: HashMap::new(),
            dirty: true,
            snapshot: None,
            synced_owned: HashSet::new(),
            synced_hooks: HashSet::new(),
            schedule,
            stats: Stats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.table
    }

    pub fn binaries(&self) -> &Binaries {
        &self.binaries
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn update_chain(&mut self, chain: Chain) {
        if !self.ownership.is_owned(&chain.name) {
            tracing::warn!(chain = %chain.name, table = %self.options.table, "ignoring update of chain not owned by this table");
            return;
        }
        self.dirty = true;
        if self.chains.get(&chain.name) != Some(&chain) {
            tracing::debug!(%chain, "chain updated");
            self.synced_owned.remove(&chain.name);
            self.chains.insert(chain.name.clone(), chain);
        }
    }

    pub fn update_chains(&mut self, chains: Vec<Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    pub fn remove_chains(&mut self, chains: &[Chain]) {
        for chain in chains {
            self.remove_chain_by_name(&chain.name);
        }
    }

    /// Removing an unknown or foreign chain is a no-op.
    pub fn remove_chain_by_name(&mut self, name: &str) {
        if !self.ownership.is_owned(name) {
            tracing::debug!(chain = %name, "not removing chain not owned by this table");
            return;
        }
        if self.chains.remove(name).is_some() {
            tracing::debug!(chain = %name, "chain removed");
            self.synced_owned.remove(name);
            self.dirty = true;
        }
    }

    /// Sets the rules placed at the insertion point of `chain`. An empty list clears them.
    pub fn insert_or_append_rules(&mut self, chain: &str, rules: Vec<Rule>) {
        self.set_hook_rules(chain, rules, false);
    }

    /// Sets the rules placed at the very end of `chain`. An empty list clears them.
    pub fn append_rules(&mut self, chain: &str, rules: Vec<Rule>) {
        self.set_hook_rules(chain, rules, true);
    }

    fn set_hook_rules(&mut self, chain: &str, rules: Vec<Rule>, append: bool) {
        if self.ownership.is_ours_or_historic(chain) {
            tracing::warn!(%chain, "ignoring hook rules for a chain owned by this table");
            return;
        }
        let target = if append { &mut self.appends } else { &mut self.inserts };
        let changed = if rules.is_empty() {
            target.remove(chain).is_some()
        } else {
            target.insert(chain.to_string(), rules.clone()) != Some(rules)
        };
        if changed {
            self.synced_hooks.remove(chain);
        }
        self.dirty = true;
    }

    /// Forces the next apply to reload instead of trusting the cached view.
    pub fn invalidate_dataplane_cache(&mut self, reason: &str) {
        if self.snapshot.take().is_some() {
            tracing::debug!(table = %self.options.table, %reason, "dataplane cache invalidated");
        }
    }

    /// Converges the dataplane with the desired model.
    ///
    /// Returns the delay after which `apply` should run again even without changes, `None` when
    /// no proactive recheck is needed. An error means the dataplane state is unknown and the
    /// caller must not continue as if it had converged.
    pub async fn apply(&mut self) -> Result<Option<Duration>, Error> {
        let now = self.clock.now();
        if let Some(reason) = self.schedule.due(now) {
            self.invalidate_dataplane_cache(reason);
        }

        if self.dirty || self.snapshot.is_none() {
            self.sync(Scope::Everything, self.options.restore_retries).await?;
        }

        Ok(self.schedule.next_delay(self.clock.now()))
    }

    /// Programs the insert rules of one hook chain right away with a single load and write.
    ///
    /// The rules become the chain's insert set, later applies keep them in place. Fails with
    /// [`Error::MissingHookChain`] when the chain does not exist in the dataplane.
    pub async fn insert_rules_now(&mut self, chain: &str, rules: Vec<Rule>) -> Result<(), Error> {
        if self.ownership.is_ours_or_historic(chain) {
            return Err(Error::NotAHookChain(chain.to_string()));
        }
        self.insert_or_append_rules(chain, rules);
        self.sync(Scope::HookChain(chain), 0).await
    }

    /// Returns the rules whose insert hashes are present in `chain`.
    pub async fn check_rules_present(&mut self, chain: &str, rules: &[Rule]) -> Result<Vec<Rule>, Error> {
        let snapshot = match self.snapshot.take() {
            Some(snapshot) => snapshot,
            None => self.load().await?,
        };
        let present: HashSet<&str> = snapshot
            .rules(chain)
            .iter()
            .filter_map(|l| l.hash.as_deref())
            .collect();
        let found = hash::rule_hashes(chain, rules, &self.features)
            .iter()
            .zip(rules)
            .filter(|(h, _)| present.contains(h.as_str()))
            .map(|(_, r)| r.clone())
            .collect();
        self.snapshot = Some(snapshot);
        Ok(found)
    }

    async fn sync(&mut self, scope: Scope<'_>, restore_retries: u32) -> Result<(), Error> {
        let mut attempt: u32 = 0;
        let mut backoff = retry_backoff(self.options.initial_restore_backoff, self.options.max_backoff);
        loop {
            let current = self.load().await?;
            if let Scope::HookChain(chain) = scope {
                if !current.contains(chain) {
                    self.snapshot = Some(current);
                    return Err(Error::MissingHookChain {
                        table: self.options.table.clone(),
                        chain: chain.to_string(),
                    });
                }
            }
            let plan = self.plan(&current, scope);

            if plan.is_empty() {
                tracing::debug!(table = %self.options.table, "dataplane in sync");
                self.snapshot = Some(current);
                self.mark_synced(scope);
                return Ok(());
            }
            self.note_drift(&plan);

            let res = {
                let _guard = LockGuard::acquire(self.lock.clone()).await?;
                self.write(&plan).await
            };
            match res {
                Ok(()) => {
                    self.snapshot = Some(plan.expected);
                    self.mark_synced(scope);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(Error::Command(e)),
                Err(e) => {
                    if attempt >= restore_retries {
                        tracing::error!(table = %self.options.table, error = %e, "giving up writing dataplane");
                        return Err(Error::WriteFailed {
                            table: self.options.table.clone(),
                            attempts: attempt + 1,
                            source: e,
                        });
                    }
                    attempt += 1;
                    let delay = backoff.next_backoff().unwrap_or(self.options.max_backoff);
                    tracing::warn!(
                        table = %self.options.table,
                        error = %e,
                        attempt,
                        backoff = %humantime::format_duration(delay),
                        "failed to write dataplane, reloading and retrying"
                    );
                    self.snapshot = None;
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    fn plan(&self, current: &Snapshot, scope: Scope<'_>) -> Plan {
        let desired = Desired {
            chains: &self.chains,
            inserts: &self.inserts,
            appends: &self.appends,
        };
        let ctx = Context {
            ownership: &self.ownership,
            features: &self.features,
            backend: self.options.backend,
            insert_mode: self.options.insert_mode,
        };
        reconcile::plan(&desired, current, &ctx, scope)
    }

    fn note_drift(&mut self, plan: &Plan) {
        for update in &plan.owned_updates {
            if self.synced_owned.contains(&update.chain) {
                tracing::warn!(chain = %update.chain, "owned chain modified outside of this table, repairing");
                self.stats.drift_repairs += 1;
            }
        }
        for update in &plan.hook_updates {
            if self.synced_hooks.contains(&update.chain) {
                tracing::warn!(chain = %update.chain, "inserted rules were clobbered, restoring them");
                self.stats.unexpected_inserts += 1;
            }
        }
    }

    fn mark_synced(&mut self, scope: Scope<'_>) {
        match scope {
            Scope::Everything => {
                self.dirty = false;
                self.synced_owned = self
                    .snapshot
                    .iter()
                    .flat_map(|s| s.chains.keys())
                    .filter(|name| self.ownership.is_owned(name))
                    .cloned()
                    .collect();
                self.synced_hooks = self
                    .inserts
                    .iter()
                    .chain(self.appends.iter())
                    .filter(|(_, rules)| !rules.is_empty())
                    .map(|(name, _)| name.clone())
                    .collect();
            }
            Scope::HookChain(chain) => {
                self.synced_hooks.insert(chain.to_string());
            }
        }
    }

    async fn refresh_features(&mut self) {
        match features::detect(&self.runner, self.options.ip_version).await {
            Ok(info) => {
                let features = info.features();
                if features != self.features {
                    tracing::info!(version = %info.version, ?features, "engine features changed");
                    self.features = features;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "unable to detect engine features, keeping previous ones");
            }
        }
    }

    async fn load(&mut self) -> Result<Snapshot, Error> {
        let _guard = LockGuard::acquire(self.lock.clone()).await?;
        self.refresh_features().await;

        let save = self.binaries.save.clone();
        let mut attempt: u32 = 0;
        let mut backoff = retry_backoff(self.options.initial_save_backoff, self.options.max_backoff);
        loop {
            let started = self.clock.now();
            let invocation = Invocation::new(&save).args(["-t", self.options.table.as_str()]);
            let res = match self.runner.run(invocation).await {
                Ok(output) => output.success_stdout(&save),
                Err(e) => Err(e),
            };
            match res {
                Ok(stdout) => {
                    let finished = self.clock.now();
                    self.schedule.peak_save.record(finished.saturating_duration_since(started));
                    self.schedule.record_read(finished);
                    self.stats.loads += 1;
                    let snapshot = Snapshot::parse(&stdout, &self.options.table, &self.ownership)?;
                    tracing::debug!(table = %self.options.table, chains = snapshot.chains.len(), "dataplane loaded");
                    return Ok(snapshot);
                }
                Err(e) if e.is_fatal() => return Err(Error::Command(e)),
                Err(e) => {
                    if attempt >= self.options.save_retries {
                        tracing::error!(table = %self.options.table, error = %e, "giving up reading dataplane");
                        return Err(Error::LoadFailed {
                            table: self.options.table.clone(),
                            attempts: attempt + 1,
                            source: e,
                        });
                    }
                    attempt += 1;
                    let delay = backoff.next_backoff().unwrap_or(self.options.max_backoff);
                    tracing::warn!(
                        table = %self.options.table,
                        error = %e,
                        attempt,
                        backoff = %humantime::format_duration(delay),
                        "failed to read dataplane, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    async fn write(&mut self, plan: &Plan) -> Result<(), cmd::Error> {
        let payload = plan.render_restore(&self.options.table);
        tracing::debug!(table = %self.options.table, %payload, "writing dataplane");

        let mut invocation = Invocation::new(&self.binaries.restore).args(["--noflush", "--verbose"]);
        if self.features.restore_supports_lock {
            let secs = self.options.restore_wait.as_secs().max(1);
            invocation = invocation.arg("--wait").arg(secs.to_string());
        }
        let invocation = invocation.stdin(payload);

        let started = self.clock.now();
        let output = self.runner.run(invocation).await?;
        output.success_stdout(&self.binaries.restore)?;
        let finished = self.clock.now();

        self.schedule.peak_restore.record(finished.saturating_duration_since(started));
        self.schedule.record_write(finished);
        self.stats.writes += 1;
        tracing::info!(
            table = %self.options.table,
            new_chains = plan.new_chains.len(),
            owned_updates = plan.owned_updates.len(),
            hook_updates = plan.hook_updates.len(),
            deleted = plan.deletions.len(),
            "dataplane updated"
        );
        Ok(())
    }
}
