//! Journey orchestration: environments, paths, the cache check and the
//! optimizer loop.
//!
//! Running a path:
//! 1. Resolve its environments and required parameters.
//! 2. Derive its key (subpath keys folded in) and consult the cache.
//! 3. On a hit, hand back the stored outcome. On a miss, run subpaths, then
//!    `run` and `evaluate`, and store the result.
//!
//! A path that fails never leaves an entry behind. Storage outages degrade
//! to uncached execution and are reported as [`Warning`]s on the report.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::cache::{CanonicalKey, EnvSnapshot, Entry, LookupCache};
use crate::environment::{Environment, ParameterAssignment};
use crate::error::{JourneyError, Result};
use crate::optimizer::{Optimizer, OptimizerSettings};
use crate::path::{FigureOfMerit, PathOps, PathSpec, PathState, RunContext, RunOutcome};

/// Unrecorded proposals kept before the oldest is dropped.
pub const MAX_PENDING_PROPOSALS: usize = 256;

/// Per-run knobs. None of them affect cache identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathOptions {
    /// Ignore cache hits down to this depth of the path tree
    /// (0 = never, 1 = top path only, 2 = top path and direct subpaths).
    pub force_run_to_depth: usize,
    /// Consult and write the store.
    pub use_cache: bool,
    /// Call `ponder` once the path completes.
    pub ponder: bool,
    pub verbose: bool,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            force_run_to_depth: 0,
            use_cache: true,
            ponder: true,
            verbose: false,
        }
    }
}

/// What to do with the remaining paths after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Continue,
    Abort,
}

/// Something the caller should know about even though the path completed.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// Lookup failed; the path ran as if nothing was cached.
    StorageUnavailableOnGet { path: String, error: String },
    /// Storing failed; the result was not persisted.
    StorageUnavailableOnPut { path: String, error: String },
    /// The entry under the key disagrees with the current parameters; it
    /// was not used.
    StaleEntry {
        path: String,
        key: CanonicalKey,
        parameters: Vec<String>,
    },
    /// The entry under the key was written by another key scheme; it was
    /// not used.
    KeyVersionMismatch {
        path: String,
        key: CanonicalKey,
        found: u32,
        expected: u32,
    },
    PonderFailed { path: String, message: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::StorageUnavailableOnGet { path, error } => {
                write!(f, "{path}: cache lookup failed, ran uncached ({error})")
            }
            Warning::StorageUnavailableOnPut { path, error } => {
                write!(f, "{path}: result not stored ({error})")
            }
            Warning::StaleEntry { path, key, parameters } => write!(
                f,
                "{path}: ignored stale entry {} (changed: {})",
                key.short(),
                parameters.join(", ")
            ),
            Warning::KeyVersionMismatch {
                path,
                key,
                found,
                expected,
            } => write!(
                f,
                "{path}: ignored entry {} from key scheme v{found} (current v{expected})",
                key.short()
            ),
            Warning::PonderFailed { path, message } => write!(f, "{path}: ponder failed: {message}"),
        }
    }
}

/// Result of running one path.
#[derive(Debug, Clone)]
pub struct PathReport {
    pub path: String,
    pub key: CanonicalKey,
    pub state: PathState,
    /// Every state visited, in order.
    pub trace: Vec<PathState>,
    pub figure_of_merit: FigureOfMerit,
    pub outcome: RunOutcome,
    pub from_cache: bool,
    /// Includes warnings raised by subpaths.
    pub warnings: Vec<Warning>,
}

/// Result of [`Journey::run_all`].
#[derive(Debug)]
pub struct JourneyReport {
    pub journey: String,
    /// One result per attempted path, in declaration order.
    pub results: Vec<(String, Result<PathReport>)>,
}

impl JourneyReport {
    pub fn completed(&self) -> impl Iterator<Item = &PathReport> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &JourneyError)> {
        self.results
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// An applied optimizer proposal awaiting its figure of merit.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub key: CanonicalKey,
    pub assignment: ParameterAssignment,
}

struct PathSlot {
    spec: PathSpec,
    ops: Box<dyn PathOps>,
}

struct PendingProposal {
    path: String,
    snapshot: Vec<EnvSnapshot>,
}

pub struct Journey {
    name: String,
    cache: Arc<LookupCache>,
    environments: IndexMap<String, Environment>,
    paths: IndexMap<String, PathSlot>,
    optimizer: Option<Optimizer>,
    pending: IndexMap<CanonicalKey, PendingProposal>,
}

impl Journey {
    pub fn new(name: impl Into<String>, cache: Arc<LookupCache>) -> Self {
        Self {
            name: name.into(),
            cache,
            environments: IndexMap::new(),
            paths: IndexMap::new(),
            optimizer: None,
            pending: IndexMap::new(),
        }
    }

    pub fn with_optimizer(mut self, settings: OptimizerSettings) -> Self {
        self.optimizer = Some(Optimizer::new(Arc::clone(&self.cache), settings));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    pub fn add_environment(&mut self, mut env: Environment) -> Result<()> {
        if self.environments.contains_key(env.name()) {
            return Err(JourneyError::InvalidJourney(format!(
                "environment '{}' is defined twice",
                env.name()
            )));
        }
        for slot in self.paths.values() {
            if slot.spec.environments.iter().any(|e| e == env.name()) {
                env.register_path(&slot.spec.name);
            }
        }
        self.environments.insert(env.name().to_string(), env);
        Ok(())
    }

    pub fn add_path(&mut self, spec: PathSpec, ops: Box<dyn PathOps>) -> Result<()> {
        if self.paths.contains_key(&spec.name) {
            return Err(JourneyError::InvalidJourney(format!(
                "path '{}' is defined twice",
                spec.name
            )));
        }
        for env_name in &spec.environments {
            if let Some(env) = self.environments.get_mut(env_name) {
                env.register_path(&spec.name);
            }
        }
        self.paths.insert(spec.name.clone(), PathSlot { spec, ops });
        Ok(())
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.get(name)
    }

    pub fn environment_mut(&mut self, name: &str) -> Option<&mut Environment> {
        self.environments.get_mut(name)
    }

    pub fn path_spec(&self, name: &str) -> Option<&PathSpec> {
        self.paths.get(name).map(|slot| &slot.spec)
    }

    /// Path names in declaration order.
    pub fn path_names(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }

    /// Check every registered path: its environments and subpaths exist
    /// and subpaths form no cycle.
    pub fn validate(&self) -> Result<()> {
        let mut done = Vec::new();
        for name in self.paths.keys() {
            self.check_tree(name, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }

    /// Like [`Journey::validate`], restricted to `path` and the subpaths it
    /// reaches. Unrelated broken paths do not affect the result.
    pub fn validate_path(&self, path: &str) -> Result<()> {
        self.slot(path)?;
        self.check_tree(path, &mut Vec::new(), &mut Vec::new())
    }

    fn check_tree<'a>(
        &'a self,
        name: &'a str,
        stack: &mut Vec<&'a str>,
        done: &mut Vec<&'a str>,
    ) -> Result<()> {
        if done.contains(&name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|n| *n == name) {
            let mut cycle: Vec<&str> = stack[pos..].to_vec();
            cycle.push(name);
            return Err(JourneyError::InvalidJourney(format!(
                "circular subpaths: {}",
                cycle.join(" -> ")
            )));
        }
        let slot = self.slot(name)?;
        self.check_slot(&slot.spec)?;

        stack.push(name);
        for sub in &slot.spec.subpaths {
            self.check_tree(sub, stack, done)?;
        }
        stack.pop();
        done.push(name);
        Ok(())
    }

    /// Environments and subpaths named by one path exist.
    fn check_slot(&self, spec: &PathSpec) -> Result<()> {
        for env in &spec.environments {
            if !self.environments.contains_key(env) {
                return Err(JourneyError::UnknownEnvironment {
                    path: spec.name.clone(),
                    environment: env.clone(),
                });
            }
        }
        let missing: Vec<&str> = spec
            .subpaths
            .iter()
            .filter(|s| !self.paths.contains_key(*s))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(JourneyError::InvalidJourney(format!(
                "path '{}' has unknown subpaths: {}",
                spec.name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Key of `path` under the current parameter values, subpath keys
    /// folded in. Always derived fresh.
    pub fn key_of(&self, path: &str) -> Result<CanonicalKey> {
        let slot = self.slot(path)?;
        let upstream = slot
            .spec
            .subpaths
            .iter()
            .map(|sub| self.key_of(sub))
            .collect::<Result<Vec<_>>>()?;
        let envs = self.envs_for(&slot.spec)?;
        self.cache.key_for(&slot.spec, &envs, &upstream)
    }

    /// Run one path (and, on a miss, its subpaths).
    pub fn run(&mut self, path: &str, options: &PathOptions) -> Result<PathReport> {
        self.validate_path(path)?;
        self.run_at(path, options, 1)
    }

    /// Run every path in declaration order.
    pub fn run_all(&mut self, options: &PathOptions, policy: FailurePolicy) -> JourneyReport {
        let names: Vec<String> = self.paths.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.run(&name, options);
            let failed = result.is_err();
            results.push((name, result));
            if failed && policy == FailurePolicy::Abort {
                break;
            }
        }
        JourneyReport {
            journey: self.name.clone(),
            results,
        }
    }

    fn run_at(&mut self, name: &str, options: &PathOptions, depth: usize) -> Result<PathReport> {
        let mut trace = vec![PathState::Pending];

        let spec = self.slot(name)?.spec.clone();
        let key = self.key_of(name)?;
        let snapshot: Vec<EnvSnapshot> = self
            .envs_for(&spec)?
            .into_iter()
            .map(EnvSnapshot::of)
            .collect();
        advance(&mut trace, PathState::Resolved);

        let cache = Arc::clone(&self.cache);
        let mut warnings = Vec::new();
        let forced = depth <= options.force_run_to_depth;

        advance(&mut trace, PathState::CacheChecked);
        if options.use_cache && !spec.keep_history && !forced {
            if let Some(entry) = lookup(&cache, name, &key, &snapshot, &mut warnings)? {
                debug!(path = name, key = %key.short(), "cache hit");
                advance(&mut trace, PathState::Complete);
                if options.ponder {
                    self.ponder(name, &entry.outcome, &mut warnings);
                }
                return Ok(PathReport {
                    path: name.to_string(),
                    key,
                    state: PathState::Complete,
                    trace,
                    figure_of_merit: entry.figure_of_merit,
                    outcome: entry.outcome,
                    from_cache: true,
                    warnings,
                });
            }
        }
        debug!(path = name, key = %key.short(), forced, "cache miss");

        advance(&mut trace, PathState::Running);
        let mut subpaths = BTreeMap::new();
        for sub in &spec.subpaths {
            match self.run_at(sub, options, depth + 1) {
                Ok(report) => {
                    warnings.extend(report.warnings);
                    subpaths.insert(sub.clone(), report.outcome);
                }
                Err(e) => {
                    advance(&mut trace, PathState::Failed);
                    return Err(fail(name, "subpath", format!("{sub}: {e}"), &trace));
                }
            }
        }

        let ctx = RunContext {
            path: name,
            snapshot: &snapshot,
            subpaths: &subpaths,
            verbose: options.verbose,
        };
        let slot = self.slot_mut(name)?;
        let outcome = match guarded(|| slot.ops.run(&ctx)) {
            Ok(outcome) => outcome,
            Err(message) => {
                advance(&mut trace, PathState::Failed);
                return Err(fail(name, "run", message, &trace));
            }
        };
        let figure_of_merit = match guarded(|| slot.ops.evaluate(&outcome)) {
            Ok(fom) => fom,
            Err(message) => {
                advance(&mut trace, PathState::Failed);
                return Err(fail(name, "evaluate", message, &trace));
            }
        };
        advance(&mut trace, PathState::Evaluated);

        if options.use_cache {
            let entry = Entry::new(
                key,
                spec.identity(),
                figure_of_merit.clone(),
                outcome.clone(),
                snapshot,
            );
            match cache.put(entry) {
                Ok(_) => advance(&mut trace, PathState::Stored),
                Err(e) => {
                    warn!(path = name, error = %e, "result not stored");
                    warnings.push(Warning::StorageUnavailableOnPut {
                        path: name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        advance(&mut trace, PathState::Complete);
        info!(path = name, key = %key.short(), fom = %figure_of_merit, "path complete");

        if options.ponder {
            self.ponder(name, &outcome, &mut warnings);
        }
        Ok(PathReport {
            path: name.to_string(),
            key,
            state: PathState::Complete,
            trace,
            figure_of_merit,
            outcome,
            from_cache: false,
            warnings,
        })
    }

    fn ponder(&mut self, name: &str, outcome: &RunOutcome, warnings: &mut Vec<Warning>) {
        let Ok(slot) = self.slot_mut(name) else {
            return;
        };
        let result = guarded(|| {
            slot.ops.ponder(outcome);
            Ok(())
        });
        if let Err(message) = result {
            warn!(path = name, %message, "ponder failed");
            warnings.push(Warning::PonderFailed {
                path: name.to_string(),
                message,
            });
        }
    }

    /// Ask the optimizer for new Variable values of `environment`, apply
    /// them and remember the resulting key until [`Journey::record_result`].
    ///
    /// If the key cannot be derived for the proposed values, the
    /// environment is left as it was and nothing becomes pending.
    pub fn propose_next(&mut self, path: &str, environment: &str) -> Result<Proposal> {
        self.validate_path(path)?;
        let spec = self.slot(path)?.spec.clone();
        if !spec.environments.iter().any(|e| e == environment) {
            return Err(JourneyError::UnknownEnvironment {
                path: path.to_string(),
                environment: environment.to_string(),
            });
        }

        let cache = Arc::clone(&self.cache);
        let optimizer = self
            .optimizer
            .get_or_insert_with(|| Optimizer::new(cache, OptimizerSettings::default()));
        let target = self
            .environments
            .get(environment)
            .ok_or_else(|| JourneyError::UnknownEnvironment {
                path: path.to_string(),
                environment: environment.to_string(),
            })?;
        let context: Vec<&Environment> = spec
            .environments
            .iter()
            .filter(|e| *e != environment)
            .filter_map(|e| self.environments.get(e))
            .collect();
        let assignment = optimizer.propose(&spec.identity(), target, &context, &[])?;

        let mut staged = target.clone();
        staged.apply(&assignment)?;
        let Some(slot) = self.environments.get_mut(environment) else {
            return Err(JourneyError::UnknownEnvironment {
                path: path.to_string(),
                environment: environment.to_string(),
            });
        };
        let original = std::mem::replace(slot, staged);

        let staged_key = self.key_of(path).and_then(|key| {
            let snapshot: Vec<EnvSnapshot> = self
                .envs_for(&spec)?
                .into_iter()
                .map(EnvSnapshot::of)
                .collect();
            Ok((key, snapshot))
        });
        let (key, snapshot) = match staged_key {
            Ok(staged) => staged,
            Err(e) => {
                if let Some(slot) = self.environments.get_mut(environment) {
                    *slot = original;
                }
                return Err(e);
            }
        };

        if self.pending.len() >= MAX_PENDING_PROPOSALS {
            if let Some((dropped, _)) = self.pending.shift_remove_index(0) {
                warn!(key = %dropped.short(), "dropping oldest unrecorded proposal");
            }
        }
        self.pending.insert(
            key,
            PendingProposal {
                path: path.to_string(),
                snapshot,
            },
        );
        debug!(path, environment, key = %key.short(), "proposal applied");
        Ok(Proposal { key, assignment })
    }

    /// Proposals applied but not yet recorded, oldest first.
    pub fn pending_proposals(&self) -> impl Iterator<Item = &CanonicalKey> {
        self.pending.keys()
    }

    /// Forget a proposal that will never be measured.
    pub fn discard_proposal(&mut self, key: &CanonicalKey) -> bool {
        self.pending.shift_remove(key).is_some()
    }

    /// Store the figure of merit measured for a pending proposal.
    pub fn record_result(&mut self, key: &CanonicalKey, figure_of_merit: FigureOfMerit) -> Result<Entry> {
        let pending = self
            .pending
            .shift_remove(key)
            .ok_or_else(|| JourneyError::UnknownProposal(key.to_hex()))?;
        let identity = self.slot(&pending.path)?.spec.identity();
        let entry = Entry::new(
            *key,
            identity,
            figure_of_merit,
            RunOutcome::new(),
            pending.snapshot.clone(),
        );
        match self.cache.put(entry) {
            Ok(stored) => Ok(stored),
            Err(e) => {
                // keep it pending so the caller can retry
                self.pending.insert(*key, pending);
                Err(e)
            }
        }
    }

    fn slot(&self, name: &str) -> Result<&PathSlot> {
        self.paths
            .get(name)
            .ok_or_else(|| JourneyError::UnknownPath(name.to_string()))
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut PathSlot> {
        self.paths
            .get_mut(name)
            .ok_or_else(|| JourneyError::UnknownPath(name.to_string()))
    }

    /// The path's environments, in its declared order.
    fn envs_for(&self, spec: &PathSpec) -> Result<Vec<&Environment>> {
        spec.environments
            .iter()
            .map(|name| {
                self.environments
                    .get(name)
                    .ok_or_else(|| JourneyError::UnknownEnvironment {
                        path: spec.name.clone(),
                        environment: name.clone(),
                    })
            })
            .collect()
    }
}

/// Cache lookup for the journey. Only a fresh, readable entry counts as a
/// hit; outages, stale entries and foreign schemes become warnings and
/// the path runs.
fn lookup(
    cache: &LookupCache,
    path: &str,
    key: &CanonicalKey,
    snapshot: &[EnvSnapshot],
    warnings: &mut Vec<Warning>,
) -> Result<Option<Entry>> {
    match cache.get(key) {
        Ok(Some(entry)) => {
            let stale = entry.stale_parameters(snapshot);
            if stale.is_empty() {
                return Ok(Some(entry));
            }
            warn!(path, key = %key.short(), changed = ?stale, "ignoring stale entry");
            warnings.push(Warning::StaleEntry {
                path: path.to_string(),
                key: *key,
                parameters: stale,
            });
            Ok(None)
        }
        Ok(None) => Ok(None),
        Err(JourneyError::StorageUnavailable(e)) => {
            warn!(path, error = %e, "cache lookup failed, running uncached");
            warnings.push(Warning::StorageUnavailableOnGet {
                path: path.to_string(),
                error: e.to_string(),
            });
            Ok(None)
        }
        Err(JourneyError::KeyVersionMismatch { found, expected, .. }) => {
            warn!(path, key = %key.short(), found, expected, "ignoring entry from another key scheme");
            warnings.push(Warning::KeyVersionMismatch {
                path: path.to_string(),
                key: *key,
                found,
                expected,
            });
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn advance(trace: &mut Vec<PathState>, next: PathState) {
    if let Some(last) = trace.last() {
        debug_assert!(last.can_transition_to(next), "{last} -> {next}");
    }
    trace.push(next);
}

fn fail(path: &str, stage: &'static str, message: String, trace: &[PathState]) -> JourneyError {
    warn!(path, stage, %message, ?trace, "path failed");
    JourneyError::PathExecution {
        path: path.to_string(),
        stage,
        message,
    }
}

/// Call user code, turning both errors and panics into a message.
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {message}"))
        }
    }
}
