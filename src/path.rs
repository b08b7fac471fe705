//! Paths: named steps with user-supplied run / ponder / evaluate operations.
//!
//! The journey only ever talks to user code through [`PathOps`]. Errors come
//! back as values; panics are caught by the journey and treated the same
//! way, so one misbehaving path cannot take the orchestration loop down.
//!
//! ## Execution protocol
//!
//! ```text
//! Pending → Resolved → CacheChecked ─┬─ hit ──────────────────────────────→ Complete
//!                                    └─ miss → Running → Evaluated → Stored → Complete
//!                                                 │           │
//!                                                 └───────────┴──→ Failed
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::EnvSnapshot;
use crate::param::{ParamValue, ParameterSet, write_bytes};

/// What makes two paths "the same" for caching: name, version and the
/// ordered environments they read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathIdentity {
    pub name: String,
    pub version: u32,
    pub environments: Vec<String>,
}

impl PathIdentity {
    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        write_bytes(out, self.name.as_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.environments.len() as u64).to_le_bytes());
        for env in &self.environments {
            write_bytes(out, env.as_bytes());
        }
    }

    /// Stable hex digest, used by stores to index entries per path.
    pub fn digest(&self) -> String {
        let mut bytes = Vec::with_capacity(64);
        self.write_canonical(&mut bytes);
        hex::encode(Sha256::digest(&bytes))
    }
}

impl fmt::Display for PathIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{} [{}]", self.name, self.version, self.environments.join(", "))
    }
}

/// Declaration of a path: identity plus what it needs from the journey.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSpec {
    pub name: String,
    /// Bump after changing the path's code to invalidate its cached results.
    pub version: u32,
    pub changelog: Option<String>,
    /// Environments read by the path, in declared order.
    pub environments: Vec<String>,
    /// (environment, parameter) pairs that must exist before running.
    pub requires: Vec<(String, String)>,
    /// Paths whose outcomes this path consumes, run before it on a miss.
    pub subpaths: Vec<String>,
    /// Always recompute and record every run; never served from cache.
    pub keep_history: bool,
}

impl PathSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            changelog: None,
            environments: Vec::new(),
            requires: Vec::new(),
            subpaths: Vec::new(),
            keep_history: false,
        }
    }

    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.environments.push(env.into());
        self
    }

    /// Declare parameters the path reads from `env`. Also adds `env` to the
    /// path's environments if it is not there yet.
    pub fn requires<I, S>(mut self, env: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let env = env.into();
        if !self.environments.contains(&env) {
            self.environments.push(env.clone());
        }
        self.requires
            .extend(params.into_iter().map(|p| (env.clone(), p.into())));
        self
    }

    pub fn subpath(mut self, name: impl Into<String>) -> Self {
        self.subpaths.push(name.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn changelog(mut self, text: impl Into<String>) -> Self {
        self.changelog = Some(text.into());
        self
    }

    pub fn keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn identity(&self) -> PathIdentity {
        PathIdentity {
            name: self.name.clone(),
            version: self.version,
            environments: self.environments.clone(),
        }
    }
}

/// Reference to an artifact a run produced (file, object-store URI, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub uri: String,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
        }
    }
}

/// Output of `run`: named values plus artifact references. Both are
/// persisted and handed back verbatim on a cache hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub values: BTreeMap<String, ParamValue>,
    pub artifacts: Vec<ArtifactRef>,
}

impl RunOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }
}

/// Result of `evaluate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FigureOfMerit {
    Scalar(f64),
    /// Several named metrics; the optimizer reads the configured objective.
    Structured(BTreeMap<String, f64>),
}

impl FigureOfMerit {
    /// Scalar used for optimization.
    ///
    /// Structured values need `objective`, unless they hold a single metric.
    /// Non-finite scores are not usable and yield `None`.
    pub fn score(&self, objective: Option<&str>) -> Option<f64> {
        let value = match (self, objective) {
            (FigureOfMerit::Scalar(v), _) => *v,
            (FigureOfMerit::Structured(map), Some(key)) => *map.get(key)?,
            (FigureOfMerit::Structured(map), None) if map.len() == 1 => *map.values().next()?,
            (FigureOfMerit::Structured(_), None) => return None,
        };
        value.is_finite().then_some(value)
    }
}

impl fmt::Display for FigureOfMerit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FigureOfMerit::Scalar(v) => write!(f, "{v:.4}"),
            FigureOfMerit::Structured(map) => {
                let parts: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<f64> for FigureOfMerit {
    fn from(v: f64) -> Self {
        FigureOfMerit::Scalar(v)
    }
}

/// What a path sees while running.
#[derive(Debug)]
pub struct RunContext<'a> {
    pub path: &'a str,
    /// Snapshots of the path's environments, all roles included.
    pub snapshot: &'a [EnvSnapshot],
    /// Outcomes of the declared subpaths, by name.
    pub subpaths: &'a BTreeMap<String, RunOutcome>,
    pub verbose: bool,
}

impl<'a> RunContext<'a> {
    pub fn environment(&self, name: &str) -> Option<&'a ParameterSet> {
        self.snapshot
            .iter()
            .find(|snap| snap.environment == name)
            .map(|snap| &snap.parameters)
    }

    /// Shortcut for `environment(env)?.value(name)`.
    pub fn value(&self, env: &str, name: &str) -> Option<&'a ParamValue> {
        self.environment(env)?.value(name)
    }

    pub fn subpath(&self, name: &str) -> Option<&'a RunOutcome> {
        self.subpaths.get(name)
    }
}

/// User-supplied behavior of a path.
pub trait PathOps {
    /// Do the (possibly long, possibly failing) work.
    fn run(&mut self, ctx: &RunContext<'_>) -> anyhow::Result<RunOutcome>;

    /// Visualize or summarize. Never affects the cache.
    fn ponder(&mut self, _outcome: &RunOutcome) {}

    /// Reduce an outcome to a figure of merit.
    fn evaluate(&mut self, outcome: &RunOutcome) -> anyhow::Result<FigureOfMerit>;
}

/// [`PathOps`] from a pair of closures.
pub struct FnPath<R, E> {
    run: R,
    evaluate: E,
}

impl<R, E> FnPath<R, E>
where
    R: FnMut(&RunContext<'_>) -> anyhow::Result<RunOutcome>,
    E: FnMut(&RunOutcome) -> anyhow::Result<FigureOfMerit>,
{
    pub fn new(run: R, evaluate: E) -> Self {
        Self { run, evaluate }
    }
}

impl<R, E> PathOps for FnPath<R, E>
where
    R: FnMut(&RunContext<'_>) -> anyhow::Result<RunOutcome>,
    E: FnMut(&RunOutcome) -> anyhow::Result<FigureOfMerit>,
{
    fn run(&mut self, ctx: &RunContext<'_>) -> anyhow::Result<RunOutcome> {
        (self.run)(ctx)
    }

    fn evaluate(&mut self, outcome: &RunOutcome) -> anyhow::Result<FigureOfMerit> {
        (self.evaluate)(outcome)
    }
}

/// Where a path is in its execution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathState {
    Pending,
    Resolved,
    CacheChecked,
    Running,
    Evaluated,
    Stored,
    Complete,
    Failed,
}

impl PathState {
    /// Legal transitions of the protocol.
    pub fn can_transition_to(self, next: PathState) -> bool {
        use PathState::*;
        matches!(
            (self, next),
            (Pending, Resolved)
                | (Resolved, CacheChecked)
                | (CacheChecked, Complete)
                | (CacheChecked, Running)
                | (Running, Evaluated)
                | (Running, Failed)
                | (Evaluated, Stored)
                | (Evaluated, Failed)
                // store skipped: caching disabled or the backend is down
                | (Evaluated, Complete)
                | (Stored, Complete)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PathState::Complete | PathState::Failed)
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_adds_environment_once() {
        let spec = PathSpec::new("anneal")
            .environment("furnace")
            .requires("furnace", ["temp", "power"])
            .requires("sample", ["mass"]);
        assert_eq!(spec.environments, vec!["furnace", "sample"]);
        assert_eq!(spec.requires.len(), 3);
    }

    #[test]
    fn test_identity_digest_depends_on_env_order() {
        let ab = PathSpec::new("p").environment("a").environment("b").identity();
        let ba = PathSpec::new("p").environment("b").environment("a").identity();
        assert_ne!(ab.digest(), ba.digest());
        assert_eq!(ab.digest(), ab.clone().digest());
    }

    #[test]
    fn test_identity_digest_depends_on_version() {
        let v0 = PathSpec::new("p").environment("a").identity();
        let v1 = PathSpec::new("p").environment("a").version(1).identity();
        assert_ne!(v0.digest(), v1.digest());
    }

    #[test]
    fn test_score_scalar_and_structured() {
        assert_eq!(FigureOfMerit::Scalar(0.82).score(None), Some(0.82));
        assert_eq!(FigureOfMerit::Scalar(f64::NAN).score(None), None);

        let mut map = BTreeMap::new();
        map.insert("loss".to_string(), 0.4);
        map.insert("yield".to_string(), 0.9);
        let fom = FigureOfMerit::Structured(map);
        assert_eq!(fom.score(Some("yield")), Some(0.9));
        assert_eq!(fom.score(Some("missing")), None);
        assert_eq!(fom.score(None), None);
    }

    #[test]
    fn test_state_transitions() {
        use PathState::*;
        assert!(Pending.can_transition_to(Resolved));
        assert!(CacheChecked.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Stored.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Running));
        assert!(Failed.is_terminal());
    }
}
