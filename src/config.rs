//! Configuration loading from jmaps.toml and pyproject.toml.
//!
//! Follows conventions from ruff, black, mypy for familiarity:
//! - Standalone jmaps.toml first
//! - `[tool.jmaps]` section in pyproject.toml as fallback
//!
//! ## Example
//!
//! ```toml
//! [store]
//! backend = "redb"
//! path = ".jmaps.cache"
//! history-limit = 8
//!
//! [optimizer]
//! gamma = 0.25
//! min-observations = 10
//! direction = "minimize"
//! objective = "loss"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::warn;

use crate::cache::{DEFAULT_HISTORY_LIMIT, FsStore, MemoryStore, RedbStore, ResultStore};
use crate::optimizer::{Direction, OptimizerSettings};

/// Default store directory, relative to the config's directory.
pub const DEFAULT_STORE_DIR: &str = ".jmaps.cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Redb,
    Fs,
    Memory,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Redb => "redb",
            Backend::Fs => "fs",
            Backend::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Resolved store directory.
    pub path: PathBuf,
    /// Prior runs kept per entry.
    pub history_limit: usize,
}

/// JourneyMAPS configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source file for this config (for display).
    pub source: Option<PathBuf>,
    pub store: StoreConfig,
    pub optimizer: OptimizerSettings,
}

/// Raw config as deserialized from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    store: Option<RawStore>,
    optimizer: Option<RawOptimizer>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawStore {
    backend: Option<Backend>,
    path: Option<String>,
    history_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawOptimizer {
    gamma: Option<f64>,
    min_observations: Option<usize>,
    candidates: Option<usize>,
    seed: Option<u64>,
    round_digits: Option<u32>,
    direction: Option<Direction>,
    objective: Option<String>,
}

/// Wrapper for pyproject.toml structure.
#[derive(Debug, Deserialize)]
struct PyProject {
    tool: Option<PyProjectTool>,
}

#[derive(Debug, Deserialize)]
struct PyProjectTool {
    jmaps: Option<RawConfig>,
}

impl Config {
    /// Load configuration from the given directory.
    ///
    /// Search order:
    /// 1. jmaps.toml in directory
    /// 2. pyproject.toml [tool.jmaps] in directory
    /// 3. Walk up to find pyproject.toml (like ruff)
    /// 4. Default config if nothing found
    pub fn load(directory: &Path) -> Self {
        let jmaps_toml = directory.join("jmaps.toml");
        if jmaps_toml.exists() {
            if let Some(config) = Self::load_jmaps_toml(&jmaps_toml) {
                return config;
            }
        }

        let mut current = Some(directory);
        while let Some(dir) = current {
            let pyproject = dir.join("pyproject.toml");
            if pyproject.exists() {
                if let Some(config) = Self::load_pyproject(&pyproject) {
                    return config;
                }
            }
            current = dir.parent();
        }

        Self::defaults_in(directory)
    }

    /// Default config with the store under `directory`.
    pub fn defaults_in(directory: &Path) -> Self {
        Self::from_raw(RawConfig::default(), directory, None)
    }

    fn load_jmaps_toml(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let raw: RawConfig = match toml::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparsable config");
                return None;
            }
        };
        Some(Self::from_raw(raw, path.parent()?, Some(path.to_path_buf())))
    }

    fn load_pyproject(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let pyproject: PyProject = match toml::from_str(&content) {
            Ok(pyproject) => pyproject,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparsable pyproject.toml");
                return None;
            }
        };
        let raw = pyproject.tool?.jmaps?;
        Some(Self::from_raw(raw, path.parent()?, Some(path.to_path_buf())))
    }

    fn from_raw(raw: RawConfig, base: &Path, source: Option<PathBuf>) -> Self {
        let store = raw.store.unwrap_or_default();
        let opt = raw.optimizer.unwrap_or_default();
        let defaults = OptimizerSettings::default();

        Self {
            source,
            store: StoreConfig {
                backend: store.backend.unwrap_or_default(),
                path: base.join(store.path.as_deref().unwrap_or(DEFAULT_STORE_DIR)),
                history_limit: store.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            },
            optimizer: OptimizerSettings {
                gamma: opt.gamma.unwrap_or(defaults.gamma),
                min_observations: opt.min_observations.unwrap_or(defaults.min_observations),
                candidates: opt.candidates.unwrap_or(defaults.candidates),
                seed: opt.seed.unwrap_or(defaults.seed),
                round_digits: opt.round_digits.unwrap_or(defaults.round_digits),
                direction: opt.direction.unwrap_or(defaults.direction),
                objective: opt.objective.or(defaults.objective),
            },
        }
    }

    /// Construct the configured backend.
    pub fn open_store(&self) -> Result<Arc<dyn ResultStore>> {
        let limit = self.store.history_limit;
        let store: Arc<dyn ResultStore> = match self.store.backend {
            Backend::Redb => Arc::new(RedbStore::open(&self.store.path, limit)?),
            Backend::Fs => Arc::new(FsStore::open(&self.store.path, limit)?),
            Backend::Memory => Arc::new(MemoryStore::new(limit)),
        };
        Ok(store)
    }

    /// Format config for verbose display.
    pub fn display_summary(&self) -> String {
        let mut lines = Vec::new();

        if let Some(ref source) = self.source {
            lines.push(format!("   Config: {}", source.display()));
        } else {
            lines.push("   Config: (defaults)".to_string());
        }

        lines.push(format!(
            "   Store: {} at {} (history {})",
            self.store.backend,
            self.store.path.display(),
            self.store.history_limit
        ));

        let opt = &self.optimizer;
        lines.push(format!(
            "   Optimizer: {} gamma={} min-observations={} candidates={} seed={}",
            opt.direction, opt.gamma, opt.min_observations, opt.candidates, opt.seed
        ));
        if let Some(ref objective) = opt.objective {
            lines.push(format!("   Objective: {objective}"));
        }

        lines.join("\n")
    }
}
