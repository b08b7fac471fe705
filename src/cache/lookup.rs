//! The lookup cache: the only component that derives keys and talks to the
//! result store.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::entry::{EnvSnapshot, Entry};
use super::key::CanonicalKey;
use super::store::{EntryIter, ResultStore};
use crate::environment::Environment;
use crate::error::{JourneyError, Result, StoreError};
use crate::param::ParameterSet;
use crate::path::{PathIdentity, PathSpec};

const LOCK_STRIPES: usize = 64;

pub struct LookupCache {
    store: Arc<dyn ResultStore>,
    /// Per-key mutual exclusion for writers in this process.
    stripes: Vec<Mutex<()>>,
}

impl LookupCache {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Key for `path` from the current values of its environments.
    ///
    /// `envs` may contain more environments than the path reads; only the
    /// path's own, in its declared order, contribute. `upstream` holds the
    /// keys of the path's subpaths.
    pub fn key(
        &self,
        path: &PathIdentity,
        envs: &[&Environment],
        upstream: &[CanonicalKey],
    ) -> Result<CanonicalKey> {
        let mut contexts: Vec<(&str, &ParameterSet)> = Vec::with_capacity(path.environments.len());
        for name in &path.environments {
            let env = find(envs, name).ok_or_else(|| JourneyError::UnknownEnvironment {
                path: path.name.clone(),
                environment: name.clone(),
            })?;
            contexts.push((name.as_str(), env.parameters()));
        }
        let key = CanonicalKey::derive(path, &contexts, upstream);
        debug!(path = %path.name, key = %key.short(), "derived key");
        Ok(key)
    }

    /// Like [`LookupCache::key`], but first checks that every parameter the
    /// path requires is defined.
    pub fn key_for(
        &self,
        spec: &PathSpec,
        envs: &[&Environment],
        upstream: &[CanonicalKey],
    ) -> Result<CanonicalKey> {
        for (env_name, param) in &spec.requires {
            let env = find(envs, env_name).ok_or_else(|| JourneyError::UnknownEnvironment {
                path: spec.name.clone(),
                environment: env_name.clone(),
            })?;
            if !env.parameters().contains(param) {
                return Err(JourneyError::IncompleteParameter {
                    path: spec.name.clone(),
                    environment: env_name.clone(),
                    parameter: param.clone(),
                });
            }
        }
        self.key(&spec.identity(), envs, upstream)
    }

    /// Non-mutating lookup. A missing entry is `Ok(None)`; a failing backend
    /// is an error, never a miss.
    pub fn get(&self, key: &CanonicalKey) -> Result<Option<Entry>> {
        self.store.get(key).map_err(|e| translate(Some(key), e))
    }

    /// Upsert; the previous entry (if any) ends up in the new one's history.
    pub fn put(&self, entry: Entry) -> Result<Entry> {
        let key = entry.key;
        let _guard = self.lock(&key);
        self.store.put(entry).map_err(|e| translate(Some(&key), e))
    }

    /// Whether the stored entry's snapshot disagrees with the current
    /// Setting/Variable values. No entry means nothing can be stale.
    pub fn is_stale(&self, key: &CanonicalKey, envs: &[&Environment]) -> Result<bool> {
        Ok(!self.stale_parameters(key, envs)?.is_empty())
    }

    /// `env.param` names whose current value differs from the snapshot
    /// stored under `key`. A snapshot environment that no longer exists
    /// is reported as `env.*`.
    pub fn stale_parameters(&self, key: &CanonicalKey, envs: &[&Environment]) -> Result<Vec<String>> {
        let Some(entry) = self.get(key)? else {
            return Ok(Vec::new());
        };
        let current: Vec<EnvSnapshot> = envs.iter().map(|env| EnvSnapshot::of(env)).collect();
        let changed = entry.stale_parameters(&current);
        if !changed.is_empty() {
            warn!(key = %key.short(), changed = ?changed, "stored snapshot disagrees with current parameters");
        }
        Ok(changed)
    }

    /// Lazy, restartable walk over every entry of a path.
    pub fn history(&self, path: &PathIdentity) -> Result<EntryIter<'_>> {
        self.store.all(path).map_err(|e| translate(None, e))
    }

    pub fn paths(&self) -> Result<Vec<PathIdentity>> {
        self.store.paths().map_err(|e| translate(None, e))
    }

    pub fn remove(&self, key: &CanonicalKey) -> Result<bool> {
        let _guard = self.lock(key);
        self.store.remove(key).map_err(|e| translate(Some(key), e))
    }

    fn lock(&self, key: &CanonicalKey) -> MutexGuard<'_, ()> {
        // the guarded data is (), so a poisoned stripe is still usable
        self.stripes[key.stripe(self.stripes.len())]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find<'a>(envs: &[&'a Environment], name: &str) -> Option<&'a Environment> {
    envs.iter().copied().find(|env| env.name() == name)
}

/// Map a backend error into the journey taxonomy.
pub(crate) fn translate(key: Option<&CanonicalKey>, err: StoreError) -> JourneyError {
    match err {
        StoreError::VersionMismatch { found, expected } => JourneyError::KeyVersionMismatch {
            key: key.map_or_else(|| "<history>".to_string(), CanonicalKey::to_hex),
            found,
            expected,
        },
        other => JourneyError::StorageUnavailable(other),
    }
}
