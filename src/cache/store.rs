//! Result store contract and the in-memory backend.
//!
//! A store maps [`CanonicalKey`] to [`Entry`] and keeps a per-path index so
//! the optimizer can walk a path's history. Backends must be safe to share
//! between threads; mutual exclusion per key is layered on top by the
//! lookup cache.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use super::entry::{self, Entry};
use super::key::CanonicalKey;
use crate::error::StoreError;
use crate::path::PathIdentity;

/// Prior runs retained per entry unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 8;

/// Persistence boundary for cached results.
pub trait ResultStore: Send + Sync {
    /// Non-mutating lookup.
    fn get(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError>;

    /// Upsert. A prior entry under the same key moves into the new entry's
    /// history; the stored (merged) entry is returned.
    fn put(&self, entry: Entry) -> Result<Entry, StoreError>;

    /// Keys stored for a path, in no particular order.
    fn keys(&self, path: &PathIdentity) -> Result<Vec<CanonicalKey>, StoreError>;

    /// Every path that has at least one entry.
    fn paths(&self) -> Result<Vec<PathIdentity>, StoreError>;

    /// Returns whether an entry was removed.
    fn remove(&self, key: &CanonicalKey) -> Result<bool, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    fn stats(&self) -> StoreStats;
}

impl dyn ResultStore {
    /// Lazy sequence over a path's entries. Entries are loaded one at a
    /// time; call [`EntryIter::restart`] to walk them again.
    pub fn all(&self, path: &PathIdentity) -> Result<EntryIter<'_>, StoreError> {
        Ok(EntryIter {
            store: self,
            keys: self.keys(path)?,
            pos: 0,
        })
    }
}

/// Finite, restartable iterator over stored entries.
pub struct EntryIter<'a> {
    store: &'a dyn ResultStore,
    keys: Vec<CanonicalKey>,
    pos: usize,
}

impl EntryIter<'_> {
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    /// Number of keys the iterator walks (entries removed meanwhile are skipped).
    pub fn len_hint(&self) -> usize {
        self.keys.len()
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<Entry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(key) = self.keys.get(self.pos) {
            self.pos += 1;
            match self.store.get(key) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                // removed by another writer since the keys were listed
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Store statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of cached entries
    pub entries: usize,
    /// Number of distinct paths
    pub paths: usize,
    /// Approximate total size in bytes
    pub size_bytes: u64,
}

impl StoreStats {
    /// Format size in human-readable form (KB, MB, GB)
    pub fn size_human(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} B", self.size_bytes)
        }
    }
}

/// In-memory store for tests and throwaway journeys.
///
/// Can be switched offline to exercise storage outages: every operation
/// then fails with [`StoreError::Unavailable`].
pub struct MemoryStore {
    entries: RwLock<BTreeMap<CanonicalKey, Entry>>,
    history_limit: usize,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl MemoryStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            history_limit,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

impl ResultStore for MemoryStore {
    fn get(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().map_err(StoreError::unavailable)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, entry: Entry) -> Result<Entry, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().map_err(StoreError::unavailable)?;
        let merged = match entries.remove(&entry.key) {
            Some(prior) => entry.supersede(prior, self.history_limit),
            None => entry,
        };
        entries.insert(merged.key, merged.clone());
        Ok(merged)
    }

    fn keys(&self, path: &PathIdentity) -> Result<Vec<CanonicalKey>, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().map_err(StoreError::unavailable)?;
        Ok(entries
            .values()
            .filter(|e| &e.path == path)
            .map(|e| e.key)
            .collect())
    }

    fn paths(&self) -> Result<Vec<PathIdentity>, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().map_err(StoreError::unavailable)?;
        let mut paths: Vec<PathIdentity> = Vec::new();
        for entry in entries.values() {
            if !paths.contains(&entry.path) {
                paths.push(entry.path.clone());
            }
        }
        Ok(paths)
    }

    fn remove(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().map_err(StoreError::unavailable)?;
        Ok(entries.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().map_err(StoreError::unavailable)?;
        entries.clear();
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let Ok(entries) = self.entries.read() else {
            return StoreStats::default();
        };
        let size_bytes = entries
            .values()
            .filter_map(|e| entry::encode(e).ok())
            .map(|bytes| bytes.len() as u64)
            .sum();
        let mut paths: Vec<&PathIdentity> = entries.values().map(|e| &e.path).collect();
        paths.sort_by(|a, b| a.digest().cmp(&b.digest()));
        paths.dedup();
        StoreStats {
            entries: entries.len(),
            paths: paths.len(),
            size_bytes,
        }
    }
}
