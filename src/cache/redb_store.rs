//! Persistent result store using redb.
//!
//! Store structure:
//! - Database: `<dir>/results.redb` (redb provides ACID guarantees)
//! - `entries`: key hex -> record bytes (format word + bincode Entry)
//! - `path_index`: "<path digest>/<key hex>" -> key hex, range-scanned per path
//! - `paths`: path digest -> bincode PathIdentity
//!
//! An upsert (read prior, merge history, write entry and index) happens in
//! one write transaction, so readers never see a half-written entry.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use tracing::{debug, warn};

use super::entry::{self, Entry};
use super::key::CanonicalKey;
use super::store::{ResultStore, StoreStats};
use crate::error::StoreError;
use crate::path::PathIdentity;

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const PATH_INDEX: TableDefinition<&str, &str> = TableDefinition::new("path_index");
const PATHS: TableDefinition<&str, &[u8]> = TableDefinition::new("paths");

/// Result store backed by a single redb file.
///
/// One process at a time; for several hosts sharing a directory use
/// [`FsStore`](super::FsStore).
pub struct RedbStore {
    db: Database,
    db_path: PathBuf,
    history_limit: usize,
}

impl RedbStore {
    /// Open or create `<dir>/results.redb`.
    ///
    /// Creates the directory and all tables if they don't exist, so read
    /// transactions never see a missing table.
    pub fn open(dir: &Path, history_limit: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;

        let db_path = dir.join("results.redb");
        let db = Database::create(&db_path)
            .with_context(|| format!("Failed to open result database: {}", db_path.display()))?;

        let txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            txn.open_table(ENTRIES).context("Failed to create entries table")?;
            txn.open_table(PATH_INDEX).context("Failed to create path index")?;
            txn.open_table(PATHS).context("Failed to create paths table")?;
        }
        txn.commit().context("Failed to commit table creation")?;

        debug!(path = %db_path.display(), "opened redb result store");
        Ok(Self {
            db,
            db_path,
            history_limit,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn index_key(digest: &str, key: &CanonicalKey) -> String {
        format!("{digest}/{key}")
    }

    /// Half-open bounds covering every index key of a path: '0' sorts right
    /// after '/'.
    fn index_range(digest: &str) -> (String, String) {
        (format!("{digest}/"), format!("{digest}0"))
    }

    /// Remove `key` from the path index; drops the path itself once it has
    /// no entries left.
    fn unindex(txn: &WriteTransaction, path: &PathIdentity, key: &CanonicalKey) -> Result<(), StoreError> {
        let digest = path.digest();
        let mut index = txn.open_table(PATH_INDEX).map_err(StoreError::unavailable)?;
        index
            .remove(Self::index_key(&digest, key).as_str())
            .map_err(StoreError::unavailable)?;

        let (start, end) = Self::index_range(&digest);
        let empty = index
            .range(start.as_str()..end.as_str())
            .map_err(StoreError::unavailable)?
            .next()
            .is_none();
        if empty {
            let mut paths = txn.open_table(PATHS).map_err(StoreError::unavailable)?;
            paths.remove(digest.as_str()).map_err(StoreError::unavailable)?;
        }
        Ok(())
    }

    /// Index entries whose record could not be decoded still have to leave
    /// the index; find them by key suffix.
    fn unindex_by_suffix(txn: &WriteTransaction, key: &CanonicalKey) -> Result<(), StoreError> {
        let suffix = format!("/{key}");
        let mut index = txn.open_table(PATH_INDEX).map_err(StoreError::unavailable)?;
        let stale: Vec<String> = index
            .iter()
            .map_err(StoreError::unavailable)?
            .filter_map(|r| r.ok())
            .map(|(k, _)| k.value().to_string())
            .filter(|k| k.ends_with(&suffix))
            .collect();
        for k in stale {
            index.remove(k.as_str()).map_err(StoreError::unavailable)?;
        }
        Ok(())
    }
}

impl ResultStore for RedbStore {
    fn get(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::unavailable)?;
        let table = read_txn.open_table(ENTRIES).map_err(StoreError::unavailable)?;

        let Some(guard) = table.get(key.to_hex().as_str()).map_err(StoreError::unavailable)? else {
            return Ok(None);
        };
        entry::decode(guard.value()).map(Some)
    }

    fn put(&self, entry: Entry) -> Result<Entry, StoreError> {
        let hex = entry.key.to_hex();
        let digest = entry.path.digest();

        let write_txn = self.db.begin_write().map_err(StoreError::unavailable)?;
        let merged = {
            let mut entries = write_txn.open_table(ENTRIES).map_err(StoreError::unavailable)?;

            let prior = entries
                .get(hex.as_str())
                .map_err(StoreError::unavailable)?
                .map(|guard| guard.value().to_vec());
            let merged = match prior.as_deref().map(entry::decode) {
                Some(Ok(prior)) => entry.supersede(prior, self.history_limit),
                Some(Err(e)) => {
                    warn!(key = %entry.key.short(), error = %e, "dropping unreadable prior entry");
                    entry
                }
                None => entry,
            };

            let bytes = entry::encode(&merged)?;
            entries
                .insert(hex.as_str(), bytes.as_slice())
                .map_err(StoreError::unavailable)?;
            merged
        };
        {
            let mut index = write_txn.open_table(PATH_INDEX).map_err(StoreError::unavailable)?;
            index
                .insert(Self::index_key(&digest, &merged.key).as_str(), hex.as_str())
                .map_err(StoreError::unavailable)?;

            let identity = bincode::serialize(&merged.path).map_err(StoreError::corrupt)?;
            let mut paths = write_txn.open_table(PATHS).map_err(StoreError::unavailable)?;
            paths
                .insert(digest.as_str(), identity.as_slice())
                .map_err(StoreError::unavailable)?;
        }
        write_txn.commit().map_err(StoreError::unavailable)?;

        Ok(merged)
    }

    fn keys(&self, path: &PathIdentity) -> Result<Vec<CanonicalKey>, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::unavailable)?;
        let index = read_txn.open_table(PATH_INDEX).map_err(StoreError::unavailable)?;

        let (start, end) = Self::index_range(&path.digest());
        let mut keys = Vec::new();
        for row in index
            .range(start.as_str()..end.as_str())
            .map_err(StoreError::unavailable)?
        {
            let (_, value) = row.map_err(StoreError::unavailable)?;
            keys.push(CanonicalKey::from_hex(value.value()).map_err(StoreError::corrupt)?);
        }
        Ok(keys)
    }

    fn paths(&self) -> Result<Vec<PathIdentity>, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::unavailable)?;
        let table = read_txn.open_table(PATHS).map_err(StoreError::unavailable)?;

        let mut paths = Vec::new();
        for row in table.iter().map_err(StoreError::unavailable)? {
            let (_, value) = row.map_err(StoreError::unavailable)?;
            paths.push(bincode::deserialize(value.value()).map_err(StoreError::corrupt)?);
        }
        Ok(paths)
    }

    fn remove(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write().map_err(StoreError::unavailable)?;
        let removed = {
            let mut entries = write_txn.open_table(ENTRIES).map_err(StoreError::unavailable)?;
            entries
                .remove(key.to_hex().as_str())
                .map_err(StoreError::unavailable)?
                .map(|guard| guard.value().to_vec())
        };
        let Some(bytes) = removed else {
            return Ok(false);
        };
        match entry::decode(&bytes) {
            Ok(prior) => Self::unindex(&write_txn, &prior.path, key)?,
            Err(_) => Self::unindex_by_suffix(&write_txn, key)?,
        }
        write_txn.commit().map_err(StoreError::unavailable)?;
        Ok(true)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(StoreError::unavailable)?;
        write_txn.delete_table(ENTRIES).map_err(StoreError::unavailable)?;
        write_txn.delete_table(PATH_INDEX).map_err(StoreError::unavailable)?;
        write_txn.delete_table(PATHS).map_err(StoreError::unavailable)?;
        {
            write_txn.open_table(ENTRIES).map_err(StoreError::unavailable)?;
            write_txn.open_table(PATH_INDEX).map_err(StoreError::unavailable)?;
            write_txn.open_table(PATHS).map_err(StoreError::unavailable)?;
        }
        write_txn.commit().map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let Ok(read_txn) = self.db.begin_read() else {
            return StoreStats::default();
        };
        let Ok(entries) = read_txn.open_table(ENTRIES) else {
            return StoreStats::default();
        };

        let count = entries.len().unwrap_or(0) as usize;
        let paths = read_txn
            .open_table(PATHS)
            .ok()
            .and_then(|t| t.len().ok())
            .unwrap_or(0) as usize;

        // Approximate size by summing key and value lengths
        let size_bytes = entries
            .iter()
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|r| r.ok())
            .map(|(k, v)| k.value().len() + v.value().len())
            .sum::<usize>() as u64;

        StoreStats {
            entries: count,
            paths,
            size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::tests::sample_entry;
    use crate::path::FigureOfMerit;
    use tempfile::TempDir;

    #[test]
    fn test_store_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let store = RedbStore::open(dir.path(), 4)?;
        let entry = sample_entry("anneal", 5.0, 0.82);

        store.put(entry.clone())?;
        let fetched = store.get(&entry.key)?.expect("entry stored");
        assert_eq!(fetched.figure_of_merit, FigureOfMerit::Scalar(0.82));
        assert_eq!(fetched.snapshot, entry.snapshot);
        Ok(())
    }

    #[test]
    fn test_missing_key_is_none() -> Result<()> {
        let dir = TempDir::new()?;
        let store = RedbStore::open(dir.path(), 4)?;
        assert!(store.get(&sample_entry("anneal", 5.0, 0.0).key)?.is_none());
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let entry = sample_entry("anneal", 5.0, 0.82);
        {
            let store = RedbStore::open(dir.path(), 4)?;
            store.put(entry.clone())?;
        }
        let store = RedbStore::open(dir.path(), 4)?;
        assert!(store.get(&entry.key)?.is_some());
        assert_eq!(store.paths()?, vec![entry.path]);
        Ok(())
    }

    #[test]
    fn test_overwrite_moves_prior_into_history() -> Result<()> {
        let dir = TempDir::new()?;
        let store = RedbStore::open(dir.path(), 4)?;
        store.put(sample_entry("anneal", 5.0, 0.80))?;
        let merged = store.put(sample_entry("anneal", 5.0, 0.85))?;

        assert_eq!(merged.history.len(), 1);
        let fetched = store.get(&merged.key)?.expect("entry stored");
        assert_eq!(fetched.figure_of_merit, FigureOfMerit::Scalar(0.85));
        assert_eq!(fetched.history[0].figure_of_merit, FigureOfMerit::Scalar(0.80));
        Ok(())
    }

    #[test]
    fn test_keys_are_scoped_by_path() -> Result<()> {
        let dir = TempDir::new()?;
        let store = RedbStore::open(dir.path(), 4)?;
        let a = sample_entry("anneal", 5.0, 0.8);
        store.put(a.clone())?;
        store.put(sample_entry("anneal", 7.0, 0.9))?;
        store.put(sample_entry("quench", 5.0, 0.1))?;

        assert_eq!(store.keys(&a.path)?.len(), 2);
        assert_eq!(store.paths()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_remove_drops_index_and_empty_path() -> Result<()> {
        let dir = TempDir::new()?;
        let store = RedbStore::open(dir.path(), 4)?;
        let entry = sample_entry("quench", 5.0, 0.1);
        store.put(entry.clone())?;

        assert!(store.remove(&entry.key)?);
        assert!(!store.remove(&entry.key)?);
        assert!(store.keys(&entry.path)?.is_empty());
        assert!(store.paths()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_clear_and_stats() -> Result<()> {
        let dir = TempDir::new()?;
        let store = RedbStore::open(dir.path(), 4)?;

        let stats = store.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.size_bytes, 0);

        store.put(sample_entry("anneal", 5.0, 0.8))?;
        store.put(sample_entry("quench", 5.0, 0.1))?;
        let stats = store.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.paths, 2);
        assert!(stats.size_bytes > 0);

        store.clear()?;
        assert_eq!(store.stats().entries, 0);
        assert!(store.paths()?.is_empty());
        Ok(())
    }
}
