//! Directory-backed result store for sharing results between processes.
//!
//! Layout under the store root:
//!
//! ```text
//! entries/<key hex>.bin          record bytes (format word + bincode Entry)
//! paths/<digest>/identity.bin    bincode PathIdentity
//! paths/<digest>/<key hex>       empty marker, one per entry of the path
//! ```
//!
//! Records are written to a temp file in the same directory and renamed
//! into place, so a concurrent reader sees either the old or the new record.
//! Writers in one process are serialized and keep superseded runs in the
//! entry's history. Two processes racing on the same key: the last rename
//! wins and the other run is lost.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::warn;

use super::entry::{self, Entry};
use super::key::CanonicalKey;
use super::store::{ResultStore, StoreStats};
use crate::error::StoreError;
use crate::path::PathIdentity;

const IDENTITY_FILE: &str = "identity.bin";

pub struct FsStore {
    root: PathBuf,
    history_limit: usize,
    /// Serializes read-merge-write within this process.
    write_lock: Mutex<()>,
}

impl FsStore {
    pub fn open(root: &Path, history_limit: usize) -> Result<Self> {
        for sub in ["entries", "paths"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            history_limit,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn entry_file(&self, key: &CanonicalKey) -> PathBuf {
        self.entries_dir().join(format!("{key}.bin"))
    }

    fn path_dir(&self, path: &PathIdentity) -> PathBuf {
        self.root.join("paths").join(path.digest())
    }

    fn read_entry(&self, key: &CanonicalKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.entry_file(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::unavailable(e)),
        }
    }

    /// Write `bytes` to `target` via temp file + rename.
    fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(dir).map_err(StoreError::unavailable)?;
        tmp.write_all(bytes).map_err(StoreError::unavailable)?;
        tmp.as_file().sync_all().map_err(StoreError::unavailable)?;
        tmp.persist(target).map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn index(&self, entry: &Entry) -> Result<(), StoreError> {
        let dir = self.path_dir(&entry.path);
        fs::create_dir_all(&dir).map_err(StoreError::unavailable)?;

        let identity = dir.join(IDENTITY_FILE);
        if !identity.exists() {
            let bytes = bincode::serialize(&entry.path).map_err(StoreError::corrupt)?;
            Self::write_atomic(&dir, &identity, &bytes)?;
        }
        fs::File::create(dir.join(entry.key.to_hex())).map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn unindex(&self, path: &PathIdentity, key: &CanonicalKey) -> Result<(), StoreError> {
        let dir = self.path_dir(path);
        match fs::remove_file(dir.join(key.to_hex())) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::unavailable(e)),
        }
        if self.markers(&dir)?.is_empty() {
            fs::remove_dir_all(&dir).map_err(StoreError::unavailable)?;
        }
        Ok(())
    }

    /// Entry keys recorded in a path directory.
    fn markers(&self, dir: &Path) -> Result<Vec<CanonicalKey>, StoreError> {
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::unavailable(e)),
        };
        let mut keys = Vec::new();
        for item in read {
            let item = item.map_err(StoreError::unavailable)?;
            let name = item.file_name();
            // identity.bin and leftover temp files don't parse as keys
            if let Some(key) = name.to_str().and_then(|n| CanonicalKey::from_hex(n).ok()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

impl ResultStore for FsStore {
    fn get(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError> {
        match self.read_entry(key)? {
            Some(bytes) => entry::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, entry: Entry) -> Result<Entry, StoreError> {
        let _guard = self.write_lock.lock().map_err(StoreError::unavailable)?;

        let merged = match self.read_entry(&entry.key)?.as_deref().map(entry::decode) {
            Some(Ok(prior)) => entry.supersede(prior, self.history_limit),
            Some(Err(e)) => {
                warn!(key = %entry.key.short(), error = %e, "dropping unreadable prior entry");
                entry
            }
            None => entry,
        };

        let bytes = entry::encode(&merged)?;
        // marker before entry; readers skip markers that have no entry
        self.index(&merged)?;
        Self::write_atomic(&self.entries_dir(), &self.entry_file(&merged.key), &bytes)?;
        Ok(merged)
    }

    fn keys(&self, path: &PathIdentity) -> Result<Vec<CanonicalKey>, StoreError> {
        self.markers(&self.path_dir(path))
    }

    fn paths(&self) -> Result<Vec<PathIdentity>, StoreError> {
        let read = fs::read_dir(self.root.join("paths")).map_err(StoreError::unavailable)?;
        let mut paths = Vec::new();
        for item in read {
            let dir = item.map_err(StoreError::unavailable)?.path();
            let bytes = match fs::read(dir.join(IDENTITY_FILE)) {
                Ok(bytes) => bytes,
                // another writer is still creating this directory
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::unavailable(e)),
            };
            paths.push(bincode::deserialize(&bytes).map_err(StoreError::corrupt)?);
        }
        Ok(paths)
    }

    fn remove(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().map_err(StoreError::unavailable)?;

        let Some(bytes) = self.read_entry(key)? else {
            return Ok(false);
        };
        fs::remove_file(self.entry_file(key)).map_err(StoreError::unavailable)?;

        match entry::decode(&bytes) {
            Ok(prior) => self.unindex(&prior.path, key)?,
            Err(e) => {
                // path unknown: sweep every path directory for the marker
                warn!(key = %key.short(), error = %e, "removed unreadable entry");
                for path in self.paths()? {
                    self.unindex(&path, key)?;
                }
            }
        }
        Ok(true)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(StoreError::unavailable)?;
        for sub in ["entries", "paths"] {
            let dir = self.root.join(sub);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(StoreError::unavailable)?;
            }
            fs::create_dir_all(&dir).map_err(StoreError::unavailable)?;
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        if let Ok(read) = fs::read_dir(self.entries_dir()) {
            for item in read.filter_map(|r| r.ok()) {
                if item.path().extension().is_some_and(|ext| ext == "bin") {
                    stats.entries += 1;
                    stats.size_bytes += item.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }
        stats.paths = self.paths().map(|p| p.len()).unwrap_or(0);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::tests::sample_entry;
    use crate::path::FigureOfMerit;
    use tempfile::TempDir;

    #[test]
    fn test_fs_store_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsStore::open(dir.path(), 4)?;
        let entry = sample_entry("anneal", 5.0, 0.82);

        store.put(entry.clone())?;
        let fetched = store.get(&entry.key)?.expect("entry stored");
        assert_eq!(fetched.outcome, entry.outcome);
        assert!(store.entry_file(&entry.key).exists());
        Ok(())
    }

    #[test]
    fn test_two_handles_share_results() -> Result<()> {
        let dir = TempDir::new()?;
        let writer = FsStore::open(dir.path(), 4)?;
        let reader = FsStore::open(dir.path(), 4)?;
        let entry = sample_entry("anneal", 5.0, 0.82);

        writer.put(entry.clone())?;
        assert!(reader.get(&entry.key)?.is_some());
        assert_eq!(reader.keys(&entry.path)?, vec![entry.key]);
        Ok(())
    }

    #[test]
    fn test_last_writer_wins_with_history() -> Result<()> {
        let dir = TempDir::new()?;
        let a = FsStore::open(dir.path(), 4)?;
        let b = FsStore::open(dir.path(), 4)?;
        a.put(sample_entry("anneal", 5.0, 0.80))?;
        b.put(sample_entry("anneal", 5.0, 0.85))?;

        let key = sample_entry("anneal", 5.0, 0.0).key;
        let fetched = a.get(&key)?.expect("entry stored");
        assert_eq!(fetched.figure_of_merit, FigureOfMerit::Scalar(0.85));
        assert_eq!(fetched.history.len(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_index_keeps_prior_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsStore::open(dir.path(), 4)?;
        let first = sample_entry("anneal", 5.0, 0.80);
        store.put(first.clone())?;

        // a directory where the marker file belongs makes indexing fail
        let marker = store.path_dir(&first.path).join(first.key.to_hex());
        fs::remove_file(&marker)?;
        fs::create_dir(&marker)?;

        assert!(store.put(sample_entry("anneal", 5.0, 0.85)).is_err());
        let kept = store.get(&first.key)?.expect("prior entry kept");
        assert_eq!(kept.figure_of_merit, FigureOfMerit::Scalar(0.80));
        assert!(kept.history.is_empty());
        Ok(())
    }

    #[test]
    fn test_remove_cleans_path_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsStore::open(dir.path(), 4)?;
        let entry = sample_entry("quench", 5.0, 0.1);
        store.put(entry.clone())?;
        assert_eq!(store.paths()?.len(), 1);

        assert!(store.remove(&entry.key)?);
        assert!(store.get(&entry.key)?.is_none());
        assert!(store.paths()?.is_empty());
        assert!(!store.remove(&entry.key)?);
        Ok(())
    }

    #[test]
    fn test_corrupt_record_is_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsStore::open(dir.path(), 4)?;
        let entry = sample_entry("anneal", 5.0, 0.82);
        store.put(entry.clone())?;

        fs::write(store.entry_file(&entry.key), [7u8, 0, 0, 0, 1, 2])?;
        assert!(matches!(
            store.get(&entry.key),
            Err(StoreError::VersionMismatch { found: 7, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_clear_and_stats() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsStore::open(dir.path(), 4)?;
        store.put(sample_entry("anneal", 5.0, 0.8))?;
        store.put(sample_entry("quench", 5.0, 0.1))?;

        let stats = store.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.paths, 2);
        assert!(stats.size_bytes > 0);

        store.clear()?;
        assert_eq!(store.stats().entries, 0);
        Ok(())
    }
}
