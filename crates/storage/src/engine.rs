//! Storage engine: versioned in-memory map with WAL durability.
//!
//! All writes go through the WAL first, then into the map. Conflicts are
//! resolved last-writer-wins on timestamp; a delete removes the entry
//! outright, so a tombstone is represented by absence.

use crate::wal::{Wal, WalError};
use parking_lot::RwLock;
use quorumkv_common::defaults::WAL_FILE_NAME;
use quorumkv_common::{OpType, Timestamp, VersionedValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Thread-safe single-node store. Readers run in parallel under the map's
/// reader lock; writers are exclusive. The WAL has its own mutex, acquired
/// before (never inside) the map lock, so disk order and memory order may
/// differ between concurrent writers; reconciliation is by timestamp, not
/// by log order.
#[derive(Debug)]
pub struct StorageEngine {
    store: RwLock<HashMap<String, VersionedValue>>,
    wal: Wal,
    #[allow(dead_code)]
    data_dir: PathBuf,
}

impl StorageEngine {
    /// Open or create a storage engine rooted at the given directory.
    ///
    /// Does not replay the WAL; call [`StorageEngine::recover`] for that.
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal = Wal::open(&data_dir.join(WAL_FILE_NAME))?;
        tracing::info!(data_dir = %data_dir.display(), "storage engine initialized");
        Ok(Self {
            store: RwLock::new(HashMap::new()),
            wal,
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Store `(value, ts, origin)` under `key`.
    ///
    /// Returns `true` if applied, `false` if an entry with an equal or newer
    /// timestamp was already present (the store is left unchanged).
    pub fn put(&self, key: &str, value: &str, ts: Timestamp, origin_node: &str) -> bool {
        self.wal.append(OpType::Put, key, value, ts);

        let mut store = self.store.write();
        if let Some(existing) = store.get(key) {
            if existing.timestamp >= ts {
                return false;
            }
        }
        store.insert(key.to_string(), VersionedValue::new(value, ts, origin_node));
        true
    }

    /// Same as [`StorageEngine::put`] but preserves the supplied origin.
    /// Used by replication to carry a value's origin through replicas.
    pub fn conditional_put(&self, key: &str, vv: &VersionedValue) -> bool {
        self.wal.append(OpType::Put, key, &vv.value, vv.timestamp);

        let mut store = self.store.write();
        if let Some(existing) = store.get(key) {
            if existing.timestamp >= vv.timestamp {
                return false;
            }
        }
        store.insert(key.to_string(), vv.clone());
        true
    }

    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.store.read().get(key).cloned()
    }

    /// Delete `key` if the stored timestamp is older than `ts`.
    ///
    /// Returns `true` only when an entry was actually erased.
    pub fn delete(&self, key: &str, ts: Timestamp) -> bool {
        self.wal.append(OpType::Delete, key, "", ts);

        let mut store = self.store.write();
        match store.get(key) {
            None => false,
            Some(existing) if existing.timestamp >= ts => false,
            Some(_) => {
                store.remove(key);
                true
            }
        }
    }

    /// Apply many entries under one writer-lock acquisition, each with the
    /// conditional-put rule. Not WAL-logged: intended only for in-memory
    /// state transfer, whose effects do not survive a crash.
    pub fn bulk_put(&self, entries: Vec<(String, VersionedValue)>) {
        let mut store = self.store.write();
        for (key, vv) in entries {
            let newer = store
                .get(&key)
                .map_or(true, |existing| existing.timestamp < vv.timestamp);
            if newer {
                store.insert(key, vv);
            }
        }
    }

    /// Unconditionally erase the given keys. Not WAL-logged, same caveat as
    /// [`StorageEngine::bulk_put`].
    pub fn remove_keys(&self, keys: &[String]) {
        let mut store = self.store.write();
        for key in keys {
            store.remove(key);
        }
    }

    /// Snapshot copy of the entire map.
    pub fn get_all_data(&self) -> Vec<(String, VersionedValue)> {
        self.store
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Rebuild the map from the WAL.
    ///
    /// Puts apply when strictly newer than the current entry; deletes erase
    /// when their timestamp is greater than or equal to the stored one, so
    /// an equal-timestamp delete wins over the put it follows.
    pub fn recover(&self) -> Result<(), StorageError> {
        let entries = self.wal.replay()?;
        let mut applied = 0usize;

        let mut store = self.store.write();
        for entry in &entries {
            match entry.op {
                OpType::Put | OpType::InternalPut => {
                    let newer = store
                        .get(&entry.key)
                        .map_or(true, |existing| existing.timestamp < entry.timestamp);
                    if newer {
                        store.insert(
                            entry.key.clone(),
                            VersionedValue::new(&entry.value, entry.timestamp, ""),
                        );
                        applied += 1;
                    }
                }
                OpType::Delete | OpType::InternalDelete => {
                    let erase = store
                        .get(&entry.key)
                        .is_some_and(|existing| existing.timestamp <= entry.timestamp);
                    if erase {
                        store.remove(&entry.key);
                        applied += 1;
                    }
                }
                _ => {}
            }
        }

        tracing::info!(
            wal_entries = entries.len(),
            applied,
            keys = store.len(),
            "recovery complete"
        );
        Ok(())
    }

    /// Number of live keys.
    pub fn size(&self) -> usize {
        self.store.read().len()
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
