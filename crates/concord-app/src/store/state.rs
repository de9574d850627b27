use std::time::Duration;

use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use super::{current_timestamp_ms, StoreError};
use crate::paths::AppPaths;

const STATE_ENV_MAP_SIZE_BYTES: usize = 1 << 30; // 1 GiB

/// Durable key-value store with optional per-entry TTL and atomic
/// compare-and-swap. Keys in use: `job:{job_id}`, `complexity:{content_hash}`,
/// `candidates:{job_id}`, `arbitration:{job_id}`.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically replace `key` if its current raw value equals `expected`
    /// (`None` meaning absent). Returns false without writing on mismatch.
    fn cas(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<bool, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys currently stored under the given prefix, expired entries excluded.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Drop entries whose TTL has elapsed; returns how many were removed.
    fn sweep_expired(&self) -> Result<usize, StoreError>;
}

/// Envelope persisted per entry so TTLs survive restarts.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    expires_at_ms: Option<i64>,
    payload: Vec<u8>,
}

impl StoredEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }
}

/// LMDB-backed `StateStore`.
#[derive(Debug)]
pub struct LmdbStateStore {
    env: Env,
    entries: Database<Str, Bytes>,
}

impl LmdbStateStore {
    pub fn open(paths: &AppPaths) -> Result<Self, StoreError> {
        let path = paths.lmdb_env_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(STATE_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path).map_err(|source| StoreError::Open {
                path: path.clone(),
                source: Box::new(source),
            })?
        };
        let entries = open_or_create(&env, "state")?;
        Ok(Self { env, entries })
    }

    /// Handle to the underlying LMDB environment, for components that share
    /// it (the queue keeps one write lock and one file set with the store).
    pub fn env_handle(&self) -> Env {
        self.env.clone()
    }

    fn read_entry(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.entries.get(&rtxn, key)? else {
            return Ok(None);
        };
        let (entry, _) = decode_from_slice::<StoredEntry, _>(raw, config::standard())?;
        Ok(Some(entry))
    }
}

fn open_or_create(env: &Env, name: &str) -> Result<Database<Str, Bytes>, StoreError> {
    let rtxn = env.read_txn()?;
    let opened = env.open_database::<Str, Bytes>(&rtxn, Some(name))?;
    drop(rtxn);
    match opened {
        Some(existing) => Ok(existing),
        None => {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Ok(db)
        }
    }
}

impl StateStore for LmdbStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        debug_assert!(!key.is_empty());
        match self.read_entry(key)? {
            Some(entry) if !entry.is_expired(current_timestamp_ms()) => Ok(Some(entry.payload)),
            _ => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        debug_assert!(!key.is_empty());
        let entry = StoredEntry {
            expires_at_ms: ttl.map(|t| current_timestamp_ms() + t.as_millis() as i64),
            payload: value.to_vec(),
        };
        let encoded = encode_to_vec(&entry, config::standard())?;
        let mut wtxn = self.env.write_txn()?;
        self.entries.put(&mut wtxn, key, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn cas(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<bool, StoreError> {
        debug_assert!(!key.is_empty());
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.env.write_txn()?;

        let current = match self.entries.get(&wtxn, key)? {
            Some(raw) => {
                let (entry, _) = decode_from_slice::<StoredEntry, _>(raw, config::standard())?;
                if entry.is_expired(now_ms) {
                    None
                } else {
                    Some(entry.payload)
                }
            }
            None => None,
        };

        if current.as_deref() != expected {
            return Ok(false);
        }

        let entry = StoredEntry {
            expires_at_ms: None,
            payload: value.to_vec(),
        };
        let encoded = encode_to_vec(&entry, config::standard())?;
        self.entries.put(&mut wtxn, key, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        debug_assert!(!key.is_empty());
        let mut wtxn = self.env.write_txn()?;
        self.entries.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now_ms = current_timestamp_ms();
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.entries.prefix_iter(&rtxn, prefix)? {
            let (key, raw) = item?;
            let (entry, _) = decode_from_slice::<StoredEntry, _>(raw, config::standard())?;
            if !entry.is_expired(now_ms) {
                out.push(key.to_string());
            }
        }
        Ok(out)
    }

    fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.env.write_txn()?;
        let mut doomed = Vec::new();
        {
            let iter = self.entries.iter(&wtxn)?;
            for item in iter {
                let (key, raw) = item?;
                let (entry, _) = decode_from_slice::<StoredEntry, _>(raw, config::standard())?;
                if entry.is_expired(now_ms) {
                    doomed.push(key.to_string());
                }
            }
        }
        for key in &doomed {
            self.entries.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, LmdbStateStore) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let store = LmdbStateStore::open(&paths).expect("open store");
        (temp, store)
    }

    #[test]
    fn set_get_roundtrip() {
        let (_temp, store) = open_store();
        store.set("job:abc", b"payload", None).expect("set");
        assert_eq!(store.get("job:abc").expect("get"), Some(b"payload".to_vec()));
        assert_eq!(store.get("job:missing").expect("get"), None);
    }

    #[test]
    fn cas_succeeds_only_on_expected_value() {
        let (_temp, store) = open_store();
        assert!(store.cas("k", None, b"v1").expect("insert"));
        assert!(!store.cas("k", None, b"v2").expect("stale insert"));
        assert!(!store.cas("k", Some(b"other"), b"v2").expect("stale swap"));
        assert!(store.cas("k", Some(b"v1"), b"v2").expect("swap"));
        assert_eq!(store.get("k").expect("get"), Some(b"v2".to_vec()));
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let (_temp, store) = open_store();
        store
            .set("ttl", b"soon gone", Some(Duration::from_millis(0)))
            .expect("set");
        assert_eq!(store.get("ttl").expect("get"), None);
        assert!(store.keys_with_prefix("ttl").expect("keys").is_empty());
        assert_eq!(store.sweep_expired().expect("sweep"), 1);
    }

    #[test]
    fn prefix_listing_filters_by_prefix() {
        let (_temp, store) = open_store();
        store.set("job:a", b"1", None).expect("set");
        store.set("job:b", b"2", None).expect("set");
        store.set("complexity:x", b"3", None).expect("set");

        let mut keys = store.keys_with_prefix("job:").expect("keys");
        keys.sort();
        assert_eq!(keys, vec!["job:a".to_string(), "job:b".to_string()]);
    }
}
