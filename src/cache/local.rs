//! Short-lived, process-local tier with per-entry TTL.
//!
//! Optionally snapshotted to a JSON file so a restarted CLI keeps its warm
//! entries; expired entries are pruned on load.

use crate::store::file::{write_atomic, DirLock};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// One cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
    /// Milliseconds; `None` never expires.
    #[serde(default)]
    pub ttl_ms: Option<i64>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => now.signed_duration_since(self.stored_at) > Duration::milliseconds(ttl),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct LocalCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    snapshot: Option<PathBuf>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a snapshot file; a missing or unreadable snapshot starts empty.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let now = Utc::now();
        let entries: HashMap<String, CacheEntry> = match read_snapshot(&path) {
            Ok(entries) => entries
                .into_iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .collect(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring local cache snapshot");
                HashMap::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            snapshot: Some(path),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live payload for `key`. Expired entries are deleted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        let expired = entries.get(key)?.is_expired(Utc::now());
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.payload.clone())
    }

    /// Replace any entry under `key`.
    pub fn set(&self, key: &str, payload: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            stored_at: Utc::now(),
            ttl_ms: ttl.map(|d| d.num_milliseconds()),
        };
        self.entries().insert(key.to_string(), entry);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries().remove(key);
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist live entries to the snapshot file, if one is configured.
    pub fn save_snapshot(&self) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        self.prune_expired();
        let content = serde_json::to_string(&*self.entries())?;
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("snapshot path has no parent directory"))?;
        let _lock = DirLock::acquire(dir, true)?;
        write_atomic(path, &content)?;
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> anyhow::Result<HashMap<String, CacheEntry>> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("snapshot path has no parent directory"))?;
    if !dir.exists() {
        return Ok(HashMap::new());
    }
    let _lock = DirLock::acquire(dir, false)?;
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_expires_after_ttl() {
        let cache = LocalCache::new();
        cache.set("k", json!(1), Some(Duration::milliseconds(1)));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty(), "expired entry is deleted on read");
    }

    #[test]
    fn unbounded_entry_stays() {
        let cache = LocalCache::new();
        cache.set("k", json!("v"), None);
        assert_eq!(cache.get("k"), Some(json!("v")));
    }

    #[test]
    fn set_replaces_existing_entry() {
        let cache = LocalCache::new();
        cache.set("k", json!(1), None);
        cache.set("k", json!(2), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k"), Some(json!(2)));
    }

    #[test]
    fn prune_removes_only_expired() {
        let cache = LocalCache::new();
        cache.set("old", json!(1), Some(Duration::milliseconds(1)));
        cache.set("new", json!(2), Some(Duration::hours(1)));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(cache.prune_expired(), 1);
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn snapshot_round_trip_skips_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_cache.json");

        let cache = LocalCache::with_snapshot(&path);
        cache.set("keep", json!({"a": 1}), Some(Duration::hours(1)));
        cache.set("drop", json!(0), Some(Duration::milliseconds(1)));
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.save_snapshot().unwrap();

        let restored = LocalCache::with_snapshot(&path);
        assert_eq!(restored.get("keep"), Some(json!({"a": 1})));
        assert!(restored.get("drop").is_none());
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_cache.json");
        fs::write(&path, "not json").unwrap();
        assert!(LocalCache::with_snapshot(&path).is_empty());
    }
}
