//! JSON-file backend for the subject table and quota counters.
//!
//! Every operation takes an advisory lock on `<dir>/.lock`, reads the whole
//! table, and writes it back atomically. Tables are small (one row per
//! artist or user), so whole-file rewrites are fine.

use super::{increment_in, upsert_into, QuotaRecord, QuotaStore, SubjectRecord, SubjectRepository};
use crate::error::StoreError;
use crate::subject::Shape;
use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const SUBJECTS_FILE: &str = "subjects.json";
const QUOTAS_FILE: &str = "quotas.json";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// File-backed durable store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run a blocking closure against the directory under an exclusive lock.
    async fn with_lock<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = DirLock::acquire(&dir, true)?;
            f(&dir)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl SubjectRepository for FileStore {
    async fn find_by_name(&self, name_key: &str) -> Result<Option<SubjectRecord>, StoreError> {
        let name_key = name_key.to_string();
        self.with_lock(move |dir| {
            let rows: Vec<SubjectRecord> = read_table(&dir.join(SUBJECTS_FILE))?;
            Ok(rows.into_iter().find(|row| row.name_key == name_key))
        })
        .await
    }

    async fn find_by_catalog_id(&self, id: &str) -> Result<Option<SubjectRecord>, StoreError> {
        let id = id.to_string();
        self.with_lock(move |dir| {
            let rows: Vec<SubjectRecord> = read_table(&dir.join(SUBJECTS_FILE))?;
            Ok(rows
                .into_iter()
                .find(|row| row.catalog_id.as_deref() == Some(id.as_str())))
        })
        .await
    }

    async fn upsert(&self, record: SubjectRecord) -> Result<(), StoreError> {
        self.with_lock(move |dir| {
            let path = dir.join(SUBJECTS_FILE);
            let mut rows: Vec<SubjectRecord> = read_table(&path)?;
            upsert_into(&mut rows, record);
            write_table(&path, &rows)
        })
        .await
    }

    async fn clear_payload(&self, target: &SubjectRecord, shape: Shape) -> Result<(), StoreError> {
        let target = target.clone();
        self.with_lock(move |dir| {
            let path = dir.join(SUBJECTS_FILE);
            let mut rows: Vec<SubjectRecord> = read_table(&path)?;
            let mut changed = false;
            for row in rows.iter_mut().filter(|row| row.same_subject(&target)) {
                changed |= row.payloads.remove(&shape).is_some();
            }
            if changed {
                write_table(&path, &rows)?;
            }
            Ok(())
        })
        .await
    }

    async fn featured(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        self.with_lock(|dir| {
            let rows: Vec<SubjectRecord> = read_table(&dir.join(SUBJECTS_FILE))?;
            Ok(rows.into_iter().filter(|row| row.featured).collect())
        })
        .await
    }
}

#[async_trait]
impl QuotaStore for FileStore {
    async fn load(&self, identity: &str) -> Result<Option<QuotaRecord>, StoreError> {
        let identity = identity.to_string();
        self.with_lock(move |dir| {
            let mut quotas: HashMap<String, QuotaRecord> = read_table(&dir.join(QUOTAS_FILE))?;
            Ok(quotas.remove(&identity))
        })
        .await
    }

    async fn increment(
        &self,
        identity: &str,
        default_limit: u32,
    ) -> Result<QuotaRecord, StoreError> {
        let identity = identity.to_string();
        self.with_lock(move |dir| {
            let path = dir.join(QUOTAS_FILE);
            let mut quotas: HashMap<String, QuotaRecord> = read_table(&path)?;
            let record = increment_in(&mut quotas, &identity, default_limit);
            write_table(&path, &quotas)?;
            Ok(record)
        })
        .await
    }

    async fn save(&self, record: QuotaRecord) -> Result<(), StoreError> {
        self.with_lock(move |dir| {
            let path = dir.join(QUOTAS_FILE);
            let mut quotas: HashMap<String, QuotaRecord> = read_table(&path)?;
            quotas.insert(record.identity.clone(), record);
            write_table(&path, &quotas)
        })
        .await
    }
}

/// Missing file reads as an empty table.
fn read_table<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(T::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

fn write_table<T: Serialize>(path: &Path, table: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string(table)?;
    write_atomic(path, &content)?;
    Ok(())
}

/// Advisory lock on `<dir>/.lock`, released on drop.
pub(crate) struct DirLock {
    file: std::fs::File,
}

impl DirLock {
    pub(crate) fn acquire(dir: &Path, exclusive: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(dir.join(LOCK_FILE))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(StoreError::Unavailable(format!(
                            "timed out waiting for store lock ({}s)",
                            LOCK_TIMEOUT_SECS
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Write content atomically by writing to a temp file first, then renaming.
///
/// On Windows the destination is moved aside first because `rename()` refuses
/// to overwrite; a crash in between leaves a `.bak` file behind.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600); // Owner read/write only
        let _ = std::fs::set_permissions(&tmp_path, perms);
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}
