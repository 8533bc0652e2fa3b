//! JSON-file store: one directory per job.
//!
//! ```text
//! <root>/<job-id>/job.json     whole job record
//! <root>/<job-id>/units.json   sub-units, ordered by ordinal
//! <root>/<job-id>/log.jsonl    generation log, one entry per line
//! <root>/<job-id>/usage.jsonl  one record per oracle call
//! <root>/<job-id>/.lock        held during a read-modify-write
//! ```
//!
//! Records are written to a temporary file and renamed into place. The lock
//! file is created with `create_new`, so read-modify-writes from separate
//! processes (a running `start` and a `pause` issued elsewhere) serialize.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::JobStore;
use crate::error::StoreError;
use crate::oracle::UsageRecord;
use crate::state_machine::{Job, LogEntry, SubUnit};

const JOB_FILE: &str = "job.json";
const UNITS_FILE: &str = "units.json";
const LOG_FILE: &str = "log.jsonl";
const USAGE_FILE: &str = "usage.jsonl";
const LOCK_FILE: &str = ".lock";

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    async fn existing_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.job_dir(id)?;
        if fs::try_exists(dir.join(JOB_FILE)).await? {
            Ok(dir)
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    async fn lock(&self, id: &str, dir: &Path) -> Result<LockGuard, StoreError> {
        let path = dir.join(LOCK_FILE);
        for attempt in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        tracing::warn!(job_id = id, "removing stale store lock");
                        match fs::remove_file(&path).await {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => {
                                tracing::warn!(job_id = id, error = %e, "failed to remove stale store lock");
                            }
                        }
                        continue;
                    }
                    let delay = 5u64.saturating_mul(u64::from(attempt) + 1).min(100);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Locked(id.to_string()))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_units(dir: &Path) -> Result<Vec<SubUnit>, StoreError> {
        let path = dir.join(UNITS_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        Self::read_json(&path).await
    }

    async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
        if !fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(path).await?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }
}

fn unit_index(units: &[SubUnit], job_id: &str, ordinal: u32) -> Result<usize, StoreError> {
    units
        .iter()
        .position(|u| u.ordinal == ordinal)
        .ok_or_else(|| StoreError::UnitNotFound {
            job_id: job_id.to_string(),
            ordinal,
        })
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

impl JobStore for FileStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let dir = self.job_dir(&job.id)?;
        if fs::try_exists(dir.join(JOB_FILE)).await? {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        fs::create_dir_all(&dir).await?;
        Self::write_json(&dir.join(JOB_FILE), job).await
    }

    async fn load_job(&self, id: &str) -> Result<Job, StoreError> {
        let dir = self.existing_dir(id).await?;
        Self::read_json(&dir.join(JOB_FILE)).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let dir = self.existing_dir(&job.id).await?;
        let _lock = self.lock(&job.id, &dir).await?;
        let mut job = job.clone();
        job.updated_at = Utc::now();
        Self::write_json(&dir.join(JOB_FILE), &job).await
    }

    async fn update_job<F, E>(&self, id: &str, mutate: F) -> Result<Job, E>
    where
        F: FnOnce(&mut Job) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        let dir = self.existing_dir(id).await?;
        let _lock = self.lock(id, &dir).await?;
        let mut job: Job = Self::read_json(&dir.join(JOB_FILE)).await?;
        mutate(&mut job)?;
        job.updated_at = Utc::now();
        Self::write_json(&dir.join(JOB_FILE), &job).await?;
        Ok(job)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(JOB_FILE);
            if !fs::try_exists(&path).await? {
                continue;
            }
            match Self::read_json::<Job>(&path).await {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                }
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let dir = self.existing_dir(id).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn save_sub_units(&self, job_id: &str, units: &[SubUnit]) -> Result<(), StoreError> {
        let dir = self.existing_dir(job_id).await?;
        let _lock = self.lock(job_id, &dir).await?;
        let mut units = units.to_vec();
        units.sort_by_key(|u| u.ordinal);
        Self::write_json(&dir.join(UNITS_FILE), &units).await
    }

    async fn update_sub_unit<F, E>(&self, job_id: &str, ordinal: u32, mutate: F) -> Result<SubUnit, E>
    where
        F: FnOnce(&mut SubUnit) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        let dir = self.existing_dir(job_id).await?;
        let _lock = self.lock(job_id, &dir).await?;
        let mut units = Self::read_units(&dir).await?;
        let index = unit_index(&units, job_id, ordinal)?;
        mutate(&mut units[index])?;
        units[index].updated_at = Utc::now();
        Self::write_json(&dir.join(UNITS_FILE), &units).await?;
        Ok(units.swap_remove(index))
    }

    async fn update_sub_unit_with_job<G, F, E>(
        &self,
        job_id: &str,
        ordinal: u32,
        check: G,
        mutate: F,
    ) -> Result<SubUnit, E>
    where
        G: FnOnce(&mut Job) -> Result<(), E> + Send,
        F: FnOnce(&mut SubUnit) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        let dir = self.existing_dir(job_id).await?;
        let _lock = self.lock(job_id, &dir).await?;
        let mut job: Job = Self::read_json(&dir.join(JOB_FILE)).await?;
        check(&mut job)?;
        let mut units = Self::read_units(&dir).await?;
        let index = unit_index(&units, job_id, ordinal)?;
        mutate(&mut units[index])?;
        let now = Utc::now();
        units[index].updated_at = now;
        job.updated_at = now;
        Self::write_json(&dir.join(UNITS_FILE), &units).await?;
        Self::write_json(&dir.join(JOB_FILE), &job).await?;
        Ok(units.swap_remove(index))
    }

    async fn load_sub_units(&self, job_id: &str) -> Result<Vec<SubUnit>, StoreError> {
        let dir = self.existing_dir(job_id).await?;
        Self::read_units(&dir).await
    }

    async fn append_log(&self, job_id: &str, entry: LogEntry) -> Result<(), StoreError> {
        let dir = self.existing_dir(job_id).await?;
        Self::append_line(&dir.join(LOG_FILE), &entry).await
    }

    async fn load_logs(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let dir = self.existing_dir(job_id).await?;
        Self::read_lines(&dir.join(LOG_FILE)).await
    }

    async fn append_usage(&self, job_id: &str, record: UsageRecord) -> Result<(), StoreError> {
        let dir = self.existing_dir(job_id).await?;
        Self::append_line(&dir.join(USAGE_FILE), &record).await
    }

    async fn load_usage(&self, job_id: &str) -> Result<Vec<UsageRecord>, StoreError> {
        let dir = self.existing_dir(job_id).await?;
        Self::read_lines(&dir.join(USAGE_FILE)).await
    }
}
