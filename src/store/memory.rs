use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use super::JobStore;
use crate::error::StoreError;
use crate::oracle::UsageRecord;
use crate::state_machine::{Job, LogEntry, SubUnit};

#[derive(Debug, Clone)]
struct Record {
    job: Job,
    units: Vec<SubUnit>,
    logs: Vec<LogEntry>,
    usage: Vec<UsageRecord>,
}

/// Process-local store. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, Record>) -> T) -> T {
        let guard = self.records.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<String, Record>) -> T) -> T {
        let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound(id.to_string())
}

fn unit_mut<'a>(units: &'a mut [SubUnit], job_id: &str, ordinal: u32) -> Result<&'a mut SubUnit, StoreError> {
    units
        .iter_mut()
        .find(|u| u.ordinal == ordinal)
        .ok_or_else(|| StoreError::UnitNotFound {
            job_id: job_id.to_string(),
            ordinal,
        })
}

impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.write(|records| {
            if records.contains_key(&job.id) {
                return Err(StoreError::Duplicate(job.id.clone()));
            }
            records.insert(
                job.id.clone(),
                Record {
                    job: job.clone(),
                    units: Vec::new(),
                    logs: Vec::new(),
                    usage: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn load_job(&self, id: &str) -> Result<Job, StoreError> {
        self.read(|records| records.get(id).map(|r| r.job.clone()).ok_or_else(|| not_found(id)))
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.write(|records| {
            let record = records.get_mut(&job.id).ok_or_else(|| not_found(&job.id))?;
            record.job = job.clone();
            record.job.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_job<F, E>(&self, id: &str, mutate: F) -> Result<Job, E>
    where
        F: FnOnce(&mut Job) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        self.write(|records| {
            let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
            let mut job = record.job.clone();
            mutate(&mut job)?;
            job.updated_at = Utc::now();
            record.job = job.clone();
            Ok(job)
        })
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.read(|records| records.values().map(|r| r.job.clone()).collect());
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        self.write(|records| records.remove(id).map(|_| ()).ok_or_else(|| not_found(id)))
    }

    async fn save_sub_units(&self, job_id: &str, units: &[SubUnit]) -> Result<(), StoreError> {
        self.write(|records| {
            let record = records.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            record.units = units.to_vec();
            record.units.sort_by_key(|u| u.ordinal);
            Ok(())
        })
    }

    async fn update_sub_unit<F, E>(&self, job_id: &str, ordinal: u32, mutate: F) -> Result<SubUnit, E>
    where
        F: FnOnce(&mut SubUnit) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        self.write(|records| {
            let record = records.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            let slot = unit_mut(&mut record.units, job_id, ordinal)?;
            let mut unit = slot.clone();
            mutate(&mut unit)?;
            unit.updated_at = Utc::now();
            *slot = unit.clone();
            Ok(unit)
        })
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
        self.write(|records| {
            let record = records.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            let mut job = record.job.clone();
            check(&mut job)?;
            let slot = unit_mut(&mut record.units, job_id, ordinal)?;
            let mut unit = slot.clone();
            mutate(&mut unit)?;
            let now = Utc::now();
            unit.updated_at = now;
            job.updated_at = now;
            *slot = unit.clone();
            record.job = job;
            Ok(unit)
        })
    }

    async fn load_sub_units(&self, job_id: &str) -> Result<Vec<SubUnit>, StoreError> {
        self.read(|records| {
            records
                .get(job_id)
                .map(|r| r.units.clone())
                .ok_or_else(|| not_found(job_id))
        })
    }

    async fn append_log(&self, job_id: &str, entry: LogEntry) -> Result<(), StoreError> {
        self.write(|records| {
            let record = records.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            record.logs.push(entry);
            Ok(())
        })
    }

    async fn load_logs(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        self.read(|records| {
            records
                .get(job_id)
                .map(|r| r.logs.clone())
                .ok_or_else(|| not_found(job_id))
        })
    }

    async fn append_usage(&self, job_id: &str, record: UsageRecord) -> Result<(), StoreError> {
        self.write(|records| {
            let entry = records.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            entry.usage.push(record);
            Ok(())
        })
    }

    async fn load_usage(&self, job_id: &str) -> Result<Vec<UsageRecord>, StoreError> {
        self.read(|records| {
            records
                .get(job_id)
                .map(|r| r.usage.clone())
                .ok_or_else(|| not_found(job_id))
        })
    }
}
