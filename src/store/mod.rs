//! Durable record of jobs, their sub-units, generation logs and per-call
//! oracle usage.
//!
//! The store is the single source of truth for a run. Every mutation of a
//! job goes through [`JobStore::update_job`], a read-modify-write applied
//! atomically to one record, so the pipeline and the oracle's usage
//! accounting never overwrite each other.

mod file;
mod memory;

use std::future::Future;

use crate::error::StoreError;
use crate::oracle::UsageRecord;
use crate::state_machine::{Job, LogEntry, SubUnit};

pub use file::FileStore;
pub use memory::MemoryStore;

pub trait JobStore: Send + Sync {
    /// Stores a new job. Fails with [`StoreError::Duplicate`] if the id exists.
    fn insert_job(&self, job: &Job) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_job(&self, id: &str) -> impl Future<Output = Result<Job, StoreError>> + Send;

    /// Replaces the whole job record.
    fn save_job(&self, job: &Job) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Loads the job, applies `mutate` and saves the result as one atomic
    /// step. Nothing is written when `mutate` returns an error.
    fn update_job<F, E>(
        &self,
        id: &str,
        mutate: F,
    ) -> impl Future<Output = Result<Job, E>> + Send
    where
        F: FnOnce(&mut Job) -> Result<(), E> + Send,
        E: From<StoreError> + Send;

    /// All jobs, newest first.
    fn list_jobs(&self) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;

    /// Removes the job with its sub-units and log.
    fn delete_job(&self, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Persists the decomposed sub-units of a job as one batch.
    fn save_sub_units(
        &self,
        job_id: &str,
        units: &[SubUnit],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Read-modify-write of a single sub-unit.
    fn update_sub_unit<F, E>(
        &self,
        job_id: &str,
        ordinal: u32,
        mutate: F,
    ) -> impl Future<Output = Result<SubUnit, E>> + Send
    where
        F: FnOnce(&mut SubUnit) -> Result<(), E> + Send,
        E: From<StoreError> + Send;

    /// Read-modify-write of a sub-unit together with its job, as one atomic
    /// step. `check` runs against the job first; nothing is written when
    /// either closure returns an error.
    fn update_sub_unit_with_job<G, F, E>(
        &self,
        job_id: &str,
        ordinal: u32,
        check: G,
        mutate: F,
    ) -> impl Future<Output = Result<SubUnit, E>> + Send
    where
        G: FnOnce(&mut Job) -> Result<(), E> + Send,
        F: FnOnce(&mut SubUnit) -> Result<(), E> + Send,
        E: From<StoreError> + Send;

    /// Sub-units ordered by ordinal; empty before decomposition.
    fn load_sub_units(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<SubUnit>, StoreError>> + Send;

    fn append_log(
        &self,
        job_id: &str,
        entry: LogEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Log entries in the order they were appended.
    fn load_logs(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<LogEntry>, StoreError>> + Send;

    fn append_usage(
        &self,
        job_id: &str,
        record: UsageRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Usage records in call order.
    fn load_usage(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<UsageRecord>, StoreError>> + Send;
}
