//! Request/response facade over the pipeline and the store.
//!
//! The CLI talks only to [`Engine`]. Besides forwarding calls it keeps the
//! in-process registry of active runs, so a second `start` in the same
//! process is refused before the persisted lease is even consulted, and a
//! pause request can cut short the wait between retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::export;
use crate::oracle::{Oracle, UsageRecord};
use crate::pipeline::{Pipeline, PipelineSettings, RunMode, RunOutcome};
use crate::state_machine::{Job, JobReport, JobSpec, JobStats, LogEntry, Phase, SubUnit};
use crate::store::JobStore;

type Registry = Mutex<HashMap<String, CancellationToken>>;

pub struct Engine<O, S> {
    pipeline: Pipeline<O, S>,
    store: Arc<S>,
    active: Registry,
}

/// Removes a job from the active registry when its run ends.
struct ActiveRun<'a> {
    registry: &'a Registry,
    job_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl<O: Oracle, S: JobStore> Engine<O, S> {
    pub fn new(oracle: Arc<O>, store: Arc<S>, settings: PipelineSettings) -> Self {
        Self {
            pipeline: Pipeline::new(oracle, Arc::clone(&store), settings),
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the inputs and stores a new Pending job.
    pub async fn create_job(&self, spec: JobSpec) -> Result<Job, PipelineError> {
        if spec.title.trim().is_empty() {
            return Err(PipelineError::InvalidSpec("title must not be empty".into()));
        }
        if spec.theme.trim().is_empty() {
            return Err(PipelineError::InvalidSpec("theme must not be empty".into()));
        }
        if spec.target_units == 0 {
            return Err(PipelineError::InvalidSpec("target units must be at least 1".into()));
        }
        if spec.target_length == 0 {
            return Err(PipelineError::InvalidSpec("target length must be positive".into()));
        }

        let job = Job::new(spec);
        self.store.insert_job(&job).await?;
        self.store
            .append_log(
                &job.id,
                LogEntry::info(Phase::Pipeline, None, format!("job created: {}", job.spec.title)),
            )
            .await?;
        tracing::info!(job_id = %job.id, title = %job.spec.title, "job created");
        Ok(job)
    }

    /// Runs a Pending job until it completes, fails or pauses.
    pub async fn start_job(&self, job_id: &str) -> Result<RunOutcome, PipelineError> {
        self.execute(job_id, RunMode::Start).await
    }

    /// Continues a Paused job, or a Running one whose runner went away.
    pub async fn resume_job(&self, job_id: &str) -> Result<RunOutcome, PipelineError> {
        self.execute(job_id, RunMode::Resume).await
    }

    /// Runs the job on a new task.
    pub fn spawn(
        self: &Arc<Self>,
        job_id: String,
        mode: RunMode,
    ) -> JoinHandle<Result<RunOutcome, PipelineError>>
    where
        O: 'static,
        S: 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.execute(&job_id, mode).await })
    }

    async fn execute(&self, job_id: &str, mode: RunMode) -> Result<RunOutcome, PipelineError> {
        let cancel = CancellationToken::new();
        let _active = self.register(job_id, cancel.clone())?;
        self.pipeline.run(job_id, mode, cancel).await
    }

    fn register(&self, job_id: &str, cancel: CancellationToken) -> Result<ActiveRun<'_>, PipelineError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(job_id) {
            return Err(PipelineError::AlreadyRunning(job_id.to_string()));
        }
        active.insert(job_id.to_string(), cancel);
        Ok(ActiveRun {
            registry: &self.active,
            job_id: job_id.to_string(),
        })
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_id)
    }

    /// Asks the run to stop at its next safe point.
    ///
    /// The flag is persisted, so a run in another process sees it too. A run
    /// in this process also has its retry backoff cut short.
    pub async fn request_pause(&self, job_id: &str) -> Result<Job, PipelineError> {
        let job = self
            .store
            .update_job(job_id, |job| {
                if job.status.is_terminal() {
                    return Err(PipelineError::InvalidState {
                        id: job.id.clone(),
                        status: job.status,
                        action: "pause",
                    });
                }
                job.pause_requested = true;
                Ok(())
            })
            .await?;

        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }

        self.store
            .append_log(job_id, LogEntry::info(Phase::Pipeline, None, "pause requested"))
            .await?;
        tracing::info!(job_id, "pause requested");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, PipelineError> {
        Ok(self.store.load_job(job_id).await?)
    }

    /// Status, stage and unit progress of a job.
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobReport, PipelineError> {
        let job = self.store.load_job(job_id).await?;
        let units = self.store.load_sub_units(job_id).await?;
        Ok(JobReport::from_job(&job, &units))
    }

    pub async fn get_sub_units(&self, job_id: &str) -> Result<Vec<SubUnit>, PipelineError> {
        Ok(self.store.load_sub_units(job_id).await?)
    }

    /// The generation log, oldest first. `limit` keeps only the latest entries.
    pub async fn get_logs(
        &self,
        job_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        let mut logs = self.store.load_logs(job_id).await?;
        if let Some(limit) = limit
            && logs.len() > limit
        {
            logs = logs.split_off(logs.len() - limit);
        }
        Ok(logs)
    }

    /// Every oracle call billed to the job, in call order.
    pub async fn get_usage(&self, job_id: &str) -> Result<Vec<UsageRecord>, PipelineError> {
        Ok(self.store.load_usage(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        Ok(self.store.list_jobs().await?)
    }

    /// Job counts by status across the store.
    pub async fn stats(&self) -> Result<JobStats, PipelineError> {
        let jobs = self.store.list_jobs().await?;
        Ok(JobStats::from_jobs(&jobs))
    }

    /// Deletes a job with its units and log. Refused while a run holds it.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), PipelineError> {
        if self.is_active(job_id) {
            return Err(PipelineError::AlreadyRunning(job_id.to_string()));
        }
        let job = self.store.load_job(job_id).await?;
        let ttl = self.pipeline.settings().lease_ttl;
        let live = job
            .lease
            .as_ref()
            .is_some_and(|lease| !lease.is_stale(ttl, chrono::Utc::now()));
        if live {
            return Err(PipelineError::AlreadyRunning(job_id.to_string()));
        }
        self.store.delete_job(job_id).await?;
        tracing::info!(job_id, "job deleted");
        Ok(())
    }

    /// Writes the finished document into `dir` and returns its path.
    pub async fn export_job(&self, job_id: &str, dir: &Path) -> Result<PathBuf, PipelineError> {
        let job = self.store.load_job(job_id).await?;
        let units = self.store.load_sub_units(job_id).await?;
        let text = export::render_text(&job, &units)?;

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(export::file_name(&job));
        tokio::fs::write(&path, text).await?;
        tracing::info!(job_id, path = %path.display(), "job exported");
        Ok(path)
    }
}
