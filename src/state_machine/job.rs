use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;
use crate::oracle::{Evaluation, UsageTotals};
use crate::outline::UnitDescriptor;

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Completed` and `Failed` admit no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The coarse stage a job is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    None,
    Setup,
    Outline,
    Content,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::None => write!(f, "-"),
            Stage::Setup => write!(f, "SETUP"),
            Stage::Outline => write!(f, "OUTLINE"),
            Stage::Content => write!(f, "CONTENT"),
        }
    }
}

/// Fine-grained phase tag carried by oracle requests and log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Outline,
    SubOutline,
    Content,
    Pipeline,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Outline => write!(f, "outline"),
            Phase::SubOutline => write!(f, "sub_outline"),
            Phase::Content => write!(f, "content"),
            Phase::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// Immutable inputs of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub title: String,
    pub theme: String,
    pub background: String,
    /// Target length of the whole document, in characters.
    pub target_length: u32,
    pub target_units: u32,
}

impl JobSpec {
    /// Length budget handed to each sub-unit.
    pub fn length_per_unit(&self) -> u32 {
        self.target_length / self.target_units.max(1)
    }
}

/// The last judged artifact of one gated stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSlot {
    pub artifact: Option<String>,
    pub evaluation: Option<Evaluation>,
    pub accepted: bool,
    /// Judged attempts written into this slot, across runs.
    pub attempts: u32,
}

impl ArtifactSlot {
    /// Overwrites the slot with the outcome of one attempt.
    pub fn record(&mut self, artifact: String, evaluation: Option<Evaluation>, accepted: bool) {
        self.artifact = Some(artifact);
        self.evaluation = evaluation;
        self.accepted = accepted;
        self.attempts += 1;
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted && self.artifact.as_deref().is_some_and(|a| !a.trim().is_empty())
    }

    pub fn accepted_artifact(&self) -> Option<&str> {
        if self.is_accepted() {
            self.artifact.as_deref()
        } else {
            None
        }
    }
}

/// Marks the single runner currently allowed to drive a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

impl RunLease {
    pub fn new(owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.into(),
            acquired_at: now,
            heartbeat: now,
        }
    }

    /// A lease whose heartbeat is older than `ttl` belongs to a dead runner.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.heartbeat) >= ttl
    }
}

/// Why a job failed, kept on the job record for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub phase: Phase,
    pub unit: Option<u32>,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, phase: Phase, unit: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            unit,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{} in {} of unit {unit}: {}", self.kind, self.phase, self.message),
            None => write!(f, "{} in {}: {}", self.kind, self.phase, self.message),
        }
    }
}

/// One end-to-end request to produce a complete multi-unit document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub current_stage: Stage,
    pub pause_requested: bool,
    pub setup: ArtifactSlot,
    pub outline: ArtifactSlot,
    pub usage: UsageTotals,
    pub lease: Option<RunLease>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            spec,
            status: JobStatus::Pending,
            current_stage: Stage::None,
            pause_requested: false,
            setup: ArtifactSlot::default(),
            outline: ArtifactSlot::default(),
            usage: UsageTotals::default(),
            lease: None,
            failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Refreshes the lease heartbeat, provided `owner` still holds it.
    pub fn heartbeat(&mut self, owner: &str) -> bool {
        match self.lease.as_mut() {
            Some(lease) if lease.owner == owner => {
                lease.heartbeat = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One decomposed portion of the document (a chapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnit {
    pub ordinal: u32,
    pub title: String,
    pub excerpt: String,
    pub sub_outline: ArtifactSlot,
    pub content: ArtifactSlot,
    /// Characters in the latest content artifact.
    pub length: usize,
    pub status: UnitStatus,
    pub updated_at: DateTime<Utc>,
}

impl From<UnitDescriptor> for SubUnit {
    fn from(descriptor: UnitDescriptor) -> Self {
        Self {
            ordinal: descriptor.ordinal,
            title: descriptor.title,
            excerpt: descriptor.excerpt,
            sub_outline: ArtifactSlot::default(),
            content: ArtifactSlot::default(),
            length: 0,
            status: UnitStatus::Pending,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Append-only audit entry of the generation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub unit: Option<u32>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(phase: Phase, unit: Option<u32>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            phase,
            unit,
            level,
            message: message.into(),
        }
    }

    pub fn info(phase: Phase, unit: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(phase, unit, LogLevel::Info, message)
    }

    pub fn warn(phase: Phase, unit: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(phase, unit, LogLevel::Warning, message)
    }

    pub fn error(phase: Phase, unit: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(phase, unit, LogLevel::Error, message)
    }
}

/// Summary of a job, printed by `status` and at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub title: String,
    pub status: JobStatus,
    pub current_stage: Stage,
    pub units_total: usize,
    pub units_completed: usize,
    pub total_length: usize,
    pub usage: UsageTotals,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobReport {
    pub fn from_job(job: &Job, units: &[SubUnit]) -> Self {
        let completed: Vec<&SubUnit> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Completed)
            .collect();

        Self {
            job_id: job.id.clone(),
            title: job.spec.title.clone(),
            status: job.status,
            current_stage: job.current_stage,
            units_total: units.len(),
            units_completed: completed.len(),
            total_length: completed.iter().map(|u| u.length).sum(),
            usage: job.usage.clone(),
            failure: job.failure.as_ref().map(ToString::to_string),
            created_at: job.created_at,
            completed_at: job.completed_at,
            duration_ms: job
                .completed_at
                .map(|done| (done - job.created_at).num_milliseconds()),
        }
    }
}

/// Job counts by status across the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        jobs.iter().fold(Self::default(), |mut stats, job| {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            stats
        })
    }
}
