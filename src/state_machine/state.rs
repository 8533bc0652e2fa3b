use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus, Stage};
use crate::error::PipelineError;

/// Events that move a job between statuses.
///
/// ```text
/// Pending --Start--> Running --Finish--> Completed
///                    Running --GateExhausted/Abort--> Failed
///                    Running --PauseObserved--> Paused --Resume--> Running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Start,
    /// Re-enters a paused job, or a running one whose runner died.
    Resume,
    PauseObserved,
    GateExhausted,
    /// Unrecoverable error outside the gates (store failure).
    Abort,
    Finish,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Start => write!(f, "start"),
            Event::Resume => write!(f, "resume"),
            Event::PauseObserved => write!(f, "pause"),
            Event::GateExhausted => write!(f, "gate failure"),
            Event::Abort => write!(f, "abort"),
            Event::Finish => write!(f, "finish"),
        }
    }
}

/// Applies status transitions to a `Job`.
pub struct StateMachine;

impl StateMachine {
    /// Computes the status reached from `from` on `event`, or `None` when
    /// the transition is not allowed.
    pub fn next(from: JobStatus, event: Event) -> Option<JobStatus> {
        match (from, event) {
            (JobStatus::Pending, Event::Start) => Some(JobStatus::Running),
            (JobStatus::Paused | JobStatus::Running, Event::Resume) => Some(JobStatus::Running),
            (JobStatus::Running, Event::PauseObserved) => Some(JobStatus::Paused),
            (JobStatus::Running, Event::GateExhausted | Event::Abort) => Some(JobStatus::Failed),
            (JobStatus::Running, Event::Finish) => Some(JobStatus::Completed),
            _ => None,
        }
    }

    /// Applies `event` to the job, updating the fields tied to the new status.
    pub fn apply(job: &mut Job, event: Event) -> Result<JobStatus, PipelineError> {
        let next = Self::next(job.status, event).ok_or(PipelineError::InvalidTransition {
            from: job.status,
            event,
        })?;

        match event {
            Event::Start | Event::Resume => {
                job.pause_requested = false;
            }
            Event::Finish => {
                job.completed_at = Some(Utc::now());
                job.current_stage = Stage::None;
                job.lease = None;
            }
            Event::PauseObserved | Event::GateExhausted | Event::Abort => {
                job.lease = None;
            }
        }
        job.status = next;
        Ok(next)
    }
}
