mod job;
mod state;

pub use job::{
    ArtifactSlot, Job, JobFailure, JobReport, JobSpec, JobStats, JobStatus, LogEntry, LogLevel,
    Phase, RunLease, Stage, SubUnit, UnitStatus,
};
pub use state::{Event, StateMachine};
