//! Stage sequencer: drives one job from setup to its last sub-unit.
//!
//! ```text
//! safe point -> Setup gate -> safe point -> Outline gate -> safe point
//!   -> decompose -> for each unit: safe point -> SubOutline gate -> Content gate
//!   -> Completed
//! ```
//!
//! Every attempt is persisted before the loop moves on, and every gate whose
//! slot is already accepted is skipped, so running the same job again picks
//! up where the last run stopped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{FailureKind, OracleError, PipelineError};
use crate::gate::{AttemptReport, GateOutcome, QualityGate, RetryPolicy, Thresholds};
use crate::oracle::{Evaluation, Oracle};
use crate::outline;
use crate::prompts::{self, UnitContext};
use crate::state_machine::{
    Event, Job, JobFailure, JobStatus, LogEntry, LogLevel, Phase, RunLease, Stage, StateMachine,
    SubUnit, UnitStatus,
};
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub thresholds: Thresholds,
    /// A lease whose heartbeat is older than this may be taken over.
    pub lease_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            thresholds: Thresholds::default(),
            lease_ttl: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Start,
    Resume,
}

/// How a run ended. Errors (store failures, lost lease) are reported
/// separately as [`PipelineError`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(JobFailure),
    Paused,
}

pub struct Pipeline<O, S> {
    oracle: Arc<O>,
    store: Arc<S>,
    settings: PipelineSettings,
}

impl<O: Oracle, S: JobStore> Pipeline<O, S> {
    pub fn new(oracle: Arc<O>, store: Arc<S>, settings: PipelineSettings) -> Self {
        Self {
            oracle,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the job until it completes, fails or pauses.
    ///
    /// `cancel` only shortens the wait between gate attempts; an oracle call
    /// already in flight always finishes.
    pub async fn run(
        &self,
        job_id: &str,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let owner = Uuid::new_v4().to_string();
        self.begin(job_id, mode, &owner).await?;

        let run = Run {
            oracle: self.oracle.as_ref(),
            store: self.store.as_ref(),
            settings: &self.settings,
            job_id: job_id.to_string(),
            owner,
            gate: QualityGate::new(self.settings.retry, cancel),
        };
        let span = tracing::info_span!("run", job_id, ?mode);
        async {
            match run.drive(mode).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "run aborted");
                    if matches!(e, PipelineError::Store(_)) {
                        run.abort(&e).await;
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Moves the job to Running and takes the run lease in one write.
    async fn begin(&self, job_id: &str, mode: RunMode, owner: &str) -> Result<Job, PipelineError> {
        let ttl = self.settings.lease_ttl;
        let event = match mode {
            RunMode::Start => Event::Start,
            RunMode::Resume => Event::Resume,
        };
        self.store
            .update_job(job_id, |job| {
                if job.status == JobStatus::Running {
                    let live = job
                        .lease
                        .as_ref()
                        .is_some_and(|lease| !lease.is_stale(ttl, Utc::now()));
                    if live {
                        return Err(PipelineError::AlreadyRunning(job.id.clone()));
                    }
                    tracing::warn!(job_id = %job.id, "taking over a stale run lease");
                }
                StateMachine::apply(job, event)?;
                job.lease = Some(RunLease::new(owner));
                Ok(())
            })
            .await
    }
}

/// Which artifact slot a gate writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Setup,
    Outline,
    SubOutline(u32),
    Content(u32),
}

impl Slot {
    fn phase(self) -> Phase {
        match self {
            Slot::Setup => Phase::Setup,
            Slot::Outline => Phase::Outline,
            Slot::SubOutline(_) => Phase::SubOutline,
            Slot::Content(_) => Phase::Content,
        }
    }

    fn unit(self) -> Option<u32> {
        match self {
            Slot::Setup | Slot::Outline => None,
            Slot::SubOutline(ordinal) | Slot::Content(ordinal) => Some(ordinal),
        }
    }
}

/// Result of one gated step.
enum Step {
    Accepted(String),
    Stop(RunOutcome),
}

/// State of one run while it holds the lease.
struct Run<'a, O, S> {
    oracle: &'a O,
    store: &'a S,
    settings: &'a PipelineSettings,
    job_id: String,
    owner: String,
    gate: QualityGate,
}

impl<O: Oracle, S: JobStore> Run<'_, O, S> {
    async fn drive(&self, mode: RunMode) -> Result<RunOutcome, PipelineError> {
        let started = match mode {
            RunMode::Start => "run started",
            RunMode::Resume => "run resumed",
        };
        self.log(LogEntry::info(Phase::Pipeline, None, started)).await?;

        if self.pause_point("before setup").await? {
            return Ok(RunOutcome::Paused);
        }
        let job = self.enter(Stage::Setup).await?;
        let setup = match job.setup.accepted_artifact() {
            Some(setup) => setup.to_string(),
            None => match self.setup_gate(&job).await? {
                Step::Accepted(setup) => setup,
                Step::Stop(outcome) => return Ok(outcome),
            },
        };

        if self.pause_point("before outline").await? {
            return Ok(RunOutcome::Paused);
        }
        let job = self.enter(Stage::Outline).await?;
        let outline = match job.outline.accepted_artifact() {
            Some(outline) => outline.to_string(),
            None => match self.outline_gate(&job, &setup).await? {
                Step::Accepted(outline) => outline,
                Step::Stop(outcome) => return Ok(outcome),
            },
        };

        if self.pause_point("before decomposition").await? {
            return Ok(RunOutcome::Paused);
        }
        let units = match self.sub_units(&job, &outline).await? {
            Ok(units) => units,
            Err(outcome) => return Ok(outcome),
        };

        let job = self.enter(Stage::Content).await?;
        let mut previous: Option<String> = None;
        for unit in &units {
            if unit.status == UnitStatus::Completed {
                previous = unit.content.accepted_artifact().map(str::to_string);
                continue;
            }
            if self
                .pause_point(&format!("before unit {}", unit.ordinal))
                .await?
            {
                return Ok(RunOutcome::Paused);
            }
            let ctx = UnitContext {
                job: &job,
                unit,
                setup: &setup,
                outline: &outline,
                previous_content: previous.as_deref(),
            };
            match self.run_unit(ctx).await? {
                Step::Accepted(content) => previous = Some(content),
                Step::Stop(outcome) => return Ok(outcome),
            }
        }

        self.update_owned(|job| StateMachine::apply(job, Event::Finish).map(drop))
            .await?;
        self.log(LogEntry::info(
            Phase::Pipeline,
            None,
            format!("job completed with {} units", units.len()),
        ))
        .await?;
        Ok(RunOutcome::Completed)
    }

    async fn setup_gate(&self, job: &Job) -> Result<Step, PipelineError> {
        let oracle = self.oracle;
        let min_total = self.settings.thresholds.setup;
        self.gated(
            Slot::Setup,
            move || oracle.produce(prompts::setup_request(job)),
            move |setup| oracle.evaluate(prompts::setup_check(job, setup, min_total)),
        )
        .await
    }

    async fn outline_gate(&self, job: &Job, setup: &str) -> Result<Step, PipelineError> {
        let oracle = self.oracle;
        let min_total = self.settings.thresholds.outline;
        self.gated(
            Slot::Outline,
            move || oracle.produce(prompts::outline_request(job, setup)),
            move |outline| oracle.evaluate(prompts::outline_check(job, setup, outline, min_total)),
        )
        .await
    }

    /// Loads the sub-units, decomposing the outline first when none exist.
    async fn sub_units(
        &self,
        job: &Job,
        outline: &str,
    ) -> Result<Result<Vec<SubUnit>, RunOutcome>, PipelineError> {
        let existing = self.store.load_sub_units(&self.job_id).await?;
        if !existing.is_empty() {
            return Ok(Ok(existing));
        }

        let descriptors = outline::decompose(outline);
        if descriptors.is_empty() {
            let failure = JobFailure::new(
                FailureKind::EmptyDecomposition,
                Phase::Outline,
                None,
                "the accepted outline has no recognisable unit headers",
            );
            return self.fail(failure).await.map(Err);
        }

        let units: Vec<SubUnit> = descriptors.into_iter().map(SubUnit::from).collect();
        self.update_owned(|_| Ok(())).await?;
        self.store.save_sub_units(&self.job_id, &units).await?;

        let expected = job.spec.target_units as usize;
        if units.len() != expected {
            self.log(LogEntry::warn(
                Phase::Outline,
                None,
                format!("outline has {} units, {expected} were requested", units.len()),
            ))
            .await?;
        }
        self.log(LogEntry::info(
            Phase::Outline,
            None,
            format!("outline decomposed into {} units", units.len()),
        ))
        .await?;
        Ok(Ok(units))
    }

    async fn run_unit(&self, ctx: UnitContext<'_>) -> Result<Step, PipelineError> {
        let ordinal = ctx.unit.ordinal;
        self.update_unit_owned(ordinal, |unit| {
            unit.status = UnitStatus::Running;
            Ok(())
        })
        .await?;
        self.log(LogEntry::info(
            Phase::Pipeline,
            Some(ordinal),
            format!("unit {ordinal} started: {}", ctx.unit.title),
        ))
        .await?;

        let oracle = self.oracle;
        let thresholds = self.settings.thresholds;

        let plan = match ctx.unit.sub_outline.accepted_artifact() {
            Some(plan) => plan.to_string(),
            None => {
                let step = self
                    .gated(
                        Slot::SubOutline(ordinal),
                        move || oracle.produce(prompts::sub_outline_request(ctx)),
                        move |plan| {
                            oracle.evaluate(prompts::sub_outline_check(ctx, plan, thresholds.sub_outline))
                        },
                    )
                    .await?;
                match step {
                    Step::Accepted(plan) => plan,
                    Step::Stop(outcome) => return Ok(Step::Stop(outcome)),
                }
            }
        };

        let content = match ctx.unit.content.accepted_artifact() {
            Some(content) => content.to_string(),
            None => {
                let plan = plan.as_str();
                let step = self
                    .gated(
                        Slot::Content(ordinal),
                        move || oracle.produce(prompts::content_request(ctx, plan)),
                        move |content| {
                            oracle.evaluate(prompts::content_check(ctx, plan, content, thresholds.content))
                        },
                    )
                    .await?;
                match step {
                    Step::Accepted(content) => content,
                    Step::Stop(outcome) => return Ok(Step::Stop(outcome)),
                }
            }
        };

        let length = content.chars().count();
        self.update_unit_owned(ordinal, |unit| {
            unit.status = UnitStatus::Completed;
            unit.length = length;
            Ok(())
        })
        .await?;
        self.log(LogEntry::info(
            Phase::Content,
            Some(ordinal),
            format!("unit {ordinal} completed ({length} characters)"),
        ))
        .await?;
        Ok(Step::Accepted(content))
    }

    /// Runs one quality gate and turns its outcome into the next step.
    async fn gated<P, PF, V, VF>(&self, slot: Slot, produce: P, evaluate: V) -> Result<Step, PipelineError>
    where
        P: FnMut() -> PF,
        PF: Future<Output = Result<String, OracleError>>,
        V: FnMut(String) -> VF,
        VF: Future<Output = Result<Evaluation, OracleError>>,
    {
        let phase = slot.phase();
        let threshold = self.settings.thresholds.for_phase(phase);
        let outcome = self
            .gate
            .pass_or_fail(
                produce,
                evaluate,
                move |report| self.record(slot, report),
                |card| threshold.accepts(card),
            )
            .await?;

        match outcome {
            GateOutcome::Passed {
                artifact, attempts, ..
            } => {
                if attempts > 1 {
                    tracing::info!(%phase, unit = ?slot.unit(), attempts, "accepted after retries");
                }
                Ok(Step::Accepted(artifact))
            }
            GateOutcome::Exhausted { attempts } => {
                if let Some(ordinal) = slot.unit() {
                    self.update_unit_owned(ordinal, |unit| {
                        unit.status = UnitStatus::Failed;
                        Ok(())
                    })
                    .await?;
                }
                let failure = JobFailure::new(
                    FailureKind::GateExhausted,
                    phase,
                    slot.unit(),
                    format!("no acceptable {phase} after {attempts} attempts"),
                );
                self.fail(failure).await.map(Step::Stop)
            }
            GateOutcome::Interrupted { .. } => self
                .observe_pause(&format!("during {phase} retries"))
                .await
                .map(Step::Stop),
        }
    }

    /// Persists one attempt and adds it to the generation log.
    async fn record(&self, slot: Slot, report: AttemptReport) -> Result<(), PipelineError> {
        let max = self.settings.retry.max_attempts.max(1);
        let attempt = report.attempt();
        let (entry, written) = match report {
            AttemptReport::Empty { reason, .. } => (
                LogEntry::new(
                    slot.phase(),
                    slot.unit(),
                    LogLevel::Warning,
                    format!("attempt {attempt}/{max} produced nothing: {reason}"),
                ),
                None,
            ),
            AttemptReport::Unjudged {
                artifact, reason, ..
            } => (
                LogEntry::new(
                    slot.phase(),
                    slot.unit(),
                    LogLevel::Warning,
                    format!("attempt {attempt}/{max} could not be judged: {reason}"),
                ),
                Some((artifact, None, false)),
            ),
            AttemptReport::Judged {
                artifact,
                evaluation,
                accepted,
                ..
            } => {
                let (level, verdict) = match (accepted, evaluation.is_degraded()) {
                    (true, true) => (LogLevel::Warning, "accepted without a usable verdict"),
                    (true, false) => (LogLevel::Info, "accepted"),
                    (false, _) => (LogLevel::Info, "rejected"),
                };
                (
                    LogEntry::new(
                        slot.phase(),
                        slot.unit(),
                        level,
                        format!("attempt {attempt}/{max} {verdict}: {}", evaluation.summary()),
                    ),
                    Some((artifact, Some(evaluation), accepted)),
                )
            }
        };

        if let Some((artifact, evaluation, accepted)) = written {
            self.write_slot(slot, artifact, evaluation, accepted).await?;
        } else {
            self.update_owned(|_| Ok(())).await?;
        }
        self.log(entry).await
    }

    async fn write_slot(
        &self,
        slot: Slot,
        artifact: String,
        evaluation: Option<Evaluation>,
        accepted: bool,
    ) -> Result<(), PipelineError> {
        match slot {
            Slot::Setup => {
                self.update_owned(move |job| {
                    job.setup.record(artifact, evaluation, accepted);
                    Ok(())
                })
                .await?;
            }
            Slot::Outline => {
                self.update_owned(move |job| {
                    job.outline.record(artifact, evaluation, accepted);
                    Ok(())
                })
                .await?;
            }
            Slot::SubOutline(ordinal) => {
                self.update_unit_owned(ordinal, move |unit| {
                    unit.sub_outline.record(artifact, evaluation, accepted);
                    Ok(())
                })
                .await?;
            }
            Slot::Content(ordinal) => {
                self.update_unit_owned(ordinal, move |unit| {
                    unit.length = artifact.chars().count();
                    unit.content.record(artifact, evaluation, accepted);
                    Ok(())
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Checks the persisted pause flag. Returns `true` when the run paused.
    async fn pause_point(&self, at: &str) -> Result<bool, PipelineError> {
        let job = self.store.load_job(&self.job_id).await?;
        if !job.pause_requested {
            return Ok(false);
        }
        self.observe_pause(at).await?;
        Ok(true)
    }

    async fn observe_pause(&self, at: &str) -> Result<RunOutcome, PipelineError> {
        self.update_owned(|job| StateMachine::apply(job, Event::PauseObserved).map(drop))
            .await?;
        self.log(LogEntry::info(Phase::Pipeline, None, format!("paused {at}")))
            .await?;
        Ok(RunOutcome::Paused)
    }

    async fn fail(&self, failure: JobFailure) -> Result<RunOutcome, PipelineError> {
        let event = match failure.kind {
            FailureKind::GateExhausted => Event::GateExhausted,
            FailureKind::EmptyDecomposition | FailureKind::Store => Event::Abort,
        };
        let recorded = failure.clone();
        self.update_owned(move |job| {
            StateMachine::apply(job, event)?;
            job.failure = Some(recorded);
            Ok(())
        })
        .await?;
        self.log(LogEntry::error(failure.phase, failure.unit, failure.to_string()))
            .await?;
        Ok(RunOutcome::Failed(failure))
    }

    /// Best-effort: marks the job Failed after a store error.
    async fn abort(&self, error: &PipelineError) {
        let failure = JobFailure::new(FailureKind::Store, Phase::Pipeline, None, error.to_string());
        let recorded = failure.clone();
        let marked = self
            .update_owned(move |job| {
                StateMachine::apply(job, Event::Abort)?;
                job.failure = Some(recorded);
                Ok(())
            })
            .await;
        if let Err(e) = marked {
            tracing::error!(error = %e, "could not mark job failed");
            return;
        }
        let entry = LogEntry::error(Phase::Pipeline, None, failure.to_string());
        if let Err(e) = self.store.append_log(&self.job_id, entry).await {
            tracing::error!(error = %e, "could not log store failure");
        }
    }

    /// Sets the current stage and refreshes the lease.
    async fn enter(&self, stage: Stage) -> Result<Job, PipelineError> {
        self.update_owned(|job| {
            job.current_stage = stage;
            Ok(())
        })
        .await
    }

    /// Read-modify-write of the job that first checks this run still holds
    /// the lease and refreshes its heartbeat.
    async fn update_owned<F>(&self, mutate: F) -> Result<Job, PipelineError>
    where
        F: FnOnce(&mut Job) -> Result<(), PipelineError> + Send,
    {
        let owner = self.owner.as_str();
        self.store
            .update_job(&self.job_id, move |job| {
                if !job.heartbeat(owner) {
                    return Err(PipelineError::LeaseLost(job.id.clone()));
                }
                mutate(job)
            })
            .await
    }

    /// Sub-unit counterpart of [`Run::update_owned`]: the lease check, the
    /// heartbeat and the unit mutation land in one store write.
    async fn update_unit_owned<F>(&self, ordinal: u32, mutate: F) -> Result<SubUnit, PipelineError>
    where
        F: FnOnce(&mut SubUnit) -> Result<(), PipelineError> + Send,
    {
        let owner = self.owner.as_str();
        self.store
            .update_sub_unit_with_job(
                &self.job_id,
                ordinal,
                move |job| {
                    if !job.heartbeat(owner) {
                        return Err(PipelineError::LeaseLost(job.id.clone()));
                    }
                    Ok(())
                },
                mutate,
            )
            .await
    }

    async fn log(&self, entry: LogEntry) -> Result<(), PipelineError> {
        match entry.level {
            LogLevel::Info => {
                tracing::info!(phase = %entry.phase, unit = ?entry.unit, "{}", entry.message)
            }
            LogLevel::Warning => {
                tracing::warn!(phase = %entry.phase, unit = ?entry.unit, "{}", entry.message)
            }
            LogLevel::Error => {
                tracing::error!(phase = %entry.phase, unit = ?entry.unit, "{}", entry.message)
            }
        }
        self.store.append_log(&self.job_id, entry).await?;
        Ok(())
    }
}
