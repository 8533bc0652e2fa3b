#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use novelsmith::PipelineSettings;
use novelsmith::error::{OracleError, StoreError};
use novelsmith::gate::{RetryPolicy, Thresholds};
use novelsmith::oracle::{EvaluateRequest, Evaluation, Oracle, ProduceRequest, Scorecard, UsageRecord};
use novelsmith::state_machine::{Job, JobSpec, LogEntry, Phase, RunLease, SubUnit};
use novelsmith::store::{JobStore, MemoryStore};

pub const THREE_UNIT_OUTLINE: &str = "\
A castaway story in three movements.

1) The Storm
The ship breaks apart off a reef.

2) The Island
Survivors argue over water and shelter.

3) The Rescue
A signal fire is finally seen.
";

pub fn spec(units: u32) -> JobSpec {
    JobSpec {
        title: "Salt and Signal".into(),
        theme: "trust under pressure".into(),
        background: "a tropical reef, 1890s".into(),
        target_length: 3_000 * units,
        target_units: units,
    }
}

/// No backoff, three attempts per gate.
pub fn settings() -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
        },
        thresholds: Thresholds::default(),
        lease_ttl: Duration::from_secs(1800),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Degraded,
    Error,
}

type Key = (Phase, Option<u32>);

/// A job edit applied by someone else while a produce call is in flight.
struct Interference {
    key: Key,
    store: Arc<MemoryStore>,
    job_id: String,
    edit: fn(&mut Job),
}

/// Oracle with canned artifacts. Verdicts default to a pass unless one was
/// scripted for the phase and unit.
pub struct ScriptedOracle {
    outline: String,
    verdicts: Mutex<HashMap<Key, VecDeque<Verdict>>>,
    produced: Mutex<Vec<Key>>,
    evaluations: AtomicUsize,
    interference: Mutex<Option<Interference>>,
    hold: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl ScriptedOracle {
    pub fn new(outline: &str) -> Self {
        Self {
            outline: outline.to_string(),
            verdicts: Mutex::new(HashMap::new()),
            produced: Mutex::new(Vec::new()),
            evaluations: AtomicUsize::new(0),
            interference: Mutex::new(None),
            hold: Mutex::new(None),
        }
    }

    pub fn script(self, phase: Phase, unit: Option<u32>, verdicts: &[Verdict]) -> Self {
        self.verdicts
            .lock()
            .unwrap()
            .insert((phase, unit), verdicts.iter().copied().collect());
        self
    }

    /// Applies `edit` to the stored job while the first matching produce
    /// call is in flight.
    pub fn during(
        self,
        phase: Phase,
        unit: Option<u32>,
        store: Arc<MemoryStore>,
        job_id: &str,
        edit: fn(&mut Job),
    ) -> Self {
        *self.interference.lock().unwrap() = Some(Interference {
            key: (phase, unit),
            store,
            job_id: job_id.to_string(),
            edit,
        });
        self
    }

    /// Sets the pause flag while the first matching produce call is in flight.
    pub fn pause_during(self, phase: Phase, unit: Option<u32>, store: Arc<MemoryStore>, job_id: &str) -> Self {
        self.during(phase, unit, store, job_id, |job| job.pause_requested = true)
    }

    /// Hands the run lease to another runner while the first matching produce
    /// call is in flight.
    pub fn steal_lease_during(self, phase: Phase, unit: Option<u32>, store: Arc<MemoryStore>, job_id: &str) -> Self {
        self.during(phase, unit, store, job_id, |job| job.lease = Some(RunLease::new("intruder")))
    }

    /// The first produce call signals `entered`, then waits for `release`.
    pub fn hold(self, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        *self.hold.lock().unwrap() = Some((entered, release));
        self
    }

    pub fn produced(&self) -> Vec<Key> {
        self.produced.lock().unwrap().clone()
    }

    pub fn produced_in(&self, phase: Phase) -> usize {
        self.produced().iter().filter(|(p, _)| *p == phase).count()
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.produced.lock().unwrap().clear();
        self.evaluations.store(0, Ordering::SeqCst);
    }

    fn artifact(&self, phase: Phase, unit: Option<u32>) -> String {
        let n = unit.unwrap_or_default();
        match phase {
            Phase::Setup => "Characters: Mara, a navigator; Ode, a cook.".to_string(),
            Phase::Outline => self.outline.clone(),
            Phase::SubOutline => format!("Plan for unit {n}: open, turn, close."),
            _ => format!("The prose of unit {n}. The tide came in and nobody spoke."),
        }
    }
}

fn card(total: f64, passed: bool) -> Scorecard {
    Scorecard {
        scores: Default::default(),
        total_score: total,
        passed,
        issues: Vec::new(),
        suggestions: Vec::new(),
    }
}

impl Oracle for ScriptedOracle {
    async fn produce(&self, req: ProduceRequest) -> Result<String, OracleError> {
        let key = (req.phase, req.unit);
        self.produced.lock().unwrap().push(key);

        let hold = self.hold.lock().unwrap().take();
        if let Some((entered, release)) = hold {
            entered.notify_one();
            release.notified().await;
        }

        let interference = {
            let mut slot = self.interference.lock().unwrap();
            if slot.as_ref().is_some_and(|i| i.key == key) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(Interference {
            store, job_id, edit, ..
        }) = interference
        {
            store
                .update_job(&job_id, |job| {
                    edit(job);
                    Ok::<_, StoreError>(())
                })
                .await
                .expect("edit job mid-call");
        }

        Ok(self.artifact(req.phase, req.unit))
    }

    async fn evaluate(&self, req: EvaluateRequest) -> Result<Evaluation, OracleError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .get_mut(&(req.phase, req.unit))
            .and_then(VecDeque::pop_front)
            .unwrap_or(Verdict::Pass);
        match verdict {
            Verdict::Pass => Ok(Evaluation::Parsed(card(45.0, true))),
            Verdict::Fail => Ok(Evaluation::Parsed(card(12.0, false))),
            Verdict::Degraded => Ok(Evaluation::Degraded {
                raw: "Reads well to me.".into(),
                reason: "expected value at line 1 column 1".into(),
            }),
            Verdict::Error => Err(OracleError::Empty),
        }
    }
}

/// Memory store whose sub-unit writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_unit_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_unit_writes(&self) {
        self.fail_unit_writes.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_unit_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

impl JobStore for FlakyStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.insert_job(job).await
    }

    async fn load_job(&self, id: &str) -> Result<Job, StoreError> {
        self.inner.load_job(id).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.save_job(job).await
    }

    async fn update_job<F, E>(&self, id: &str, mutate: F) -> Result<Job, E>
    where
        F: FnOnce(&mut Job) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        self.inner.update_job(id, mutate).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.list_jobs().await
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_job(id).await
    }

    async fn save_sub_units(&self, job_id: &str, units: &[SubUnit]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_sub_units(job_id, units).await
    }

    async fn update_sub_unit<F, E>(&self, job_id: &str, ordinal: u32, mutate: F) -> Result<SubUnit, E>
    where
        F: FnOnce(&mut SubUnit) -> Result<(), E> + Send,
        E: From<StoreError> + Send,
    {
        self.check()?;
        self.inner.update_sub_unit(job_id, ordinal, mutate).await
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
        self.check()?;
        self.inner
            .update_sub_unit_with_job(job_id, ordinal, check, mutate)
            .await
    }

    async fn load_sub_units(&self, job_id: &str) -> Result<Vec<SubUnit>, StoreError> {
        self.inner.load_sub_units(job_id).await
    }

    async fn append_log(&self, job_id: &str, entry: LogEntry) -> Result<(), StoreError> {
        self.inner.append_log(job_id, entry).await
    }

    async fn load_logs(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.load_logs(job_id).await
    }

    async fn append_usage(&self, job_id: &str, record: UsageRecord) -> Result<(), StoreError> {
        self.inner.append_usage(job_id, record).await
    }

    async fn load_usage(&self, job_id: &str) -> Result<Vec<UsageRecord>, StoreError> {
        self.inner.load_usage(job_id).await
    }
}
