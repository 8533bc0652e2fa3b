mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use common::{ScriptedOracle, THREE_UNIT_OUTLINE, Verdict, settings, spec};
use novelsmith::anthropic::Usage;
use novelsmith::error::{PipelineError, StoreError};
use novelsmith::oracle::{Operation, UsageRecord};
use novelsmith::state_machine::{JobSpec, JobStatus, Phase};
use novelsmith::store::{FileStore, JobStore, MemoryStore};
use novelsmith::{Engine, RunMode, RunOutcome};

fn engine(oracle: ScriptedOracle) -> Arc<Engine<ScriptedOracle, MemoryStore>> {
    Arc::new(Engine::new(
        Arc::new(oracle),
        Arc::new(MemoryStore::new()),
        settings(),
    ))
}

#[tokio::test]
async fn create_job_validates_the_spec() {
    let engine = engine(ScriptedOracle::new(THREE_UNIT_OUTLINE));

    let cases = [
        JobSpec { title: "  ".into(), ..spec(3) },
        JobSpec { theme: String::new(), ..spec(3) },
        JobSpec { target_units: 0, ..spec(3) },
        JobSpec { target_length: 0, ..spec(3) },
    ];
    for case in cases {
        let err = engine.create_job(case).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSpec(_)), "{err}");
    }
    assert!(engine.list_jobs().await.unwrap().is_empty());

    let job = engine.create_job(spec(3)).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    let logs = engine.get_logs(&job.id, None).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].message.starts_with("job created"));
}

#[tokio::test]
async fn completed_job_reports_and_exports() {
    let engine = engine(ScriptedOracle::new(THREE_UNIT_OUTLINE));
    let job = engine.create_job(spec(3)).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let err = engine.export_job(&job.id, dir.path()).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { action: "export", .. }));

    assert_eq!(engine.start_job(&job.id).await.unwrap(), RunOutcome::Completed);

    let report = engine.get_job_status(&job.id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.units_total, 3);
    assert_eq!(report.units_completed, 3);
    assert!(report.total_length > 0);
    assert!(report.duration_ms.is_some());

    let tail = engine.get_logs(&job.id, Some(2)).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert!(tail[1].message.contains("completed with 3 units"));

    let path = engine.export_job(&job.id, dir.path()).await.unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().ends_with(&format!("_{}.txt", job.id)));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("Salt and Signal"));
    assert!(text.contains("Chapter 1: The Storm"));
    assert!(text.contains("Chapter 3: The Rescue"));
    assert!(text.find("Chapter 2").unwrap() < text.find("Chapter 3").unwrap());
    assert!(text.trim_end().contains("The End"));
}

#[tokio::test]
async fn second_start_in_process_is_refused_while_running() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let engine = engine(
        ScriptedOracle::new(THREE_UNIT_OUTLINE).hold(Arc::clone(&entered), Arc::clone(&release)),
    );
    let job = engine.create_job(spec(3)).await.unwrap();

    let run = engine.spawn(job.id.clone(), RunMode::Start);
    entered.notified().await;
    assert!(engine.is_active(&job.id));

    let err = engine.start_job(&job.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning(_)));
    let err = engine.delete_job(&job.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning(_)));

    release.notify_one();
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Completed);
    assert!(!engine.is_active(&job.id));
}

#[tokio::test]
async fn pause_request_interrupts_the_retry_wait() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let oracle = ScriptedOracle::new(THREE_UNIT_OUTLINE)
        .script(Phase::Setup, None, &[Verdict::Fail])
        .hold(Arc::clone(&entered), Arc::clone(&release));
    let mut slow = settings();
    slow.retry.base_delay_ms = 60_000;
    let engine = Arc::new(Engine::new(Arc::new(oracle), Arc::new(MemoryStore::new()), slow));
    let job = engine.create_job(spec(3)).await.unwrap();

    let run = engine.spawn(job.id.clone(), RunMode::Start);
    entered.notified().await;
    let flagged = engine.request_pause(&job.id).await.unwrap();
    assert!(flagged.pause_requested);
    release.notify_one();

    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Paused);
    assert_eq!(engine.get_job(&job.id).await.unwrap().status, JobStatus::Paused);

    assert_eq!(engine.resume_job(&job.id).await.unwrap(), RunOutcome::Completed);
    let job = engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.setup.attempts, 2);
}

#[tokio::test]
async fn finished_jobs_refuse_pause_and_can_be_deleted() {
    let engine = engine(ScriptedOracle::new(THREE_UNIT_OUTLINE));
    let job = engine.create_job(spec(3)).await.unwrap();
    engine.start_job(&job.id).await.unwrap();

    let err = engine.request_pause(&job.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidState { status: JobStatus::Completed, action: "pause", .. }
    ));

    engine.delete_job(&job.id).await.unwrap();
    let err = engine.get_job(&job.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(StoreError::NotFound(_))));
    assert!(engine.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn file_store_keeps_a_run_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let engine = Engine::new(
        Arc::new(ScriptedOracle::new(THREE_UNIT_OUTLINE)),
        Arc::clone(&store),
        settings(),
    );
    let job = engine.create_job(spec(3)).await.unwrap();
    assert_eq!(engine.start_job(&job.id).await.unwrap(), RunOutcome::Completed);
    drop(engine);

    let reopened = FileStore::open(dir.path()).await.unwrap();
    let stored = reopened.load_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.setup.is_accepted());
    let units = reopened.load_sub_units(&job.id).await.unwrap();
    assert_eq!(units.len(), 3);
    assert!(units.iter().all(|u| u.content.is_accepted()));
    assert!(reopened.load_logs(&job.id).await.unwrap().len() >= 8);
}

#[tokio::test]
async fn stats_count_jobs_by_status() {
    let oracle = ScriptedOracle::new(THREE_UNIT_OUTLINE).script(
        Phase::Setup,
        None,
        &[Verdict::Fail, Verdict::Fail, Verdict::Fail],
    );
    let engine = engine(oracle);
    assert_eq!(engine.stats().await.unwrap().total, 0);

    let failed = engine.create_job(spec(3)).await.unwrap();
    assert!(matches!(engine.start_job(&failed.id).await.unwrap(), RunOutcome::Failed(_)));
    let pending = engine.create_job(spec(3)).await.unwrap();
    engine.start_job(&pending.id).await.unwrap();
    engine.create_job(spec(2)).await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 0);
}

#[tokio::test]
async fn usage_history_is_read_back_per_job() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(
        Arc::new(ScriptedOracle::new(THREE_UNIT_OUTLINE)),
        Arc::clone(&store),
        settings(),
    );
    let job = engine.create_job(spec(3)).await.unwrap();
    assert!(engine.get_usage(&job.id).await.unwrap().is_empty());

    let usage = Usage {
        input_tokens: 800,
        output_tokens: 200,
    };
    let record = UsageRecord::new(
        Phase::Outline,
        Operation::Produce,
        None,
        "claude-sonnet-4-5",
        &usage,
        Duration::from_millis(900),
    );
    store.append_usage(&job.id, record.clone()).await.unwrap();

    assert_eq!(engine.get_usage(&job.id).await.unwrap(), vec![record]);
    let err = engine.get_usage("missing").await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(StoreError::NotFound(_))));
}
