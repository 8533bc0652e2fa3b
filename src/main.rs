mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use novelsmith::anthropic::AnthropicClient;
use novelsmith::config::{AppConfig, DEFAULT_API_BASE, DEFAULT_MODEL, OraclePurpose};
use novelsmith::logging::init_logging;
use novelsmith::oracle::{Endpoint, LlmOracle};
use novelsmith::state_machine::JobSpec;
use novelsmith::store::FileStore;
use novelsmith::ui::{self, RunProgress};
use novelsmith::{Engine, RunMode};

type AppEngine = Engine<LlmOracle<AnthropicClient, FileStore>, FileStore>;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store.clone() {
        config.store_dir = store;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.retry.max_attempts = max_attempts.max(1);
    }

    let store = Arc::new(
        FileStore::open(&config.store_dir)
            .await
            .with_context(|| format!("cannot open store at {}", config.store_dir.display()))?,
    );

    match cli.command {
        Command::Create {
            title,
            theme,
            background,
            length,
            units,
            start,
        } => {
            let engine = if start {
                build_engine(&config, store)?
            } else {
                offline_engine(&config, store)?
            };
            let job = engine
                .create_job(JobSpec {
                    title,
                    theme,
                    background,
                    target_length: length,
                    target_units: units,
                })
                .await?;
            println!("{}", job.id);
            if start {
                drive(&engine, &job.id, RunMode::Start).await?;
            }
        }
        Command::Start { job_id } => {
            let engine = build_engine(&config, store)?;
            drive(&engine, &job_id, RunMode::Start).await?;
        }
        Command::Resume { job_id } => {
            let engine = build_engine(&config, store)?;
            drive(&engine, &job_id, RunMode::Resume).await?;
        }
        command => {
            // Commands below never call the oracle, so they work without credentials.
            let engine = offline_engine(&config, store)?;
            run_offline(&engine, &config, command).await?;
        }
    }

    Ok(())
}

async fn run_offline(engine: &AppEngine, config: &AppConfig, command: Command) -> Result<()> {
    match command {
        Command::Pause { job_id } => {
            let job = engine.request_pause(&job_id).await?;
            println!("pause requested for {} ({})", job.id, job.status);
        }
        Command::Status { job_id, json } => {
            let report = engine.get_job_status(&job_id).await?;
            if json {
                ui::print_report_json(&report);
            } else {
                ui::print_report(&report);
            }
        }
        Command::Units { job_id } => ui::print_units(&engine.get_sub_units(&job_id).await?),
        Command::Logs { job_id, tail } => ui::print_logs(&engine.get_logs(&job_id, tail).await?),
        Command::Export { job_id, out } => {
            let dir = out.unwrap_or_else(|| config.export_dir.clone());
            let path = engine.export_job(&job_id, &dir).await?;
            println!("{}", path.display());
        }
        Command::Usage { job_id } => ui::print_usage(&engine.get_usage(&job_id).await?),
        Command::List => ui::print_jobs(&engine.list_jobs().await?),
        Command::Stats { json } => {
            let stats = engine.stats().await?;
            if json {
                ui::print_stats_json(&stats);
            } else {
                ui::print_stats(&stats);
            }
        }
        Command::Delete { job_id } => {
            engine.delete_job(&job_id).await?;
            println!("deleted {job_id}");
        }
        Command::Create { .. } | Command::Start { .. } | Command::Resume { .. } => {
            anyhow::bail!("this command needs an oracle");
        }
    }
    Ok(())
}

fn build_engine(config: &AppConfig, store: Arc<FileStore>) -> Result<Arc<AppEngine>> {
    let timeout = config.oracle_timeout();
    let endpoint = |purpose: OraclePurpose| -> Result<Endpoint<AnthropicClient>> {
        let profile = config.profile_for(purpose)?;
        tracing::debug!(profile = %profile.name, model = %profile.model, ?purpose, "oracle profile resolved");
        let client = AnthropicClient::with_base_url(profile.api_key.clone(), profile.api_base.clone(), timeout)?;
        Ok(Endpoint::new(client, profile.model.clone()))
    };
    let oracle = LlmOracle::new(
        endpoint(OraclePurpose::Generation)?,
        endpoint(OraclePurpose::Check)?,
        Arc::clone(&store),
    );
    Ok(Arc::new(Engine::new(
        Arc::new(oracle),
        store,
        config.pipeline_settings(),
    )))
}

/// Engine for commands that only read or flag jobs. Its oracle has no key
/// and is never called.
fn offline_engine(config: &AppConfig, store: Arc<FileStore>) -> Result<Arc<AppEngine>> {
    let endpoint = || -> Result<Endpoint<AnthropicClient>> {
        let client = AnthropicClient::with_base_url(
            String::new(),
            DEFAULT_API_BASE.to_string(),
            config.oracle_timeout(),
        )?;
        Ok(Endpoint::new(client, DEFAULT_MODEL))
    };
    let oracle = LlmOracle::new(endpoint()?, endpoint()?, Arc::clone(&store));
    Ok(Arc::new(Engine::new(
        Arc::new(oracle),
        store,
        config.pipeline_settings(),
    )))
}

/// Runs a job on its own task, showing progress until it ends. Ctrl-C
/// requests a pause instead of killing the process.
async fn drive(engine: &Arc<AppEngine>, job_id: &str, mode: RunMode) -> Result<()> {
    let title = engine.get_job(job_id).await?.spec.title;
    let progress = RunProgress::start(&title);
    let mut run = engine.spawn(job_id.to_string(), mode);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut pause_sent = false;

    let result = loop {
        tokio::select! {
            joined = &mut run => break joined.context("run task panicked")?,
            _ = &mut ctrl_c, if !pause_sent => {
                pause_sent = true;
                match engine.request_pause(job_id).await {
                    Ok(_) => progress.note("pause requested; waiting for the current step to finish"),
                    Err(e) => progress.note(&format!("could not request pause: {e}")),
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if let Ok(report) = engine.get_job_status(job_id).await {
                    progress.update(&report);
                }
            }
        }
    };

    match result {
        Ok(outcome) => {
            progress.complete(&outcome);
            ui::print_report(&engine.get_job_status(job_id).await?);
            Ok(())
        }
        Err(e) => {
            progress.abort(&e);
            Err(e.into())
        }
    }
}
