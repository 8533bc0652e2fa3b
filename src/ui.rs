//! Interface de terminal do novelsmith: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente a
//! execução de um job no terminal, consultando o armazenamento.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::oracle::UsageRecord;
use crate::pipeline::RunOutcome;
use crate::state_machine::{
    Job, JobReport, JobStats, JobStatus, LogEntry, LogLevel, SubUnit, UnitStatus,
};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e pausa (amarelo).
pub struct RunProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    palette: Palette,
}

impl RunProgress {
    /// Inicia o spinner com o título do job.
    pub fn start(title: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("starting: {title}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            palette: Palette::new(),
        }
    }

    /// Atualiza a mensagem do spinner a partir do relatório mais recente.
    pub fn update(&self, report: &JobReport) {
        let units = if report.units_total > 0 {
            format!(" | units {}/{}", report.units_completed, report.units_total)
        } else {
            String::new()
        };
        self.pb.set_message(format!(
            "{} {}{units} | {} tokens",
            report.status, report.current_stage, report.usage.total_tokens
        ));
    }

    /// Imprime uma linha acima do spinner sem interrompê-lo.
    pub fn note(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.palette.yellow.apply_to("!")));
    }

    /// Finaliza o spinner e exibe o resultado da execução.
    pub fn complete(&self, outcome: &RunOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            RunOutcome::Completed => {
                println!("  {} Job completed", self.palette.green.apply_to("✓"));
            }
            RunOutcome::Paused => {
                println!("  {} Job paused; resume it to continue", self.palette.yellow.apply_to("‖"));
            }
            RunOutcome::Failed(failure) => {
                println!("  {} Job failed: {failure}", self.palette.red.apply_to("✗"));
            }
        }
    }

    /// Finaliza o spinner após um erro que interrompeu a execução.
    pub fn abort(&self, error: &dyn std::fmt::Display) {
        self.pb.finish_and_clear();
        println!("  {} Run aborted: {error}", self.palette.red.apply_to("✗"));
    }
}

struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn status(&self, status: JobStatus) -> &Style {
        match status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            JobStatus::Paused => &self.yellow,
            JobStatus::Pending | JobStatus::Running => &self.dim,
        }
    }
}

/// Imprime o relatório de um job.
pub fn print_report(report: &JobReport) {
    let palette = Palette::new();
    println!(
        "{}  {}",
        palette.status(report.status).apply_to(format!("[{}]", report.status)),
        report.title
    );
    println!("  id:       {}", report.job_id);
    println!("  stage:    {}", report.current_stage);
    println!(
        "  units:    {}/{} completed, {} characters",
        report.units_completed, report.units_total, report.total_length
    );
    println!(
        "  usage:    {} tokens in {} calls, ${:.4}",
        report.usage.total_tokens, report.usage.calls, report.usage.cost_usd
    );
    if let Some(ms) = report.duration_ms {
        println!("  duration: {:.1}s", ms as f64 / 1000.0);
    }
    if let Some(failure) = &report.failure {
        println!("  {} {failure}", palette.red.apply_to("failure:"));
    }
}

/// Imprime o relatório formatado em JSON.
pub fn print_report_json(report: &JobReport) {
    println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
}

pub fn print_jobs(jobs: &[Job]) {
    let palette = Palette::new();
    if jobs.is_empty() {
        println!("{}", palette.dim.apply_to("no jobs"));
        return;
    }
    for job in jobs {
        println!(
            "{}  {:<10} {}  {}",
            job.id,
            palette.status(job.status).apply_to(job.status.to_string()),
            job.created_at.format("%Y-%m-%d %H:%M"),
            job.spec.title
        );
    }
}

pub fn print_units(units: &[SubUnit]) {
    let palette = Palette::new();
    if units.is_empty() {
        println!("{}", palette.dim.apply_to("no units yet; the outline has not been decomposed"));
        return;
    }
    for unit in units {
        let style = match unit.status {
            UnitStatus::Completed => &palette.green,
            UnitStatus::Failed => &palette.red,
            UnitStatus::Running => &palette.yellow,
            UnitStatus::Pending => &palette.dim,
        };
        println!(
            "{:>3}. {:<10} {:>7} chars  {}",
            unit.ordinal,
            style.apply_to(unit.status.to_string()),
            unit.length,
            unit.title
        );
    }
}

pub fn print_logs(entries: &[LogEntry]) {
    let palette = Palette::new();
    for entry in entries {
        let level = match entry.level {
            LogLevel::Info => palette.dim.apply_to(entry.level.to_string()),
            LogLevel::Warning => palette.yellow.apply_to(entry.level.to_string()),
            LogLevel::Error => palette.red.apply_to(entry.level.to_string()),
        };
        let unit = entry.unit.map(|u| format!(" #{u}")).unwrap_or_default();
        println!(
            "{} {:<5} {}{unit}: {}",
            entry.at.format("%H:%M:%S"),
            level,
            entry.phase,
            entry.message
        );
    }
}

/// Imprime as contagens de jobs por status.
pub fn print_stats(stats: &JobStats) {
    let palette = Palette::new();
    println!("  total:     {}", stats.total);
    println!("  pending:   {}", palette.dim.apply_to(stats.pending));
    println!("  running:   {}", palette.dim.apply_to(stats.running));
    println!("  paused:    {}", palette.yellow.apply_to(stats.paused));
    println!("  completed: {}", palette.green.apply_to(stats.completed));
    println!("  failed:    {}", palette.red.apply_to(stats.failed));
}

pub fn print_stats_json(stats: &JobStats) {
    println!("{}", serde_json::to_string_pretty(stats).unwrap_or_default());
}

/// Imprime uma linha por chamada ao oráculo e o total ao final.
pub fn print_usage(records: &[UsageRecord]) {
    let palette = Palette::new();
    if records.is_empty() {
        println!("{}", palette.dim.apply_to("no oracle calls recorded"));
        return;
    }
    for record in records {
        let unit = record.unit.map(|u| format!(" #{u}")).unwrap_or_default();
        println!(
            "{} {:<8} {}{unit:<4} {:>7} tokens  ${:.4}  {:>6}ms  {}",
            record.at.format("%H:%M:%S"),
            record.operation,
            record.phase,
            record.total_tokens,
            record.cost_usd,
            record.duration_ms,
            palette.dim.apply_to(&record.model)
        );
    }
    let tokens: u64 = records.iter().map(|r| r.total_tokens).sum();
    let cost: f64 = records.iter().map(|r| r.cost_usd).sum();
    println!("  {} calls, {tokens} tokens, ${cost:.4}", records.len());
}
