//! Plain-text rendering of a completed job.

use crate::error::PipelineError;
use crate::state_machine::{Job, JobStatus, SubUnit};

const WIDTH: usize = 60;

/// Renders the finished document: title banner, setting, then every unit.
pub fn render_text(job: &Job, units: &[SubUnit]) -> Result<String, PipelineError> {
    if job.status != JobStatus::Completed {
        return Err(PipelineError::InvalidState {
            id: job.id.clone(),
            status: job.status,
            action: "export",
        });
    }

    let heavy = "=".repeat(WIDTH);
    let light = "-".repeat(WIDTH);
    let mut lines: Vec<String> = vec![
        heavy.clone(),
        centered(&job.spec.title),
        heavy.clone(),
        String::new(),
    ];

    if let Some(setup) = job.setup.artifact.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.extend([
            "[Setting]".to_string(),
            String::new(),
            setup.trim_end().to_string(),
            String::new(),
            heavy.clone(),
            String::new(),
        ]);
    }

    let mut ordered: Vec<&SubUnit> = units.iter().collect();
    ordered.sort_by_key(|u| u.ordinal);
    for unit in ordered {
        lines.push(format!("Chapter {}: {}", unit.ordinal, unit.title));
        lines.push(String::new());
        match unit.content.artifact.as_deref() {
            Some(content) => lines.push(content.trim_end().to_string()),
            None => lines.push("[no content]".to_string()),
        }
        lines.extend([String::new(), light.clone(), String::new()]);
    }

    lines.extend([heavy.clone(), centered("The End"), heavy]);
    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

/// `<title>_<id>.txt`, with anything unsafe in a file name replaced.
pub fn file_name(job: &Job) -> String {
    let title: String = job
        .spec
        .title
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let title = if title.is_empty() { "untitled".to_string() } else { title };
    format!("{title}_{}.txt", job.id)
}

fn centered(text: &str) -> String {
    let len = text.chars().count();
    if len >= WIDTH {
        return text.to_string();
    }
    let pad = (WIDTH - len) / 2;
    format!("{}{text}", " ".repeat(pad))
}
