//! Judge verdicts: a parsed scorecard, or the raw text when it could not be
//! parsed.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Structured score returned by the evaluating oracle.
///
/// `total_score` and `passed` are required; a response missing either is
/// not a scorecard. Per-criterion scores that are not numbers (`"6/10"`) are
/// dropped instead of invalidating the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    #[serde(default, deserialize_with = "numeric_scores")]
    pub scores: BTreeMap<String, f64>,
    pub total_score: f64,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

fn numeric_scores<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(criterion, score)| score.as_f64().map(|score| (criterion, score)))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evaluation {
    Parsed(Scorecard),
    /// The judge answered but the answer was not a scorecard. The raw text
    /// is kept for audit.
    Degraded { raw: String, reason: String },
}

impl Evaluation {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Evaluation::Degraded { .. })
    }

    pub fn scorecard(&self) -> Option<&Scorecard> {
        match self {
            Evaluation::Parsed(card) => Some(card),
            Evaluation::Degraded { .. } => None,
        }
    }

    /// One-line summary used in the generation log.
    pub fn summary(&self) -> String {
        match self {
            Evaluation::Parsed(card) => {
                let mut line = format!(
                    "score {} (judge {})",
                    card.total_score,
                    if card.passed { "passed" } else { "failed" }
                );
                if let Some(issue) = card.issues.first() {
                    line.push_str(&format!("; first issue: {issue}"));
                }
                line
            }
            Evaluation::Degraded { reason, raw } => {
                format!("unparseable verdict ({reason}); raw: {}", preview(raw, 200))
            }
        }
    }
}

/// Parses a judge response into an [`Evaluation`].
///
/// The JSON body may be wrapped in a markdown code fence or surrounded by
/// prose; anything else degrades.
pub fn parse_evaluation(raw: &str) -> Evaluation {
    let body = json_body(raw);
    match serde_json::from_str::<Scorecard>(body) {
        Ok(card) if card.total_score.is_finite() => Evaluation::Parsed(card),
        Ok(_) => Evaluation::Degraded {
            raw: raw.to_string(),
            reason: "total_score is not a finite number".into(),
        },
        Err(e) => Evaluation::Degraded {
            raw: raw.to_string(),
            reason: e.to_string(),
        },
    }
}

fn json_body(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // Skip the info string ("json") up to the end of the fence line.
        let body_start = after_fence.find('\n').map_or(0, |i| i + 1);
        let body = &after_fence[body_start..];
        let body_end = body.find("```").unwrap_or(body.len());
        return body[..body_end].trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(open), Some(close)) if open < close => &trimmed[open..=close],
        _ => trimmed,
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
