use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anthropic::Usage;
use crate::state_machine::Phase;

/// Cumulative oracle consumption of one job. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub calls: u64,
}

impl UsageTotals {
    pub fn absorb(&mut self, usage: &Usage, cost_usd: f64) {
        let prompt = u64::from(usage.input_tokens);
        let completion = u64::from(usage.output_tokens);
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
        self.total_tokens += prompt + completion;
        self.cost_usd += cost_usd.max(0.0);
        self.calls += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Produce,
    Evaluate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Produce => write!(f, "produce"),
            Operation::Evaluate => write!(f, "evaluate"),
        }
    }
}

/// One oracle call as it was billed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub operation: Operation,
    pub unit: Option<u32>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

impl UsageRecord {
    pub fn new(
        phase: Phase,
        operation: Operation,
        unit: Option<u32>,
        model: &str,
        usage: &Usage,
        elapsed: Duration,
    ) -> Self {
        let prompt_tokens = u64::from(usage.input_tokens);
        let completion_tokens = u64::from(usage.output_tokens);
        Self {
            at: Utc::now(),
            phase,
            operation,
            unit,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd: estimate_cost(model, usage),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// USD per million tokens, (input, output).
fn rates_for(model: &str) -> (f64, f64) {
    let model = model.to_ascii_lowercase();
    if model.contains("haiku") {
        (1.0, 5.0)
    } else if model.contains("opus") {
        (15.0, 75.0)
    } else {
        // Sonnet pricing doubles as the default for unknown models.
        (3.0, 15.0)
    }
}

/// Estimated cost of one call.
pub fn estimate_cost(model: &str, usage: &Usage) -> f64 {
    let (input_rate, output_rate) = rates_for(model);
    (f64::from(usage.input_tokens) * input_rate + f64::from(usage.output_tokens) * output_rate)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u32, output: u32) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
        }
    }

    #[test]
    fn cost_by_model_family() {
        let u = usage(1_000_000, 1_000_000);
        assert_eq!(estimate_cost("claude-haiku-4-5-20251001", &u), 6.0);
        assert_eq!(estimate_cost("claude-sonnet-4-5-20250929", &u), 18.0);
        assert_eq!(estimate_cost("claude-opus-4-6", &u), 90.0);
        assert_eq!(estimate_cost("something-else", &u), 18.0);
    }

    #[test]
    fn totals_accumulate() {
        let mut totals = UsageTotals::default();
        totals.absorb(&usage(100, 50), 0.25);
        totals.absorb(&usage(10, 5), 0.5);
        assert_eq!(totals.prompt_tokens, 110);
        assert_eq!(totals.completion_tokens, 55);
        assert_eq!(totals.total_tokens, 165);
        assert_eq!(totals.cost_usd, 0.75);
        assert_eq!(totals.calls, 2);
    }

    #[test]
    fn record_carries_tokens_cost_and_duration() {
        let record = UsageRecord::new(
            Phase::Content,
            Operation::Evaluate,
            Some(4),
            "claude-haiku-4-5",
            &usage(2_000, 400),
            Duration::from_millis(1_250),
        );
        assert_eq!(record.total_tokens, 2_400);
        assert!((record.cost_usd - 0.004).abs() < 1e-12);
        assert_eq!(record.duration_ms, 1_250);
        assert_eq!(record.unit, Some(4));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operation"], "evaluate");
        assert_eq!(json["phase"], "content");
    }

    #[test]
    fn negative_cost_is_ignored() {
        let mut totals = UsageTotals::default();
        totals.absorb(&usage(1, 1), -3.0);
        assert_eq!(totals.cost_usd, 0.0);
    }
}
