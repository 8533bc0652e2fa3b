//! Generate-until-acceptable loop shared by every stage.
//!
//! A [`QualityGate`] drives one `(produce, evaluate)` pair for at most
//! `max_attempts` attempts. Each judged attempt is handed to `record` before
//! the pass predicate is tested, so a crash never loses an artifact the
//! judge has already seen.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{OracleError, StoreError};
use crate::oracle::{Evaluation, Scorecard};
use crate::state_machine::Phase;

/// Bounded retry with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per gate invocation, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Pass predicate over a parsed scorecard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreThreshold {
    pub min_total: f64,
    /// Also require the judge's own `passed` verdict.
    pub require_recommendation: bool,
}

impl ScoreThreshold {
    pub fn accepts(&self, card: &Scorecard) -> bool {
        card.total_score >= self.min_total && (!self.require_recommendation || card.passed)
    }
}

/// Minimum total score per gated phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub setup: f64,
    pub outline: f64,
    /// Sub-unit plans are judged on four criteria instead of five.
    pub sub_outline: f64,
    pub content: f64,
    pub require_recommendation: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            setup: 40.0,
            outline: 40.0,
            sub_outline: 32.0,
            content: 40.0,
            require_recommendation: true,
        }
    }
}

impl Thresholds {
    pub fn for_phase(&self, phase: Phase) -> ScoreThreshold {
        let min_total = match phase {
            Phase::Setup => self.setup,
            Phase::Outline => self.outline,
            Phase::SubOutline => self.sub_outline,
            Phase::Content | Phase::Pipeline => self.content,
        };
        ScoreThreshold {
            min_total,
            require_recommendation: self.require_recommendation,
        }
    }
}

/// What happened in one attempt, handed to the gate's `record` callback.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptReport {
    /// Produce failed or returned blank text; nothing was judged.
    Empty { attempt: u32, reason: String },
    /// The artifact exists but the judge could not be reached.
    Unjudged {
        attempt: u32,
        artifact: String,
        reason: String,
    },
    Judged {
        attempt: u32,
        artifact: String,
        evaluation: Evaluation,
        accepted: bool,
    },
}

impl AttemptReport {
    pub fn attempt(&self) -> u32 {
        match self {
            AttemptReport::Empty { attempt, .. }
            | AttemptReport::Unjudged { attempt, .. }
            | AttemptReport::Judged { attempt, .. } => *attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Passed {
        artifact: String,
        evaluation: Evaluation,
        attempts: u32,
    },
    /// Every attempt failed.
    Exhausted { attempts: u32 },
    /// The wait before the next attempt was cancelled.
    Interrupted { attempts: u32 },
}

pub struct QualityGate {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl QualityGate {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// Runs the attempt loop.
    ///
    /// A degraded evaluation passes: the judge answered, it just did not
    /// answer in a shape that can be scored. Errors from `record` abort the
    /// loop and are returned as-is, and so do store failures inside an
    /// oracle call.
    pub async fn pass_or_fail<P, PF, V, VF, R, RF, A, E>(
        &self,
        mut produce: P,
        mut evaluate: V,
        mut record: R,
        accept: A,
    ) -> Result<GateOutcome, E>
    where
        P: FnMut() -> PF,
        PF: Future<Output = Result<String, OracleError>>,
        V: FnMut(String) -> VF,
        VF: Future<Output = Result<Evaluation, OracleError>>,
        R: FnMut(AttemptReport) -> RF,
        RF: Future<Output = Result<(), E>>,
        A: Fn(&Scorecard) -> bool,
        E: From<StoreError>,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.wait(self.policy.delay_for_attempt(attempt - 1)).await {
                tracing::info!(attempt, "gate interrupted while waiting to retry");
                return Ok(GateOutcome::Interrupted {
                    attempts: attempt - 1,
                });
            }

            let artifact = match produce().await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => {
                    record(AttemptReport::Empty {
                        attempt,
                        reason: OracleError::Empty.to_string(),
                    })
                    .await?;
                    continue;
                }
                Err(OracleError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "produce failed");
                    record(AttemptReport::Empty {
                        attempt,
                        reason: e.to_string(),
                    })
                    .await?;
                    continue;
                }
            };

            let evaluation = match evaluate(artifact.clone()).await {
                Ok(evaluation) => evaluation,
                Err(OracleError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "evaluate failed");
                    record(AttemptReport::Unjudged {
                        attempt,
                        artifact,
                        reason: e.to_string(),
                    })
                    .await?;
                    continue;
                }
            };

            let accepted = evaluation.scorecard().is_none_or(|card| accept(card));
            record(AttemptReport::Judged {
                attempt,
                artifact: artifact.clone(),
                evaluation: evaluation.clone(),
                accepted,
            })
            .await?;

            if accepted {
                return Ok(GateOutcome::Passed {
                    artifact,
                    evaluation,
                    attempts: attempt,
                });
            }
        }

        tracing::warn!(attempts = max_attempts, "gate exhausted its retry budget");
        Ok(GateOutcome::Exhausted {
            attempts: max_attempts,
        })
    }

    /// Sleeps for `delay`; returns `false` if cancelled first.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
