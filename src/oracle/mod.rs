//! The generative/evaluative oracle as seen by the pipeline.
//!
//! [`Oracle`] is the seam: the pipeline only ever calls `produce` and
//! `evaluate`. [`LlmOracle`] implements it over the Anthropic Messages API.

mod evaluation;
mod llm;
mod usage;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::OracleError;
use crate::state_machine::Phase;

pub use evaluation::{Evaluation, Scorecard, parse_evaluation};
pub use llm::{Endpoint, LlmOracle};
pub use usage::{Operation, UsageRecord, UsageTotals, estimate_cost};

/// A request for a new artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub job_id: String,
    pub phase: Phase,
    pub unit: Option<u32>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// A request to judge `material` against `rubric`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub job_id: String,
    pub phase: Phase,
    pub unit: Option<u32>,
    pub system_prompt: String,
    pub rubric: String,
    pub material: String,
    pub max_output_tokens: u32,
}

pub trait Oracle: Send + Sync {
    /// Produces artifact text. Empty output is reported as [`OracleError::Empty`].
    fn produce(&self, req: ProduceRequest)
    -> impl Future<Output = Result<String, OracleError>> + Send;

    /// Judges an artifact. A reply that is not a scorecard comes back as
    /// [`Evaluation::Degraded`], not as an error.
    fn evaluate(
        &self,
        req: EvaluateRequest,
    ) -> impl Future<Output = Result<Evaluation, OracleError>> + Send;
}
