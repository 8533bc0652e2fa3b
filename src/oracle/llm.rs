use std::sync::Arc;
use std::time::Instant;

use super::evaluation::{Evaluation, parse_evaluation};
use super::usage::{Operation, UsageRecord};
use super::{EvaluateRequest, Oracle, ProduceRequest};
use crate::anthropic::{Message, MessageSender, MessagesRequest, MessagesResponse, Usage};
use crate::error::{OracleError, StoreError};
use crate::state_machine::Phase;
use crate::store::JobStore;

/// Sampling temperature of every judge call.
const JUDGE_TEMPERATURE: f32 = 0.3;

/// One Messages client bound to the model it should call.
pub struct Endpoint<S> {
    pub sender: S,
    pub model: String,
}

impl<S> Endpoint<S> {
    pub fn new(sender: S, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
        }
    }
}

/// Where a call was made from, for usage records.
#[derive(Debug, Clone, Copy)]
struct CallSite<'a> {
    job_id: &'a str,
    phase: Phase,
    unit: Option<u32>,
    operation: Operation,
}

/// [`Oracle`] backed by two Messages endpoints: one that writes and one
/// that judges. Every call is added to the job's usage totals and to its
/// per-call usage history; a store failure there fails the call.
pub struct LlmOracle<S, St> {
    generator: Endpoint<S>,
    judge: Endpoint<S>,
    store: Arc<St>,
}

impl<S: MessageSender, St: JobStore> LlmOracle<S, St> {
    pub fn new(generator: Endpoint<S>, judge: Endpoint<S>, store: Arc<St>) -> Self {
        Self {
            generator,
            judge,
            store,
        }
    }

    async fn call(
        &self,
        endpoint: &Endpoint<S>,
        site: CallSite<'_>,
        req: MessagesRequest,
    ) -> Result<String, OracleError> {
        let started = Instant::now();
        let response: MessagesResponse = endpoint.sender.send_message(&req).await?;
        let record = UsageRecord::new(
            site.phase,
            site.operation,
            site.unit,
            &endpoint.model,
            &response.usage,
            started.elapsed(),
        );
        self.account(site.job_id, &response.usage, record).await?;
        Ok(response.text())
    }

    async fn account(&self, job_id: &str, usage: &Usage, record: UsageRecord) -> Result<(), StoreError> {
        let cost = record.cost_usd;
        self.store
            .update_job(job_id, |job| {
                job.usage.absorb(usage, cost);
                Ok::<_, StoreError>(())
            })
            .await
            .inspect_err(|e| tracing::error!(job_id, error = %e, "failed to record oracle usage"))?;
        self.store.append_usage(job_id, record).await
    }
}

impl<S: MessageSender, St: JobStore> Oracle for LlmOracle<S, St> {
    async fn produce(&self, req: ProduceRequest) -> Result<String, OracleError> {
        tracing::debug!(job_id = %req.job_id, phase = %req.phase, unit = ?req.unit, model = %self.generator.model, "produce");
        let request = MessagesRequest {
            model: self.generator.model.clone(),
            max_tokens: req.max_output_tokens,
            system: Some(req.system_prompt),
            temperature: Some(req.temperature),
            messages: vec![Message::user(req.user_prompt)],
        };
        let site = CallSite {
            job_id: &req.job_id,
            phase: req.phase,
            unit: req.unit,
            operation: Operation::Produce,
        };
        let text = self.call(&self.generator, site, request).await?;
        if text.trim().is_empty() {
            return Err(OracleError::Empty);
        }
        Ok(text)
    }

    async fn evaluate(&self, req: EvaluateRequest) -> Result<Evaluation, OracleError> {
        tracing::debug!(job_id = %req.job_id, phase = %req.phase, unit = ?req.unit, model = %self.judge.model, "evaluate");
        let request = MessagesRequest {
            model: self.judge.model.clone(),
            max_tokens: req.max_output_tokens,
            system: Some(req.system_prompt),
            temperature: Some(JUDGE_TEMPERATURE),
            messages: vec![Message::user(format!("{}\n\n{}", req.rubric, req.material))],
        };
        let site = CallSite {
            job_id: &req.job_id,
            phase: req.phase,
            unit: req.unit,
            operation: Operation::Evaluate,
        };
        let raw = self.call(&self.judge, site, request).await?;
        let evaluation = parse_evaluation(&raw);
        if let Evaluation::Degraded { reason, .. } = &evaluation {
            tracing::warn!(job_id = %req.job_id, phase = %req.phase, %reason, "judge reply is not a scorecard");
        }
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::anthropic::{AnthropicError, ContentBlock};
    use crate::state_machine::{Job, JobSpec, Phase};
    use crate::store::MemoryStore;

    /// Replays canned replies and keeps every request it saw.
    struct MockSender {
        replies: Mutex<Vec<Result<String, AnthropicError>>>,
        seen: Mutex<Vec<MessagesRequest>>,
    }

    impl MockSender {
        fn new(replies: Vec<Result<String, AnthropicError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageSender for MockSender {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.seen.lock().unwrap().push(req.clone());
            let reply = self.replies.lock().unwrap().remove(0);
            reply.map(|text| MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text,
                }],
                model: "mock".into(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: 1_000,
                    output_tokens: 500,
                },
            })
        }
    }

    async fn setup(
        generator: Vec<Result<String, AnthropicError>>,
        judge: Vec<Result<String, AnthropicError>>,
    ) -> (LlmOracle<MockSender, MemoryStore>, Arc<MemoryStore>, Job) {
        let store = Arc::new(MemoryStore::new());
        let job = Job::new(JobSpec {
            title: "Usage".into(),
            theme: "t".into(),
            background: "b".into(),
            target_length: 100,
            target_units: 1,
        });
        store.insert_job(&job).await.unwrap();
        let oracle = LlmOracle::new(
            Endpoint::new(MockSender::new(generator), "claude-sonnet-4-5"),
            Endpoint::new(MockSender::new(judge), "claude-haiku-4-5"),
            store.clone(),
        );
        (oracle, store, job)
    }

    fn produce_request(job_id: &str) -> ProduceRequest {
        ProduceRequest {
            job_id: job_id.into(),
            phase: Phase::Setup,
            unit: None,
            system_prompt: "You are a novelist.".into(),
            user_prompt: "Write a setting.".into(),
            temperature: 0.8,
            max_output_tokens: 3000,
        }
    }

    fn evaluate_request(job_id: &str) -> EvaluateRequest {
        EvaluateRequest {
            job_id: job_id.into(),
            phase: Phase::Setup,
            unit: None,
            system_prompt: "You are an editor.".into(),
            rubric: "Score it.".into(),
            material: "The setting.".into(),
            max_output_tokens: 1500,
        }
    }

    #[tokio::test]
    async fn produce_sends_prompt_and_records_usage() {
        let (oracle, store, job) = setup(vec![Ok("A grey harbour.".into())], vec![]).await;

        let text = oracle.produce(produce_request(&job.id)).await.unwrap();
        assert_eq!(text, "A grey harbour.");

        let seen = oracle.generator.sender.seen.lock().unwrap().clone();
        assert_eq!(seen[0].model, "claude-sonnet-4-5");
        assert_eq!(seen[0].system.as_deref(), Some("You are a novelist."));
        assert_eq!(seen[0].max_tokens, 3000);

        let usage = store.load_job(&job.id).await.unwrap().usage;
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.total_tokens, 1_500);
        assert!((usage.cost_usd - 0.0105).abs() < 1e-9);

        let records = store.load_usage(&job.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::Produce);
        assert_eq!(records[0].phase, Phase::Setup);
        assert_eq!(records[0].model, "claude-sonnet-4-5");
        assert_eq!(records[0].total_tokens, 1_500);
    }

    #[tokio::test]
    async fn blank_reply_is_empty_error() {
        let (oracle, _, job) = setup(vec![Ok("   ".into())], vec![]).await;
        assert!(matches!(
            oracle.produce(produce_request(&job.id)).await,
            Err(OracleError::Empty)
        ));
    }

    #[tokio::test]
    async fn transport_error_is_passed_through() {
        let (oracle, store, job) = setup(vec![Err(AnthropicError::Timeout)], vec![]).await;
        assert!(matches!(
            oracle.produce(produce_request(&job.id)).await,
            Err(OracleError::Transport(AnthropicError::Timeout))
        ));
        assert_eq!(store.load_job(&job.id).await.unwrap().usage.calls, 0);
    }

    #[tokio::test]
    async fn evaluate_parses_fenced_scorecard() {
        let reply = "```json\n{\"total_score\": 44, \"passed\": true, \"issues\": [\"pacing\"]}\n```";
        let (oracle, _, job) = setup(vec![], vec![Ok(reply.into())]).await;

        let evaluation = oracle.evaluate(evaluate_request(&job.id)).await.unwrap();
        let card = evaluation.scorecard().unwrap();
        assert_eq!(card.total_score, 44.0);
        assert_eq!(card.issues, vec!["pacing".to_string()]);

        let seen = oracle.judge.sender.seen.lock().unwrap().clone();
        assert_eq!(seen[0].temperature, Some(JUDGE_TEMPERATURE));
        assert_eq!(seen[0].messages[0].content, "Score it.\n\nThe setting.");
    }

    #[tokio::test]
    async fn evaluate_degrades_on_prose() {
        let (oracle, store, job) = setup(vec![], vec![Ok("It is good.".into())]).await;

        let evaluation = oracle.evaluate(evaluate_request(&job.id)).await.unwrap();
        assert!(evaluation.is_degraded());
        assert_eq!(store.load_job(&job.id).await.unwrap().usage.calls, 1);

        let records = store.load_usage(&job.id).await.unwrap();
        assert_eq!(records[0].operation, Operation::Evaluate);
        assert_eq!(records[0].model, "claude-haiku-4-5");
    }

    #[tokio::test]
    async fn usage_store_failure_fails_the_call() {
        let (oracle, store, job) = setup(vec![Ok("text".into())], vec![]).await;
        store.delete_job(&job.id).await.unwrap();
        assert!(matches!(
            oracle.produce(produce_request(&job.id)).await,
            Err(OracleError::Store(StoreError::NotFound(_)))
        ));
    }
}
