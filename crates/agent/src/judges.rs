//! Bounded judge fan-out
//!
//! Conversations are scored by several external judge models in parallel.
//! Each call is a bounded task with its own timeout; a slow or failing judge
//! never blocks the others, and the pipeline treats its result as absent.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use cpq_scribe::{ChatMessage, LlmBackend};

/// One judge's result
#[derive(Debug)]
pub struct JudgeOutcome {
    pub model: String,
    /// Raw judge response; `None` when the call failed or timed out
    pub response: Option<String>,
}

/// Run every judge over the same prompt with bounded parallelism
pub async fn run_judges(
    judges: &[Arc<dyn LlmBackend>],
    system_prompt: &str,
    user_prompt: &str,
    timeout: Duration,
    max_parallel: usize,
) -> Vec<JudgeOutcome> {
    let messages = [
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_prompt),
    ];

    stream::iter(judges.iter().cloned())
        .map(|judge| {
            let messages = messages.clone();
            async move {
                let model = judge.model_name().to_string();
                let response = match tokio::time::timeout(timeout, judge.generate(&messages)).await
                {
                    Ok(Ok(text)) => Some(text),
                    Ok(Err(e)) => {
                        tracing::warn!(model = %model, error = %e, "judge call failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(model = %model, "judge call timed out");
                        None
                    }
                };
                JudgeOutcome { model, response }
            }
        })
        .buffer_unordered(max_parallel.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cpq_scribe::ScribeError;

    struct FakeJudge {
        name: String,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl LlmBackend for FakeJudge {
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<String, ScribeError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(ScribeError::Api("judge exploded".into()))
            } else {
                Ok(format!("{{\"score\": 90, \"judge\": \"{}\"}}", self.name))
            }
        }

        fn model_name(&self) -> &str {
            &self.name
        }
    }

    fn judge(name: &str, delay_ms: u64, fail: bool) -> Arc<dyn LlmBackend> {
        Arc::new(FakeJudge {
            name: name.into(),
            delay: Duration::from_millis(delay_ms),
            fail,
        })
    }

    #[tokio::test]
    async fn test_all_judges_complete() {
        let judges = vec![judge("a", 1, false), judge("b", 1, false), judge("c", 1, false)];
        let outcomes = run_judges(&judges, "sys", "user", Duration::from_secs(1), 3).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.response.is_some()));
    }

    #[tokio::test]
    async fn test_failed_and_slow_judges_do_not_block_others() {
        let judges = vec![
            judge("fast", 1, false),
            judge("broken", 1, true),
            judge("slow", 500, false),
        ];
        let outcomes = run_judges(&judges, "sys", "user", Duration::from_millis(50), 3).await;
        assert_eq!(outcomes.len(), 3);
        let ok: Vec<&JudgeOutcome> = outcomes.iter().filter(|o| o.response.is_some()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].model, "fast");
    }
}
