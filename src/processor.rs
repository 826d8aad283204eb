use crate::config::Config;
use crate::llm::{ BackendError, ContextRole, ContextTurn, GenerationBackend, GenerationRequest };
use crate::models::{ Record, RecordFailure };
use log::{ debug, warn };
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("record {id}: {source}")] InvalidRequest {
        id: i64,
        #[source]
        source: BackendError,
    },
    #[error("record {id}: generation failed after {attempts} attempt(s): {source}")] GenerationFailed {
        id: i64,
        attempts: u32,
        #[source]
        source: BackendError,
    },
}

impl ProcessError {
    pub fn id(&self) -> i64 {
        match self {
            ProcessError::InvalidRequest { id, .. } | ProcessError::GenerationFailed { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::InvalidRequest { .. } => "InvalidRequest",
            ProcessError::GenerationFailed { .. } => "GenerationFailed",
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProcessError::InvalidRequest { .. } => 0,
            ProcessError::GenerationFailed { attempts, .. } => *attempts,
        }
    }

    /// The last backend error behind this failure.
    pub fn backend_error(&self) -> &BackendError {
        match self {
            ProcessError::InvalidRequest { source, .. } | ProcessError::GenerationFailed { source, .. } =>
                source,
        }
    }

    pub fn to_failure(&self) -> RecordFailure {
        RecordFailure {
            kind: self.kind().to_string(),
            message: self.backend_error().to_string(),
            attempts: self.attempts(),
        }
    }
}

/// Appends one model turn to a record, retrying transient backend failures.
pub struct TurnProcessor {
    backend: Arc<dyn GenerationBackend>,
    config: Arc<Config>,
    model: String,
}

impl TurnProcessor {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: Arc<Config>, model: impl Into<String>) -> Self {
        Self {
            backend,
            config,
            model: model.into(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn request_for(&self, record: &Record) -> Result<GenerationRequest, BackendError> {
        let prompt = record
            .prompt()
            .ok_or_else(|| BackendError::InvalidRequest("record has no text turn".to_string()))?;

        // A lone turn is always sent as the user prompt.
        let context = if self.config.multi_turn && record.turn_count() > 1 {
            let last_role = record.last_role().unwrap_or_default();
            if ContextRole::from_record_role(last_role) != ContextRole::User {
                return Err(
                    BackendError::InvalidRequest(
                        format!("last turn is from '{}', expected 'user'", last_role)
                    )
                );
            }
            record
                .history()
                .map(|(role, text)| ContextTurn {
                    role: ContextRole::from_record_role(role),
                    content: text.to_string(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(GenerationRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            context,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            top_k: self.config.top_k,
            max_tokens: self.config.max_tokens,
            timeout: self.config.timeout_duration(),
        })
    }

    /// Returns a copy of `record` with the model's reply appended. The input
    /// record is left untouched so callers can still write it on failure.
    pub async fn process(&self, record: &Record) -> Result<Record, ProcessError> {
        let id = record.id;
        let request = self
            .request_for(record)
            .map_err(|source| ProcessError::InvalidRequest { id, source })?;
        let max_attempts = self.config.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.backend.generate(&request).await {
                Ok(response) => {
                    debug!("Record {} answered on attempt {}", id, attempt);
                    let mut output = record.clone();
                    output.error = None;
                    output.push_turn(self.model.clone(), response.text);
                    return Ok(output);
                }
                Err(err) if !err.is_retryable() => {
                    return Err(ProcessError::InvalidRequest { id, source: err });
                }
                Err(err) if attempt >= max_attempts => {
                    return Err(ProcessError::GenerationFailed { id, attempts: attempt, source: err });
                }
                Err(err) => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "Record {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        id,
                        attempt,
                        max_attempts,
                        err,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<String, BackendError>>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(
            &self,
            request: &GenerationRequest
        ) -> Result<GenerationResponse, BackendError> {
            self.seen.lock().unwrap().push(request.clone());
            let reply = self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Server("script exhausted".into())));
            reply.map(|text| GenerationResponse { text })
        }
    }

    fn timeout() -> BackendError {
        BackendError::Timeout(Duration::from_secs(120))
    }

    fn processor(backend: Arc<ScriptedBackend>, config: Config) -> TurnProcessor {
        TurnProcessor::new(backend, Arc::new(config), "m1")
    }

    #[tokio::test]
    async fn appends_model_turn() {
        let backend = ScriptedBackend::new(vec![Ok("hi there".into())]);
        let p = processor(backend.clone(), Config::default());

        let input = Record::new(1, "user", "hello");
        let output = p.process(&input).await.unwrap();

        assert_eq!(
            serde_json::to_string(&output).unwrap(),
            r#"{"id":1,"role":["user","m1"],"text":["hello","hi there"]}"#
        );
        assert_eq!(input.turn_count(), 1);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].prompt, "hello");
        assert_eq!(seen[0].model, "m1");
        assert_eq!(seen[0].top_k, 40);
        assert_eq!(seen[0].timeout, Duration::from_secs(120));
        assert!(seen[0].context.is_empty());
    }

    #[tokio::test]
    async fn uses_last_turn_as_prompt_and_keeps_history() {
        let backend = ScriptedBackend::new(vec![Ok("third".into())]);
        let p = processor(backend.clone(), Config::default());

        let mut input = Record::new(2, "user", "first");
        input.push_turn("m0", "second");
        input.push_turn("user", "follow-up");
        let output = p.process(&input).await.unwrap();

        assert_eq!(output.role[..3], input.role[..]);
        assert_eq!(output.text[..3], input.text[..]);
        assert_eq!(output.text[3], "third");
        assert_eq!(backend.seen.lock().unwrap()[0].prompt, "follow-up");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let backend = ScriptedBackend::new(
            vec![
                Err(timeout()),
                Err(BackendError::Connection("refused".into())),
                Ok("finally".into())
            ]
        );
        let p = processor(backend.clone(), Config::default());

        let output = p.process(&Record::new(3, "user", "q")).await.unwrap();
        assert_eq!(output.text.last().unwrap(), "finally");
        assert_eq!(backend.calls(), 3);

        let seen = backend.seen.lock().unwrap();
        assert!(seen.iter().all(|r| *r == seen[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_exhaust_three_attempts() {
        let backend = ScriptedBackend::new(vec![Err(timeout()), Err(timeout()), Err(timeout())]);
        let p = processor(backend.clone(), Config::default());

        let err = p.process(&Record::new(42, "user", "q")).await.unwrap_err();
        match &err {
            ProcessError::GenerationFailed { id, attempts, source } => {
                assert_eq!(*id, 42);
                assert_eq!(*attempts, 3);
                assert!(matches!(source, BackendError::Timeout(_)));
            }
            other => panic!("expected GenerationFailed, got {:?}", other),
        }
        assert_eq!(backend.calls(), 3);
        assert_eq!(err.to_failure().kind, "GenerationFailed");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_between_attempts() {
        let backend = ScriptedBackend::new(vec![Err(timeout()), Err(timeout()), Ok("ok".into())]);
        let mut config = Config::default();
        config.retry_delay_ms = 1000;
        let p = processor(backend, config);

        let started = tokio::time::Instant::now();
        p.process(&Record::new(1, "user", "q")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn invalid_request_is_not_retried() {
        let backend = ScriptedBackend::new(
            vec![Err(BackendError::InvalidRequest("model not found".into())), Ok("unused".into())]
        );
        let p = processor(backend.clone(), Config::default());

        let err = p.process(&Record::new(5, "user", "q")).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidRequest { id: 5, .. }));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn zero_retry_attempts_makes_a_single_call() {
        let backend = ScriptedBackend::new(vec![Err(timeout()), Ok("unused".into())]);
        let mut config = Config::default();
        config.retry_attempts = 0;
        let p = processor(backend.clone(), config);

        let err = p.process(&Record::new(6, "user", "q")).await.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn multi_turn_sends_history_as_context() {
        let backend = ScriptedBackend::new(vec![Ok("answer".into())]);
        let mut config = Config::default();
        config.multi_turn = true;
        let p = processor(backend.clone(), config);

        let mut input = Record::new(7, "user", "first");
        input.push_turn("llama3", "reply");
        input.push_turn("user", "second");
        p.process(&input).await.unwrap();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].prompt, "second");
        assert_eq!(
            seen[0].context,
            vec![
                ContextTurn { role: ContextRole::User, content: "first".into() },
                ContextTurn { role: ContextRole::Assistant, content: "reply".into() }
            ]
        );
    }

    #[tokio::test]
    async fn multi_turn_rejects_record_ending_with_model_turn() {
        let backend = ScriptedBackend::new(vec![Ok("unused".into())]);
        let mut config = Config::default();
        config.multi_turn = true;
        let p = processor(backend.clone(), config);

        let mut input = Record::new(8, "user", "q");
        input.push_turn("m1", "a");
        let err = p.process(&input).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidRequest { id: 8, .. }));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn multi_turn_sends_lone_turn_as_prompt_whatever_its_role() {
        let backend = ScriptedBackend::new(vec![Ok("answer".into())]);
        let mut config = Config::default();
        config.multi_turn = true;
        let p = processor(backend.clone(), config);

        let output = p.process(&Record::new(10, "system", "seed")).await.unwrap();
        assert_eq!(output.role, vec!["system", "m1"]);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].prompt, "seed");
        assert!(seen[0].context.is_empty());
    }

    #[tokio::test]
    async fn success_clears_previous_annotation() {
        let backend = ScriptedBackend::new(vec![Ok("ok".into())]);
        let p = processor(backend, Config::default());

        let mut input = Record::new(9, "user", "q");
        input.annotate(RecordFailure { kind: "GenerationFailed".into(), message: "x".into(), attempts: 3 });
        let output = p.process(&input).await.unwrap();
        assert!(output.error.is_none());
    }
}
