//! Bounded-concurrency, retrying, schema-validated LLM access.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use super::client::LlmClient;
use crate::types::LlmError;

/// An agent: a role prompt, an optional model override, and the name of the
/// schema its output must satisfy.
#[derive(Debug, Clone, Copy)]
pub struct AgentSpec {
    pub name: &'static str,
    pub instructions: &'static str,
    pub model: Option<&'static str>,
    pub schema_name: &'static str,
}

/// Gateway over a chat-completions provider.
///
/// A process-wide semaphore bounds parallel in-flight calls. Retryable
/// failures (rate limits, timeouts, transport errors, parse and schema
/// failures) back off exponentially; the final attempt switches to the
/// configured fallback model when one is set.
pub struct LlmGateway {
    client: Option<LlmClient>,
    fallback_model: Option<String>,
    semaphore: Arc<Semaphore>,
    attempts: u32,
    base_delay: Duration,
}

impl LlmGateway {
    pub fn new(client: Option<LlmClient>, max_concurrent: usize) -> Self {
        Self {
            client,
            fallback_model: None,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }

    /// Build from the environment: provider autodetection plus the optional
    /// `FALLBACK_MODEL` override.
    pub fn from_env(max_concurrent: usize) -> Self {
        let mut gateway = Self::new(LlmClient::from_env(), max_concurrent);
        if let Ok(model) = std::env::var("FALLBACK_MODEL") {
            if !model.trim().is_empty() {
                gateway.fallback_model = Some(model);
            }
        }
        gateway
    }

    /// A gateway with no provider; every `run` returns `LlmError::Disabled`.
    pub fn disabled() -> Self {
        Self::new(None, 1)
    }

    pub fn with_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Run an agent on a prompt and coerce its output into `T`.
    ///
    /// Holds a semaphore permit for the whole call, including retries, so
    /// the per-process concurrency cap is honored end to end.
    pub async fn run<T: DeserializeOwned>(
        &self,
        spec: &AgentSpec,
        prompt: &str,
    ) -> Result<T, LlmError> {
        let client = self.client.as_ref().ok_or(LlmError::Disabled)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Provider("semaphore closed".to_string()))?;

        let mut delay = self.base_delay;
        let mut last_error: Option<LlmError> = None;

        for attempt in 1..=self.attempts {
            // Final attempt falls back to the configured model, if any.
            let model = if attempt == self.attempts {
                self.fallback_model.as_deref().or(spec.model)
            } else {
                spec.model
            };

            let result = match client.complete(model, spec.instructions, prompt).await {
                Ok(raw) => parse_structured::<T>(spec.schema_name, &raw),
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.attempts => {
                    let wait = match &error {
                        LlmError::RateLimited { retry_after_ms } => {
                            delay.max(Duration::from_millis(*retry_after_ms))
                        }
                        _ => delay,
                    };
                    tracing::warn!(
                        "{} attempt {}/{} failed ({}); retrying in {:?}",
                        spec.name,
                        attempt,
                        self.attempts,
                        error,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    delay *= 2;
                    last_error = Some(error);
                }
                Err(error) => {
                    if error.is_retryable() {
                        // Retryable but out of attempts.
                        return Err(LlmError::Exhausted {
                            attempts: self.attempts,
                            last: error.to_string(),
                        });
                    }
                    return Err(error);
                }
            }
        }

        Err(LlmError::Exhausted {
            attempts: self.attempts,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Coerce raw model text into the declared schema. Non-JSON text is a
/// `Parse` error; valid JSON of the wrong shape is a `SchemaValidation`
/// error. Both are retryable.
fn parse_structured<T: DeserializeOwned>(
    schema_name: &'static str,
    raw: &str,
) -> Result<T, LlmError> {
    let json_text = extract_json(raw);
    let value: serde_json::Value =
        serde_json::from_str(json_text).map_err(|e| LlmError::Parse(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| LlmError::SchemaValidation {
        schema: schema_name,
        message: e.to_string(),
    })
}

/// Models often wrap JSON in markdown fences or prose; take the outermost
/// braced region when the text is not bare JSON.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed;
    }
    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if end >= start => &trimmed[start..=end],
        _ => trimmed,
    }
}
