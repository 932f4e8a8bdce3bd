//! Chat-completions client with provider autodetection.
//!
//! Checks `OPENROUTER_API_KEY`, then `OPENAI_API_KEY`, then
//! `ANTHROPIC_API_KEY`; the first key found selects the provider. Absence
//! of all keys disables LLM invocation and the pipeline stays on its
//! heuristic paths.

use crate::types::LlmError;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenRouter,
    OpenAI,
    Anthropic,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::OpenRouter => write!(f, "OpenRouter"),
            LlmProvider::OpenAI => write!(f, "OpenAI"),
            LlmProvider::Anthropic => write!(f, "Anthropic"),
        }
    }
}

/// Thin chat-completions client. Retry and concurrency policy live in the
/// gateway; this type only shapes requests and classifies failures.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    provider: LlmProvider,
}

impl LlmClient {
    /// Auto-detect the provider from environment variables. Returns `None`
    /// when no API key is set.
    pub fn from_env() -> Option<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .ok()?;

        let detected = [
            (
                "OPENROUTER_API_KEY",
                "OPENROUTER_MODEL",
                "OPENROUTER_BASE_URL",
                "https://openrouter.ai/api/v1",
                "anthropic/claude-sonnet-4",
                LlmProvider::OpenRouter,
            ),
            (
                "OPENAI_API_KEY",
                "CHAT_MODEL",
                "OPENAI_BASE_URL",
                "https://api.openai.com/v1",
                "gpt-4o",
                LlmProvider::OpenAI,
            ),
            (
                "ANTHROPIC_API_KEY",
                "ANTHROPIC_MODEL",
                "ANTHROPIC_BASE_URL",
                "https://api.anthropic.com/v1",
                "claude-sonnet-4-5",
                LlmProvider::Anthropic,
            ),
        ]
        .into_iter()
        .find_map(|(key_var, model_var, base_var, default_base, default_model, provider)| {
            let api_key = std::env::var(key_var).ok()?;
            let model = std::env::var(model_var).unwrap_or_else(|_| default_model.to_string());
            let base_url = std::env::var(base_var).unwrap_or_else(|_| default_base.to_string());
            Some((api_key, model, base_url, provider))
        });

        match detected {
            Some((api_key, model, base_url, provider)) => {
                tracing::info!(
                    "LLM client initialized: provider={} model={}",
                    provider,
                    model
                );
                Some(Self {
                    client,
                    api_key,
                    base_url,
                    model,
                    provider,
                })
            }
            None => {
                tracing::info!("No LLM API key found in environment, LLM invocation disabled");
                None
            }
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    /// One chat completion with a system and user message, returning the
    /// raw text content. `model` overrides the client default when set.
    pub async fn complete(
        &self,
        model: Option<&str>,
        system: &str,
        user: &str,
    ) -> Result<String, LlmError> {
        let model = model.unwrap_or(&self.model);
        let start = std::time::Instant::now();

        let request = match self.provider {
            LlmProvider::Anthropic => {
                let body = serde_json::json!({
                    "model": model,
                    "max_tokens": 4096,
                    "system": system,
                    "messages": [{ "role": "user", "content": user }]
                });
                self.client
                    .post(format!("{}/messages", self.base_url))
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .header("Content-Type", "application/json")
                    .json(&body)
            }
            _ => {
                let body = serde_json::json!({
                    "model": model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ],
                    "max_tokens": 4096,
                    "temperature": 0.3
                });
                self.client
                    .post(format!("{}/chat/completions", self.base_url))
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
            }
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(LlmError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Provider(format!("{status}: {error_text}")));
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        if let Some(usage) = resp_json.get("usage") {
            tracing::debug!(
                "LLM usage: provider={} model={} usage={} latency={:?}",
                self.provider,
                model,
                usage,
                start.elapsed(),
            );
        }

        extract_content(self.provider, &resp_json)
    }
}

fn extract_content(
    provider: LlmProvider,
    resp: &serde_json::Value,
) -> Result<String, LlmError> {
    let content = match provider {
        LlmProvider::Anthropic => resp
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str()),
        _ => resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str()),
    };
    content
        .map(str::to_string)
        .ok_or_else(|| LlmError::Parse("no text content in response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_display() {
        assert_eq!(LlmProvider::OpenRouter.to_string(), "OpenRouter");
        assert_eq!(LlmProvider::OpenAI.to_string(), "OpenAI");
        assert_eq!(LlmProvider::Anthropic.to_string(), "Anthropic");
    }

    #[test]
    fn openai_content_extraction() {
        let resp = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"x\": 1}"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        assert_eq!(
            extract_content(LlmProvider::OpenAI, &resp).unwrap(),
            "{\"x\": 1}"
        );
    }

    #[test]
    fn anthropic_content_extraction() {
        let resp = serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "hello"}
            ]
        });
        assert_eq!(
            extract_content(LlmProvider::Anthropic, &resp).unwrap(),
            "hello"
        );
    }

    #[test]
    fn missing_content_is_a_parse_error() {
        let resp = serde_json::json!({"choices": []});
        assert!(matches!(
            extract_content(LlmProvider::OpenAI, &resp),
            Err(LlmError::Parse(_))
        ));
    }
}
