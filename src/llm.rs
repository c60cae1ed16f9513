// =============================================================================
// LLM Provider — pluggable text generation behind one async trait
// =============================================================================
//
// Everything LLM-driven (AIStrategy, the intervention advisor, the feedback
// loop) goes through `LlmProvider::generate`.  The production implementation
// speaks the OpenAI-compatible chat completions API over reqwest; tests use
// the scripted provider, which replays canned responses and records the
// prompts it saw.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::errors::BotError;

// =============================================================================
// Contract types
// =============================================================================

/// One generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 512,
            temperature: 0.3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// One generation result with accounting for the event log.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cached: bool,
    pub duration_ms: u64,
    pub model: String,
}

/// The provider seam. Implementations must be cheap to share behind an Arc.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, BotError>;

    /// Model identifier for logging.
    fn model_id(&self) -> String;
}

// =============================================================================
// OpenAI-compatible HTTP provider
// =============================================================================

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
}

impl HttpLlmProvider {
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        }
    }

    async fn call_once(&self, request: &LlmRequest) -> Result<LlmResponse, BotError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let started = Instant::now();
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = tokio::time::timeout(request.timeout, req.send())
            .await
            .map_err(|_| BotError::Llm(format!("request timed out after {:?}", request.timeout)))?
            .map_err(|e| BotError::Llm(format!("request failed: {e}")))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BotError::Llm(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            let msg = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown provider error");
            return Err(BotError::Llm(format!("provider returned {status}: {msg}")));
        }

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BotError::Llm("response missing choices[0].message.content".into()))?
            .to_string();

        Ok(LlmResponse {
            text,
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cached: false,
            duration_ms: started.elapsed().as_millis() as u64,
            model: self.model.clone(),
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, BotError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match self.call_once(&request).await {
                Ok(resp) => {
                    debug!(
                        model = %resp.model,
                        duration_ms = resp.duration_ms,
                        attempt,
                        "llm generation complete"
                    );
                    return Ok(resp);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "llm call failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BotError::Llm("no attempts made".into())))
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

// =============================================================================
// Scripted provider (demo mode and tests)
// =============================================================================

/// Replays a queue of canned responses and records every prompt it saw.
/// Used by demo runs without an API key and by unit tests.
pub struct ScriptedLlmProvider {
    responses: Mutex<VecDeque<Result<String, String>>>,
    pub prompts_seen: Mutex<Vec<String>>,
}

impl ScriptedLlmProvider {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts_seen: Mutex::new(Vec::new()),
        }
    }

    /// A provider that always answers with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            responses: Mutex::new(VecDeque::from([Ok(text)])),
            prompts_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, BotError> {
        self.prompts_seen.lock().push(request.prompt.clone());

        let next = {
            let mut q = self.responses.lock();
            // The last entry repeats once the script runs dry.
            if q.len() > 1 {
                q.pop_front()
            } else {
                q.front().cloned()
            }
        };

        match next {
            Some(Ok(text)) => Ok(LlmResponse {
                prompt_tokens: (request.prompt.len() / 4) as u32,
                completion_tokens: (text.len() / 4) as u32,
                text,
                cached: true,
                duration_ms: 0,
                model: "scripted".to_string(),
            }),
            Some(Err(msg)) => Err(BotError::Llm(msg)),
            None => Err(BotError::Llm("script exhausted".into())),
        }
    }

    fn model_id(&self) -> String {
        "scripted".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_provider_replays_and_records() {
        let provider = ScriptedLlmProvider::new(vec![
            Ok("first".to_string()),
            Err("boom".to_string()),
            Ok("last".to_string()),
        ]);

        let r1 = provider.generate(LlmRequest::new("p1")).await.unwrap();
        assert_eq!(r1.text, "first");

        let err = provider.generate(LlmRequest::new("p2")).await.unwrap_err();
        assert!(matches!(err, BotError::Llm(_)));

        // The final entry repeats.
        let r3 = provider.generate(LlmRequest::new("p3")).await.unwrap();
        let r4 = provider.generate(LlmRequest::new("p4")).await.unwrap();
        assert_eq!(r3.text, "last");
        assert_eq!(r4.text, "last");

        assert_eq!(provider.prompts_seen.lock().len(), 4);
    }
}
