//! HTTP client for the LLM endpoint.
//!
//! One operation: `call(system_prompt, user_prompt) -> String` against an
//! OpenAI-compatible chat-completions API. Transport failures are retried a
//! bounded number of times with a linear back-off; everything after the raw
//! string — extraction, normalization, validation — belongs to the agents.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::errors::EngineError;

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries.max(1),
        })
    }

    /// One model invocation. Retries transport-level failures with a linear
    /// back-off of 1 s × attempt.
    pub async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, EngineError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            match self.try_call(system_prompt, user_prompt).await {
                Ok(content) => return Ok(content),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        warn!(attempt, error = %last_error, "llm call failed, retrying");
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        Err(EngineError::LlmUnavailable { reason: last_error })
    }

    async fn try_call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, EngineError> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_prompt,
        });

        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::LlmUnavailable {
                reason: "response carried no choices".into(),
            })?;

        debug!(chars = content.len(), "llm response received");
        Ok(content)
    }
}

/// Extract the first JSON object from a model response.
///
/// Tolerates code-fence decoration and leading prose: finds the first `{`
/// and matches braces with a depth counter.
pub fn extract_json(response: &str) -> Option<&str> {
    let bytes = response.as_bytes();
    let start = response.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&response[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
