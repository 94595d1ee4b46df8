//! Client for the local completion service (text + vision endpoints).
//!
//! The service is opaque: two named chat-completion endpoints on one host,
//! Ollama-compatible. Calls are capped at a configured number of in-flight
//! requests so a handful of busy handlers cannot saturate the local model.
//!
//! Retry policy: one retry on network error; no retry on HTTP 4xx/5xx or on
//! timeout. Timeouts map to [`CompletionError::Timeout`], connection
//! failures to [`CompletionError::Unavailable`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::CompletionConfig;

#[derive(Debug)]
pub enum CompletionError {
    Unavailable(String),
    Timeout(String),
    Api(String),
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionError::Unavailable(e) => write!(f, "completion service unreachable: {}", e),
            CompletionError::Timeout(e) => write!(f, "completion service timed out: {}", e),
            CompletionError::Api(e) => write!(f, "completion service error: {}", e),
        }
    }
}

impl std::error::Error for CompletionError {}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            images: None,
        }
    }
}

/// Liveness report for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompletionHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CompletionClient {
    client: reqwest::Client,
    endpoint: String,
    vision_model: String,
    text_model: String,
    text_timeout: Duration,
    vision_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            vision_model: config.vision_model.clone(),
            text_model: config.text_model.clone(),
            text_timeout: Duration::from_secs(config.text_timeout_secs),
            vision_timeout: Duration::from_secs(config.vision_timeout_secs),
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
        })
    }

    /// Text completion over the configured text model.
    pub async fn text(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        self.chat(&self.text_model, messages, self.text_timeout)
            .await
    }

    /// Vision completion: one prompt plus one base64-encoded image.
    pub async fn vision(
        &self,
        prompt: &str,
        image_base64: &str,
    ) -> Result<String, CompletionError> {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
            images: Some(vec![image_base64.to_string()]),
        }];
        self.chat(&self.vision_model, &messages, self.vision_timeout)
            .await
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, CompletionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| CompletionError::Api(e.to_string()))?;

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": 0.1 },
        });

        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/chat", self.endpoint))
                .timeout(timeout)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(CompletionError::Api(format!("{}: {}", status, text)));
                    }
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| CompletionError::Api(e.to_string()))?;
                    return parse_chat_response(&json);
                }
                Err(e) if e.is_timeout() => {
                    return Err(CompletionError::Timeout(e.to_string()));
                }
                Err(e) => {
                    last_err = Some(CompletionError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CompletionError::Unavailable("no response after retry".to_string())))
    }

    /// Probe the service's model listing. Never errors; reports
    /// online/offline for the health endpoint.
    pub async fn health(&self) -> CompletionHealth {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .timeout(Duration::from_secs(2))
            .send()
            .await;

        match resp {
            Ok(response) if response.status().is_success() => {
                let models = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|json| {
                        json.get("models").and_then(|m| m.as_array()).map(|arr| {
                            arr.iter()
                                .filter_map(|m| {
                                    m.get("name").and_then(|n| n.as_str()).map(String::from)
                                })
                                .collect()
                        })
                    });
                CompletionHealth {
                    status: "online".to_string(),
                    models,
                    error: None,
                }
            }
            Ok(response) => CompletionHealth {
                status: "error".to_string(),
                models: None,
                error: Some(format!("HTTP {}", response.status())),
            },
            Err(e) => CompletionHealth {
                status: "offline".to_string(),
                models: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, CompletionError> {
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(String::from)
        .ok_or_else(|| {
            CompletionError::Api("invalid chat response: missing message.content".to_string())
        })
}
