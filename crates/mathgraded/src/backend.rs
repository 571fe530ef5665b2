//! Model backend abstraction.
//!
//! Tool handlers build prompts; a `ModelBackend` turns a prompt into model
//! text. Production uses `ChatCompletionsBackend` (OpenAI-compatible HTTP
//! API). Tests and offline runs use `ScriptedBackend` with canned replies.

use async_trait::async_trait;
use mathgrade_shared::config::BackendConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("model backend not configured (set NVIDIA_API_KEY or backend.api_key)")]
    NotConfigured,

    #[error("model request failed: {0}")]
    Http(String),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned an empty completion")]
    EmptyCompletion,

    #[error("{0}")]
    Scripted(String),
}

/// One completion request issued by a tool handler
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Tool that issued the request
    pub tool: String,
    pub model: String,
    pub prompt: String,
    /// Base64 image for vision requests
    pub image_base64: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError>;
}

// ============================================================================
// Chat completions backend (production)
// ============================================================================

pub struct ChatCompletionsBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            warn!("No model API key configured; every tool call will fail until one is set");
        }
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn body(request: &CompletionRequest) -> serde_json::Value {
        let content = match &request.image_base64 {
            Some(image) => serde_json::json!([
                { "type": "text", "text": request.prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{}", image) }
                }
            ]),
            None => serde_json::Value::String(request.prompt.clone()),
        };
        serde_json::json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionsBackend {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        let api_key = self.api_key.as_ref().ok_or(BackendError::NotConfigured)?;

        debug!(tool = %request.tool, model = %request.model, "sending completion request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&Self::body(&request))
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        if text.trim().is_empty() {
            return Err(BackendError::EmptyCompletion);
        }
        Ok(text)
    }
}

// ============================================================================
// Scripted backend (tests, offline runs)
// ============================================================================

/// Canned reply for one completion
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
}

/// Backend replaying canned replies keyed by tool name.
///
/// Replies for a tool are consumed in order; the last one repeats once the
/// script runs out. Tools without a script fail.
pub struct ScriptedBackend {
    replies: HashMap<String, Vec<ScriptedReply>>,
    cursors: Mutex<HashMap<String, usize>>,
    calls: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedBackend {
    pub fn builder() -> ScriptedBackendBuilder {
        ScriptedBackendBuilder::default()
    }

    /// Load replies from a JSON or TOML file mapping tool name to a reply
    /// string or a list of reply strings.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        let contents = std::fs::read_to_string(path)?;
        let script: HashMap<String, OneOrMany> =
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                toml::from_str(&contents)?
            } else {
                serde_json::from_str(&contents)?
            };

        let mut builder = Self::builder();
        for (tool, replies) in script {
            let replies = match replies {
                OneOrMany::One(text) => vec![text],
                OneOrMany::Many(texts) => texts,
            };
            for text in replies {
                builder = builder.reply(&tool, text);
            }
        }
        Ok(builder.build())
    }

    /// Requests seen so far
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.tool == tool)
            .count()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        let tool = request.tool.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request);
        }

        let script = self
            .replies
            .get(&tool)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| BackendError::Scripted(format!("no scripted reply for {}", tool)))?;

        let index = match self.cursors.lock() {
            Ok(mut cursors) => {
                let cursor = cursors.entry(tool).or_insert(0);
                let index = (*cursor).min(script.len() - 1);
                *cursor += 1;
                index
            }
            Err(_) => script.len() - 1,
        };

        match &script[index] {
            ScriptedReply::Text(text) => Ok(text.clone()),
            ScriptedReply::Fail(message) => Err(BackendError::Scripted(message.clone())),
        }
    }
}

#[derive(Default)]
pub struct ScriptedBackendBuilder {
    replies: HashMap<String, Vec<ScriptedReply>>,
}

impl ScriptedBackendBuilder {
    pub fn reply(mut self, tool: &str, text: impl Into<String>) -> Self {
        self.replies
            .entry(tool.to_string())
            .or_default()
            .push(ScriptedReply::Text(text.into()));
        self
    }

    pub fn json(self, tool: &str, value: serde_json::Value) -> Self {
        self.reply(tool, value.to_string())
    }

    pub fn fail(mut self, tool: &str, message: impl Into<String>) -> Self {
        self.replies
            .entry(tool.to_string())
            .or_default()
            .push(ScriptedReply::Fail(message.into()));
        self
    }

    pub fn build(self) -> ScriptedBackend {
        ScriptedBackend {
            replies: self.replies,
            cursors: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}
