pub mod error;
pub mod openai;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{JudgeError, ProviderErrorKind};
pub use openai::{OpenAiJudge, OpenAiJudgeConfig, DEFAULT_JUDGE_MODEL, DEFAULT_OPENAI_BASE};

/// Output token ceiling for one rating call.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 500;

/// Low temperature favors consistent scores over varied prose.
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

/// One call to the external judge.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl JudgeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_limits(mut self, max_output_tokens: u32, temperature: f32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self.temperature = temperature;
        self
    }
}

/// The I/O boundary to the scoring model. Implementations return the raw
/// text exactly as produced; parsing happens elsewhere.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, request: JudgeRequest) -> Result<String, JudgeError>;

    /// Model identifier recorded alongside every rating.
    fn model(&self) -> &str;
}

// ============================================================
// Judge Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JudgeProviderType {
    /// Any OpenAI-compatible chat completions endpoint
    OpenAi,
    /// Canned local response, no network
    Stub,
}

fn default_provider() -> JudgeProviderType {
    JudgeProviderType::OpenAi
}

fn default_model() -> String {
    DEFAULT_JUDGE_MODEL.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeProviderConfig {
    #[serde(default = "default_provider")]
    pub provider: JudgeProviderType,
    #[serde(default = "default_model")]
    pub model: String,
    /// Custom base URL (defaults to the public OpenAI endpoint)
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for JudgeProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_base: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl JudgeProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Build a judge from configuration. Only the given config is read; nothing
/// comes from process-wide state.
pub fn create_judge(config: &JudgeProviderConfig) -> Result<Arc<dyn Judge>> {
    let judge: Arc<dyn Judge> = match config.provider {
        JudgeProviderType::OpenAi => {
            let key = config
                .api_key
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow!("openai judge requires api_key"))?;
            let base_url = config.api_base.as_deref().unwrap_or(DEFAULT_OPENAI_BASE);
            Arc::new(OpenAiJudge::new(
                OpenAiJudgeConfig::new(key)
                    .with_base_url(base_url)
                    .with_model(config.model.clone())
                    .with_timeout(config.timeout()),
            )?)
        }
        JudgeProviderType::Stub => Arc::new(StubJudge::new(config.model.clone())),
    };
    tracing::info!(provider = ?config.provider, model = %config.model, "judge client ready");
    Ok(judge)
}

// ============================================================
// Offline judges
// ============================================================

const STUB_RESPONSE: &str = r#"{"opening":5,"discovery":5,"presentation":5,"objectionHandling":5,"closing":5,"totalScore":25,"maxPossibleScore":50,"feedback":"You kept the conversation moving; ask more discovery questions before presenting."}"#;

/// Always answers with the same mid-band rating. Useful for dry runs.
pub struct StubJudge {
    model: String,
}

impl StubJudge {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[async_trait]
impl Judge for StubJudge {
    async fn evaluate(&self, _request: JudgeRequest) -> Result<String, JudgeError> {
        Ok(STUB_RESPONSE.to_string())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Replays queued responses in order and records every request it saw.
pub struct ScriptedJudge {
    model: String,
    responses: Mutex<VecDeque<Result<String, JudgeError>>>,
    requests: Mutex<Vec<JudgeRequest>>,
}

impl ScriptedJudge {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    pub fn with_error(self, err: JudgeError) -> Self {
        self.push(Err(err));
        self
    }

    pub fn push(&self, response: Result<String, JudgeError>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    pub fn requests(&self) -> Vec<JudgeRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn evaluate(&self, request: JudgeRequest) -> Result<String, JudgeError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.unwrap_or_else(|| Err(JudgeError::Unavailable("no scripted response left".into())))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
