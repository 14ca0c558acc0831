use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Judge, JudgeError, JudgeRequest, ProviderErrorKind};

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_JUDGE_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_JUDGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for an OpenAI-compatible judge.
#[derive(Debug, Clone)]
pub struct OpenAiJudgeConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    /// Per-call ceiling enforced by the HTTP client
    pub timeout: Duration,
}

impl OpenAiJudgeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_OPENAI_BASE.to_string(),
            model: DEFAULT_JUDGE_MODEL.to_string(),
            timeout: DEFAULT_JUDGE_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Judge backed by a `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiJudge {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    timeout: Duration,
}

impl OpenAiJudge {
    /// Fails when the HTTP client cannot be built, so a judge never runs
    /// without its configured timeout.
    pub fn new(config: OpenAiJudgeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build judge http client")?;
        Ok(Self {
            client,
            api_key: config.api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model,
            timeout: config.timeout,
        })
    }

    /// The rubric travels as the only message, in the system role.
    pub(crate) fn to_api_request(&self, request: &JudgeRequest) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            messages: vec![ApiMessage {
                role: "system".to_string(),
                content: request.prompt.clone(),
            }],
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl Judge for OpenAiJudge {
    async fn evaluate(&self, request: JudgeRequest) -> Result<String, JudgeError> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = self.to_api_request(&request);

        let resp = self
            .client
            .post(url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| JudgeError::from_transport(e, self.timeout))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| JudgeError::from_transport(e, self.timeout))?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<ApiErrorEnvelope>(&text).ok();
            return Err(classify_api_error(status, parsed));
        }

        let body: ApiResponse =
            serde_json::from_str(&text).map_err(|e| JudgeError::Rejected {
                status: Some(status.as_u16()),
                kind: ProviderErrorKind::Unknown,
                error_type: None,
                message: format!("invalid response body: {e}"),
            })?;
        extract_text(body)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn extract_text(body: ApiResponse) -> Result<String, JudgeError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| JudgeError::Rejected {
            status: None,
            kind: ProviderErrorKind::EmptyResponse,
            error_type: None,
            message: "empty choices".to_string(),
        })?;
    if let Some(reason) = choice.finish_reason.as_deref() {
        if reason == "length" {
            tracing::warn!("judge output hit the token ceiling; response may be truncated");
        }
    }
    Ok(choice.message.content.unwrap_or_default())
}

fn classify_api_error(status: reqwest::StatusCode, parsed: Option<ApiErrorEnvelope>) -> JudgeError {
    let kind = ProviderErrorKind::from_status(status);
    let (error_type, message) = match parsed {
        Some(envelope) => (envelope.error.r#type, envelope.error.message),
        None => (None, status.canonical_reason().unwrap_or("no body").to_string()),
    };

    if kind == ProviderErrorKind::AuthError {
        return JudgeError::Unavailable(format!("auth rejected ({status}): {message}"));
    }

    JudgeError::Rejected {
        status: Some(status.as_u16()),
        kind,
        error_type,
        message,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponse {
    #[serde(default)]
    pub choices: Vec<ApiChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiChoice {
    pub message: ApiAssistantMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiAssistantMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(rename = "type", default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub message: String,
}
