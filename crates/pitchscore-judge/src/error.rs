use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider-side classification of a rejected judge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    AuthError,
    InvalidRequest,
    EmptyResponse,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::AuthError => "auth_error",
            Self::InvalidRequest => "invalid_request",
            Self::EmptyResponse => "empty_response",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single judge call. The adapter never retries; callers decide
/// using [`JudgeError::is_retryable`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeError {
    /// Transport, network or credential failure
    #[error("judge unavailable [retryable]: {0}")]
    Unavailable(String),

    #[error("judge timed out after {}ms [retryable]", .after.as_millis())]
    Timeout { after: Duration },

    /// The provider answered but refused or could not serve the request.
    #[error("judge error ({kind}{}): {message}", status_suffix(.status))]
    Rejected {
        status: Option<u16>,
        kind: ProviderErrorKind,
        /// Provider's own error type string, kept verbatim for diagnostics
        error_type: Option<String>,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(", status {s}")).unwrap_or_default()
}

impl JudgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }

    pub(crate) fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout { after: timeout }
        } else if err.is_connect() {
            Self::Unavailable(format!("connect: {err}"))
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::FORBIDDEN),
            ProviderErrorKind::AuthError
        );
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::UNPROCESSABLE_ENTITY),
            ProviderErrorKind::InvalidRequest
        );
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::BAD_GATEWAY),
            ProviderErrorKind::ServerError
        );
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::IM_A_TEAPOT),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(JudgeError::Unavailable("down".into()).is_retryable());
        assert!(JudgeError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        let rejected = JudgeError::Rejected {
            status: Some(429),
            kind: ProviderErrorKind::RateLimit,
            error_type: Some("rate_limit_error".into()),
            message: "slow down".into(),
        };
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn rejected_message_keeps_classification() {
        let err = JudgeError::Rejected {
            status: Some(400),
            kind: ProviderErrorKind::InvalidRequest,
            error_type: Some("invalid_request_error".into()),
            message: "max_tokens too large".into(),
        };
        let text = err.to_string();
        assert!(text.contains("invalid_request"));
        assert!(text.contains("status 400"));
        assert!(text.contains("max_tokens too large"));
    }
}
