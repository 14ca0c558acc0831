use std::fmt;

use pitchscore_judge::JudgeError;
use pitchscore_schema::Dimension;
use serde::Serialize;

use crate::validator::PartialRating;

/// Stable name for each way a rating attempt can fail. Used in log lines and
/// backfill reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EmptyTranscript,
    ConversationNotFound,
    JudgeUnavailable,
    JudgeTimeout,
    JudgeError,
    Unparsable,
    OutOfRangeScore,
    IncompleteRating,
    Store,
    LockUnavailable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyTranscript => "empty_transcript",
            Self::ConversationNotFound => "conversation_not_found",
            Self::JudgeUnavailable => "judge_unavailable",
            Self::JudgeTimeout => "judge_timeout",
            Self::JudgeError => "judge_error",
            Self::Unparsable => "unparsable",
            Self::OutOfRangeScore => "out_of_range_score",
            Self::IncompleteRating => "incomplete_rating",
            Self::Store => "store",
            Self::LockUnavailable => "lock_unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RatingError {
    #[error("transcript has no messages")]
    EmptyTranscript,

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error(transparent)]
    Judge(#[from] JudgeError),

    /// The judge answered with something other than a structured object.
    #[error("judge output unparsable: {reason}")]
    Unparsable { reason: String, raw: String },

    #[error("judge scored {dimension}={value}, outside 0-10")]
    OutOfRangeScore {
        dimension: Dimension,
        value: i64,
        raw: String,
    },

    #[error("rating incomplete, missing: {}", join_dimensions(.missing))]
    IncompleteRating {
        missing: Vec<Dimension>,
        partial: PartialRating,
        raw: String,
    },

    #[error("conversation store: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("conversation lock closed")]
    LockUnavailable,
}

fn join_dimensions(dimensions: &[Dimension]) -> String {
    dimensions
        .iter()
        .map(|d| d.field_name())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RatingError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(err.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::EmptyTranscript => FailureKind::EmptyTranscript,
            Self::ConversationNotFound(_) => FailureKind::ConversationNotFound,
            Self::Judge(JudgeError::Unavailable(_)) => FailureKind::JudgeUnavailable,
            Self::Judge(JudgeError::Timeout { .. }) => FailureKind::JudgeTimeout,
            Self::Judge(JudgeError::Rejected { .. }) => FailureKind::JudgeError,
            Self::Unparsable { .. } => FailureKind::Unparsable,
            Self::OutOfRangeScore { .. } => FailureKind::OutOfRangeScore,
            Self::IncompleteRating { .. } => FailureKind::IncompleteRating,
            Self::Store(_) => FailureKind::Store,
            Self::LockUnavailable => FailureKind::LockUnavailable,
        }
    }

    /// Transport-level judge failures only. Everything else would repeat
    /// with the same input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Judge(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// The judge's raw answer, when the failure happened after it replied.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::Unparsable { raw, .. }
            | Self::OutOfRangeScore { raw, .. }
            | Self::IncompleteRating { raw, .. } => Some(raw),
            _ => None,
        }
    }
}
