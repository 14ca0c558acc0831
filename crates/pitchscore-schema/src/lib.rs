use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound of a single dimension score.
pub const MAX_DIMENSION_SCORE: i64 = 10;

/// Fixed ceiling of a rating: five dimensions, ten points each.
pub const MAX_POSSIBLE_SCORE: u32 = 50;

// ============================================================
// Conversations
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// When the message was recorded, if the source kept it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A recorded sales conversation as read from the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Whatever rating is currently stored, possibly partial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<StoredRating>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages,
            rating: None,
        }
    }
}

// ============================================================
// Rubric dimensions
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    Opening,
    Discovery,
    Presentation,
    ObjectionHandling,
    Closing,
}

impl Dimension {
    /// Rubric order. Prompt sections, validation and reporting all follow it.
    pub const ALL: [Dimension; 5] = [
        Dimension::Opening,
        Dimension::Discovery,
        Dimension::Presentation,
        Dimension::ObjectionHandling,
        Dimension::Closing,
    ];

    /// Key used in the judge's output object.
    pub fn field_name(&self) -> &'static str {
        match self {
            Dimension::Opening => "opening",
            Dimension::Discovery => "discovery",
            Dimension::Presentation => "presentation",
            Dimension::ObjectionHandling => "objectionHandling",
            Dimension::Closing => "closing",
        }
    }

    /// Heading used in the rubric prompt.
    pub fn title(&self) -> &'static str {
        match self {
            Dimension::Opening => "OPENING",
            Dimension::Discovery => "DISCOVERY",
            Dimension::Presentation => "PRESENTATION",
            Dimension::ObjectionHandling => "OBJECTION HANDLING",
            Dimension::Closing => "CLOSING",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DimensionScores {
    pub opening: u8,
    pub discovery: u8,
    pub presentation: u8,
    pub objection_handling: u8,
    pub closing: u8,
}

impl DimensionScores {
    pub fn get(&self, dimension: Dimension) -> u8 {
        match dimension {
            Dimension::Opening => self.opening,
            Dimension::Discovery => self.discovery,
            Dimension::Presentation => self.presentation,
            Dimension::ObjectionHandling => self.objection_handling,
            Dimension::Closing => self.closing,
        }
    }

    pub fn set(&mut self, dimension: Dimension, score: u8) {
        match dimension {
            Dimension::Opening => self.opening = score,
            Dimension::Discovery => self.discovery = score,
            Dimension::Presentation => self.presentation = score,
            Dimension::ObjectionHandling => self.objection_handling = score,
            Dimension::Closing => self.closing = score,
        }
    }

    pub fn total(&self) -> u32 {
        Dimension::ALL
            .iter()
            .map(|d| u32::from(self.get(*d)))
            .sum()
    }
}

// ============================================================
// Rating records
// ============================================================

/// A validated, complete rating. Only values of this type are ever written
/// to the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RatingRecord {
    #[serde(flatten)]
    pub scores: DimensionScores,
    pub total_score: u32,
    pub max_possible_score: u32,
    /// Second-person feedback for the salesperson. May be empty; see
    /// [`CompletenessPolicy::require_feedback`].
    pub feedback: String,
    /// Judge model that produced the scores
    pub model: String,
    pub rated_at: DateTime<Utc>,
}

impl RatingRecord {
    /// Builds a record whose total is always the recomputed sum.
    pub fn new(
        scores: DimensionScores,
        feedback: impl Into<String>,
        model: impl Into<String>,
        rated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            total_score: scores.total(),
            max_possible_score: MAX_POSSIBLE_SCORE,
            scores,
            feedback: feedback.into(),
            model: model.into(),
            rated_at,
        }
    }

    pub fn to_stored(&self) -> StoredRating {
        StoredRating {
            opening: Some(i64::from(self.scores.opening)),
            discovery: Some(i64::from(self.scores.discovery)),
            presentation: Some(i64::from(self.scores.presentation)),
            objection_handling: Some(i64::from(self.scores.objection_handling)),
            closing: Some(i64::from(self.scores.closing)),
            total_score: Some(i64::from(self.total_score)),
            max_possible_score: Some(i64::from(self.max_possible_score)),
            feedback: Some(self.feedback.clone()),
            model: Some(self.model.clone()),
            rated_at: Some(self.rated_at),
        }
    }
}

/// A rating as it sits in the store. Records written by older tooling may
/// lack any field, so everything is optional here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredRating {
    #[serde(default)]
    pub opening: Option<i64>,
    #[serde(default)]
    pub discovery: Option<i64>,
    #[serde(default)]
    pub presentation: Option<i64>,
    #[serde(default)]
    pub objection_handling: Option<i64>,
    #[serde(default)]
    pub closing: Option<i64>,
    #[serde(default)]
    pub total_score: Option<i64>,
    #[serde(default)]
    pub max_possible_score: Option<i64>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub rated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletenessPolicy {
    /// Treat a record with blank feedback as incomplete
    #[serde(default)]
    pub require_feedback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncompleteReason {
    MissingDimension(Dimension),
    OutOfRange { dimension: Dimension, value: i64 },
    TotalMismatch { stored: Option<i64>, expected: i64 },
    MissingFeedback,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompleteReason::MissingDimension(d) => write!(f, "missing {d}"),
            IncompleteReason::OutOfRange { dimension, value } => {
                write!(f, "{dimension}={value} out of range")
            }
            IncompleteReason::TotalMismatch { stored, expected } => match stored {
                Some(stored) => write!(f, "totalScore={stored}, expected {expected}"),
                None => write!(f, "missing totalScore (expected {expected})"),
            },
            IncompleteReason::MissingFeedback => f.write_str("missing feedback"),
        }
    }
}

impl StoredRating {
    pub fn dimension(&self, dimension: Dimension) -> Option<i64> {
        match dimension {
            Dimension::Opening => self.opening,
            Dimension::Discovery => self.discovery,
            Dimension::Presentation => self.presentation,
            Dimension::ObjectionHandling => self.objection_handling,
            Dimension::Closing => self.closing,
        }
    }

    /// Everything that keeps this record from counting as a rating. Empty
    /// means the record is complete under `policy`.
    pub fn incomplete_reasons(&self, policy: CompletenessPolicy) -> Vec<IncompleteReason> {
        let mut reasons = Vec::new();
        let mut sum = 0i64;
        let mut all_present = true;

        for dimension in Dimension::ALL {
            match self.dimension(dimension) {
                None => {
                    all_present = false;
                    reasons.push(IncompleteReason::MissingDimension(dimension));
                }
                Some(value) if !(0..=MAX_DIMENSION_SCORE).contains(&value) => {
                    all_present = false;
                    reasons.push(IncompleteReason::OutOfRange { dimension, value });
                }
                Some(value) => sum += value,
            }
        }

        if all_present && self.total_score != Some(sum) {
            reasons.push(IncompleteReason::TotalMismatch {
                stored: self.total_score,
                expected: sum,
            });
        }

        let feedback_blank = self
            .feedback
            .as_deref()
            .map_or(true, |text| text.trim().is_empty());
        if policy.require_feedback && feedback_blank {
            reasons.push(IncompleteReason::MissingFeedback);
        }

        reasons
    }

    pub fn is_complete(&self, policy: CompletenessPolicy) -> bool {
        self.incomplete_reasons(policy).is_empty()
    }

    /// Reads the record back as a [`RatingRecord`] when it passes the
    /// completeness predicate.
    pub fn to_record(&self, policy: CompletenessPolicy) -> Option<RatingRecord> {
        if !self.is_complete(policy) {
            return None;
        }
        let mut scores = DimensionScores::default();
        for dimension in Dimension::ALL {
            let value = self.dimension(dimension)?;
            scores.set(dimension, u8::try_from(value).ok()?);
        }
        Some(RatingRecord {
            total_score: scores.total(),
            max_possible_score: MAX_POSSIBLE_SCORE,
            scores,
            feedback: self.feedback.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            rated_at: self.rated_at.unwrap_or_default(),
        })
    }
}

/// Where a conversation sits in the rating lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingState {
    NeedsEvaluation,
    Rated,
}

impl RatingState {
    pub fn of(rating: Option<&StoredRating>, policy: CompletenessPolicy) -> Self {
        match rating {
            Some(rating) if rating.is_complete(policy) => RatingState::Rated,
            _ => RatingState::NeedsEvaluation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_rating() -> StoredRating {
        StoredRating {
            opening: Some(8),
            discovery: Some(6),
            presentation: Some(7),
            objection_handling: Some(7),
            closing: Some(9),
            total_score: Some(37),
            max_possible_score: Some(50),
            feedback: Some("You opened well.".into()),
            model: Some("gpt-3.5-turbo".into()),
            rated_at: None,
        }
    }

    #[test]
    fn full_rating_is_complete() {
        let rating = full_rating();
        assert!(rating.is_complete(CompletenessPolicy::default()));
        assert_eq!(
            RatingState::of(Some(&rating), CompletenessPolicy::default()),
            RatingState::Rated
        );
    }

    #[test]
    fn missing_rating_needs_evaluation() {
        assert_eq!(
            RatingState::of(None, CompletenessPolicy::default()),
            RatingState::NeedsEvaluation
        );
    }

    #[test]
    fn missing_dimension_is_reported() {
        let mut rating = full_rating();
        rating.presentation = None;
        let reasons = rating.incomplete_reasons(CompletenessPolicy::default());
        assert_eq!(
            reasons,
            vec![IncompleteReason::MissingDimension(Dimension::Presentation)]
        );
    }

    #[test]
    fn wrong_total_is_incomplete() {
        let mut rating = full_rating();
        rating.total_score = Some(40);
        let reasons = rating.incomplete_reasons(CompletenessPolicy::default());
        assert_eq!(
            reasons,
            vec![IncompleteReason::TotalMismatch {
                stored: Some(40),
                expected: 37
            }]
        );
    }

    #[test]
    fn out_of_range_dimension_is_incomplete() {
        let mut rating = full_rating();
        rating.closing = Some(11);
        assert!(!rating.is_complete(CompletenessPolicy::default()));
        assert!(rating.to_record(CompletenessPolicy::default()).is_none());
    }

    #[test]
    fn blank_feedback_only_matters_when_required() {
        let mut rating = full_rating();
        rating.feedback = Some("   ".into());
        assert!(rating.is_complete(CompletenessPolicy::default()));
        let strict = CompletenessPolicy {
            require_feedback: true,
        };
        assert_eq!(
            rating.incomplete_reasons(strict),
            vec![IncompleteReason::MissingFeedback]
        );
    }

    #[test]
    fn record_round_trips_through_stored_form() {
        let mut scores = DimensionScores::default();
        scores.set(Dimension::Opening, 8);
        scores.set(Dimension::Discovery, 6);
        let record = RatingRecord::new(scores, "Good opening.", "gpt-3.5-turbo", Utc::now());
        assert_eq!(record.total_score, 14);
        assert_eq!(record.max_possible_score, MAX_POSSIBLE_SCORE);

        let stored = record.to_stored();
        assert!(stored.is_complete(CompletenessPolicy::default()));
        assert_eq!(stored.to_record(CompletenessPolicy::default()), Some(record));
    }

    #[test]
    fn record_serializes_with_judge_field_names() {
        let record = RatingRecord::new(DimensionScores::default(), "", "m", Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("objectionHandling").is_some());
        assert_eq!(json["maxPossibleScore"], 50);
        assert_eq!(json["totalScore"], 0);
    }

    #[test]
    fn role_parses_from_store_text() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("narrator".parse::<Role>().is_err());
    }
}
