//! Parse and validate the judge's raw answer.
//!
//! The judge is untrusted: scores must be present and within 0-10, the total
//! is always recomputed, and the maximum is always 50. Nothing is clamped and
//! nothing missing is defaulted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pitchscore_schema::{
    Dimension, DimensionScores, RatingRecord, MAX_DIMENSION_SCORE, MAX_POSSIBLE_SCORE,
};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::RatingError;

/// Whatever could be read from a judge answer, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartialRating {
    pub scores: BTreeMap<Dimension, i64>,
    pub reported_total: Option<i64>,
    pub reported_max: Option<i64>,
    pub feedback: Option<String>,
}

impl PartialRating {
    pub fn missing_dimensions(&self) -> Vec<Dimension> {
        Dimension::ALL
            .into_iter()
            .filter(|d| !self.scores.contains_key(d))
            .collect()
    }
}

/// Non-fatal oddities in an otherwise valid answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    TotalMismatch { reported: i64, computed: u32 },
    MaxScoreOverridden { reported: i64 },
    EmptyFeedback,
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::TotalMismatch { reported, computed } => {
                write!(f, "judge totalScore {reported} replaced by recomputed {computed}")
            }
            Anomaly::MaxScoreOverridden { reported } => {
                write!(f, "judge maxPossibleScore {reported} replaced by {MAX_POSSIBLE_SCORE}")
            }
            Anomaly::EmptyFeedback => f.write_str("judge returned no feedback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRating {
    pub record: RatingRecord,
    pub anomalies: Vec<Anomaly>,
}

impl ValidatedRating {
    pub fn feedback_missing(&self) -> bool {
        self.anomalies.contains(&Anomaly::EmptyFeedback)
    }
}

/// Read the first JSON object out of the judge's text. Judges sometimes wrap
/// the object in prose or a markdown fence, so every `{` is tried in turn.
pub fn extract_object(raw: &str) -> Result<Map<String, Value>, RatingError> {
    let mut last_error = None;

    for (start, _) in raw.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(map))) => return Ok(map),
            Some(Ok(_)) => {}
            Some(Err(e)) => last_error = Some(e.to_string()),
            None => {}
        }
    }

    Err(RatingError::Unparsable {
        reason: last_error.map_or_else(
            || "no JSON object found".to_string(),
            |e| format!("invalid JSON: {e}"),
        ),
        raw: raw.to_string(),
    })
}

/// Integers, integral floats and integer strings count; anything else is
/// treated as absent.
pub fn coerce_score(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Steps 1 and 2: structure and per-field coercion, no judgement yet.
pub fn parse_judge_output(raw: &str) -> Result<PartialRating, RatingError> {
    let object = extract_object(raw)?;

    let mut partial = PartialRating::default();
    for dimension in Dimension::ALL {
        if let Some(score) = object.get(dimension.field_name()).and_then(coerce_score) {
            partial.scores.insert(dimension, score);
        }
    }
    partial.reported_total = object.get("totalScore").and_then(coerce_score);
    partial.reported_max = object.get("maxPossibleScore").and_then(coerce_score);
    partial.feedback = object
        .get("feedback")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());

    Ok(partial)
}

/// Turn raw judge text into a complete record or say exactly why not.
pub fn validate_judge_output(
    raw: &str,
    model: &str,
    rated_at: DateTime<Utc>,
) -> Result<ValidatedRating, RatingError> {
    let partial = parse_judge_output(raw)?;

    for dimension in Dimension::ALL {
        if let Some(&value) = partial.scores.get(&dimension) {
            if !(0..=MAX_DIMENSION_SCORE).contains(&value) {
                return Err(RatingError::OutOfRangeScore {
                    dimension,
                    value,
                    raw: raw.to_string(),
                });
            }
        }
    }

    let missing = partial.missing_dimensions();
    if !missing.is_empty() {
        return Err(RatingError::IncompleteRating {
            missing,
            partial,
            raw: raw.to_string(),
        });
    }

    let mut scores = DimensionScores::default();
    for (dimension, value) in &partial.scores {
        // Range-checked above.
        scores.set(*dimension, *value as u8);
    }

    let mut anomalies = Vec::new();
    let computed = scores.total();
    if let Some(reported) = partial.reported_total {
        if reported != i64::from(computed) {
            anomalies.push(Anomaly::TotalMismatch { reported, computed });
        }
    }
    if let Some(reported) = partial.reported_max {
        if reported != i64::from(MAX_POSSIBLE_SCORE) {
            anomalies.push(Anomaly::MaxScoreOverridden { reported });
        }
    }
    let feedback = partial.feedback.unwrap_or_default();
    if feedback.is_empty() {
        anomalies.push(Anomaly::EmptyFeedback);
    }

    Ok(ValidatedRating {
        record: RatingRecord::new(scores, feedback, model, rated_at),
        anomalies,
    })
}
