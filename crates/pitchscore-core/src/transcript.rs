use pitchscore_schema::Message;

use crate::RatingError;

/// Flatten a conversation into `role: content` lines, in original order.
pub fn normalize_transcript(messages: &[Message]) -> Result<String, RatingError> {
    if messages.is_empty() {
        return Err(RatingError::EmptyTranscript);
    }

    Ok(messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n"))
}
