use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pitchscore_schema::Conversation;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Many(Vec<Conversation>),
    One(Conversation),
}

/// Accepts a single conversation object or an array of them.
pub fn parse_conversations(text: &str) -> Result<Vec<Conversation>> {
    let conversations = match serde_json::from_str::<ImportFile>(text)
        .context("expected a conversation object or an array of conversations")?
    {
        ImportFile::Many(many) => many,
        ImportFile::One(one) => vec![one],
    };

    let mut seen = HashSet::new();
    for conversation in &conversations {
        if conversation.id.trim().is_empty() {
            return Err(anyhow!("conversation with empty id"));
        }
        if !seen.insert(conversation.id.as_str()) {
            return Err(anyhow!("duplicate conversation id: {}", conversation.id));
        }
    }
    Ok(conversations)
}

pub fn read_conversations(path: &Path) -> Result<Vec<Conversation>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read import file: {}", path.display()))?;
    parse_conversations(&text).with_context(|| format!("invalid import file: {}", path.display()))
}
