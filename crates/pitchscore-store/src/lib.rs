//! Conversation store: where transcripts are read and ratings are written.

pub mod sqlite_store;

use anyhow::Result;
use async_trait::async_trait;
use pitchscore_schema::{CompletenessPolicy, Conversation, RatingRecord};

pub use sqlite_store::SqliteConversationStore;

/// Page request for conversations whose stored rating is not complete.
#[derive(Debug, Clone, Default)]
pub struct IncompleteRatingQuery {
    pub page_size: usize,
    /// Keyset cursor: only ids strictly greater than this are returned
    pub after: Option<String>,
    /// Also return conversations that have never been rated
    pub include_unrated: bool,
    pub policy: CompletenessPolicy,
}

impl IncompleteRatingQuery {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after = Some(id.into());
        self
    }

    pub fn include_unrated(mut self, include: bool) -> Self {
        self.include_unrated = include;
        self
    }

    pub fn with_policy(mut self, policy: CompletenessPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Conversation with its messages in original order and whatever rating
    /// is stored for it.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Replace the stored rating as a whole. Implementations must make this a
    /// single atomic write; readers see either the old record or the new one.
    async fn put_rating(&self, id: &str, record: &RatingRecord) -> Result<()>;

    /// Conversation ids in ascending order whose rating fails the
    /// completeness predicate, at most `page_size` of them.
    async fn list_incomplete_ratings(&self, query: &IncompleteRatingQuery) -> Result<Vec<String>>;
}
