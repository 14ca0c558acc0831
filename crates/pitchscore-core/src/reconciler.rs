//! Per-conversation rating lifecycle: NeedsEvaluation -> Rated.
//!
//! A conversation only becomes Rated through a full pipeline run that ends in
//! a complete record, and that record replaces whatever was stored in one
//! write. Every failure leaves the store untouched.

use std::sync::Arc;

use chrono::Utc;
use pitchscore_judge::{Judge, JudgeRequest, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE};
use pitchscore_schema::{CompletenessPolicy, Conversation, RatingRecord, RatingState};
use pitchscore_store::ConversationStore;

use crate::{
    build_prompt, normalize_transcript, validate_judge_output, ConversationLockManager,
    RatingError, ValidatedRating,
};

/// Longest slice of raw judge output copied into a log line.
const RAW_LOG_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Skip conversations that already hold a complete rating
    #[default]
    IfNeeded,
    /// Re-evaluate and replace even a complete rating
    Force,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Nothing was evaluated; the stored record already passes
    AlreadyRated(RatingRecord),
    /// A new record was evaluated and written
    Rated(ValidatedRating),
}

impl ReconcileOutcome {
    pub fn record(&self) -> &RatingRecord {
        match self {
            Self::AlreadyRated(record) => record,
            Self::Rated(validated) => &validated.record,
        }
    }

    pub fn was_evaluated(&self) -> bool {
        matches!(self, Self::Rated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSettings {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub policy: CompletenessPolicy,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            policy: CompletenessPolicy::default(),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    judge: Arc<dyn Judge>,
    locks: ConversationLockManager,
    settings: EvaluationSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        judge: Arc<dyn Judge>,
        settings: EvaluationSettings,
    ) -> Self {
        Self {
            store,
            judge,
            locks: ConversationLockManager::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    pub fn policy(&self) -> CompletenessPolicy {
        self.settings.policy
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, RatingError> {
        self.store
            .get_conversation(conversation_id)
            .await
            .map_err(RatingError::store)?
            .ok_or_else(|| RatingError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Bring one conversation to Rated. The per-conversation lock is held
    /// from the read until the write returns, so concurrent callers for the
    /// same id run one after another and the second one sees the first's
    /// record.
    pub async fn reconcile(
        &self,
        conversation_id: &str,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome, RatingError> {
        let _guard = self.locks.acquire(conversation_id).await?;
        let conversation = self.load(conversation_id).await?;

        if mode == ReconcileMode::IfNeeded {
            if let Some(record) = conversation
                .rating
                .as_ref()
                .and_then(|stored| stored.to_record(self.settings.policy))
            {
                tracing::debug!(conversation_id, "rating already complete, skipping");
                return Ok(ReconcileOutcome::AlreadyRated(record));
            }
        }

        let validated = self.evaluate(&conversation).await?;

        self.store
            .put_rating(conversation_id, &validated.record)
            .await
            .map_err(RatingError::store)?;

        tracing::debug!(
            conversation_id,
            total_score = validated.record.total_score,
            model = %validated.record.model,
            "rating stored"
        );
        Ok(ReconcileOutcome::Rated(validated))
    }

    /// Run the pipeline without touching the store.
    pub async fn evaluate(
        &self,
        conversation: &Conversation,
    ) -> Result<ValidatedRating, RatingError> {
        let transcript = normalize_transcript(&conversation.messages)?;
        let request = JudgeRequest::new(build_prompt(&transcript))
            .with_limits(self.settings.max_output_tokens, self.settings.temperature);

        let raw = self.judge.evaluate(request).await?;

        let validated = validate_judge_output(&raw, self.judge.model(), Utc::now()).map_err(|e| {
            tracing::warn!(
                conversation_id = %conversation.id,
                kind = %e.kind(),
                raw = %truncate(&raw, RAW_LOG_LIMIT),
                "judge output rejected: {e}"
            );
            e
        })?;

        for anomaly in &validated.anomalies {
            tracing::warn!(conversation_id = %conversation.id, "{anomaly}");
        }
        Ok(validated)
    }

    /// Evaluate by id without writing, for dry runs.
    pub async fn preview(&self, conversation_id: &str) -> Result<ValidatedRating, RatingError> {
        let conversation = self.load(conversation_id).await?;
        self.evaluate(&conversation).await
    }

    /// The exact text the judge would receive for this conversation.
    pub async fn render_prompt(&self, conversation_id: &str) -> Result<String, RatingError> {
        let conversation = self.load(conversation_id).await?;
        let transcript = normalize_transcript(&conversation.messages)?;
        Ok(build_prompt(&transcript))
    }

    pub async fn state(&self, conversation_id: &str) -> Result<RatingState, RatingError> {
        let conversation = self.load(conversation_id).await?;
        Ok(RatingState::of(
            conversation.rating.as_ref(),
            self.settings.policy,
        ))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
