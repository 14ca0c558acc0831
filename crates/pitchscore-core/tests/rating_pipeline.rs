use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use pitchscore_core::{
    EvaluationSettings, FailureKind, RatingError, ReconcileMode, ReconcileOutcome, Reconciler,
};
use pitchscore_judge::{JudgeError, ProviderErrorKind, ScriptedJudge};
use pitchscore_schema::{
    CompletenessPolicy, Conversation, Message, RatingRecord, RatingState, StoredRating,
};
use pitchscore_store::{ConversationStore, IncompleteRatingQuery, SqliteConversationStore};

const COMPLETE: &str = r#"{"opening":8,"discovery":6,"presentation":7,"objectionHandling":7,"closing":9,"totalScore":37,"maxPossibleScore":50,"feedback":"You asked strong discovery questions."}"#;

/// Sqlite store that counts every rating write.
struct CountingStore {
    inner: SqliteConversationStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: SqliteConversationStore::open_in_memory().unwrap(),
            writes: AtomicUsize::new(0),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn seed(&self, conversation: Conversation) {
        self.inner.insert_conversation(&conversation).await.unwrap();
    }

    async fn rating(&self, id: &str) -> Option<StoredRating> {
        self.inner.get_rating(id).await.unwrap()
    }
}

#[async_trait]
impl ConversationStore for CountingStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.inner.get_conversation(id).await
    }

    async fn put_rating(&self, id: &str, record: &RatingRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_rating(id, record).await
    }

    async fn list_incomplete_ratings(&self, query: &IncompleteRatingQuery) -> Result<Vec<String>> {
        self.inner.list_incomplete_ratings(query).await
    }
}

fn sales_call(id: &str) -> Conversation {
    Conversation::new(
        id,
        vec![
            Message::user("Hello, calling about our product."),
            Message::assistant("Tell me more."),
        ],
    )
}

fn reconciler(store: &Arc<CountingStore>, judge: &Arc<ScriptedJudge>) -> Reconciler {
    Reconciler::new(store.clone(), judge.clone(), EvaluationSettings::default())
}

#[tokio::test]
async fn recomputes_total_from_dimension_scores() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-a")).await;
    let judge = Arc::new(ScriptedJudge::new("gpt-3.5-turbo").with_response(
        r#"{"opening":8,"discovery":6,"presentation":0,"objectionHandling":0,"closing":0,"totalScore":14,"maxPossibleScore":50,"feedback":"Good opening..."}"#,
    ));

    let outcome = reconciler(&store, &judge)
        .reconcile("conv-a", ReconcileMode::IfNeeded)
        .await
        .unwrap();

    assert_eq!(outcome.record().total_score, 14);
    let stored = store.rating("conv-a").await.unwrap();
    assert_eq!(stored.total_score, Some(14));
    assert_eq!(stored.max_possible_score, Some(50));
    assert_eq!(stored.feedback.as_deref(), Some("Good opening..."));
    assert!(stored.is_complete(CompletenessPolicy::default()));
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn prose_answer_writes_nothing() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-b")).await;
    let judge = Arc::new(
        ScriptedJudge::new("m").with_response("This was a solid call. I'd give it a seven."),
    );
    let reconciler = reconciler(&store, &judge);

    let err = reconciler
        .reconcile("conv-b", ReconcileMode::IfNeeded)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Unparsable);
    assert_eq!(
        err.raw_output(),
        Some("This was a solid call. I'd give it a seven.")
    );
    assert_eq!(store.writes(), 0);
    assert!(store.rating("conv-b").await.is_none());
    assert_eq!(
        reconciler.state("conv-b").await.unwrap(),
        RatingState::NeedsEvaluation
    );
}

#[tokio::test]
async fn missing_feedback_still_rated_and_not_reevaluated() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-c")).await;
    let judge = Arc::new(ScriptedJudge::new("m").with_response(
        r#"{"opening":8,"discovery":6,"presentation":7,"objectionHandling":7,"closing":9}"#,
    ));
    let reconciler = reconciler(&store, &judge);

    let outcome = reconciler
        .reconcile("conv-c", ReconcileMode::IfNeeded)
        .await
        .unwrap();
    match &outcome {
        ReconcileOutcome::Rated(validated) => {
            assert_eq!(validated.record.total_score, 37);
            assert!(validated.feedback_missing());
        }
        other => panic!("expected Rated, got {other:?}"),
    }
    assert_eq!(reconciler.state("conv-c").await.unwrap(), RatingState::Rated);

    // Second run must not call the judge again.
    let again = reconciler
        .reconcile("conv-c", ReconcileMode::IfNeeded)
        .await
        .unwrap();
    assert!(!again.was_evaluated());
    assert_eq!(judge.call_count(), 1);
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn feedback_policy_keeps_blank_feedback_incomplete() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-c")).await;
    let judge = Arc::new(ScriptedJudge::new("m").with_response(
        r#"{"opening":8,"discovery":6,"presentation":7,"objectionHandling":7,"closing":9}"#,
    ));
    let settings = EvaluationSettings {
        policy: CompletenessPolicy {
            require_feedback: true,
        },
        ..EvaluationSettings::default()
    };
    let reconciler = Reconciler::new(store.clone(), judge.clone(), settings);

    reconciler
        .reconcile("conv-c", ReconcileMode::IfNeeded)
        .await
        .unwrap();
    assert_eq!(
        reconciler.state("conv-c").await.unwrap(),
        RatingState::NeedsEvaluation
    );
}

#[tokio::test]
async fn new_record_replaces_partial_one_whole() {
    let store = Arc::new(CountingStore::new());
    let mut conversation = sales_call("conv-d");
    conversation.rating = Some(StoredRating {
        opening: Some(3),
        total_score: Some(3),
        feedback: Some("old feedback".into()),
        model: Some("legacy".into()),
        ..StoredRating::default()
    });
    store.seed(conversation).await;
    let judge = Arc::new(ScriptedJudge::new("gpt-3.5-turbo").with_response(
        r#"{"opening":8,"discovery":6,"presentation":7,"objectionHandling":7,"closing":9}"#,
    ));

    reconciler(&store, &judge)
        .reconcile("conv-d", ReconcileMode::IfNeeded)
        .await
        .unwrap();

    let stored = store.rating("conv-d").await.unwrap();
    assert_eq!(stored.opening, Some(8));
    assert_eq!(stored.total_score, Some(37));
    assert_eq!(stored.feedback.as_deref(), Some(""));
    assert_eq!(stored.model.as_deref(), Some("gpt-3.5-turbo"));
}

#[tokio::test]
async fn force_reevaluates_complete_rating() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-e")).await;
    let judge = Arc::new(
        ScriptedJudge::new("m")
            .with_response(COMPLETE)
            .with_response(
                r#"{"opening":1,"discovery":1,"presentation":1,"objectionHandling":1,"closing":1,"feedback":"Try again."}"#,
            ),
    );
    let reconciler = reconciler(&store, &judge);

    reconciler
        .reconcile("conv-e", ReconcileMode::IfNeeded)
        .await
        .unwrap();
    let forced = reconciler
        .reconcile("conv-e", ReconcileMode::Force)
        .await
        .unwrap();

    assert!(forced.was_evaluated());
    assert_eq!(store.rating("conv-e").await.unwrap().total_score, Some(5));
    assert_eq!(store.writes(), 2);
}

#[tokio::test]
async fn empty_transcript_never_reaches_judge() {
    let store = Arc::new(CountingStore::new());
    store.seed(Conversation::new("conv-empty", Vec::new())).await;
    let judge = Arc::new(ScriptedJudge::new("m").with_response(COMPLETE));

    let err = reconciler(&store, &judge)
        .reconcile("conv-empty", ReconcileMode::IfNeeded)
        .await
        .unwrap_err();

    assert!(matches!(err, RatingError::EmptyTranscript));
    assert_eq!(judge.call_count(), 0);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn judge_timeout_is_retryable_and_writes_nothing() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-t")).await;
    let judge = Arc::new(ScriptedJudge::new("m").with_error(JudgeError::Timeout {
        after: Duration::from_secs(60),
    }));

    let err = reconciler(&store, &judge)
        .reconcile("conv-t", ReconcileMode::IfNeeded)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::JudgeTimeout);
    assert!(err.is_retryable());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn judge_rejection_keeps_provider_classification() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-r")).await;
    let judge = Arc::new(ScriptedJudge::new("m").with_error(JudgeError::Rejected {
        status: Some(429),
        kind: ProviderErrorKind::RateLimit,
        error_type: Some("rate_limit_exceeded".into()),
        message: "slow down".into(),
    }));

    let err = reconciler(&store, &judge)
        .reconcile("conv-r", ReconcileMode::IfNeeded)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::JudgeError);
    assert!(!err.is_retryable());
    match err {
        RatingError::Judge(JudgeError::Rejected { kind, .. }) => {
            assert_eq!(kind, ProviderErrorKind::RateLimit)
        }
        other => panic!("expected rejected judge error, got {other:?}"),
    }
}

#[tokio::test]
async fn out_of_range_and_incomplete_answers_write_nothing() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-x")).await;
    let judge = Arc::new(
        ScriptedJudge::new("m")
            .with_response(
                r#"{"opening":12,"discovery":6,"presentation":7,"objectionHandling":7,"closing":9}"#,
            )
            .with_response(r#"{"opening":8,"discovery":6,"presentation":7,"closing":9}"#),
    );
    let reconciler = reconciler(&store, &judge);

    let first = reconciler
        .reconcile("conv-x", ReconcileMode::IfNeeded)
        .await
        .unwrap_err();
    let second = reconciler
        .reconcile("conv-x", ReconcileMode::IfNeeded)
        .await
        .unwrap_err();

    assert_eq!(first.kind(), FailureKind::OutOfRangeScore);
    assert_eq!(second.kind(), FailureKind::IncompleteRating);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn concurrent_runs_for_one_conversation_evaluate_once() {
    let store = Arc::new(CountingStore::new());
    store.seed(sales_call("conv-lock")).await;
    let judge = Arc::new(
        ScriptedJudge::new("m")
            .with_response(COMPLETE)
            .with_response(COMPLETE),
    );
    let reconciler = Arc::new(reconciler(&store, &judge));

    let a = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler
                .reconcile("conv-lock", ReconcileMode::IfNeeded)
                .await
        })
    };
    let b = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler
                .reconcile("conv-lock", ReconcileMode::IfNeeded)
                .await
        })
    };

    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    let evaluated = outcomes.iter().filter(|o| o.was_evaluated()).count();
    assert_eq!(evaluated, 1);
    assert_eq!(judge.call_count(), 1);
    assert_eq!(store.writes(), 1);
}
