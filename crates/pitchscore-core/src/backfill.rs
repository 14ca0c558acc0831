//! Backfill: find conversations whose stored rating is incomplete and run
//! them through the reconciler, one page at a time.
//!
//! A failing conversation is logged and counted, never fatal to the batch.
//! Only a failure to list the next page stops the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use pitchscore_store::{ConversationStore, IncompleteRatingQuery};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::{FailureKind, RatingError, ReconcileMode, ReconcileOutcome, Reconciler};

fn default_page_size() -> usize {
    10
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillOptions {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Stop after this many pages; unbounded when absent
    #[serde(default)]
    pub max_pages: Option<usize>,
    /// 1 means strictly sequential
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub include_unrated: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: None,
            workers: default_workers(),
            include_unrated: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackfillFailure {
    pub conversation_id: String,
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub pages: usize,
    pub scanned: usize,
    pub rated: usize,
    /// Listed as incomplete but already complete by the time the lock was held
    pub skipped: usize,
    pub failures: Vec<BackfillFailure>,
    /// Worker tasks that panicked or were cancelled
    pub aborted: usize,
}

impl BackfillReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn failures_by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
    }

    fn record(&mut self, conversation_id: &str, result: Result<ReconcileOutcome, RatingError>) {
        self.scanned += 1;
        match result {
            Ok(ReconcileOutcome::Rated(validated)) => {
                self.rated += 1;
                tracing::info!(
                    conversation_id,
                    total_score = validated.record.total_score,
                    anomalies = validated.anomalies.len(),
                    "backfill: rated"
                );
            }
            Ok(ReconcileOutcome::AlreadyRated(_)) => {
                self.skipped += 1;
                tracing::info!(conversation_id, "backfill: already complete");
            }
            Err(err) => {
                tracing::warn!(
                    conversation_id,
                    kind = %err.kind(),
                    retryable = err.is_retryable(),
                    "backfill: failed: {err}"
                );
                self.failures.push(BackfillFailure {
                    conversation_id: conversation_id.to_string(),
                    kind: err.kind(),
                    retryable: err.is_retryable(),
                    message: err.to_string(),
                });
            }
        }
    }
}

pub struct BackfillScanner {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ConversationStore>,
    options: BackfillOptions,
}

impl BackfillScanner {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn ConversationStore>,
        options: BackfillOptions,
    ) -> Self {
        Self {
            reconciler,
            store,
            options,
        }
    }

    pub fn options(&self) -> &BackfillOptions {
        &self.options
    }

    /// Walk the backlog in ascending id order. The cursor always advances
    /// past the last listed id, so a conversation that keeps failing is
    /// tried once per run and cannot hold up the rest.
    pub async fn run(&self) -> Result<BackfillReport, RatingError> {
        let page_size = self.options.page_size.max(1);
        let workers = self.options.workers.max(1);
        let slots = Arc::new(Semaphore::new(workers));
        let mut report = BackfillReport::default();
        let mut cursor: Option<String> = None;

        tracing::info!(
            page_size,
            workers,
            max_pages = ?self.options.max_pages,
            include_unrated = self.options.include_unrated,
            "backfill started"
        );

        loop {
            if self
                .options
                .max_pages
                .is_some_and(|max| report.pages >= max)
            {
                tracing::info!(pages = report.pages, "backfill: page limit reached");
                break;
            }

            let mut query = IncompleteRatingQuery::new(page_size)
                .include_unrated(self.options.include_unrated)
                .with_policy(self.reconciler.policy());
            query.after = cursor.clone();

            let ids = self
                .store
                .list_incomplete_ratings(&query)
                .await
                .map_err(RatingError::store)?;
            if ids.is_empty() {
                break;
            }
            report.pages += 1;
            tracing::debug!(page = report.pages, count = ids.len(), "backfill page");

            let short_page = ids.len() < page_size;
            cursor = ids.last().cloned();

            if workers == 1 {
                for id in &ids {
                    let result = self.reconciler.reconcile(id, ReconcileMode::IfNeeded).await;
                    report.record(id, result);
                }
            } else {
                self.run_page_parallel(ids, &slots, &mut report).await?;
            }

            if short_page {
                break;
            }
        }

        report.failures.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        tracing::info!(
            pages = report.pages,
            scanned = report.scanned,
            rated = report.rated,
            skipped = report.skipped,
            failed = report.failed(),
            "backfill finished"
        );
        Ok(report)
    }

    async fn run_page_parallel(
        &self,
        ids: Vec<String>,
        slots: &Arc<Semaphore>,
        report: &mut BackfillReport,
    ) -> Result<(), RatingError> {
        let mut join_set = JoinSet::new();

        for id in ids {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RatingError::LockUnavailable)?;
            let reconciler = self.reconciler.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = reconciler.reconcile(&id, ReconcileMode::IfNeeded).await;
                (id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, result)) => report.record(&id, result),
                Err(e) => {
                    tracing::error!("backfill worker failed: {e}");
                    report.aborted += 1;
                }
            }
        }
        Ok(())
    }
}
