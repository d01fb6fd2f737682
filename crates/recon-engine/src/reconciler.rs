//! Run orchestration: discovery, matching, batched foreign-key backfill.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recon_core::{Assignment, RecordId, SubjectRecord};
use recon_storage::{
    classify_store_error, BackoffPolicy, CanonicalStore, RecordSource, RetryDisposition, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE};
use crate::discovery::{CategoryDiscovery, DiscoverySummary};
use crate::matcher::{MatchResolver, MatchTier, Resolution};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub batch_size: usize,
    /// Pause between consecutive batch commits.
    pub batch_delay: Duration,
    pub retry: BackoffPolicy,
    pub dry_run: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            retry: BackoffPolicy::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("backing store is not ready: {0}")]
    Setup(#[source] StoreError),
    #[error("fetching {what} failed: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub exact: usize,
    pub case_insensitive: usize,
    pub substring: usize,
}

impl TierCounts {
    fn record(&mut self, tier: MatchTier) {
        match tier {
            MatchTier::Exact => self.exact += 1,
            MatchTier::CaseInsensitive => self.case_insensitive += 1,
            MatchTier::Substring => self.substring += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub record_ids: Vec<RecordId>,
    pub committed: bool,
    pub attempts: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub updated: usize,
    pub skipped_unmatched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub eligible: usize,
    /// In a dry run, records that would have been updated.
    pub updated: usize,
    pub skipped_unmatched: usize,
    pub failed: usize,
    pub discovery: DiscoverySummary,
    pub tiers: TierCounts,
    pub batches: Vec<BatchOutcome>,
    pub assignments: Vec<Assignment>,
    pub unmatched_record_ids: Vec<RecordId>,
    pub failed_record_ids: Vec<RecordId>,
}

impl RunOutcome {
    pub fn counts(&self) -> RunCounts {
        RunCounts {
            updated: self.updated,
            skipped_unmatched: self.skipped_unmatched,
            failed: self.failed,
        }
    }
}

pub struct BatchReconciler {
    canonical: Arc<dyn CanonicalStore>,
    records: Arc<dyn RecordSource>,
    settings: ReconcilerSettings,
}

impl BatchReconciler {
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        records: Arc<dyn RecordSource>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            canonical,
            records,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    pub async fn run(&self) -> Result<RunOutcome, ReconcileError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, dry_run = self.settings.dry_run);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunOutcome, ReconcileError> {
        let started_at = Utc::now();
        let dry_run = self.settings.dry_run;

        self.canonical.check_ready().await.map_err(ReconcileError::Setup)?;
        self.records.check_ready().await.map_err(ReconcileError::Setup)?;

        let all_records = self
            .records
            .fetch_all()
            .await
            .map_err(|source| ReconcileError::Fetch { what: "records", source })?;

        let discovery = CategoryDiscovery::new(self.canonical.clone());
        let discovery = if dry_run {
            discovery.plan(&all_records).await.map_err(|source| ReconcileError::Fetch {
                what: "canonical snapshot for planning",
                source,
            })?
        } else {
            discovery.run(&all_records).await
        };

        let mut snapshot = self
            .canonical
            .list_all()
            .await
            .map_err(|source| ReconcileError::Fetch { what: "canonical snapshot", source })?;
        if dry_run {
            snapshot.extend(discovery.planned.iter().filter_map(|p| p.preview(started_at)));
        }

        let eligible = self
            .records
            .fetch_unresolved()
            .await
            .map_err(|source| ReconcileError::Fetch { what: "unresolved records", source })?
            .into_iter()
            .filter(SubjectRecord::is_eligible)
            .collect::<Vec<_>>();
        info!(
            snapshot = snapshot.len(),
            eligible = eligible.len(),
            "matching unresolved records"
        );

        let resolver = MatchResolver::new(&snapshot);
        let mut tiers = TierCounts::default();
        let mut assignments = Vec::new();
        let mut unmatched_record_ids = Vec::new();
        for record in &eligible {
            match resolver.resolve(record) {
                Resolution::Matched { category_id, tier } => {
                    tiers.record(tier);
                    assignments.push(Assignment {
                        record_id: record.id,
                        category_id,
                    });
                }
                Resolution::Unmatched => unmatched_record_ids.push(record.id),
            }
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut batches = Vec::new();
        let mut updated = 0usize;
        let mut failed_record_ids = Vec::new();

        for (index, batch) in assignments.chunks(batch_size).enumerate() {
            let record_ids = batch.iter().map(|a| a.record_id).collect::<Vec<_>>();

            if dry_run {
                updated += batch.len();
                batches.push(BatchOutcome {
                    index,
                    record_ids,
                    committed: false,
                    attempts: 0,
                    error: None,
                });
                continue;
            }

            if index > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let (result, attempts) = self.commit_with_retry(index, batch).await;
            match result {
                Ok(rows) => {
                    info!(batch = index, rows, attempts, "batch committed");
                    updated += batch.len();
                    batches.push(BatchOutcome {
                        index,
                        record_ids,
                        committed: true,
                        attempts,
                        error: None,
                    });
                }
                Err(err) => {
                    error!(batch = index, record_ids = ?record_ids, attempts, error = %err, "batch commit failed");
                    failed_record_ids.extend(record_ids.iter().copied());
                    batches.push(BatchOutcome {
                        index,
                        record_ids,
                        committed: false,
                        attempts,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let outcome = RunOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            eligible: eligible.len(),
            updated,
            skipped_unmatched: unmatched_record_ids.len(),
            failed: failed_record_ids.len(),
            discovery,
            tiers,
            batches,
            assignments,
            unmatched_record_ids,
            failed_record_ids,
        };
        info!(
            updated = outcome.updated,
            skipped_unmatched = outcome.skipped_unmatched,
            failed = outcome.failed,
            "reconciliation finished"
        );
        Ok(outcome)
    }

    async fn commit_with_retry(
        &self,
        index: usize,
        batch: &[Assignment],
    ) -> (Result<u64, StoreError>, usize) {
        let policy = self.settings.retry;
        let mut attempt = 0usize;
        loop {
            match self.records.assign_batch(batch).await {
                Ok(rows) => return (Ok(rows), attempt + 1),
                Err(err)
                    if attempt < policy.max_retries
                        && classify_store_error(&err) == RetryDisposition::Retryable =>
                {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(batch = index, attempt = attempt + 1, ?delay, error = %err, "retrying batch commit");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return (Err(err), attempt + 1),
            }
        }
    }
}
