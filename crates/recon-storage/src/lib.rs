//! Store contracts for canonical categories and subject records, plus memory and Postgres backends.

use std::time::Duration;

use async_trait::async_trait;
use recon_core::{fold, Assignment, CanonicalCategory, RecordId, SubjectRecord};
use thiserror::Error;

mod memory;
mod postgres;
mod schema;

pub use memory::{MemoryCanonicalStore, MemoryRecordSource};
pub use postgres::{connect, run_migrations, PgCanonicalStore, PgRecordSource, MIGRATOR};
pub use schema::{validate_identifier, CategoryTable, RecordTable, SchemaMapping};

pub const CRATE_NAME: &str = "recon-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema object missing: {0}")]
    SchemaMissing(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate slug `{slug}`")]
    DuplicateSlug { slug: String },
    #[error("no slug derivable from ({name_local:?}, {name_en:?})")]
    EmptySlug { name_local: String, name_en: String },
    #[error("record {0} already has a category reference")]
    AlreadyAssigned(RecordId),
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),
    #[error("batch partially applied ({applied} of {expected} rows), rolled back")]
    PartialCommit { applied: u64, expected: u64 },
    #[error("batch rejected: {0}")]
    Rejected(String),
    #[error("invalid sql identifier `{0}`")]
    InvalidIdentifier(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Errors that mean the backing schema or connection is not usable at all.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::SchemaMissing(_) | Self::Unavailable(_) | Self::InvalidIdentifier(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Unavailable(_) => RetryDisposition::Retryable,
        StoreError::Database(db) => match db {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

/// Capped exponential backoff for batch commits. `max_retries = 0` disables retrying.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Fails with a setup-class error when the backing table or columns are absent.
    async fn check_ready(&self) -> Result<(), StoreError>;

    /// Full snapshot in creation order, ties broken by id.
    async fn list_all(&self) -> Result<Vec<CanonicalCategory>, StoreError>;

    /// True when an entry matches either non-empty name case-insensitively.
    async fn exists_by_identity(&self, name_local: &str, name_en: &str) -> Result<bool, StoreError>;

    async fn create(&self, name_local: &str, name_en: &str) -> Result<CanonicalCategory, StoreError>;
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn check_ready(&self) -> Result<(), StoreError>;

    async fn fetch_all(&self) -> Result<Vec<SubjectRecord>, StoreError>;

    /// Records with no category reference and at least one legacy value.
    async fn fetch_unresolved(&self) -> Result<Vec<SubjectRecord>, StoreError>;

    /// Applies every assignment or none of them. Returns the number of rows written.
    async fn assign_batch(&self, batch: &[Assignment]) -> Result<u64, StoreError>;
}

/// Identity test shared by every `CanonicalStore` implementation.
pub fn matches_identity(category: &CanonicalCategory, name_local: &str, name_en: &str) -> bool {
    let local = fold(name_local);
    let en = fold(name_en);
    (!local.is_empty() && fold(&category.name_local) == local)
        || (!en.is_empty() && fold(&category.name_en) == en)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn category(local: &str, en: &str) -> CanonicalCategory {
        CanonicalCategory {
            id: Uuid::new_v4(),
            name_local: local.into(),
            name_en: en.into(),
            slug: recon_core::slugify(en),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn identity_matches_either_field() {
        let c = category("Κατοικημένο", "Inhabited");
        assert!(matches_identity(&c, "κατοικημένο", ""));
        assert!(matches_identity(&c, "", "INHABITED"));
        assert!(matches_identity(&c, "other", "inhabited"));
        assert!(!matches_identity(&c, "", ""));
        assert!(!matches_identity(&c, "Inhabited", "Κατοικημένο"));
    }

    #[test]
    fn identity_folds_unicode_whitespace_and_greek_case() {
        let c = category("Κατοικημένο", "Inhabited");
        assert!(matches_identity(&c, "\u{a0}ΚΑΤΟΙΚΗΜΈΝΟ\u{2003}", ""));
        assert!(matches_identity(&c, "", "\tinhabited\u{3000}"));
    }

    #[test]
    fn empty_names_never_match_empty_fields() {
        let c = category("", "Resort");
        assert!(!matches_identity(&c, "", "Industrial"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_backoff_never_retries() {
        assert_eq!(BackoffPolicy::default().max_retries, 0);
        assert_eq!(BackoffPolicy::with_retries(3).max_retries, 3);
    }

    #[test]
    fn setup_errors_are_classified() {
        assert!(StoreError::SchemaMissing("table islands".into()).is_setup());
        assert!(!StoreError::DuplicateSlug { slug: "x".into() }.is_setup());
        assert_eq!(
            classify_store_error(&StoreError::Unavailable("down".into())),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_store_error(&StoreError::Rejected("constraint".into())),
            RetryDisposition::NonRetryable
        );
    }
}
