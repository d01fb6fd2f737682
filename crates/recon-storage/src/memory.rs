use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use recon_core::{clean_legacy, derive_slug, Assignment, CanonicalCategory, RecordId, SubjectRecord};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{matches_identity, CanonicalStore, RecordSource, StoreError};

/// In-memory category store kept in creation order, used for offline datasets and tests.
#[derive(Debug, Default)]
pub struct MemoryCanonicalStore {
    categories: Mutex<Vec<CanonicalCategory>>,
    schema_missing: bool,
}

impl MemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store in creation order, ties broken by id, whatever the input order.
    pub fn with_categories(mut categories: Vec<CanonicalCategory>) -> Self {
        categories.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Self {
            categories: Mutex::new(categories),
            schema_missing: false,
        }
    }

    /// A store whose readiness check fails, standing in for an unmigrated database.
    pub fn missing_schema() -> Self {
        Self {
            categories: Mutex::default(),
            schema_missing: true,
        }
    }
}

#[async_trait]
impl CanonicalStore for MemoryCanonicalStore {
    async fn check_ready(&self) -> Result<(), StoreError> {
        if self.schema_missing {
            return Err(StoreError::SchemaMissing("table categories".into()));
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<CanonicalCategory>, StoreError> {
        Ok(self.categories.lock().await.clone())
    }

    async fn exists_by_identity(&self, name_local: &str, name_en: &str) -> Result<bool, StoreError> {
        let categories = self.categories.lock().await;
        Ok(categories
            .iter()
            .any(|c| matches_identity(c, name_local, name_en)))
    }

    async fn create(&self, name_local: &str, name_en: &str) -> Result<CanonicalCategory, StoreError> {
        let name_local = clean_legacy(Some(name_local)).unwrap_or_default();
        let name_en = clean_legacy(Some(name_en)).unwrap_or_default();
        let slug = derive_slug(&name_local, &name_en).ok_or_else(|| StoreError::EmptySlug {
            name_local: name_local.clone(),
            name_en: name_en.clone(),
        })?;

        let mut categories = self.categories.lock().await;
        if categories.iter().any(|c| c.slug == slug) {
            return Err(StoreError::DuplicateSlug { slug });
        }
        let category = CanonicalCategory {
            id: Uuid::new_v4(),
            name_local,
            name_en,
            slug,
            created_at: Utc::now(),
        };
        categories.push(category.clone());
        Ok(category)
    }
}

/// In-memory record set with failure injection for commit paths.
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    records: Mutex<Vec<SubjectRecord>>,
    poisoned: Mutex<HashSet<RecordId>>,
    transient_failures: AtomicUsize,
    commits: AtomicUsize,
    schema_missing: bool,
}

impl MemoryRecordSource {
    pub fn new(records: Vec<SubjectRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn missing_schema() -> Self {
        Self {
            schema_missing: true,
            ..Self::default()
        }
    }

    /// Every batch containing `record_id` is rejected.
    pub async fn poison(&self, record_id: RecordId) {
        self.poisoned.lock().await.insert(record_id);
    }

    /// The next `count` commits fail with a retryable error.
    pub fn fail_next_commits(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Number of commit attempts seen, successful or not.
    pub fn commit_attempts(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<SubjectRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn check_ready(&self) -> Result<(), StoreError> {
        if self.schema_missing {
            return Err(StoreError::SchemaMissing("table records".into()));
        }
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        Ok(self.records.lock().await.clone())
    }

    async fn fetch_unresolved(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.iter().filter(|r| r.is_eligible()).cloned().collect())
    }

    async fn assign_batch(&self, batch: &[Assignment]) -> Result<u64, StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected transient failure".into()));
        }

        let poisoned = self.poisoned.lock().await;
        if let Some(bad) = batch.iter().find(|a| poisoned.contains(&a.record_id)) {
            return Err(StoreError::Rejected(format!(
                "record {} failed a constraint check",
                bad.record_id
            )));
        }
        drop(poisoned);

        let mut records = self.records.lock().await;
        let mut seen = HashSet::with_capacity(batch.len());
        let mut positions = Vec::with_capacity(batch.len());
        for assignment in batch {
            if !seen.insert(assignment.record_id) {
                return Err(StoreError::Rejected(format!(
                    "record {} appears twice in one batch",
                    assignment.record_id
                )));
            }
            let pos = records
                .iter()
                .position(|r| r.id == assignment.record_id)
                .ok_or(StoreError::UnknownRecord(assignment.record_id))?;
            if records[pos].category_ref.is_some() {
                return Err(StoreError::AlreadyAssigned(assignment.record_id));
            }
            positions.push((pos, assignment.category_id));
        }

        for (pos, category_id) in &positions {
            records[*pos].category_ref = Some(*category_id);
        }
        Ok(positions.len() as u64)
    }
}
