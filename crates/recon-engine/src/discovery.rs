//! Derives canonical categories from the distinct legacy values on subject records.

use std::collections::HashSet;
use std::sync::Arc;

use recon_core::{fold, CanonicalCategory, IdentityKey, NewCategory, SubjectRecord};
use recon_storage::{matches_identity, CanonicalStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverySummary {
    pub distinct_pairs: usize,
    pub already_present: usize,
    pub created: Vec<CanonicalCategory>,
    /// Pairs a dry run would create. Empty after a real run.
    pub planned: Vec<NewCategory>,
    pub errors: Vec<DiscoveryFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryFailure {
    pub pair: NewCategory,
    pub duplicate_slug: bool,
    pub message: String,
}

impl DiscoveryFailure {
    fn new(pair: &NewCategory, err: &StoreError) -> Self {
        Self {
            pair: pair.clone(),
            duplicate_slug: matches!(err, StoreError::DuplicateSlug { .. }),
            message: err.to_string(),
        }
    }
}

/// Distinct legacy pairs in first-seen order, deduplicated case-insensitively.
pub fn distinct_pairs(records: &[SubjectRecord]) -> Vec<NewCategory> {
    let mut seen: HashSet<IdentityKey> = HashSet::new();
    records
        .iter()
        .filter_map(SubjectRecord::legacy_pair)
        .filter(|pair| seen.insert(pair.identity()))
        .collect()
}

pub struct CategoryDiscovery {
    store: Arc<dyn CanonicalStore>,
}

impl CategoryDiscovery {
    pub fn new(store: Arc<dyn CanonicalStore>) -> Self {
        Self { store }
    }

    /// Creates every missing pair. A failed pair is recorded and the rest still run.
    pub async fn run(&self, records: &[SubjectRecord]) -> DiscoverySummary {
        let pairs = distinct_pairs(records);
        let mut summary = DiscoverySummary {
            distinct_pairs: pairs.len(),
            ..DiscoverySummary::default()
        };

        for pair in &pairs {
            match self
                .store
                .exists_by_identity(&pair.name_local, &pair.name_en)
                .await
            {
                Ok(true) => {
                    summary.already_present += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(name_local = %pair.name_local, name_en = %pair.name_en, error = %err, "identity lookup failed; skipping pair");
                    summary.errors.push(DiscoveryFailure::new(pair, &err));
                    continue;
                }
            }

            match self.store.create(&pair.name_local, &pair.name_en).await {
                Ok(category) => {
                    info!(category_id = %category.id, slug = %category.slug, "canonical category created");
                    summary.created.push(category);
                }
                Err(err) => {
                    warn!(name_local = %pair.name_local, name_en = %pair.name_en, error = %err, "category create skipped");
                    summary.errors.push(DiscoveryFailure::new(pair, &err));
                }
            }
        }

        info!(
            distinct = summary.distinct_pairs,
            present = summary.already_present,
            created = summary.created.len(),
            errors = summary.errors.len(),
            "discovery finished"
        );
        summary
    }

    /// Computes what [`run`](Self::run) would create without writing anything.
    ///
    /// Planned pairs shadow later pairs that share a name, and slug collisions are
    /// reported as the store would report them.
    pub async fn plan(&self, records: &[SubjectRecord]) -> Result<DiscoverySummary, StoreError> {
        let pairs = distinct_pairs(records);
        let existing = self.store.list_all().await?;
        let mut slugs: HashSet<String> = existing.iter().map(|c| c.slug.clone()).collect();
        let mut summary = DiscoverySummary {
            distinct_pairs: pairs.len(),
            ..DiscoverySummary::default()
        };

        for pair in pairs {
            let present = existing
                .iter()
                .any(|c| matches_identity(c, &pair.name_local, &pair.name_en))
                || summary.planned.iter().any(|p| shares_a_name(p, &pair));
            if present {
                summary.already_present += 1;
                continue;
            }
            let Some(slug) = pair.slug() else {
                let err = StoreError::EmptySlug {
                    name_local: pair.name_local.clone(),
                    name_en: pair.name_en.clone(),
                };
                summary.errors.push(DiscoveryFailure::new(&pair, &err));
                continue;
            };
            if !slugs.insert(slug.clone()) {
                let err = StoreError::DuplicateSlug { slug };
                summary.errors.push(DiscoveryFailure::new(&pair, &err));
                continue;
            }
            debug!(name_local = %pair.name_local, name_en = %pair.name_en, "category planned");
            summary.planned.push(pair);
        }

        info!(
            distinct = summary.distinct_pairs,
            present = summary.already_present,
            planned = summary.planned.len(),
            errors = summary.errors.len(),
            "discovery planned"
        );
        Ok(summary)
    }
}

fn shares_a_name(a: &NewCategory, b: &NewCategory) -> bool {
    let same = |x: &str, y: &str| {
        let x = fold(x);
        !x.is_empty() && x == fold(y)
    };
    same(&a.name_local, &b.name_local) || same(&a.name_en, &b.name_en)
}
