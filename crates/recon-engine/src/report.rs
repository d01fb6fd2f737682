use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{CanonicalCategory, CategoryId, SubjectRecord};
use recon_storage::{CanonicalStore, RecordSource, StoreError};
use serde::Serialize;

use crate::reconciler::RunOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category_id: CategoryId,
    pub slug: String,
    pub name_local: String,
    pub name_en: String,
    pub count: usize,
}

/// Distribution of category references over the current record set.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub generated_at: DateTime<Utc>,
    pub per_category: BTreeMap<CategoryId, usize>,
    /// One row per canonical category, in snapshot order.
    pub rows: Vec<CategoryCount>,
    /// Unresolved records that still carry legacy text.
    pub unmapped_count: usize,
    /// References to ids absent from the canonical snapshot.
    pub dangling_refs: usize,
    pub total_records: usize,
}

impl DistributionReport {
    pub fn resolved_count(&self) -> usize {
        self.per_category.values().sum::<usize>() + self.dangling_refs
    }

    pub fn markdown(&self) -> String {
        let mut lines = vec![
            "## Category Distribution".to_string(),
            String::new(),
            format!("- Generated: {}", self.generated_at),
            format!("- Records: {}", self.total_records),
            format!("- Linked: {}", self.resolved_count()),
            format!("- Unmapped (eligible, unresolved): {}", self.unmapped_count),
        ];
        if self.dangling_refs > 0 {
            lines.push(format!("- Dangling references: {}", self.dangling_refs));
        }
        lines.push(String::new());
        lines.push("| slug | local | english | records |".to_string());
        lines.push("|---|---|---|---:|".to_string());
        for row in &self.rows {
            lines.push(format!(
                "| {} | {} | {} | {} |",
                row.slug, row.name_local, row.name_en, row.count
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Pure join of record state against a canonical snapshot.
pub fn build_report(
    snapshot: &[CanonicalCategory],
    records: &[SubjectRecord],
    generated_at: DateTime<Utc>,
) -> DistributionReport {
    let mut counts: HashMap<CategoryId, usize> = snapshot.iter().map(|c| (c.id, 0)).collect();
    let mut dangling_refs = 0usize;
    let mut unmapped_count = 0usize;

    for record in records {
        match record.category_ref {
            Some(id) => match counts.get_mut(&id) {
                Some(count) => *count += 1,
                None => dangling_refs += 1,
            },
            None if record.has_legacy() => unmapped_count += 1,
            None => {}
        }
    }

    let rows = snapshot
        .iter()
        .map(|c| CategoryCount {
            category_id: c.id,
            slug: c.slug.clone(),
            name_local: c.name_local.clone(),
            name_en: c.name_en.clone(),
            count: counts.get(&c.id).copied().unwrap_or_default(),
        })
        .collect();

    DistributionReport {
        generated_at,
        per_category: counts.into_iter().collect(),
        rows,
        unmapped_count,
        dangling_refs,
        total_records: records.len(),
    }
}

/// Distribution a dry run would leave behind: planned categories are added to the
/// snapshot and planned assignments are applied to the records.
pub fn project_dry_run(
    snapshot: &[CanonicalCategory],
    records: &[SubjectRecord],
    outcome: &RunOutcome,
    generated_at: DateTime<Utc>,
) -> DistributionReport {
    let mut projected = snapshot.to_vec();
    projected.extend(
        outcome
            .discovery
            .planned
            .iter()
            .filter_map(|pair| pair.preview(outcome.started_at)),
    );

    let planned: HashMap<_, _> = outcome
        .assignments
        .iter()
        .map(|a| (a.record_id, a.category_id))
        .collect();
    let records = records
        .iter()
        .cloned()
        .map(|mut record| {
            if record.category_ref.is_none() {
                record.category_ref = planned.get(&record.id).copied();
            }
            record
        })
        .collect::<Vec<_>>();

    build_report(&projected, &records, generated_at)
}

/// Read-only summary over the live stores; safe to call at any time.
pub struct ReportGenerator {
    canonical: Arc<dyn CanonicalStore>,
    records: Arc<dyn RecordSource>,
}

impl ReportGenerator {
    pub fn new(canonical: Arc<dyn CanonicalStore>, records: Arc<dyn RecordSource>) -> Self {
        Self { canonical, records }
    }

    pub async fn generate(&self) -> Result<DistributionReport, StoreError> {
        let snapshot = self.canonical.list_all().await?;
        let records = self.records.fetch_all().await?;
        Ok(build_report(&snapshot, &records, Utc::now()))
    }

    /// Report for a finished run. Dry runs are projected, since nothing was written.
    pub async fn generate_for(&self, outcome: &RunOutcome) -> Result<DistributionReport, StoreError> {
        if !outcome.dry_run {
            return self.generate().await;
        }
        let snapshot = self.canonical.list_all().await?;
        let records = self.records.fetch_all().await?;
        Ok(project_dry_run(&snapshot, &records, outcome, Utc::now()))
    }
}
