use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recon_core::{CanonicalCategory, SubjectRecord};
use recon_engine::{BatchReconciler, ReconcileError, ReconcilerSettings, ReportGenerator};
use recon_ingest::{deterministic_record_id, load_dataset};
use recon_storage::{CanonicalStore, MemoryCanonicalStore, MemoryRecordSource, RecordSource};
use uuid::Uuid;

fn settings(batch_size: usize) -> ReconcilerSettings {
    ReconcilerSettings {
        batch_size,
        batch_delay: Duration::ZERO,
        ..ReconcilerSettings::default()
    }
}

fn category(n: u128, local: &str, en: &str) -> CanonicalCategory {
    CanonicalCategory {
        id: Uuid::from_u128(n),
        name_local: local.into(),
        name_en: en.into(),
        slug: recon_core::slugify(en),
        created_at: Utc::now(),
    }
}

fn record(local: Option<&str>, en: Option<&str>) -> SubjectRecord {
    SubjectRecord::new(Uuid::new_v4(), local, en, None)
}

fn fixture_stores() -> (Arc<MemoryCanonicalStore>, Arc<MemoryRecordSource>) {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/legacy-islands/dataset.json");
    let dataset = load_dataset(path).expect("fixture loads");
    (
        Arc::new(MemoryCanonicalStore::with_categories(dataset.categories)),
        Arc::new(MemoryRecordSource::new(dataset.records)),
    )
}

fn assignments(records: &[SubjectRecord]) -> BTreeMap<Uuid, Option<Uuid>> {
    records.iter().map(|r| (r.id, r.category_ref)).collect()
}

#[tokio::test]
async fn worked_examples_resolve_to_the_expected_categories() {
    let canonical = Arc::new(MemoryCanonicalStore::with_categories(vec![
        category(1, "", "Inhabited"),
        category(2, "", "Industrial"),
        category(3, "", "Resort"),
    ]));
    let inhabited = record(None, Some("inhabited"));
    let resort = record(None, Some("Tourist Resort Island"));
    let source = Arc::new(MemoryRecordSource::new(vec![inhabited.clone(), resort.clone()]));

    let outcome = BatchReconciler::new(canonical.clone(), source.clone(), settings(20))
        .run()
        .await
        .unwrap();

    let after = assignments(&source.snapshot().await);
    assert_eq!(after[&inhabited.id], Some(Uuid::from_u128(1)));
    assert_eq!(outcome.tiers.case_insensitive, 1);
    assert_eq!(outcome.updated, 2);
    // "Tourist Resort Island" becomes its own canonical entity during discovery,
    // so the exact tier wins over the "Resort" substring candidate.
    assert_eq!(outcome.discovery.created.len(), 1);
    assert_eq!(after[&resort.id], Some(outcome.discovery.created[0].id));
}

#[tokio::test]
async fn substring_tier_applies_when_discovery_cannot_create() {
    let canonical = Arc::new(MemoryCanonicalStore::with_categories(vec![
        category(3, "", "Resort"),
        category(4, "", "Tourist Resort Island"),
    ]));
    // Same slug as category 4 but a different identity: creation fails, matching still succeeds.
    let r = record(None, Some("tourist-resort island"));
    let source = Arc::new(MemoryRecordSource::new(vec![r.clone()]));

    let outcome = BatchReconciler::new(canonical, source.clone(), settings(20))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.discovery.errors.len(), 1);
    assert!(outcome.discovery.errors[0].duplicate_slug);
    assert_eq!(outcome.tiers.substring, 1);
    assert_eq!(assignments(&source.snapshot().await)[&r.id], Some(Uuid::from_u128(3)));
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let (canonical, source) = fixture_stores();
    let reconciler = BatchReconciler::new(canonical.clone(), source.clone(), settings(2));

    let first = reconciler.run().await.unwrap();
    let categories_after_first = canonical.list_all().await.unwrap();
    let state_after_first = assignments(&source.snapshot().await);

    let second = reconciler.run().await.unwrap();

    assert_eq!(first.updated, 6);
    assert_eq!(first.discovery.created.len(), 3);
    assert!(second.discovery.created.is_empty());
    assert_eq!(second.eligible, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(canonical.list_all().await.unwrap(), categories_after_first);
    assert_eq!(assignments(&source.snapshot().await), state_after_first);
}

#[tokio::test]
async fn fixture_links_spelling_variants_to_shared_categories() {
    let (canonical, source) = fixture_stores();
    BatchReconciler::new(canonical, source.clone(), settings(20))
        .run()
        .await
        .unwrap();

    let state = assignments(&source.snapshot().await);
    let inhabited = Uuid::parse_str("0b9f6a52-1c1e-4c55-9a0e-6f0f3b0c1a01").unwrap();
    let industrial = Uuid::parse_str("0b9f6a52-1c1e-4c55-9a0e-6f0f3b0c1a02").unwrap();
    assert_eq!(state[&deterministic_record_id("naxos")], Some(inhabited));
    assert_eq!(state[&deterministic_record_id("17")], Some(inhabited));
    assert_eq!(state[&deterministic_record_id("lavrio-islet")], Some(industrial));
    assert_eq!(
        state[&deterministic_record_id("gyaros")],
        state[&deterministic_record_id("dokos")]
    );
    assert_eq!(state[&deterministic_record_id("blank-one")], None);
}

#[tokio::test]
async fn outcomes_partition_the_eligible_records() {
    let canonical = Arc::new(MemoryCanonicalStore::new());
    let mut records = (0..7)
        .map(|i| record(Some(&format!("Τύπος {i}")), Some(&format!("Kind {i}"))))
        .collect::<Vec<_>>();
    records.push(record(Some("###"), None));
    records.push(record(Some("@@"), Some("!!")));
    records.push(record(None, None));
    let poisoned = records[3].id;
    let source = Arc::new(MemoryRecordSource::new(records.clone()));
    source.poison(poisoned).await;

    let outcome = BatchReconciler::new(canonical, source.clone(), settings(3))
        .run()
        .await
        .unwrap();

    let eligible: HashSet<Uuid> = records.iter().filter(|r| r.is_eligible()).map(|r| r.id).collect();
    let updated: HashSet<Uuid> = outcome
        .batches
        .iter()
        .filter(|b| b.committed)
        .flat_map(|b| b.record_ids.iter().copied())
        .collect();
    let unmatched: HashSet<Uuid> = outcome.unmatched_record_ids.iter().copied().collect();
    let failed: HashSet<Uuid> = outcome.failed_record_ids.iter().copied().collect();

    assert_eq!(outcome.eligible, eligible.len());
    assert_eq!(outcome.updated + outcome.skipped_unmatched + outcome.failed, eligible.len());
    assert!(updated.is_disjoint(&unmatched));
    assert!(updated.is_disjoint(&failed));
    assert!(unmatched.is_disjoint(&failed));
    let union: HashSet<Uuid> = updated.union(&unmatched).chain(failed.iter()).copied().collect();
    assert_eq!(union, eligible);
    assert_eq!(outcome.skipped_unmatched, 2);
    assert_eq!(outcome.failed, 3, "the whole batch holding the poisoned record fails");
}

#[tokio::test]
async fn failed_batch_does_not_stop_later_batches() {
    let canonical = Arc::new(MemoryCanonicalStore::new());
    let records = (0..8)
        .map(|i| record(None, Some(&format!("Kind {i}"))))
        .collect::<Vec<_>>();
    let source = Arc::new(MemoryRecordSource::new(records.clone()));
    source.poison(records[0].id).await;

    let outcome = BatchReconciler::new(canonical, source.clone(), settings(2))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.batches.len(), 4);
    assert!(!outcome.batches[0].committed);
    assert!(outcome.batches[0].error.is_some());
    assert!(outcome.batches[1..].iter().all(|b| b.committed));
    assert_eq!(source.commit_attempts(), 4);

    let remaining = source.fetch_unresolved().await.unwrap();
    let remaining: HashSet<Uuid> = remaining.into_iter().map(|r| r.id).collect();
    assert_eq!(remaining, HashSet::from([records[0].id, records[1].id]));
}

#[tokio::test]
async fn slugs_stay_unique_after_discovery() {
    let canonical = Arc::new(MemoryCanonicalStore::new());
    let source = Arc::new(MemoryRecordSource::new(vec![
        record(Some("Α"), Some("Small Islet")),
        record(Some("Β"), Some("small  islet")),
        record(Some("Γ"), Some("Small-Islet!")),
        record(Some("Δ"), Some("Rock")),
    ]));

    BatchReconciler::new(canonical.clone(), source, settings(20))
        .run()
        .await
        .unwrap();

    let categories = canonical.list_all().await.unwrap();
    let slugs: HashSet<&str> = categories.iter().map(|c| c.slug.as_str()).collect();
    assert_eq!(slugs.len(), categories.len());
}

#[tokio::test]
async fn missing_canonical_table_is_fatal() {
    let source = Arc::new(MemoryRecordSource::new(vec![record(None, Some("Resort"))]));
    let err = BatchReconciler::new(
        Arc::new(MemoryCanonicalStore::missing_schema()),
        source.clone(),
        settings(20),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, ReconcileError::Setup(_)));
    assert_eq!(source.commit_attempts(), 0);
}

#[tokio::test]
async fn report_unmapped_matches_leftovers_of_the_run() {
    let canonical = Arc::new(MemoryCanonicalStore::new());
    let records = vec![
        record(None, Some("Resort")),
        record(None, Some("resort")),
        record(Some("%%"), None),
        record(None, Some("Rock")),
    ];
    let source = Arc::new(MemoryRecordSource::new(records.clone()));
    source.poison(records[3].id).await;

    let outcome = BatchReconciler::new(canonical.clone(), source.clone(), settings(1))
        .run()
        .await
        .unwrap();
    let report = ReportGenerator::new(canonical.clone(), source.clone())
        .generate()
        .await
        .unwrap();

    assert_eq!(report.unmapped_count, outcome.skipped_unmatched + outcome.failed);
    let resort = canonical
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.slug == "resort")
        .unwrap();
    assert_eq!(report.per_category[&resort.id], 2);
    assert_eq!(report.per_category.len(), 2);
}
