//! Per-run report directory: markdown brief, JSON outcome, parquet snapshots + sha256 manifest.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::reconciler::RunOutcome;
use crate::report::DistributionReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `reports_root/<run_id>/` and returns that directory.
pub async fn write_run_reports(
    reports_root: &Path,
    outcome: &RunOutcome,
    report: &DistributionReport,
) -> Result<PathBuf> {
    let run_dir = reports_root.join(outcome.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join("reconcile_brief.md"), brief_markdown(outcome, report))
        .await
        .context("writing reconcile_brief.md")?;

    let outcome_json = serde_json::to_vec_pretty(&serde_json::json!({
        "outcome": outcome,
        "report": report,
    }))
    .context("serializing run outcome")?;
    fs::write(run_dir.join("run_outcome.json"), outcome_json)
        .await
        .context("writing run_outcome.json")?;

    export_parquet_snapshots(&run_dir, outcome, report).await?;
    Ok(run_dir)
}

pub fn brief_markdown(outcome: &RunOutcome, report: &DistributionReport) -> String {
    let mode = if outcome.dry_run { "dry run" } else { "committed" };
    let mut lines = vec![
        "# Category Reconciliation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", outcome.run_id),
        format!("- Mode: {mode}"),
        format!("- Started: {}", outcome.started_at),
        format!("- Finished: {}", outcome.finished_at),
        String::new(),
        "## Outcome".to_string(),
        format!("- Eligible records: {}", outcome.eligible),
        format!("- Updated: {}", outcome.updated),
        format!("- Skipped (unmatched): {}", outcome.skipped_unmatched),
        format!("- Failed: {}", outcome.failed),
        format!(
            "- Batches: {} ({} failed)",
            outcome.batches.len(),
            outcome.batches.iter().filter(|b| b.error.is_some()).count()
        ),
        format!(
            "- Tiers: exact {}, case-insensitive {}, substring {}",
            outcome.tiers.exact, outcome.tiers.case_insensitive, outcome.tiers.substring
        ),
        String::new(),
        "## Discovery".to_string(),
        format!("- Distinct legacy pairs: {}", outcome.discovery.distinct_pairs),
        format!("- Already present: {}", outcome.discovery.already_present),
        format!("- Created: {}", outcome.discovery.created.len()),
        format!("- Planned: {}", outcome.discovery.planned.len()),
        format!("- Errors: {}", outcome.discovery.errors.len()),
    ];
    for failure in &outcome.discovery.errors {
        lines.push(format!(
            "  - ({:?}, {:?}): {}",
            failure.pair.name_local, failure.pair.name_en, failure.message
        ));
    }
    lines.push(String::new());
    lines.push(report.markdown());
    lines.join("\n")
}

async fn export_parquet_snapshots(
    run_dir: &Path,
    outcome: &RunOutcome,
    report: &DistributionReport,
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let distribution_path = snapshot_dir.join("distribution.parquet");
    let assignments_path = snapshot_dir.join("assignments.parquet");
    write_distribution_parquet(&distribution_path, report)?;
    write_assignments_parquet(&assignments_path, outcome)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("distribution", run_dir, &distribution_path)?,
            manifest_entry("assignments", run_dir, &assignments_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_distribution_parquet(path: &Path, report: &DistributionReport) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category_id", DataType::Utf8, false),
        ArrowField::new("slug", DataType::Utf8, false),
        ArrowField::new("name_local", DataType::Utf8, false),
        ArrowField::new("name_en", DataType::Utf8, false),
        ArrowField::new("records", DataType::UInt64, false),
    ]));

    let ids = StringArray::from(
        report
            .rows
            .iter()
            .map(|r| r.category_id.to_string())
            .collect::<Vec<_>>(),
    );
    let slugs = StringArray::from(report.rows.iter().map(|r| r.slug.as_str()).collect::<Vec<_>>());
    let locals = StringArray::from(
        report
            .rows
            .iter()
            .map(|r| r.name_local.as_str())
            .collect::<Vec<_>>(),
    );
    let ens = StringArray::from(report.rows.iter().map(|r| r.name_en.as_str()).collect::<Vec<_>>());
    let counts = UInt64Array::from(report.rows.iter().map(|r| r.count as u64).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(slugs),
            Arc::new(locals),
            Arc::new(ens),
            Arc::new(counts),
        ],
    )
    .context("building distribution record batch")?;
    write_parquet(path, batch)
}

fn write_assignments_parquet(path: &Path, outcome: &RunOutcome) -> Result<()> {
    let failed: HashSet<_> = outcome.failed_record_ids.iter().copied().collect();
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("category_id", DataType::Utf8, false),
        ArrowField::new("committed", DataType::Boolean, false),
    ]));

    let record_ids = StringArray::from(
        outcome
            .assignments
            .iter()
            .map(|a| a.record_id.to_string())
            .collect::<Vec<_>>(),
    );
    let category_ids = StringArray::from(
        outcome
            .assignments
            .iter()
            .map(|a| a.category_id.to_string())
            .collect::<Vec<_>>(),
    );
    let committed = BooleanArray::from(
        outcome
            .assignments
            .iter()
            .map(|a| !outcome.dry_run && !failed.contains(&a.record_id))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(record_ids), Arc::new(category_ids), Arc::new(committed)],
    )
    .context("building assignments record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Summary of the newest `runs` report directories under `reports_root`.
pub fn report_history_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Reconciliation History".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let outcome_path = dir.path().join("run_outcome.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&outcome_path)
                .with_context(|| format!("reading {}", outcome_path.display()))?,
        )
        .with_context(|| format!("parsing {}", outcome_path.display()))?;
        let count = |key: &str| {
            value
                .get("outcome")
                .and_then(|o| o.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let dry_run = value
            .get("outcome")
            .and_then(|o| o.get("dry_run"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let unmapped = value
            .get("report")
            .and_then(|r| r.get("unmapped_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`{}", if dry_run { " (dry run)" } else { "" }));
        lines.push(format!(
            "- updated: {}, unmatched: {}, failed: {}",
            count("updated"),
            count("skipped_unmatched"),
            count("failed")
        ));
        lines.push(format!("- unmapped after run: {unmapped}"));
        if manifest_path.exists() {
            lines.push(format!("- snapshot manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
