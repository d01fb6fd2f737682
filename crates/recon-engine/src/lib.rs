//! Category reconciliation engine: discovery, tiered matching, batched backfill, reporting.

pub mod artifacts;
pub mod config;
pub mod discovery;
pub mod matcher;
pub mod reconciler;
pub mod report;

pub use artifacts::{report_history_markdown, write_run_reports};
pub use config::{parse_schema_mapping, ReconConfig};
pub use discovery::{distinct_pairs, CategoryDiscovery, DiscoverySummary};
pub use matcher::{MatchResolver, MatchTier, Resolution};
pub use reconciler::{BatchReconciler, ReconcileError, ReconcilerSettings, RunCounts, RunOutcome};
pub use report::{build_report, project_dry_run, DistributionReport, ReportGenerator};

pub const CRATE_NAME: &str = "recon-engine";
