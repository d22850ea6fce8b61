//! Deletion planning.
//!
//! Every inventoried blob is classified against the age and size thresholds
//! and the path rules, then checked against the reference set. The resulting
//! entries are sorted by name and written to the plan store, so the same
//! inputs always produce the same plan.

pub mod rollup;
pub mod snapshot;
pub mod store;

use crate::blob::BlobRecord;
use crate::references::ReferenceSet;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use common::cli::utils::human_readable_size;
use common::config::{PlanConfig, PlanMode};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub use rollup::{DeletionUnit, rollup};
pub use store::{PlanStore, PlanStoreError};

/// Path segment marking redundant pipeline logs
pub const PIPELINE_LOGS_SEGMENT: &str = "/pipelines-logs/";

/// Suffixes of execution provenance that is never deleted
pub const FORCE_KEEP_SUFFIXES: [&str; 2] = [".log", "/script"];

/// How many referencing columns are reported after planning
const TOP_COLUMNS: usize = 10;

/// Thresholds for one planning run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRules {
    pub days_considered_old: u32,
    pub bytes_considered_large: u64,
    /// Reference instant for the age rule
    pub as_of: DateTime<Utc>,
}

impl PlanRules {
    pub fn new(config: &PlanConfig, as_of: DateTime<Utc>) -> Self {
        Self {
            days_considered_old: config.days_considered_old,
            bytes_considered_large: config.bytes_considered_large,
            as_of,
        }
    }

    /// Objects last updated before this instant are old
    pub fn old_cutoff(&self) -> DateTime<Utc> {
        self.as_of - Duration::days(i64::from(self.days_considered_old))
    }
}

/// A blob with the flags deciding its fate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub url: String,
    pub blob: BlobRecord,
    pub is_large: bool,
    pub is_old: bool,
    pub is_pipeline_logs: bool,
    pub force_keep: bool,
    pub in_data_table: bool,
    pub to_delete: bool,
}

impl PlanEntry {
    pub fn name(&self) -> &str {
        &self.blob.name
    }
}

pub fn is_pipeline_logs(name: &str) -> bool {
    name.contains(PIPELINE_LOGS_SEGMENT)
}

/// Provenance logs and scripts are kept; logs under the pipeline log tree are
/// redundant copies and stay eligible.
pub fn is_force_keep(name: &str) -> bool {
    !is_pipeline_logs(name) && FORCE_KEEP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Classify one blob. `old_cutoff` is computed once per run by the caller.
pub fn classify(
    blob: BlobRecord,
    bucket: &str,
    rules: &PlanRules,
    old_cutoff: DateTime<Utc>,
    refs: &ReferenceSet,
) -> PlanEntry {
    let url = blob.url(bucket);
    let is_large = blob.size > rules.bytes_considered_large;
    let is_old = blob.updated < old_cutoff;
    let is_pipeline_logs = is_pipeline_logs(&blob.name);
    let force_keep = is_force_keep(&blob.name);
    let in_data_table = refs.contains(&url);
    let to_delete = !in_data_table && !force_keep && (is_old || is_large || is_pipeline_logs);

    PlanEntry {
        url,
        blob,
        is_large,
        is_old,
        is_pipeline_logs,
        force_keep,
        in_data_table,
        to_delete,
    }
}

/// Classify an inventory. Entries come back sorted by name; a name listed
/// twice keeps its last record.
pub fn build_plan(
    blobs: Vec<BlobRecord>,
    bucket: &str,
    rules: &PlanRules,
    refs: &ReferenceSet,
) -> Vec<PlanEntry> {
    let old_cutoff = rules.old_cutoff();

    let by_name: BTreeMap<String, BlobRecord> =
        blobs.into_iter().map(|b| (b.name.clone(), b)).collect();

    by_name
        .into_values()
        .map(|blob| classify(blob, bucket, rules, old_cutoff, refs))
        .collect()
}

/// Aggregate counts of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub objects: u64,
    pub bytes: u64,
    pub large: u64,
    pub old: u64,
    pub pipeline_logs: u64,
    pub force_keep: u64,
    pub in_data_table: u64,
    pub to_delete: u64,
    pub bytes_to_delete: u64,
    /// Deletion units, in rollup mode
    pub units: Option<u64>,
}

impl PlanSummary {
    pub fn from_entries(entries: &[PlanEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            summary.objects += 1;
            summary.bytes += entry.blob.size;
            summary.large += u64::from(entry.is_large);
            summary.old += u64::from(entry.is_old);
            summary.pipeline_logs += u64::from(entry.is_pipeline_logs);
            summary.force_keep += u64::from(entry.force_keep);
            summary.in_data_table += u64::from(entry.in_data_table);
            if entry.to_delete {
                summary.to_delete += 1;
                summary.bytes_to_delete += entry.blob.size;
            }
        }
        summary
    }

    fn log(&self) {
        tracing::info!(
            objects = self.objects,
            bytes = self.bytes,
            large = self.large,
            old = self.old,
            pipeline_logs = self.pipeline_logs,
            force_keep = self.force_keep,
            in_data_table = self.in_data_table,
            to_delete = self.to_delete,
            bytes_to_delete = self.bytes_to_delete,
            "Plan: {} of {} objects marked for deletion ({} of {})",
            self.to_delete,
            self.objects,
            human_readable_size(self.bytes_to_delete),
            human_readable_size(self.bytes)
        );
    }
}

/// Turns an inventory and a reference set into a persisted plan
pub struct PlanEngine {
    config: PlanConfig,
}

impl PlanEngine {
    pub fn new(config: PlanConfig) -> Self {
        Self { config }
    }

    /// Classify the inventory at `inventory_path` and replace the plan store
    pub async fn run(
        &self,
        inventory_path: &Path,
        bucket: &str,
        refs: &ReferenceSet,
        as_of: DateTime<Utc>,
    ) -> Result<PlanSummary> {
        let blobs = crate::inventory::read_inventory(inventory_path).await?;
        let rules = PlanRules::new(&self.config, as_of);

        tracing::info!(
            objects = blobs.len(),
            references = refs.len(),
            days_considered_old = rules.days_considered_old,
            bytes_considered_large = rules.bytes_considered_large,
            cutoff = %rules.old_cutoff(),
            "Classifying inventory"
        );

        let entries = build_plan(blobs, bucket, &rules, refs);
        let mut summary = PlanSummary::from_entries(&entries);
        summary.log();
        log_column_usage(refs, &entries);

        let store = PlanStore::create(&self.config.path)
            .await
            .with_context(|| format!("Failed to create plan {}", self.config.path.display()))?;
        store
            .write_entries(&entries)
            .await
            .context("Failed to persist plan entries")?;

        if self.config.mode == PlanMode::Rollup {
            let units = rollup(&entries);
            log_units(&units);
            store
                .write_prefixes(&units)
                .await
                .context("Failed to persist deletion units")?;
            summary.units = Some(units.len() as u64);
        }
        store.close().await;

        if let Some(snapshot_path) = &self.config.snapshot_path {
            snapshot::write_snapshot(&entries, snapshot_path)
                .await
                .with_context(|| {
                    format!("Failed to write plan snapshot {}", snapshot_path.display())
                })?;
        }

        log::info!(
            "Plan written to {} ({} entries)",
            self.config.path.display(),
            entries.len()
        );
        Ok(summary)
    }
}

fn log_column_usage(refs: &ReferenceSet, entries: &[PlanEntry]) {
    let sizes: HashMap<String, u64> = entries
        .iter()
        .filter(|e| e.in_data_table)
        .map(|e| (e.url.clone(), e.blob.size))
        .collect();

    for usage in refs.column_usage(&sizes).into_iter().take(TOP_COLUMNS) {
        log::info!(
            "Referenced by {}: {} objects, {}",
            usage.column,
            usage.objects,
            human_readable_size(usage.bytes)
        );
    }
}

fn log_units(units: &[DeletionUnit]) {
    let prefixes = units.iter().filter(|u| u.is_prefix).count();
    tracing::info!(
        units = units.len(),
        prefixes,
        files = units.len() - prefixes,
        "Rolled deletions up to {} units",
        units.len()
    );
    for unit in units.iter().filter(|u| u.is_prefix) {
        log::info!(
            "Delete prefix {}: {} objects, {}",
            unit.path,
            unit.objects,
            human_readable_size(unit.bytes)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::references::ColumnRef;
    use chrono::TimeZone;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn rules() -> PlanRules {
        PlanRules {
            days_considered_old: 90,
            bytes_considered_large: 1_073_741_824,
            as_of: as_of(),
        }
    }

    fn blob(name: &str, size: u64, days_ago: i64) -> BlobRecord {
        BlobRecord::new(name, size, as_of() - Duration::days(days_ago))
    }

    fn referenced(urls: &[&str]) -> ReferenceSet {
        let mut refs = ReferenceSet::new();
        for url in urls {
            refs.insert(
                *url,
                ColumnRef {
                    workspace: "ns/ws".to_string(),
                    entity_type: "sample".to_string(),
                    column: "file".to_string(),
                },
            );
        }
        refs
    }

    fn classify_one(blob: BlobRecord, refs: &ReferenceSet) -> PlanEntry {
        let rules = rules();
        classify(blob, "bkt", &rules, rules.old_cutoff(), refs)
    }

    #[test]
    fn test_referenced_old_large_blob_is_kept() {
        let refs = referenced(&["gs://bkt/a/data.bam"]);
        let entry = classify_one(blob("a/data.bam", 10 * GIB, 100), &refs);
        assert!(entry.in_data_table);
        assert!(entry.is_old && entry.is_large);
        assert!(!entry.to_delete);
    }

    #[test]
    fn test_recent_pipeline_log_is_deleted() {
        let entry = classify_one(
            blob("a/pipelines-logs/task/stdout.log", 100, 1),
            &ReferenceSet::new(),
        );
        assert!(entry.is_pipeline_logs);
        assert!(!entry.is_old);
        assert!(!entry.force_keep);
        assert!(entry.to_delete);
    }

    #[test]
    fn test_old_script_is_force_kept() {
        let entry = classify_one(blob("a/script", 1000, 400), &ReferenceSet::new());
        assert!(entry.is_old);
        assert!(!entry.is_large);
        assert!(entry.force_keep);
        assert!(!entry.to_delete);
    }

    #[test]
    fn test_recent_large_blob_is_deleted() {
        let entry = classify_one(blob("b/huge.bin", 2 * GIB, 5), &ReferenceSet::new());
        assert!(entry.is_large);
        assert!(!entry.is_old);
        assert!(entry.to_delete);
    }

    #[test]
    fn test_threshold_boundaries() {
        let refs = ReferenceSet::new();
        // exactly at the size threshold is not large
        assert!(!classify_one(blob("x", 1_073_741_824, 0), &refs).is_large);
        assert!(classify_one(blob("x", 1_073_741_825, 0), &refs).is_large);
        // exactly at the cutoff is not old
        assert!(!classify_one(blob("x", 1, 90), &refs).is_old);
        assert!(classify_one(blob("x", 1, 91), &refs).is_old);
    }

    #[test]
    fn test_recent_small_unreferenced_blob_is_kept() {
        let entry = classify_one(blob("c/fresh.txt", 10, 1), &ReferenceSet::new());
        assert!(!entry.to_delete);
    }

    #[test]
    fn test_force_keep_suffixes() {
        assert!(is_force_keep("run/call-1/stderr.log"));
        assert!(is_force_keep("run/call-1/script"));
        assert!(!is_force_keep("run/call-1/script.sh"));
        assert!(!is_force_keep("script"));
        assert!(!is_force_keep("x/pipelines-logs/action/1/stderr.log"));
    }

    /// Every combination of the input flags obeys the deletion invariant
    #[test]
    fn test_to_delete_invariant_exhaustive() {
        let names = [
            "a/plain.bin",
            "a/run.log",
            "a/script",
            "a/pipelines-logs/x.txt",
            "a/pipelines-logs/x.log",
        ];
        let sizes = [1, 2 * GIB];
        let ages = [1, 365];

        for name in names {
            for size in sizes {
                for age in ages {
                    for is_referenced in [false, true] {
                        let url = format!("gs://bkt/{name}");
                        let refs = if is_referenced {
                            referenced(&[url.as_str()])
                        } else {
                            ReferenceSet::new()
                        };
                        let e = classify_one(blob(name, size, age), &refs);

                        assert_eq!(e.in_data_table, is_referenced);
                        assert_eq!(
                            e.to_delete,
                            !e.in_data_table
                                && !e.force_keep
                                && (e.is_old || e.is_large || e.is_pipeline_logs),
                            "{name} size={size} age={age} referenced={is_referenced}"
                        );
                        if e.force_keep || e.in_data_table {
                            assert!(!e.to_delete);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_build_plan_sorted_and_deterministic() {
        let refs = referenced(&["gs://bkt/m/keep.bam"]);
        let blobs = vec![
            blob("z/last.bin", 2 * GIB, 1),
            blob("m/keep.bam", 1, 400),
            blob("a/first.txt", 1, 400),
        ];

        let first = build_plan(blobs.clone(), "bkt", &rules(), &refs);
        let mut reversed = blobs;
        reversed.reverse();
        let second = build_plan(reversed, "bkt", &rules(), &refs);

        assert_eq!(first, second);
        let names: Vec<&str> = first.iter().map(PlanEntry::name).collect();
        assert_eq!(names, vec!["a/first.txt", "m/keep.bam", "z/last.bin"]);
        assert_eq!(first[1].url, "gs://bkt/m/keep.bam");
    }

    #[test]
    fn test_build_plan_keeps_last_duplicate() {
        let plan = build_plan(
            vec![blob("dup", 1, 1), blob("dup", 2, 1)],
            "bkt",
            &rules(),
            &ReferenceSet::new(),
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].blob.size, 2);
    }

    #[test]
    fn test_summary_counts() {
        let refs = referenced(&["gs://bkt/a/data.bam"]);
        let entries = build_plan(
            vec![
                blob("a/data.bam", 10 * GIB, 100),
                blob("a/pipelines-logs/task/stdout.log", 100, 1),
                blob("a/script", 1000, 400),
                blob("b/huge.bin", 2 * GIB, 5),
            ],
            "bkt",
            &rules(),
            &refs,
        );

        let summary = PlanSummary::from_entries(&entries);
        assert_eq!(summary.objects, 4);
        assert_eq!(summary.to_delete, 2);
        assert_eq!(summary.bytes_to_delete, 2 * GIB + 100);
        assert_eq!(summary.large, 2);
        assert_eq!(summary.old, 2);
        assert_eq!(summary.force_keep, 1);
        assert_eq!(summary.pipeline_logs, 1);
        assert_eq!(summary.in_data_table, 1);
        assert_eq!(summary.units, None);
    }
}
