//! Plan execution.
//!
//! The executor never trusts the plan's `in_data_table` flag: every selected
//! URL is checked against a reference set rebuilt just before deletion, and
//! any overlap aborts the run before a single object is touched.
//!
//! Deletion then proceeds in evenly sized batches, one batched request per
//! batch, on a bounded pool. A failed object is recorded and skipped.

use crate::plan::{PlanEntry, PlanStore};
use crate::pool::{WorkerPool, jitter};
use crate::references::ReferenceSet;
use anyhow::{Context, Result};
use common::cli::utils::human_readable_size;
use common::config::{CleanConfig, MAX_OBJECTS_PER_BATCH};
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Referenced URLs reported in a [`SafetyViolation`]
const VIOLATION_SAMPLES: usize = 10;

/// Objects selected for deletion are still referenced by a data table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "refusing to delete: {count} objects selected for deletion are still referenced (e.g. {})",
    samples.join(", ")
)]
pub struct SafetyViolation {
    pub count: usize,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one clean run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Objects selected by the plan
    pub selected: u64,
    pub selected_bytes: u64,
    pub batches: u64,
    pub objects_deleted: u64,
    pub bytes_deleted: u64,
    pub objects_failed: u64,
    pub failures: Vec<DeletionFailure>,
    pub dry_run: bool,
}

/// The `to_delete` entries, provided none of them is in `fresh_refs`
pub fn select_for_deletion(
    entries: Vec<PlanEntry>,
    fresh_refs: &ReferenceSet,
) -> Result<Vec<PlanEntry>, SafetyViolation> {
    let selected: Vec<PlanEntry> = entries.into_iter().filter(|e| e.to_delete).collect();

    let referenced: Vec<&str> = selected
        .iter()
        .filter(|e| fresh_refs.contains(&e.url))
        .map(|e| e.url.as_str())
        .collect();

    if !referenced.is_empty() {
        return Err(SafetyViolation {
            count: referenced.len(),
            samples: referenced
                .iter()
                .take(VIOLATION_SAMPLES)
                .map(|s| s.to_string())
                .collect(),
        });
    }

    Ok(selected)
}

/// Split `items` into the fewest batches of at most `max_batch_size`, with
/// sizes differing by at most one batch's remainder.
pub fn split_batches<T>(items: Vec<T>, max_batch_size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }

    let max = max_batch_size.clamp(1, MAX_OBJECTS_PER_BATCH);
    let count = items.len().div_ceil(max);
    let size = items.len().div_ceil(count);

    let mut batches = Vec::with_capacity(count);
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(size).collect());
    }
    batches
}

/// Object name a storage error refers to, when the error carries one
fn error_path(error: &object_store::Error) -> Option<&str> {
    use object_store::Error as E;
    match error {
        E::NotFound { path, .. }
        | E::AlreadyExists { path, .. }
        | E::Precondition { path, .. }
        | E::NotModified { path, .. }
        | E::PermissionDenied { path, .. }
        | E::Unauthenticated { path, .. } => Some(path.as_str()),
        _ => None,
    }
}

/// Stores report either the object key or a backend path ending in it
fn refers_to(error_path: &str, name: &str) -> bool {
    error_path == name
        || error_path
            .strip_suffix(name)
            .is_some_and(|rest| rest.ends_with('/'))
}

/// Result of deleting one batch
#[derive(Debug, Default)]
struct BatchOutcome {
    deleted: u64,
    bytes: u64,
    failures: Vec<DeletionFailure>,
}

/// Issue one batched delete and attribute each result to its object
async fn delete_batch(store: &dyn ObjectStore, batch: Vec<PlanEntry>) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let mut sizes: HashMap<String, u64> = HashMap::with_capacity(batch.len());
    let mut locations = Vec::with_capacity(batch.len());

    for entry in batch {
        match Path::parse(entry.name()) {
            Ok(path) => {
                sizes.insert(entry.blob.name.clone(), entry.blob.size);
                locations.push(Ok(path));
            }
            Err(e) => outcome.failures.push(DeletionFailure {
                name: entry.blob.name,
                error: e.to_string(),
            }),
        }
    }

    let results: Vec<object_store::Result<Path>> = store
        .delete_stream(futures::stream::iter(locations).boxed())
        .collect()
        .await;

    let mut confirmed: HashSet<String> = HashSet::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(path) => {
                confirmed.insert(path.to_string());
            }
            Err(e) => errors.push(e),
        }
    }

    let mut unconfirmed: Vec<&String> = sizes
        .keys()
        .filter(|name| !confirmed.contains(*name))
        .collect();
    unconfirmed.sort();

    let mut messages: HashMap<&str, String> = HashMap::new();
    let mut unattributed = Vec::new();
    for e in &errors {
        match error_path(e).and_then(|p| unconfirmed.iter().find(|n| refers_to(p, n))) {
            Some(name) => {
                messages.insert(name.as_str(), e.to_string());
            }
            None => unattributed.push(e.to_string()),
        }
    }
    let mut unattributed = unattributed.into_iter();

    for name in &unconfirmed {
        let error = messages
            .remove(name.as_str())
            .or_else(|| unattributed.next())
            .unwrap_or_else(|| "not confirmed deleted".to_string());
        log::warn!("Failed to delete {name}: {error}");
        outcome.failures.push(DeletionFailure {
            name: name.to_string(),
            error,
        });
    }

    for name in &confirmed {
        if let Some(size) = sizes.get(name) {
            outcome.deleted += 1;
            outcome.bytes += size;
        }
    }

    outcome
}

/// Per-run tally shared by the batch workers
struct CleanContext {
    store: Arc<dyn ObjectStore>,
    dry_run: bool,
    report: Mutex<DeletionReport>,
}

impl CleanContext {
    async fn run_batch(&self, batch: Vec<PlanEntry>) -> Result<()> {
        let outcome = if self.dry_run {
            let bytes = batch.iter().map(|e| e.blob.size).sum();
            for entry in &batch {
                log::debug!("Would delete {}", entry.url);
            }
            log::info!(
                "Dry run: would delete {} objects ({})",
                batch.len(),
                human_readable_size(bytes)
            );
            BatchOutcome::default()
        } else {
            delete_batch(self.store.as_ref(), batch).await
        };

        let mut report = self
            .report
            .lock()
            .map_err(|_| anyhow::anyhow!("deletion tally lock poisoned"))?;
        report.objects_deleted += outcome.deleted;
        report.bytes_deleted += outcome.bytes;
        report.objects_failed += outcome.failures.len() as u64;
        report.failures.extend(outcome.failures);

        if !self.dry_run {
            log::info!(
                "Deleted {} of {} objects ({}), {} failed",
                report.objects_deleted,
                report.selected,
                human_readable_size(report.bytes_deleted),
                report.objects_failed
            );
        }
        Ok(())
    }

    fn snapshot(&self) -> DeletionReport {
        self.report.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// Deletes the objects a plan selects
pub struct DeletionExecutor {
    store: Arc<dyn ObjectStore>,
    max_batch_size: usize,
    workers: usize,
    queue_size: usize,
    dry_run: bool,
}

impl DeletionExecutor {
    pub fn new(store: Arc<dyn ObjectStore>, config: &CleanConfig) -> Self {
        Self {
            store,
            max_batch_size: config.max_batch_size,
            workers: config.workers,
            queue_size: config.queue_size,
            dry_run: config.dry_run,
        }
    }

    /// Re-check the plan against `fresh_refs` and delete what it selects.
    ///
    /// Returns a [`SafetyViolation`] (downcastable from the error) without
    /// deleting anything if a selected object is referenced.
    pub async fn execute(&self, plan: &PlanStore, fresh_refs: &ReferenceSet) -> Result<DeletionReport> {
        let entries = plan
            .to_delete()
            .await
            .with_context(|| format!("Failed to read plan {}", plan.path().display()))?;
        let selected = select_for_deletion(entries, fresh_refs)?;

        let selected_bytes: u64 = selected.iter().map(|e| e.blob.size).sum();
        let batches = split_batches(selected, self.max_batch_size);

        let report = DeletionReport {
            selected: batches.iter().map(|b| b.len() as u64).sum(),
            selected_bytes,
            batches: batches.len() as u64,
            dry_run: self.dry_run,
            ..Default::default()
        };
        tracing::info!(
            objects = report.selected,
            bytes = report.selected_bytes,
            batches = report.batches,
            dry_run = self.dry_run,
            "Deleting {} objects ({})",
            report.selected,
            human_readable_size(report.selected_bytes)
        );

        let ctx = Arc::new(CleanContext {
            store: self.store.clone(),
            dry_run: self.dry_run,
            report: Mutex::new(report),
        });

        let pool = {
            let ctx = ctx.clone();
            WorkerPool::new("delete", self.workers, self.queue_size, move |batch| {
                let ctx = ctx.clone();
                async move { ctx.run_batch(batch).await }
            })
        };

        let mut submit_error = None;
        for batch in batches {
            if let Err(e) = pool.submit(batch).await {
                submit_error = Some(e);
                break;
            }
            let pause = jitter(10..=30);
            tokio::time::sleep(pause).await;
        }

        let pool_result = pool.join().await;
        let report = ctx.snapshot();
        let result = match submit_error {
            Some(e) => Err(e),
            None => pool_result.map(|_| ()),
        };
        if let Err(e) = result {
            return Err(e.context(format!(
                "Clean aborted after deleting {} of {} objects",
                report.objects_deleted, report.selected
            )));
        }

        tracing::info!(
            deleted = report.objects_deleted,
            bytes = report.bytes_deleted,
            failed = report.objects_failed,
            dry_run = report.dry_run,
            "Clean complete: removed {} objects ({})",
            report.objects_deleted,
            human_readable_size(report.bytes_deleted)
        );
        Ok(report)
    }
}
