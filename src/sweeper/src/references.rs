//! Blob references held in workspace entity tables.
//!
//! A blob is referenced when any cell of any entity table, in the swept
//! workspace or a sibling, contains its `gs://bucket/name` URL. Cells can be
//! scalars, lists, or maps nested to any depth.

use crate::pool::WorkerPool;
use anyhow::{Context, Result};
use common::WorkspaceRef;
use common::storage::bucket_prefix;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use terra::{Entity, WorkspaceApi};

/// Where a reference was found
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    pub workspace: String,
    pub entity_type: String,
    pub column: String,
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.workspace, self.entity_type, self.column)
    }
}

/// Aggregate size of the blobs one column references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUsage {
    pub column: ColumnRef,
    pub objects: u64,
    pub bytes: u64,
}

/// Object URLs referenced by entity tables, with the columns referencing them.
///
/// Rebuilt on every plan and clean run; never persisted.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    refs: HashMap<String, BTreeSet<ColumnRef>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>, source: ColumnRef) {
        self.refs.entry(url.into()).or_default().insert(source);
    }

    pub fn contains(&self, url: &str) -> bool {
        self.refs.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Columns referencing `url`
    pub fn sources(&self, url: &str) -> Option<&BTreeSet<ColumnRef>> {
        self.refs.get(url)
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().map(String::as_str)
    }

    pub fn merge(&mut self, other: ReferenceSet) {
        for (url, sources) in other.refs {
            self.refs.entry(url).or_default().extend(sources);
        }
    }

    /// Referencing columns ranked by the total size of the listed blobs they
    /// point at. URLs missing from `sizes` (not in the inventory) are skipped.
    pub fn column_usage(&self, sizes: &HashMap<String, u64>) -> Vec<ColumnUsage> {
        let mut usage: BTreeMap<&ColumnRef, (u64, u64)> = BTreeMap::new();
        for (url, sources) in &self.refs {
            let Some(size) = sizes.get(url) else {
                continue;
            };
            for source in sources {
                let entry = usage.entry(source).or_default();
                entry.0 += 1;
                entry.1 += size;
            }
        }

        let mut ranked: Vec<ColumnUsage> = usage
            .into_iter()
            .map(|(column, (objects, bytes))| ColumnUsage {
                column: column.clone(),
                objects,
                bytes,
            })
            .collect();
        // stable sort keeps column order among equal sizes
        ranked.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        ranked
    }
}

/// Every string reachable from `value`.
///
/// Lists contribute their elements and maps their values; numbers, booleans
/// and nulls contribute nothing.
pub fn flatten_strings(value: &Value) -> Vec<&str> {
    let mut found = Vec::new();
    let mut stack = vec![value];

    while let Some(current) = stack.pop() {
        match current {
            Value::String(s) => found.push(s.as_str()),
            Value::Array(items) => stack.extend(items.iter().rev()),
            Value::Object(map) => stack.extend(map.values().rev()),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    found
}

/// Collect the references one entity table makes into any of `prefixes`
fn extract_references(
    workspace: &WorkspaceRef,
    entity_type: &str,
    entities: &[Entity],
    prefixes: &[String],
) -> ReferenceSet {
    let mut refs = ReferenceSet::new();
    for entity in entities {
        for (column, value) in &entity.attributes {
            for s in flatten_strings(value) {
                if prefixes.iter().any(|p| s.starts_with(p.as_str())) {
                    refs.insert(
                        s,
                        ColumnRef {
                            workspace: workspace.to_string(),
                            entity_type: entity_type.to_string(),
                            column: column.clone(),
                        },
                    );
                }
            }
        }
    }
    refs
}

/// Builds a [`ReferenceSet`] by fetching entity tables concurrently
pub struct ReferenceResolver {
    api: Arc<dyn WorkspaceApi>,
    workers: usize,
    queue_size: usize,
}

impl ReferenceResolver {
    pub fn new(api: Arc<dyn WorkspaceApi>, workers: usize) -> Self {
        Self {
            api,
            workers,
            queue_size: workers.max(1) * 2,
        }
    }

    /// References from every table of every workspace into any of `buckets`
    pub async fn resolve(
        &self,
        workspaces: &[WorkspaceRef],
        buckets: &[String],
    ) -> Result<ReferenceSet> {
        let prefixes: Arc<Vec<String>> =
            Arc::new(buckets.iter().map(|b| bucket_prefix(b)).collect());
        let merged = Arc::new(Mutex::new(ReferenceSet::new()));

        let pool = {
            let api = self.api.clone();
            let merged = merged.clone();
            let prefixes = prefixes.clone();
            WorkerPool::new(
                "reference",
                self.workers,
                self.queue_size,
                move |(workspace, entity_type): (WorkspaceRef, String)| {
                    let api = api.clone();
                    let merged = merged.clone();
                    let prefixes = prefixes.clone();
                    async move {
                        let entities = api
                            .entities(&workspace, &entity_type)
                            .await
                            .with_context(|| {
                                format!("Failed to fetch {entity_type} table of {workspace}")
                            })?;
                        let found =
                            extract_references(&workspace, &entity_type, &entities, &prefixes);
                        log::debug!(
                            "{workspace}: {} rows of {entity_type} reference {} objects",
                            entities.len(),
                            found.len()
                        );
                        merged
                            .lock()
                            .map_err(|_| anyhow::anyhow!("reference set lock poisoned"))?
                            .merge(found);
                        Ok(())
                    }
                },
            )
        };

        let mut listing_error = None;
        let mut tables = 0usize;
        'workspaces: for workspace in workspaces {
            let entity_types = match self.api.entity_types(workspace).await {
                Ok(types) => types,
                Err(e) => {
                    listing_error = Some(
                        anyhow::Error::new(e)
                            .context(format!("Failed to list entity types of {workspace}")),
                    );
                    break;
                }
            };
            log::info!("{workspace}: {} entity types", entity_types.len());

            for entity_type in entity_types {
                if let Err(e) = pool.submit((workspace.clone(), entity_type)).await {
                    listing_error = Some(e);
                    break 'workspaces;
                }
                tables += 1;
            }
        }

        let pool_result = pool.join().await;
        if let Some(e) = listing_error {
            return Err(e);
        }
        pool_result.context("Reference resolution failed")?;

        let refs = std::mem::take(
            &mut *merged
                .lock()
                .map_err(|_| anyhow::anyhow!("reference set lock poisoned"))?,
        );

        tracing::info!(
            workspaces = workspaces.len(),
            tables,
            references = refs.len(),
            "Resolved references"
        );
        Ok(refs)
    }
}
