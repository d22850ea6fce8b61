//! End-to-end pipeline context
//!
//! Wires a test bucket, an in-memory set of workspaces, and a configuration
//! pointing at scratch files into a [`Pipeline`].

use super::StorageTestContext;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use common::config::PlanMode;
use common::{Configuration, WorkspaceRef};
use serde_json::json;
use std::sync::Arc;
use sweeper::{Pipeline, PlanEntry, PlanStore};
use tempfile::TempDir;
use terra::WorkspaceApi;
use terra::testing::InMemoryWorkspaces;

/// Bucket backing the primary workspace
pub const BUCKET: &str = "fc-test-bucket";
pub const PRIMARY: (&str, &str) = ("lab", "primary");
pub const SIBLING: (&str, &str) = ("lab", "sibling");

pub struct SweepTestContext {
    pub storage: StorageTestContext,
    pub workspaces: Arc<InMemoryWorkspaces>,
    pub config: Configuration,
    /// Ages are measured from here
    pub as_of: DateTime<Utc>,
    dir: TempDir,
}

impl SweepTestContext {
    pub fn new_in_memory() -> Result<Self> {
        Self::with_storage(StorageTestContext::new_in_memory())
    }

    pub fn new_local() -> Result<Self> {
        Self::with_storage(StorageTestContext::new_local()?)
    }

    fn with_storage(storage: StorageTestContext) -> Result<Self> {
        let dir = TempDir::new()?;

        let workspaces = Arc::new(InMemoryWorkspaces::new());
        workspaces.add_workspace(&Self::primary(), BUCKET);
        workspaces.add_workspace(&Self::sibling(), "fc-sibling-bucket");

        let mut config = Configuration::default();
        config.workspace.namespace = PRIMARY.0.to_string();
        config.workspace.name = PRIMARY.1.to_string();
        config.gcp.project_id = "test-project".to_string();
        config.inventory.path = dir.path().join("inventories/inventory.ndjson");
        config.inventory.workers = 2;
        config.inventory.queue_size = 2;
        config.inventory.page_size = 3;
        config.plan.path = dir.path().join("plans/plan.db");
        config.plan.resolver_workers = 2;
        config.clean.workers = 2;
        config.clean.queue_size = 2;
        config.clean.max_batch_size = 4;

        Ok(Self {
            storage,
            workspaces,
            config,
            as_of: Utc::now(),
            dir,
        })
    }

    pub fn primary() -> WorkspaceRef {
        WorkspaceRef::new(PRIMARY.0, PRIMARY.1)
    }

    pub fn sibling() -> WorkspaceRef {
        WorkspaceRef::new(SIBLING.0, SIBLING.1)
    }

    pub fn url(name: &str) -> String {
        format!("gs://{BUCKET}/{name}")
    }

    /// Evaluate ages as if `days` had passed since the objects were written
    pub fn advance_days(&mut self, days: i64) {
        self.as_of = Utc::now() + Duration::days(days);
    }

    pub fn set_rollup(&mut self) {
        self.config.plan.mode = PlanMode::Rollup;
    }

    pub fn snapshot_path(&self) -> std::path::PathBuf {
        self.dir.path().join("plans/plan.parquet")
    }

    /// Reference `name` from a row of `entity_type` in `workspace`
    pub fn reference(&self, workspace: &WorkspaceRef, entity_type: &str, row: &str, name: &str) {
        self.workspaces.add_entity(
            workspace,
            entity_type,
            row,
            json!({ "file": Self::url(name), "note": "kept by the lab" }),
        );
    }

    pub fn pipeline(&self) -> Pipeline {
        let api: Arc<dyn WorkspaceApi> = self.workspaces.clone();
        Pipeline::new(self.config.clone(), api)
            .with_object_store(self.storage.object_store.clone())
            .with_as_of(self.as_of)
    }

    /// Every row of the plan store
    pub async fn plan_entries(&self) -> Result<Vec<PlanEntry>> {
        let store = PlanStore::open(&self.config.plan.path).await?;
        let entries = store.entries().await?;
        store.close().await;
        Ok(entries)
    }
}
