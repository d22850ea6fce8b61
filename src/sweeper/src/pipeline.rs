//! Phase orchestration.
//!
//! Each phase reads the complete durable output of the previous one: the
//! inventory file, then the plan store. The reference set is rebuilt by both
//! `plan` and `clean`.

use crate::clean::{DeletionExecutor, DeletionReport};
use crate::inventory::{InventoryCollector, InventorySummary};
use crate::plan::{PlanEngine, PlanStore, PlanSummary};
use crate::references::{ReferenceResolver, ReferenceSet};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::Configuration;
use common::storage::create_object_store;
use object_store::ObjectStore;
use std::sync::Arc;
use terra::WorkspaceApi;

/// Results of `run-all`
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub inventory: InventorySummary,
    pub plan: PlanSummary,
    pub clean: DeletionReport,
}

pub struct Pipeline {
    config: Configuration,
    api: Arc<dyn WorkspaceApi>,
    store: Option<Arc<dyn ObjectStore>>,
    as_of: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(config: Configuration, api: Arc<dyn WorkspaceApi>) -> Self {
        Self {
            config,
            api,
            store: None,
            as_of: None,
        }
    }

    /// Use `store` instead of opening the workspace bucket
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Evaluate ages against `as_of` instead of the current time
    pub fn with_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Bucket backing the primary workspace
    pub async fn bucket(&self) -> Result<String> {
        let workspace = self.config.workspace.primary();
        self.api
            .bucket_name(&workspace)
            .await
            .with_context(|| format!("Failed to look up the bucket of {workspace}"))
    }

    fn object_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        match &self.store {
            Some(store) => Ok(store.clone()),
            None => create_object_store(&self.config.storage, bucket),
        }
    }

    /// References into the primary bucket from every configured workspace
    pub async fn resolve_references(&self, bucket: &str) -> Result<ReferenceSet> {
        let resolver = ReferenceResolver::new(self.api.clone(), self.config.plan.resolver_workers);
        resolver
            .resolve(
                &self.config.workspace.all_workspaces(),
                &[bucket.to_string()],
            )
            .await
    }

    pub async fn inventory(&self) -> Result<InventorySummary> {
        let bucket = self.bucket().await?;
        let store = self.object_store(&bucket)?;

        InventoryCollector::new(&self.config.inventory)
            .collect(store, &bucket, &self.config.inventory.path)
            .await
            .context("Inventory phase failed")
    }

    pub async fn plan(&self) -> Result<PlanSummary> {
        let bucket = self.bucket().await?;
        let refs = self
            .resolve_references(&bucket)
            .await
            .context("Plan phase failed while resolving references")?;
        let as_of = self.as_of.unwrap_or_else(Utc::now);

        PlanEngine::new(self.config.plan.clone())
            .run(&self.config.inventory.path, &bucket, &refs, as_of)
            .await
            .context("Plan phase failed")
    }

    pub async fn clean(&self) -> Result<DeletionReport> {
        let bucket = self.bucket().await?;
        let store = self.object_store(&bucket)?;
        let plan = PlanStore::open(&self.config.plan.path)
            .await
            .context("Clean phase failed to open the plan")?;

        let result = async {
            let fresh_refs = self
                .resolve_references(&bucket)
                .await
                .context("Clean phase failed while resolving references")?;
            DeletionExecutor::new(store, &self.config.clean)
                .execute(&plan, &fresh_refs)
                .await
                .context("Clean phase failed")
        }
        .await;

        plan.close().await;
        result
    }

    /// Inventory, plan and clean in sequence
    pub async fn run_all(&self) -> Result<RunSummary> {
        let inventory = self.inventory().await?;
        let plan = self.plan().await?;
        let clean = self.clean().await?;
        Ok(RunSummary {
            inventory,
            plan,
            clean,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::WorkspaceRef;
    use object_store::memory::InMemory;
    use terra::{MockWorkspaceApi, WorkspaceApiError};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Configuration {
        let mut config = Configuration::default();
        config.workspace.namespace = "ns".to_string();
        config.workspace.name = "ws".to_string();
        config.gcp.project_id = "proj".to_string();
        config.inventory.path = dir.path().join("inventory.ndjson");
        config.plan.path = dir.path().join("plan.db");
        config
    }

    #[tokio::test]
    async fn test_bucket_lookup_failure_aborts_inventory() {
        let mut api = MockWorkspaceApi::new();
        api.expect_bucket_name()
            .withf(|ws: &WorkspaceRef| ws.to_string() == "ns/ws")
            .returning(|_| {
                Err(WorkspaceApiError::Api {
                    status: 403,
                    body: "forbidden".to_string(),
                })
            });

        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&dir), Arc::new(api))
            .with_object_store(Arc::new(InMemory::new()));

        let err = pipeline.inventory().await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Failed to look up the bucket of ns/ws"), "{message}");
        assert!(message.contains("HTTP 403 error: forbidden"), "{message}");
        assert!(!dir.path().join("inventory.ndjson").exists());
    }

    #[tokio::test]
    async fn test_clean_without_plan_fails() {
        let mut api = MockWorkspaceApi::new();
        api.expect_bucket_name().returning(|_| Ok("bkt".to_string()));

        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&dir), Arc::new(api))
            .with_object_store(Arc::new(InMemory::new()));

        let err = pipeline.clean().await.unwrap_err();
        assert!(format!("{err:#}").contains("does not exist"));
    }
}
