//! Workspace metadata API.
//!
//! The sweeper only needs three things from a workspace: the bucket backing it,
//! the entity types it defines, and the rows of each entity table.

pub mod auth;
pub mod client;
pub mod error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;
use common::WorkspaceRef;
use serde::Deserialize;

pub use client::FirecloudClient;
pub use error::WorkspaceApiError;

/// One row of an entity table
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Entity {
    /// Row identifier
    pub name: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    /// Column name to cell value; cells may be scalars, lists or maps
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Name of the bucket backing the workspace
    async fn bucket_name(&self, workspace: &WorkspaceRef) -> Result<String, WorkspaceApiError>;

    /// Entity types (table names) defined in the workspace
    async fn entity_types(
        &self,
        workspace: &WorkspaceRef,
    ) -> Result<Vec<String>, WorkspaceApiError>;

    /// Every row of one entity table
    async fn entities(
        &self,
        workspace: &WorkspaceRef,
        entity_type: &str,
    ) -> Result<Vec<Entity>, WorkspaceApiError>;
}
