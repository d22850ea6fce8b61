//! In-memory workspace for tests.

use crate::{Entity, WorkspaceApi, WorkspaceApiError};
use async_trait::async_trait;
use common::WorkspaceRef;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct WorkspaceTables {
    bucket: String,
    tables: BTreeMap<String, Vec<Entity>>,
}

/// A set of workspaces whose tables can be edited between pipeline phases
#[derive(Default)]
pub struct InMemoryWorkspaces {
    workspaces: Mutex<HashMap<WorkspaceRef, WorkspaceTables>>,
}

impl InMemoryWorkspaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workspace(&self, workspace: &WorkspaceRef, bucket: &str) {
        let mut workspaces = self.workspaces.lock().unwrap();
        workspaces.entry(workspace.clone()).or_default().bucket = bucket.to_string();
    }

    /// Append a row to `entity_type`, creating the table if needed
    pub fn add_entity(
        &self,
        workspace: &WorkspaceRef,
        entity_type: &str,
        name: &str,
        attributes: serde_json::Value,
    ) {
        let attributes = match attributes {
            serde_json::Value::Object(map) => map,
            other => panic!("attributes must be a JSON object, got {other}"),
        };

        let mut workspaces = self.workspaces.lock().unwrap();
        workspaces
            .entry(workspace.clone())
            .or_default()
            .tables
            .entry(entity_type.to_string())
            .or_default()
            .push(Entity {
                name: name.to_string(),
                entity_type: entity_type.to_string(),
                attributes,
            });
    }

    pub fn clear_table(&self, workspace: &WorkspaceRef, entity_type: &str) {
        let mut workspaces = self.workspaces.lock().unwrap();
        if let Some(ws) = workspaces.get_mut(workspace) {
            ws.tables.remove(entity_type);
        }
    }

    fn not_found(workspace: &WorkspaceRef) -> WorkspaceApiError {
        WorkspaceApiError::Api {
            status: 404,
            body: format!("{{\"message\":\"{workspace} does not exist\"}}"),
        }
    }
}

#[async_trait]
impl WorkspaceApi for InMemoryWorkspaces {
    async fn bucket_name(&self, workspace: &WorkspaceRef) -> Result<String, WorkspaceApiError> {
        let workspaces = self.workspaces.lock().unwrap();
        workspaces
            .get(workspace)
            .map(|ws| ws.bucket.clone())
            .ok_or_else(|| Self::not_found(workspace))
    }

    async fn entity_types(
        &self,
        workspace: &WorkspaceRef,
    ) -> Result<Vec<String>, WorkspaceApiError> {
        let workspaces = self.workspaces.lock().unwrap();
        workspaces
            .get(workspace)
            .map(|ws| ws.tables.keys().cloned().collect())
            .ok_or_else(|| Self::not_found(workspace))
    }

    async fn entities(
        &self,
        workspace: &WorkspaceRef,
        entity_type: &str,
    ) -> Result<Vec<Entity>, WorkspaceApiError> {
        let workspaces = self.workspaces.lock().unwrap();
        let ws = workspaces
            .get(workspace)
            .ok_or_else(|| Self::not_found(workspace))?;
        Ok(ws.tables.get(entity_type).cloned().unwrap_or_default())
    }
}
