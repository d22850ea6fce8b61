//! Storage test context for integration testing
//!
//! Provides in-memory and local filesystem buckets. The local variant reports
//! missing objects on delete, which the in-memory store does not.

use anyhow::Result;
use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tempfile::TempDir;

/// Test context for object storage operations
pub struct StorageTestContext {
    pub object_store: Arc<dyn ObjectStore>,
    // Keeps the local bucket directory alive
    _root: Option<TempDir>,
}

impl StorageTestContext {
    /// Creates in-memory storage for fast tests
    pub fn new_in_memory() -> Self {
        Self {
            object_store: Arc::new(InMemory::new()),
            _root: None,
        }
    }

    /// Creates a bucket backed by a temporary directory
    pub fn new_local() -> Result<Self> {
        let root = TempDir::new()?;
        let object_store = Arc::new(LocalFileSystem::new_with_prefix(root.path())?);
        Ok(Self {
            object_store,
            _root: Some(root),
        })
    }

    /// Writes an object of `size` bytes
    pub async fn put(&self, name: &str, size: usize) -> Result<()> {
        self.object_store
            .put(&Path::from(name), PutPayload::from(vec![0u8; size]))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.object_store.delete(&Path::from(name)).await?;
        Ok(())
    }

    /// Lists all objects in storage, sorted by name
    pub async fn list_all_objects(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut stream = self.object_store.list(None);
        while let Some(meta) = stream.next().await {
            paths.push(meta?.location.to_string());
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.object_store.head(&Path::from(name)).await.is_ok()
    }
}
