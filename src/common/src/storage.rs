use anyhow::Result;
use object_store::{
    ObjectStore, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem, memory::InMemory,
};
use std::sync::Arc;
use url::Url;

use crate::config::StorageConfig;

/// Scheme prefix of object references stored in workspace tables
pub const GCS_SCHEME: &str = "gs://";

/// Bucket-qualified URL of an object, e.g. `gs://bucket/a/b.txt`
pub fn blob_url(bucket: &str, name: &str) -> String {
    format!("{GCS_SCHEME}{bucket}/{name}")
}

/// Prefix every object URL in `bucket` starts with
pub fn bucket_prefix(bucket: &str) -> String {
    format!("{GCS_SCHEME}{bucket}/")
}

/// Create the object store for a workspace bucket.
///
/// `storage.url` overrides the bucket (local runs and tests); otherwise the
/// bucket is opened on Google Cloud Storage with ambient credentials.
pub fn create_object_store(
    storage_config: &StorageConfig,
    bucket: &str,
) -> Result<Arc<dyn ObjectStore>> {
    match &storage_config.url {
        Some(dsn) => create_object_store_from_dsn(dsn),
        None => create_object_store_from_dsn(&format!("{GCS_SCHEME}{bucket}")),
    }
}

/// Create an object store from a DSN string
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/storage"
                ));
            }
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "gs" => {
            let bucket = url
                .host_str()
                .ok_or_else(|| anyhow::anyhow!("GCS DSN must specify a bucket: gs://bucket"))?;
            let store = GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(Arc::new(store))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: gs, file, memory",
            scheme
        )),
    }
}
