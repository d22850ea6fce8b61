//! Bucket inventory.
//!
//! Lists every object in a bucket and persists `(name, size, updated)` as
//! NDJSON, one record per line.

use crate::blob::BlobRecord;
use crate::pool::{WorkerPool, jitter};
use anyhow::{Context, Result};
use common::cli::utils::human_readable_size;
use common::config::InventoryConfig;
use futures::StreamExt;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Totals of one inventory run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventorySummary {
    pub objects: u64,
    pub bytes: u64,
    pub pages: u64,
}

/// Per-run state shared by the page workers.
///
/// The writer and the counters sit behind separate locks so a slow write never
/// blocks progress accounting.
struct InventoryContext {
    writer: tokio::sync::Mutex<BufWriter<File>>,
    tally: Mutex<InventorySummary>,
}

impl InventoryContext {
    async fn persist_page(&self, page: Vec<BlobRecord>) -> Result<()> {
        let mut lines = String::new();
        let mut bytes = 0u64;
        for blob in &page {
            lines.push_str(&serde_json::to_string(blob)?);
            lines.push('\n');
            bytes += blob.size;
        }

        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(lines.as_bytes())
                .await
                .context("Failed to append inventory page")?;
        }

        let total = {
            let mut tally = self
                .tally
                .lock()
                .map_err(|_| anyhow::anyhow!("inventory counter lock poisoned"))?;
            tally.objects += page.len() as u64;
            tally.bytes += bytes;
            tally.pages += 1;
            *tally
        };

        log::info!(
            "Inventoried {} objects ({})",
            total.objects,
            human_readable_size(total.bytes)
        );
        Ok(())
    }

    fn snapshot(&self) -> InventorySummary {
        self.tally.lock().map(|t| *t).unwrap_or_default()
    }
}

/// Pages through a bucket listing and persists it
pub struct InventoryCollector {
    workers: usize,
    queue_size: usize,
    page_size: usize,
}

impl InventoryCollector {
    pub fn new(config: &InventoryConfig) -> Self {
        Self {
            workers: config.workers,
            queue_size: config.queue_size,
            page_size: config.page_size.max(1),
        }
    }

    /// List `store` and write every object to `out_path`, replacing any
    /// previous inventory there.
    pub async fn collect(
        &self,
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        out_path: &Path,
    ) -> Result<InventorySummary> {
        tracing::info!(
            bucket,
            path = %out_path.display(),
            page_size = self.page_size,
            "Starting inventory"
        );

        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        remove_if_exists(out_path)
            .await
            .with_context(|| format!("Failed to remove old inventory {}", out_path.display()))?;

        let partial = partial_path(out_path);
        let summary = match self.write_listing(store, bucket, &partial).await {
            Ok(summary) => summary,
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&partial).await {
                    log::warn!("Failed to remove {}: {cleanup}", partial.display());
                }
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, out_path)
            .await
            .with_context(|| format!("Failed to move inventory into {}", out_path.display()))?;

        tracing::info!(
            bucket,
            objects = summary.objects,
            bytes = summary.bytes,
            pages = summary.pages,
            "Inventory complete: {}",
            human_readable_size(summary.bytes)
        );

        Ok(summary)
    }

    /// List `store` into `path`. The file only holds a complete listing when
    /// this returns `Ok`.
    async fn write_listing(
        &self,
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        path: &Path,
    ) -> Result<InventorySummary> {
        let file = File::create(path)
            .await
            .with_context(|| format!("Failed to create inventory {}", path.display()))?;

        let ctx = Arc::new(InventoryContext {
            writer: tokio::sync::Mutex::new(BufWriter::new(file)),
            tally: Mutex::new(InventorySummary::default()),
        });

        let pool = {
            let ctx = ctx.clone();
            WorkerPool::new("inventory", self.workers, self.queue_size, move |page| {
                let ctx = ctx.clone();
                async move { ctx.persist_page(page).await }
            })
        };

        let mut listing_error = None;
        let mut pages = store.list(None).chunks(self.page_size);
        while let Some(page) = pages.next().await {
            let page = match page.into_iter().collect::<Result<Vec<_>, _>>() {
                Ok(metas) => metas.into_iter().map(BlobRecord::from).collect::<Vec<_>>(),
                Err(e) => {
                    listing_error = Some(anyhow::Error::new(e).context("Bucket listing failed"));
                    break;
                }
            };

            if let Err(e) = pool.submit(page).await {
                listing_error = Some(e);
                break;
            }

            let pause = jitter(10..=30);
            tokio::time::sleep(pause).await;
        }

        let pool_result = pool.join().await;
        let summary = ctx.snapshot();

        // Counts are of listed objects; the partial file is discarded by the caller
        if let Some(e) = listing_error {
            return Err(e.context(format!(
                "Inventory of {bucket} aborted after listing {} objects; no inventory was kept",
                summary.objects
            )));
        }
        pool_result.with_context(|| {
            format!(
                "Inventory of {bucket} failed after listing {} objects; no inventory was kept",
                summary.objects
            )
        })?;

        ctx.writer
            .lock()
            .await
            .flush()
            .await
            .context("Failed to flush inventory")?;

        Ok(summary)
    }
}

/// Sibling file an inventory is written to before it replaces `out_path`
fn partial_path(out_path: &Path) -> PathBuf {
    let mut name = out_path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    out_path.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Load an NDJSON inventory
pub async fn read_inventory(path: &Path) -> Result<Vec<BlobRecord>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open inventory {}", path.display()))?;

    let mut lines = BufReader::new(file).lines();
    let mut blobs = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let blob: BlobRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{line_no}: invalid record", path.display()))?;
        blobs.push(blob);
    }

    log::debug!("Read {} records from {}", blobs.len(), path.display());
    Ok(blobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::PutPayload;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn collector(page_size: usize) -> InventoryCollector {
        InventoryCollector::new(&InventoryConfig {
            workers: 3,
            queue_size: 2,
            page_size,
            ..Default::default()
        })
    }

    async fn store_with(names: &[(&str, usize)]) -> Arc<dyn ObjectStore> {
        let store = InMemory::new();
        for (name, size) in names {
            store
                .put(&ObjectPath::from(*name), PutPayload::from(vec![0u8; *size]))
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_collect_writes_every_object() {
        let names: Vec<String> = (0..25).map(|i| format!("dir{}/obj{i}.txt", i % 3)).collect();
        let objects: Vec<(&str, usize)> = names.iter().map(|n| (n.as_str(), 10)).collect();
        let store = store_with(&objects).await;

        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested/inventory.ndjson");

        let summary = collector(4).collect(store, "bkt", &out).await.unwrap();
        assert_eq!(summary.objects, 25);
        assert_eq!(summary.bytes, 250);
        assert_eq!(summary.pages, 7);

        let blobs = read_inventory(&out).await.unwrap();
        let listed: BTreeSet<String> = blobs.iter().map(|b| b.name.clone()).collect();
        let expected: BTreeSet<String> = names.into_iter().collect();
        assert_eq!(listed, expected);
        assert!(blobs.iter().all(|b| b.size == 10));
    }

    #[tokio::test]
    async fn test_collect_truncates_previous_inventory() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("inventory.ndjson");
        tokio::fs::write(&out, "stale line that is not json\n".repeat(100))
            .await
            .unwrap();

        let store = store_with(&[("a", 1), ("b", 2)]).await;
        let summary = collector(1000).collect(store, "bkt", &out).await.unwrap();
        assert_eq!(summary.objects, 2);

        let blobs = read_inventory(&out).await.unwrap();
        assert_eq!(blobs.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listing_error_leaves_no_inventory() {
        use object_store::local::LocalFileSystem;
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let bucket = TempDir::new().unwrap();
        for i in 0..20 {
            std::fs::write(bucket.path().join(format!("obj{i:02}")), b"data").unwrap();
        }
        // object names must be UTF-8, so listing this entry fails
        std::fs::write(bucket.path().join(OsStr::from_bytes(b"bad\xff")), b"data").unwrap();
        let store = Arc::new(LocalFileSystem::new_with_prefix(bucket.path()).unwrap());

        let dir = TempDir::new().unwrap();
        let out = dir.path().join("inventory.ndjson");
        tokio::fs::write(
            &out,
            "{\"name\":\"old\",\"size\":1,\"updated\":\"2024-01-01T00:00:00Z\"}\n",
        )
        .await
        .unwrap();

        let err = collector(3).collect(store, "bkt", &out).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Inventory of bkt aborted"), "{message}");
        assert!(message.contains("Bucket listing failed"), "{message}");

        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
        assert!(read_inventory(&out).await.is_err());
    }

    #[tokio::test]
    async fn test_successful_collect_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("inventory.ndjson");

        let store = store_with(&[("a", 1)]).await;
        collector(10).collect(store, "bkt", &out).await.unwrap();

        assert!(out.exists());
        assert!(!partial_path(&out).exists());
        assert_eq!(
            partial_path(&out).file_name().unwrap(),
            "inventory.ndjson.partial"
        );
    }

    #[tokio::test]
    async fn test_empty_bucket() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("inventory.ndjson");

        let summary = collector(10)
            .collect(Arc::new(InMemory::new()), "bkt", &out)
            .await
            .unwrap();
        assert_eq!(summary, InventorySummary::default());
        assert!(read_inventory(&out).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_inventory_reports_bad_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.ndjson");
        tokio::fs::write(
            &path,
            "{\"name\":\"a\",\"size\":1,\"updated\":\"2024-01-01T00:00:00Z\"}\n\nnot json\n",
        )
        .await
        .unwrap();

        let err = read_inventory(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains(":3: invalid record"));
    }

    #[tokio::test]
    async fn test_read_missing_inventory() {
        let err = read_inventory(Path::new("/nonexistent/inventory.ndjson"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to open inventory"));
    }
}
