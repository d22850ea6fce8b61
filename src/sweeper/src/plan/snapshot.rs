//! Parquet copy of the `blobs` table.

use super::PlanEntry;
use anyhow::{Context, Result};
use datafusion::arrow::array::{
    ArrayRef, BooleanArray, RecordBatch, StringArray, TimestampMicrosecondArray, UInt64Array,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::parquet::{
    arrow::{AsyncArrowWriter, async_writer::ParquetObjectWriter},
    file::properties::{WriterProperties, WriterVersion},
};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use std::path::Path;
use std::sync::Arc;

/// Arrow schema mirroring the `blobs` table
pub fn blobs_schema() -> SchemaRef {
    let flag = |name: &str| Field::new(name, DataType::Boolean, false);

    Arc::new(Schema::new(vec![
        Field::new("url", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("size", DataType::UInt64, false),
        Field::new(
            "updated",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        flag("is_large"),
        flag("is_old"),
        flag("is_pipeline_logs"),
        flag("force_keep"),
        flag("in_data_table"),
        flag("to_delete"),
    ]))
}

pub fn entries_to_batch(entries: &[PlanEntry]) -> Result<RecordBatch> {
    let flag = |f: fn(&PlanEntry) -> bool| -> ArrayRef {
        Arc::new(BooleanArray::from(entries.iter().map(f).collect::<Vec<_>>()))
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            entries.iter().map(|e| e.url.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.name()))),
        Arc::new(UInt64Array::from_iter_values(
            entries.iter().map(|e| e.blob.size),
        )),
        Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                entries.iter().map(|e| e.blob.updated.timestamp_micros()),
            )
            .with_timezone("UTC"),
        ),
        flag(|e| e.is_large),
        flag(|e| e.is_old),
        flag(|e| e.is_pipeline_logs),
        flag(|e| e.force_keep),
        flag(|e| e.in_data_table),
        flag(|e| e.to_delete),
    ];

    RecordBatch::try_new(blobs_schema(), columns).context("Failed to build plan record batch")
}

/// Write `entries` to a Parquet file at `path`, replacing it
pub async fn write_snapshot(entries: &[PlanEntry], path: &Path) -> Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid snapshot path {}", path.display()))?;

    tokio::fs::create_dir_all(&dir).await?;
    let store = Arc::new(LocalFileSystem::new_with_prefix(&dir)?);

    let batch = entries_to_batch(entries)?;
    let props = WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .build();

    let object_writer = ParquetObjectWriter::new(store, ObjectPath::from(file_name));
    let mut writer = AsyncArrowWriter::try_new(object_writer, batch.schema(), Some(props))
        .map_err(|e| anyhow::anyhow!("Failed to create parquet writer: {}", e))?;

    writer.write(&batch).await?;
    writer.close().await?;

    log::info!(
        "Wrote plan snapshot {} ({} rows)",
        path.display(),
        batch.num_rows()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobRecord;
    use chrono::{TimeZone, Utc};
    use datafusion::arrow::array::Array;
    use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReader;
    use std::fs::File;
    use tempfile::tempdir;

    fn entries() -> Vec<PlanEntry> {
        ["a/one", "b/two"]
            .into_iter()
            .enumerate()
            .map(|(i, name)| PlanEntry {
                url: format!("gs://bkt/{name}"),
                blob: BlobRecord::new(
                    name,
                    i as u64 * 10,
                    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                ),
                is_large: false,
                is_old: true,
                is_pipeline_logs: false,
                force_keep: false,
                in_data_table: i == 1,
                to_delete: i == 0,
            })
            .collect()
    }

    #[test]
    fn test_batch_matches_schema() {
        let batch = entries_to_batch(&entries()).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 10);
        assert_eq!(batch.schema(), blobs_schema());

        let to_delete = batch
            .column_by_name("to_delete")
            .unwrap()
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap();
        assert!(to_delete.value(0));
        assert!(!to_delete.value(1));
    }

    #[tokio::test]
    async fn test_write_snapshot() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("snapshots/plan.parquet");

        write_snapshot(&entries(), &path).await?;
        assert!(path.exists());

        let reader = ParquetRecordBatchReader::try_new(File::open(&path)?, 1024)?;
        let batches: Vec<_> = reader.collect::<Result<Vec<_>, _>>()?;
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let names = batches[0]
            .column_by_name("name")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "a/one");
        assert_eq!(names.len(), 2);
        Ok(())
    }
}
