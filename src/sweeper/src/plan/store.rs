//! SQLite plan store.
//!
//! The `blobs` table is the reviewable record of a plan; the executor reads it
//! back and never writes to it. `prefixes` only holds rows in rollup mode.

use super::{DeletionUnit, PlanEntry};
use crate::blob::BlobRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::path::{Path, PathBuf};

const CREATE_BLOBS: &str = r#"
    CREATE TABLE blobs (
        url TEXT NOT NULL,
        name TEXT NOT NULL PRIMARY KEY,
        size UNSIGNED BIG INT NOT NULL,
        updated TIMESTAMP WITH TIME ZONE NOT NULL,
        is_large BOOLEAN NOT NULL DEFAULT FALSE,
        is_old BOOLEAN NOT NULL DEFAULT FALSE,
        is_pipeline_logs BOOLEAN NOT NULL DEFAULT FALSE,
        force_keep BOOLEAN NOT NULL DEFAULT FALSE,
        in_data_table BOOLEAN NOT NULL DEFAULT FALSE,
        to_delete BOOLEAN NOT NULL DEFAULT FALSE
    )
"#;

const CREATE_PREFIXES: &str = r#"
    CREATE TABLE prefixes (
        path TEXT NOT NULL PRIMARY KEY,
        is_prefix BOOLEAN NOT NULL DEFAULT FALSE,
        objects UNSIGNED BIG INT NOT NULL,
        bytes UNSIGNED BIG INT NOT NULL
    )
"#;

const INSERT_BLOB: &str = r#"
    INSERT INTO blobs (url, name, size, updated, is_large, is_old, is_pipeline_logs,
                       force_keep, in_data_table, to_delete)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const SELECT_BLOBS: &str = "SELECT url, name, size, updated, is_large, is_old, is_pipeline_logs, \
                            force_keep, in_data_table, to_delete FROM blobs";

#[derive(Debug, thiserror::Error)]
pub enum PlanStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plan store {0} does not exist")]
    Missing(PathBuf),

    #[error("invalid row for {name}: {reason}")]
    InvalidRow { name: String, reason: String },
}

/// SQLite integers are signed; sizes and counts beyond `i64::MAX` are rejected
fn to_stored(name: &str, column: &str, value: u64) -> Result<i64, PlanStoreError> {
    i64::try_from(value).map_err(|_| PlanStoreError::InvalidRow {
        name: name.to_string(),
        reason: format!("{column} {value} exceeds the store's range"),
    })
}

fn from_stored(name: &str, column: &str, value: i64) -> Result<u64, PlanStoreError> {
    u64::try_from(value).map_err(|_| PlanStoreError::InvalidRow {
        name: name.to_string(),
        reason: format!("{column} {value}"),
    })
}

#[derive(FromRow)]
struct BlobRow {
    url: String,
    name: String,
    size: i64,
    updated: String,
    is_large: bool,
    is_old: bool,
    is_pipeline_logs: bool,
    force_keep: bool,
    in_data_table: bool,
    to_delete: bool,
}

impl TryFrom<BlobRow> for PlanEntry {
    type Error = PlanStoreError;

    fn try_from(row: BlobRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| PlanStoreError::InvalidRow {
            name: row.name.clone(),
            reason,
        };

        let size = from_stored(&row.name, "size", row.size)?;
        let updated = DateTime::parse_from_rfc3339(&row.updated)
            .map_err(|e| invalid(format!("updated {:?}: {e}", row.updated)))?
            .with_timezone(&Utc);

        Ok(PlanEntry {
            url: row.url,
            blob: BlobRecord {
                name: row.name,
                size,
                updated,
            },
            is_large: row.is_large,
            is_old: row.is_old,
            is_pipeline_logs: row.is_pipeline_logs,
            force_keep: row.force_keep,
            in_data_table: row.in_data_table,
            to_delete: row.to_delete,
        })
    }
}

#[derive(FromRow)]
struct PrefixRow {
    path: String,
    is_prefix: bool,
    objects: i64,
    bytes: i64,
}

impl TryFrom<PrefixRow> for DeletionUnit {
    type Error = PlanStoreError;

    fn try_from(row: PrefixRow) -> Result<Self, Self::Error> {
        Ok(DeletionUnit {
            objects: from_stored(&row.path, "objects", row.objects)?,
            bytes: from_stored(&row.path, "bytes", row.bytes)?,
            path: row.path,
            is_prefix: row.is_prefix,
        })
    }
}

pub struct PlanStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl PlanStore {
    /// Create an empty plan at `path`, replacing any existing file
    pub async fn create(path: &Path) -> Result<Self, PlanStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PlanStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        // A leftover journal would be replayed into the new database
        let files = [path.to_path_buf(), sidecar(path, "-wal"), sidecar(path, "-shm")];
        for file in &files {
            match tokio::fs::remove_file(file).await {
                Ok(()) => log::debug!("Removed previous plan file {}", file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PlanStoreError::Io {
                        path: file.clone(),
                        source,
                    });
                }
            }
        }

        let store = Self::connect(path, true).await?;
        sqlx::query(CREATE_BLOBS).execute(&store.pool).await?;
        sqlx::query(CREATE_PREFIXES).execute(&store.pool).await?;
        Ok(store)
    }

    /// Open an existing plan
    pub async fn open(path: &Path) -> Result<Self, PlanStoreError> {
        if !path.exists() {
            return Err(PlanStoreError::Missing(path.to_path_buf()));
        }
        Self::connect(path, false).await
    }

    async fn connect(path: &Path, create: bool) -> Result<Self, PlanStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert `entries` in one transaction
    pub async fn write_entries(&self, entries: &[PlanEntry]) -> Result<(), PlanStoreError> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let size = to_stored(&entry.blob.name, "size", entry.blob.size)?;

            sqlx::query(INSERT_BLOB)
                .bind(&entry.url)
                .bind(&entry.blob.name)
                .bind(size)
                .bind(format_timestamp(&entry.blob.updated))
                .bind(entry.is_large)
                .bind(entry.is_old)
                .bind(entry.is_pipeline_logs)
                .bind(entry.force_keep)
                .bind(entry.in_data_table)
                .bind(entry.to_delete)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        log::debug!("Wrote {} plan rows to {}", entries.len(), self.path.display());
        Ok(())
    }

    pub async fn write_prefixes(&self, units: &[DeletionUnit]) -> Result<(), PlanStoreError> {
        let mut tx = self.pool.begin().await?;
        for unit in units {
            sqlx::query("INSERT INTO prefixes (path, is_prefix, objects, bytes) VALUES (?, ?, ?, ?)")
                .bind(&unit.path)
                .bind(unit.is_prefix)
                .bind(to_stored(&unit.path, "objects", unit.objects)?)
                .bind(to_stored(&unit.path, "bytes", unit.bytes)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Every entry, in name order
    pub async fn entries(&self) -> Result<Vec<PlanEntry>, PlanStoreError> {
        self.select(&format!("{SELECT_BLOBS} ORDER BY name")).await
    }

    /// Entries marked for deletion, in name order
    pub async fn to_delete(&self) -> Result<Vec<PlanEntry>, PlanStoreError> {
        self.select(&format!("{SELECT_BLOBS} WHERE to_delete ORDER BY name"))
            .await
    }

    async fn select(&self, sql: &str) -> Result<Vec<PlanEntry>, PlanStoreError> {
        let rows = sqlx::query_as::<_, BlobRow>(sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PlanEntry::try_from).collect()
    }

    pub async fn prefixes(&self) -> Result<Vec<DeletionUnit>, PlanStoreError> {
        let rows = sqlx::query_as::<_, PrefixRow>(
            "SELECT path, is_prefix, objects, bytes FROM prefixes ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeletionUnit::try_from).collect()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// `plan.db` -> `plan.db-wal`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// RFC 3339 with a `Z` suffix and only as many fractional digits as needed
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
