//! Blob records as listed from the bucket.

use chrono::{DateTime, NaiveDateTime, Utc};
use common::storage::blob_url;
use object_store::ObjectMeta;
use serde::{Deserialize, Deserializer, Serialize};

/// One object in the bucket at listing time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// Full object key, unique within the bucket
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated: DateTime<Utc>,
}

impl BlobRecord {
    pub fn new(name: impl Into<String>, size: u64, updated: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            updated,
        }
    }

    pub fn url(&self, bucket: &str) -> String {
        blob_url(bucket, &self.name)
    }
}

impl From<ObjectMeta> for BlobRecord {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            name: meta.location.to_string(),
            size: meta.size as u64,
            updated: meta.last_modified,
        }
    }
}

/// RFC 3339, or a zone-less `YYYY-MM-DDTHH:MM:SS` taken as UTC
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
}
