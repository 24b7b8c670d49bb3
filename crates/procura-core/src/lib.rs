//! Core domain model and provenance types for the procurement ingestion pipeline.

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod events;

pub use events::{EventSink, MemorySink, PipelineEvent, SkipReason, Stage, TracingSink};

pub const CRATE_NAME: &str = "procura-core";

/// Column names appended to every normalized row; excluded from schema signatures.
pub const PROVENANCE_COLUMNS: [&str; 3] = ["version", "year", "month"];

/// One fetchable unit observed on a source listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub source: String,
    pub download_url: String,
    pub remote_updated_at: Option<String>,
}

/// Persisted record of the last successful fetch of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub source: String,
    pub content_hash: String,
    pub remote_updated_at: String,
    pub last_fetched_at: String,
}

/// The part of a manifest entry the incremental-sync decision needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub content_hash: String,
    pub remote_updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("object id `{id}` cannot be used as a path component")]
pub struct UnsafeIdError {
    pub id: String,
}

/// Object ids name directories and files under the root, so they must be a single
/// plain path component.
pub fn check_object_id(id: &str) -> Result<(), UnsafeIdError> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(UnsafeIdError { id: id.to_string() });
    }
    Ok(())
}

/// `{version, year, month}` provenance decoded from an object id such as `seace_v3-2025-03`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vintage {
    pub version: String,
    pub year: String,
    pub month: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VintageError {
    #[error("object id `{id}` has {parts} dash-separated parts, expected 3")]
    WrongPartCount { id: String, parts: usize },
    #[error("object id `{0}` has an empty component")]
    EmptyComponent(String),
    #[error(transparent)]
    Unsafe(#[from] UnsafeIdError),
}

impl Vintage {
    pub fn parse_object_id(id: &str) -> Result<Self, VintageError> {
        check_object_id(id)?;
        let parts: Vec<&str> = id.split('-').collect();
        let [version, year, month] = parts.as_slice() else {
            return Err(VintageError::WrongPartCount {
                id: id.to_string(),
                parts: parts.len(),
            });
        };
        if version.is_empty() || year.is_empty() || month.is_empty() {
            return Err(VintageError::EmptyComponent(id.to_string()));
        }
        Ok(Self {
            version: version.to_string(),
            year: year.to_string(),
            month: month.to_string(),
        })
    }

    pub fn values(&self) -> [&str; 3] {
        [&self.version, &self.year, &self.month]
    }
}

/// Identifies one fragment file: logical table, schema signature, and originating object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentKey {
    pub table: String,
    pub signature: String,
    pub object_id: String,
}

/// On-disk layout under the configured root directory.
///
/// Only `final_dir` is a contract with downstream consumers; everything else is
/// pipeline-internal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("state").join("manifest.sqlite")
    }

    pub fn staging_dir(&self, source: &str) -> PathBuf {
        self.root.join("raw_zips").join(source)
    }

    pub fn staged_archive(&self, source: &str, id: &str) -> PathBuf {
        self.staging_dir(source).join(format!("{id}.zip"))
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join("extracted_csv")
    }

    pub fn extraction_dir(&self, id: &str) -> PathBuf {
        self.extracted_dir().join(id)
    }

    pub fn fragments_dir(&self) -> PathBuf {
        self.root.join("processed").join("signatures")
    }

    pub fn fragment_path(&self, key: &FragmentKey) -> PathBuf {
        self.fragments_dir()
            .join(&key.table)
            .join(format!("signature_{}", key.signature))
            .join(format!("{}.parquet", key.object_id))
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root.join("final")
    }

    pub fn final_artifact(&self, table: &str) -> PathBuf {
        self.final_dir().join(format!("{table}_latest.parquet"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timestamp `{raw}`")]
pub struct TimestampError {
    pub raw: String,
}

/// Parse a listing timestamp into a comparable instant.
///
/// Accepts RFC 3339 (`Z` or explicit offset) and offset-less ISO-8601, which is read as UTC.
pub fn parse_remote_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, TimestampError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts);
    }
    if let Ok(ts) = DateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f%:z") {
        return Ok(ts);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc().fixed_offset());
        }
    }
    Err(TimestampError {
        raw: raw.to_string(),
    })
}

/// Single canonical string form used for everything persisted in the manifest.
pub fn normalize_remote_timestamp(ts: DateTime<FixedOffset>) -> String {
    ts.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Incremental-sync decision: fetch when nothing is stored, when the stored value is
/// unreadable, or when the stored instant is strictly older than the observed one.
pub fn needs_refetch(stored: Option<&ManifestRecord>, observed: DateTime<FixedOffset>) -> bool {
    let Some(raw) = stored.and_then(|r| r.remote_updated_at.as_deref()) else {
        return true;
    };
    match parse_remote_timestamp(raw) {
        Ok(previous) => previous < observed,
        Err(_) => true,
    }
}
