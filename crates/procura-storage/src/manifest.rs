//! Durable record of every remote object fetched so far.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use procura_core::{ManifestEntry, ManifestRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::ConnectOptions;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("preparing manifest location {path}: {source}")]
    Location {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Storage seam for the manifest. Implementations serialize access internally so
/// concurrent crawlers can share one instance behind an `Arc`.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ManifestRecord>, ManifestError>;

    /// Overwrite any prior entry for `id` and stamp `last_fetched_at` with now.
    async fn upsert(
        &self,
        id: &str,
        source: &str,
        content_hash: &str,
        remote_updated_at: &str,
    ) -> Result<(), ManifestError>;

    async fn entry(&self, id: &str) -> Result<Option<ManifestEntry>, ManifestError>;
}

const CREATE_FILES_TABLE: &str = "CREATE TABLE IF NOT EXISTS files (
    file_id        TEXT PRIMARY KEY,
    source         TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    updated_at_api TEXT,
    last_download  TEXT NOT NULL
)";

/// Embedded SQLite manifest with a single connection guarded by one mutex.
#[derive(Debug)]
pub struct SqliteManifestStore {
    path: PathBuf,
    conn: Mutex<SqliteConnection>,
}

impl SqliteManifestStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ManifestError::Location {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .connect()
            .await?;
        sqlx::query(CREATE_FILES_TABLE).execute(&mut conn).await?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ManifestStore for SqliteManifestStore {
    async fn get(&self, id: &str) -> Result<Option<ManifestRecord>, ManifestError> {
        let mut conn = self.conn.lock().await;
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT content_hash, updated_at_api FROM files WHERE file_id = ?1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.map(|(content_hash, remote_updated_at)| ManifestRecord {
            content_hash,
            remote_updated_at,
        }))
    }

    async fn upsert(
        &self,
        id: &str,
        source: &str,
        content_hash: &str,
        remote_updated_at: &str,
    ) -> Result<(), ManifestError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let mut conn = self.conn.lock().await;
        sqlx::query(
            "INSERT INTO files (file_id, source, content_hash, updated_at_api, last_download)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id) DO UPDATE SET
               source         = excluded.source,
               content_hash   = excluded.content_hash,
               updated_at_api = excluded.updated_at_api,
               last_download  = excluded.last_download",
        )
        .bind(id)
        .bind(source)
        .bind(content_hash)
        .bind(remote_updated_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn entry(&self, id: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        let mut conn = self.conn.lock().await;
        let row: Option<(String, String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT file_id, source, content_hash, updated_at_api, last_download
             FROM files WHERE file_id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(
            |(id, source, content_hash, remote_updated_at, last_fetched_at)| ManifestEntry {
                id,
                source,
                content_hash,
                remote_updated_at: remote_updated_at.unwrap_or_default(),
                last_fetched_at,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn empty_store_reports_no_entry() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteManifestStore::open(dir.path().join("state/manifest.sqlite"))
            .await
            .expect("open");
        assert_eq!(store.get("v1-2023-01").await.expect("get"), None);
    }

    #[tokio::test]
    async fn upsert_overwrites_and_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state/manifest.sqlite");
        {
            let store = SqliteManifestStore::open(&path).await.expect("open");
            store
                .upsert("v1-2023-01", "seace", "hash-a", "2023-02-01T00:00:00+00:00")
                .await
                .expect("first upsert");
            store
                .upsert("v1-2023-01", "seace", "hash-b", "2023-03-01T00:00:00+00:00")
                .await
                .expect("second upsert");
        }

        let reopened = SqliteManifestStore::open(&path).await.expect("reopen");
        let record = reopened.get("v1-2023-01").await.expect("get").expect("entry");
        assert_eq!(record.content_hash, "hash-b");
        assert_eq!(
            record.remote_updated_at.as_deref(),
            Some("2023-03-01T00:00:00+00:00")
        );

        let entry = reopened.entry("v1-2023-01").await.expect("entry").expect("some");
        assert_eq!(entry.source, "seace");
        assert!(!entry.last_fetched_at.is_empty());
    }

    #[tokio::test]
    async fn concurrent_upserts_of_distinct_ids_all_land() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            SqliteManifestStore::open(dir.path().join("manifest.sqlite"))
                .await
                .expect("open"),
        );

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = format!("v1-2023-{i:02}");
                store
                    .upsert(&id, "seace", "h", "2023-02-01T00:00:00+00:00")
                    .await
                    .expect("upsert");
                store.get(&id).await.expect("get").is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join"));
        }
    }
}
