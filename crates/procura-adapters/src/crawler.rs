//! Per-source crawl: paginate the listing, decide what changed, download,
//! extract and record each changed object in the manifest.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use procura_core::{
    check_object_id, needs_refetch, normalize_remote_timestamp, parse_remote_timestamp,
    DataLayout, EventSink, PipelineEvent, RemoteObject, SkipReason, Stage,
};
use procura_storage::{extract_zip_fresh, sha256_file, HttpFetcher, ManifestError, ManifestStore};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{AdapterError, ListingItem, SourceAdapter};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("listing page {page} of source {source_id}: {error}")]
    Listing {
        source_id: String,
        page: u32,
        #[source]
        error: AdapterError,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// A fatal crawl error plus whatever was already downloaded and recorded before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CrawlFailure {
    pub changed: Vec<String>,
    #[source]
    pub error: CrawlError,
}

pub struct SourceCrawler {
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    manifest: Arc<dyn ManifestStore>,
    sink: Arc<dyn EventSink>,
    layout: DataLayout,
    window_days: i64,
    started_at: DateTime<Utc>,
}

impl SourceCrawler {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        http: Arc<HttpFetcher>,
        manifest: Arc<dyn ManifestStore>,
        sink: Arc<dyn EventSink>,
        layout: DataLayout,
        window_days: i64,
    ) -> Self {
        Self {
            adapter,
            http,
            manifest,
            sink,
            layout,
            window_days,
            started_at: Utc::now(),
        }
    }

    /// Pin "now" for the recency window; tests use a fixed instant.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn source_id(&self) -> &str {
        self.adapter.source_id()
    }

    /// Oldest accepted update time; `None` when the window reaches past the
    /// representable range, which admits everything.
    fn threshold(&self) -> Option<DateTime<Utc>> {
        TimeDelta::try_days(self.window_days)
            .and_then(|window| self.started_at.checked_sub_signed(window))
    }

    /// Crawl every listing page and return the ids downloaded or updated in this run.
    pub async fn crawl(&self) -> Result<Vec<String>, CrawlFailure> {
        let mut changed = Vec::new();
        match self.crawl_pages(&mut changed).await {
            Ok(()) => Ok(changed),
            Err(error) => Err(CrawlFailure { changed, error }),
        }
    }

    async fn crawl_pages(&self, changed: &mut Vec<String>) -> Result<(), CrawlError> {
        let source = self.source_id().to_string();
        info!(source, window_days = self.window_days, "starting source crawl");

        let mut page = 1u32;
        let mut visited = HashSet::new();
        loop {
            visited.insert(page);
            debug!(source, page, "requesting listing page");
            let listing = self
                .adapter
                .fetch_listing_page(&self.http, page)
                .await
                .map_err(|error| CrawlError::Listing {
                    source_id: source.clone(),
                    page,
                    error,
                })?;

            for raw in listing.results {
                if let Some(id) = self.process_item(raw).await? {
                    changed.push(id);
                }
            }

            if !listing.pagination.has_next {
                break;
            }
            let next = listing.pagination.next_page_number.unwrap_or(page + 1);
            if visited.contains(&next) {
                warn!(source, page, next, "listing pagination loops back, stopping");
                break;
            }
            page = next;
        }
        Ok(())
    }

    /// Returns the id when the object was fetched; per-item problems become skip events.
    async fn process_item(&self, raw: serde_json::Value) -> Result<Option<String>, CrawlError> {
        let fallback_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string();
        let item = match ListingItem::from_value(raw) {
            Ok(item) => item,
            Err(err) => {
                self.skip(
                    &fallback_id,
                    SkipReason::MalformedItem {
                        error: err.to_string(),
                    },
                );
                return Ok(None);
            }
        };
        if let Err(err) = check_object_id(&item.id) {
            self.skip(
                &item.id,
                SkipReason::MalformedItem {
                    error: err.to_string(),
                },
            );
            return Ok(None);
        }

        let Some(raw_ts) = item.timestamp() else {
            self.skip(&item.id, SkipReason::MissingTimestamp);
            return Ok(None);
        };
        let observed = match parse_remote_timestamp(raw_ts) {
            Ok(ts) => ts,
            Err(_) => {
                self.skip(
                    &item.id,
                    SkipReason::InvalidTimestamp {
                        raw: raw_ts.to_string(),
                    },
                );
                return Ok(None);
            }
        };
        let normalized = normalize_remote_timestamp(observed);
        if normalized != raw_ts {
            debug!(id = item.id.as_str(), raw = raw_ts, normalized, "timestamp normalized to UTC");
        }

        if self
            .threshold()
            .is_some_and(|threshold| observed.with_timezone(&Utc) < threshold)
        {
            self.skip(
                &item.id,
                SkipReason::OutsideWindow {
                    remote_updated_at: normalized,
                },
            );
            return Ok(None);
        }

        let Some(url) = item.download_url() else {
            self.skip(&item.id, SkipReason::MissingDownloadUrl);
            return Ok(None);
        };
        let object = RemoteObject {
            id: item.id.clone(),
            source: self.source_id().to_string(),
            download_url: url.to_string(),
            remote_updated_at: Some(normalized.clone()),
        };

        let stored = self.manifest.get(&object.id).await?;
        if !needs_refetch(stored.as_ref(), observed) {
            self.skip(&object.id, SkipReason::UpToDate);
            return Ok(None);
        }

        let content_hash = match self.download_and_extract(&object).await {
            Ok(hash) => hash,
            Err(reason) => {
                self.skip(&object.id, reason);
                return Ok(None);
            }
        };

        self.manifest
            .upsert(&object.id, &object.source, &content_hash, &normalized)
            .await?;
        self.sink.emit(PipelineEvent::ObjectFetched {
            source: object.source,
            id: object.id.clone(),
            content_hash,
            remote_updated_at: normalized,
        });
        Ok(Some(object.id))
    }

    /// Download into staging, hash, extract over a clean directory, drop the archive.
    async fn download_and_extract(&self, object: &RemoteObject) -> Result<String, SkipReason> {
        let id = object.id.as_str();
        let staged = self.layout.staged_archive(&object.source, id);
        remove_file_if_exists(&staged).await;

        if let Err(err) = self.http.fetch_archive(&object.download_url, &staged).await {
            remove_file_if_exists(&staged).await;
            return Err(SkipReason::DownloadFailed {
                error: err.to_string(),
            });
        }

        let content_hash = match sha256_file(&staged).await {
            Ok(hash) => hash,
            Err(err) => {
                remove_file_if_exists(&staged).await;
                return Err(SkipReason::DownloadFailed {
                    error: format!("hashing {}: {err}", staged.display()),
                });
            }
        };

        let target = self.layout.extraction_dir(id);
        let archive: PathBuf = staged.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_zip_fresh(&archive, &target))
            .await
            .map_err(anyhow::Error::new)
            .and_then(|result| result);
        remove_file_if_exists(&staged).await;

        match extracted {
            Ok(entries) => {
                debug!(source = self.source_id(), id, entries, "archive extracted");
                Ok(content_hash)
            }
            Err(err) => Err(SkipReason::ExtractFailed {
                error: format!("{err:#}"),
            }),
        }
    }

    fn skip(&self, id: &str, reason: SkipReason) {
        self.sink.emit(PipelineEvent::Skipped {
            stage: Stage::Download,
            source: Some(self.source_id().to_string()),
            id: id.to_string(),
            reason,
        });
    }
}

async fn remove_file_if_exists(path: &std::path::Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove staged archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApiListingAdapter, SourceEndpoint};
    use async_trait::async_trait;
    use procura_core::{ManifestEntry, ManifestRecord, MemorySink};
    use procura_storage::{BackoffPolicy, HttpClientConfig, SqliteManifestStore};
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, contents) in files {
                zip.start_file(*name, options).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn started_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2023-03-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Harness {
        _dir: TempDir,
        layout: DataLayout,
        manifest: Arc<SqliteManifestStore>,
        sink: Arc<MemorySink>,
        http: Arc<HttpFetcher>,
    }

    async fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let manifest = Arc::new(
            SqliteManifestStore::open(layout.manifest_path())
                .await
                .expect("manifest"),
        );
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                backoff: BackoffPolicy::fixed(3, Duration::from_millis(5)),
                ..Default::default()
            })
            .expect("http"),
        );
        Harness {
            _dir: dir,
            layout,
            manifest,
            sink: Arc::new(MemorySink::new()),
            http,
        }
    }

    fn crawler(h: &Harness, server: &MockServer, manifest: Arc<dyn ManifestStore>) -> SourceCrawler {
        crawler_with_window(h, server, manifest, 120)
    }

    fn crawler_with_window(
        h: &Harness,
        server: &MockServer,
        manifest: Arc<dyn ManifestStore>,
        window_days: i64,
    ) -> SourceCrawler {
        let adapter = Arc::new(ApiListingAdapter::new(SourceEndpoint {
            name: "seace".into(),
            api_endpoint: format!("{}/api/files", server.uri()),
        }));
        SourceCrawler::new(
            adapter,
            Arc::clone(&h.http),
            manifest,
            h.sink.clone(),
            h.layout.clone(),
            window_days,
        )
        .with_started_at(started_at())
    }

    fn item(server: &MockServer, id: &str, ts: &str) -> serde_json::Value {
        json!({
            "id": id,
            "files": {"csv": format!("{}/zips/{id}.zip", server.uri())},
            "updated_at": ts
        })
    }

    async fn mount_page(server: &MockServer, page: u32, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/files"))
            .and(query_param("page", page.to_string()))
            .and(query_param("source", "seace"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_zip(server: &MockServer, id: &str, expected: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/zips/{id}.zip")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes(&[("com_contracts.csv", "a,b\n1,2\n")])),
            )
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn older_remote_version_is_not_downloaded() {
        let h = harness().await;
        let server = MockServer::start().await;
        h.manifest
            .upsert("v1-2023-01", "seace", "old", "2023-02-01T00:00:00+00:00")
            .await
            .unwrap();
        mount_page(
            &server,
            1,
            json!({"results": [item(&server, "v1-2023-01", "2023-01-15T00:00:00+00:00")]}),
        )
        .await;
        mount_zip(&server, "v1-2023-01", 0).await;

        let changed = crawler(&h, &server, h.manifest.clone()).crawl().await.unwrap();
        assert!(changed.is_empty());
        assert_eq!(h.sink.skipped_ids(Stage::Download), vec!["v1-2023-01".to_string()]);
    }

    #[tokio::test]
    async fn newer_remote_version_is_downloaded_and_recorded() {
        let h = harness().await;
        let server = MockServer::start().await;
        h.manifest
            .upsert("v1-2023-01", "seace", "old", "2023-02-01T00:00:00+00:00")
            .await
            .unwrap();
        let stale = h.layout.extraction_dir("v1-2023-01");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover.csv"), "x").unwrap();

        mount_page(
            &server,
            1,
            json!({"results": [item(&server, "v1-2023-01", "2023-03-01T00:00:00Z")]}),
        )
        .await;
        mount_zip(&server, "v1-2023-01", 1).await;

        let changed = crawler(&h, &server, h.manifest.clone()).crawl().await.unwrap();
        assert_eq!(changed, vec!["v1-2023-01".to_string()]);

        let record = h.manifest.get("v1-2023-01").await.unwrap().unwrap();
        assert_ne!(record.content_hash, "old");
        assert_eq!(
            record.remote_updated_at.as_deref(),
            Some("2023-03-01T00:00:00+00:00")
        );
        assert!(stale.join("com_contracts.csv").exists());
        assert!(!stale.join("leftover.csv").exists());
        assert!(!h.layout.staged_archive("seace", "v1-2023-01").exists());
    }

    #[tokio::test]
    async fn items_without_timestamp_or_outside_window_are_skipped() {
        let h = harness().await;
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            json!({"results": [
                {"id": "v1-2022-01", "files": {"csv": "http://unused"}},
                item(&server, "v1-2022-02", "2022-02-01T00:00:00Z"),
                item(&server, "v1-2023-02", "not a date"),
            ]}),
        )
        .await;

        let changed = crawler(&h, &server, h.manifest.clone()).crawl().await.unwrap();
        assert!(changed.is_empty());
        let reasons: Vec<SkipReason> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Skipped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons[0], SkipReason::MissingTimestamp);
        assert!(matches!(reasons[1], SkipReason::OutsideWindow { .. }));
        assert!(matches!(reasons[2], SkipReason::InvalidTimestamp { .. }));
    }

    #[tokio::test]
    async fn ids_that_are_not_single_path_components_leave_existing_data_alone() {
        let h = harness().await;
        let server = MockServer::start().await;
        h.manifest
            .upsert("v1-2023-01", "seace", "kept", "2023-02-01T00:00:00+00:00")
            .await
            .unwrap();
        let sibling = h.layout.extraction_dir("v1-2023-01");
        std::fs::create_dir_all(&sibling).unwrap();
        std::fs::write(sibling.join("com_contracts.csv"), "a\n1\n").unwrap();
        let artifact = h.layout.final_artifact("com_contracts");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"published").unwrap();

        mount_page(
            &server,
            1,
            json!({"results": [
                item(&server, "..", "2023-03-05T00:00:00Z"),
                item(&server, "", "2023-03-05T00:00:00Z"),
                item(&server, "v1/../..", "2023-03-05T00:00:00Z"),
                item(&server, "v1-2023-03", "2023-03-05T00:00:00Z"),
            ]}),
        )
        .await;
        Mock::given(method("GET"))
            .and(path_regex("^/zips/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes(&[("com_contracts.csv", "a,b\n1,2\n")])),
            )
            .mount(&server)
            .await;

        let changed = crawler(&h, &server, h.manifest.clone()).crawl().await.unwrap();
        assert_eq!(changed, vec!["v1-2023-03".to_string()]);
        assert_eq!(h.sink.skipped_ids(Stage::Download), vec!["..", "", "v1/../.."]);

        assert!(h.manifest.get("v1-2023-01").await.unwrap().is_some());
        assert!(sibling.join("com_contracts.csv").exists());
        assert_eq!(std::fs::read(&artifact).unwrap(), b"published");
        let archive_requests = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path().starts_with("/zips/"))
            .count();
        assert_eq!(archive_requests, 1);
    }

    #[tokio::test]
    async fn window_wider_than_the_calendar_admits_every_item() {
        let h = harness().await;
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            json!({"results": [item(&server, "v1-1990-01", "1990-01-01T00:00:00Z")]}),
        )
        .await;
        mount_zip(&server, "v1-1990-01", 1).await;

        let changed = crawler_with_window(&h, &server, h.manifest.clone(), i64::MAX)
            .crawl()
            .await
            .unwrap();
        assert_eq!(changed, vec!["v1-1990-01".to_string()]);
    }

    #[tokio::test]
    async fn failed_download_is_skipped_and_crawl_continues_across_pages() {
        let h = harness().await;
        let server = MockServer::start().await;

        let ids: Vec<String> = (1..=10).map(|m| format!("v1-2023-{m:02}")).collect();
        let results: Vec<_> = ids
            .iter()
            .map(|id| item(&server, id, "2023-03-05T00:00:00Z"))
            .collect();
        mount_page(
            &server,
            1,
            json!({"results": results, "pagination": {"has_next": true, "next_page_number": 2}}),
        )
        .await;
        mount_page(
            &server,
            2,
            json!({"results": [item(&server, "v2-2023-01", "2023-03-05T00:00:00Z")],
                   "pagination": {"has_next": false}}),
        )
        .await;

        for id in ids.iter().filter(|id| id.as_str() != "v1-2023-04") {
            mount_zip(&server, id, 1).await;
        }
        mount_zip(&server, "v2-2023-01", 1).await;
        Mock::given(method("GET"))
            .and(path("/zips/v1-2023-04.zip"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let changed = crawler(&h, &server, h.manifest.clone()).crawl().await.unwrap();
        assert_eq!(changed.len(), 10);
        assert!(!changed.contains(&"v1-2023-04".to_string()));
        assert!(changed.contains(&"v2-2023-01".to_string()));
        assert!(h.manifest.get("v1-2023-04").await.unwrap().is_none());
        assert!(!h.layout.staged_archive("seace", "v1-2023-04").exists());
    }

    struct FailingUpsert {
        inner: Arc<SqliteManifestStore>,
    }

    #[async_trait]
    impl ManifestStore for FailingUpsert {
        async fn get(&self, id: &str) -> Result<Option<ManifestRecord>, ManifestError> {
            self.inner.get(id).await
        }

        async fn upsert(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), ManifestError> {
            Err(ManifestError::Location {
                path: PathBuf::from("injected"),
                source: std::io::Error::other("disk full"),
            })
        }

        async fn entry(&self, id: &str) -> Result<Option<ManifestEntry>, ManifestError> {
            self.inner.entry(id).await
        }
    }

    #[tokio::test]
    async fn failure_before_manifest_write_leaves_no_entry() {
        let h = harness().await;
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            json!({"results": [item(&server, "v1-2023-03", "2023-03-05T00:00:00Z")]}),
        )
        .await;
        mount_zip(&server, "v1-2023-03", 1).await;

        let failing = Arc::new(FailingUpsert {
            inner: h.manifest.clone(),
        });
        let failure = crawler(&h, &server, failing).crawl().await.expect_err("storage error");
        assert!(matches!(failure.error, CrawlError::Manifest(_)));
        assert!(failure.changed.is_empty());
        assert!(h.manifest.get("v1-2023-03").await.unwrap().is_none());
        assert!(h.manifest.entry("v1-2023-03").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_listing_is_a_crawl_failure() {
        let h = harness().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/files"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let failure = crawler(&h, &server, h.manifest.clone())
            .crawl()
            .await
            .expect_err("listing down");
        assert!(matches!(failure.error, CrawlError::Listing { page: 1, .. }));
    }
}
