//! Source listing adapters, the per-source crawler and the crawl orchestrator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use procura_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod crawler;
pub mod orchestrator;

pub use crawler::{CrawlFailure, SourceCrawler};
pub use orchestrator::{CrawlOrchestrator, CrawlSummary, SourceFailure};

pub const CRATE_NAME: &str = "procura-adapters";

/// Timestamp fields consulted on each listing item, highest priority first.
pub const TIMESTAMP_FIELDS: [&str; 3] = ["timestamp", "updated_at", "created_at"];

/// Key under `files` holding the archive download url.
pub const ARCHIVE_FILE_KEY: &str = "csv";

/// A configured source: a name plus the listing API it is crawled through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub name: String,
    pub api_endpoint: String,
}

/// One page of a source listing: raw items plus the pagination cursor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub results: Vec<JsonValue>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub next_page_number: Option<u32>,
}

/// A listing result decoded far enough for the crawl decision.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingItem {
    pub id: String,
    #[serde(default)]
    pub files: BTreeMap<String, Option<String>>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl ListingItem {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// First non-empty timestamp among [`TIMESTAMP_FIELDS`].
    pub fn timestamp(&self) -> Option<&str> {
        TIMESTAMP_FIELDS.iter().find_map(|name| {
            self.fields
                .get(*name)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
    }

    pub fn download_url(&self) -> Option<&str> {
        self.files
            .get(ARCHIVE_FILE_KEY)
            .and_then(|url| url.as_deref())
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("listing response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_listing_page(
        &self,
        http: &HttpFetcher,
        page: u32,
    ) -> Result<ListingPage, AdapterError>;
}

/// Paginated JSON listing API: `GET <endpoint>?page=<n>&source=<name>`.
#[derive(Debug, Clone)]
pub struct ApiListingAdapter {
    endpoint: SourceEndpoint,
}

impl ApiListingAdapter {
    pub fn new(endpoint: SourceEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl SourceAdapter for ApiListingAdapter {
    fn source_id(&self) -> &str {
        &self.endpoint.name
    }

    async fn fetch_listing_page(
        &self,
        http: &HttpFetcher,
        page: u32,
    ) -> Result<ListingPage, AdapterError> {
        let resp = http
            .fetch_bytes(
                &self.endpoint.api_endpoint,
                &[("page", page.to_string()), ("source", self.endpoint.name.clone())],
            )
            .await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }
}
