//! Pipeline stages after the crawl (normalize, consolidate) and the facade that
//! runs download -> normalize -> consolidate against one configured root.

use std::sync::Arc;

use anyhow::{Context, Result};
use procura_adapters::{ApiListingAdapter, CrawlOrchestrator, CrawlSummary, SourceAdapter};
use procura_core::{DataLayout, EventSink, TracingSink};
use procura_storage::{HttpFetcher, ManifestStore, SqliteManifestStore};
use serde::Serialize;
use tracing::info;

pub mod config;
pub mod consolidate;
pub mod normalize;
pub mod table;

pub use config::{ConfigError, PipelineConfig, RetryConfig};
pub use consolidate::{union_tables, Consolidator, TableReport};
pub use normalize::{NormalizeSummary, Normalizer, DEFAULT_EXPECTED_TABLES};
pub use table::{parquet_columns, Table, TableError};

pub const CRATE_NAME: &str = "procura-sync";

/// Ids changed by a download run plus the sources that failed outright.
pub type DownloadSummary = CrawlSummary;

/// Receives `(percent, message)` checkpoints while [`Pipeline::run_flow`] runs.
pub trait ProgressReporter {
    fn report(&self, percent: u8, message: &str);
}

impl<F> ProgressReporter for F
where
    F: Fn(u8, &str),
{
    fn report(&self, percent: u8, message: &str) {
        self(percent, message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub download: DownloadSummary,
    pub normalize: NormalizeSummary,
    pub tables: Vec<TableReport>,
}

pub struct Pipeline {
    config: PipelineConfig,
    layout: DataLayout,
    http: Arc<HttpFetcher>,
    manifest: Arc<dyn ManifestStore>,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    /// Create the root directory, open the manifest and build the HTTP client.
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let layout = DataLayout::new(&config.root_dir);
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("creating root_dir {}", layout.root().display()))?;

        let manifest = SqliteManifestStore::open(layout.manifest_path())
            .await
            .context("opening manifest store")?;
        let http = HttpFetcher::new(config.http_client_config())?;

        Ok(Self {
            config,
            layout,
            http: Arc::new(http),
            manifest: Arc::new(manifest),
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn manifest(&self) -> Arc<dyn ManifestStore> {
        Arc::clone(&self.manifest)
    }

    /// Crawl every configured source and return the ids that were (re)fetched.
    pub async fn download(&self, window_days: i64) -> Result<DownloadSummary> {
        let adapters: Vec<Arc<dyn SourceAdapter>> = self
            .config
            .sources
            .iter()
            .cloned()
            .map(|endpoint| Arc::new(ApiListingAdapter::new(endpoint)) as Arc<dyn SourceAdapter>)
            .collect();

        let orchestrator = CrawlOrchestrator::new(
            Arc::clone(&self.http),
            Arc::clone(&self.manifest),
            Arc::clone(&self.sink),
            self.layout.clone(),
            self.config.max_workers,
        );
        Ok(orchestrator.run(adapters, window_days).await)
    }

    /// `None` normalizes every extracted id; an empty slice does nothing.
    pub async fn normalize(&self, ids: Option<&[String]>) -> Result<NormalizeSummary> {
        let normalizer = Normalizer::new(
            self.layout.clone(),
            self.config.expected_tables.clone(),
            Arc::clone(&self.sink),
        );
        let ids = ids.map(<[String]>::to_vec);
        tokio::task::spawn_blocking(move || normalizer.normalize(ids.as_deref()))
            .await
            .context("normalize task panicked")?
    }

    pub async fn consolidate(&self) -> Result<Vec<TableReport>> {
        let consolidator = Consolidator::new(self.layout.clone(), Arc::clone(&self.sink));
        tokio::task::spawn_blocking(move || consolidator.consolidate())
            .await
            .context("consolidate task panicked")?
    }

    /// Run download, normalization of the changed ids, and consolidation in order.
    pub async fn run_flow(
        &self,
        window_days: Option<i64>,
        progress: &dyn ProgressReporter,
    ) -> Result<FlowSummary> {
        let window_days = window_days.unwrap_or(self.config.window_days);
        info!(window_days, root = %self.layout.root().display(), "pipeline run started");

        progress.report(0, "downloading archives");
        let download = self.download(window_days).await?;
        progress.report(
            40,
            &format!("download done ({} new or changed); normalizing", download.changed_ids.len()),
        );

        let normalize = self.normalize(Some(&download.changed_ids)).await?;
        progress.report(70, "normalization done; consolidating");

        let tables = self.consolidate().await?;
        progress.report(90, "consolidation done");

        info!(
            changed = download.changed_ids.len(),
            failed_sources = download.failed_sources.len(),
            tables = tables.len(),
            "pipeline run finished"
        );
        progress.report(100, "finished");
        Ok(FlowSummary {
            download,
            normalize,
            tables,
        })
    }
}
