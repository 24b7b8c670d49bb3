//! Runs one crawler per source on a bounded pool and merges their results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use procura_core::{DataLayout, EventSink, PipelineEvent};
use procura_storage::{HttpFetcher, ManifestStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{error, info};

use crate::{SourceAdapter, SourceCrawler};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    /// Union of changed ids across sources, in completion order.
    pub changed_ids: Vec<String>,
    pub failed_sources: Vec<SourceFailure>,
}

impl CrawlSummary {
    fn absorb(&mut self, seen: &mut HashSet<String>, ids: Vec<String>) {
        for id in ids {
            if seen.insert(id.clone()) {
                self.changed_ids.push(id);
            }
        }
    }
}

pub struct CrawlOrchestrator {
    http: Arc<HttpFetcher>,
    manifest: Arc<dyn ManifestStore>,
    sink: Arc<dyn EventSink>,
    layout: DataLayout,
    max_workers: usize,
}

impl CrawlOrchestrator {
    pub fn new(
        http: Arc<HttpFetcher>,
        manifest: Arc<dyn ManifestStore>,
        sink: Arc<dyn EventSink>,
        layout: DataLayout,
        max_workers: usize,
    ) -> Self {
        Self {
            http,
            manifest,
            sink,
            layout,
            max_workers: max_workers.max(1),
        }
    }

    /// Crawl all sources concurrently. A failing source is reported in the summary;
    /// it never cancels or hides the results of its siblings.
    pub async fn run(&self, adapters: Vec<Arc<dyn SourceAdapter>>, window_days: i64) -> CrawlSummary {
        let limit = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut task_sources: HashMap<TaskId, String> = HashMap::new();

        for adapter in adapters {
            let source = adapter.source_id().to_string();
            let crawler = SourceCrawler::new(
                adapter,
                Arc::clone(&self.http),
                Arc::clone(&self.manifest),
                Arc::clone(&self.sink),
                self.layout.clone(),
                window_days,
            );
            let limit = Arc::clone(&limit);
            let task_source = source.clone();
            let handle = tasks.spawn(async move {
                // The semaphore is never closed, so this always yields a permit.
                let _permit = limit.acquire_owned().await.ok();
                let result = crawler.crawl().await;
                (task_source, result)
            });
            task_sources.insert(handle.id(), source);
        }

        let mut summary = CrawlSummary::default();
        let mut seen = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source, Ok(ids))) => {
                    info!(source, changed = ids.len(), "source finished");
                    self.sink.emit(PipelineEvent::SourceCompleted {
                        source,
                        changed: ids.len(),
                    });
                    summary.absorb(&mut seen, ids);
                }
                Ok((source, Err(failure))) => {
                    let message = format!("{:#}", anyhow::Error::new(failure.error));
                    self.sink.emit(PipelineEvent::SourceFailed {
                        source: source.clone(),
                        error: message.clone(),
                    });
                    summary.failed_sources.push(SourceFailure {
                        source,
                        error: message,
                    });
                    summary.absorb(&mut seen, failure.changed);
                }
                Err(join_err) => {
                    let source = task_sources
                        .remove(&join_err.id())
                        .unwrap_or_else(|| format!("task {}", join_err.id()));
                    let message = join_err.to_string();
                    error!(source, error = %message, "crawl task did not complete");
                    self.sink.emit(PipelineEvent::SourceFailed {
                        source: source.clone(),
                        error: message.clone(),
                    });
                    summary.failed_sources.push(SourceFailure {
                        source,
                        error: message,
                    });
                }
            }
        }

        info!(
            changed = summary.changed_ids.len(),
            failed_sources = summary.failed_sources.len(),
            "crawl finished"
        );
        summary
    }
}
