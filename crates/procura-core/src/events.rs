//! Structured diagnostics reported by pipeline components to an injected sink.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Normalize,
    Consolidate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Download => "download",
            Stage::Normalize => "normalize",
            Stage::Consolidate => "consolidate",
        })
    }
}

/// Why a unit of work (listing item, object, file, fragment) was left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    MalformedItem { error: String },
    MissingTimestamp,
    InvalidTimestamp { raw: String },
    OutsideWindow { remote_updated_at: String },
    UpToDate,
    MissingDownloadUrl,
    DownloadFailed { error: String },
    ExtractFailed { error: String },
    MalformedId { error: String },
    MissingExtraction { path: String },
    UnreadableFile { path: String, error: String },
    UnreadableFragment { path: String, error: String },
    NoReadableFragments,
}

impl SkipReason {
    /// Expected, non-problem skips are reported at debug level.
    pub fn is_routine(&self) -> bool {
        matches!(self, SkipReason::OutsideWindow { .. } | SkipReason::UpToDate)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MalformedItem { error } => write!(f, "malformed listing item: {error}"),
            SkipReason::MissingTimestamp => write!(f, "no timestamp field present"),
            SkipReason::InvalidTimestamp { raw } => write!(f, "invalid timestamp `{raw}`"),
            SkipReason::OutsideWindow { remote_updated_at } => {
                write!(f, "updated at {remote_updated_at}, outside recency window")
            }
            SkipReason::UpToDate => write!(f, "manifest already holds an equal or newer version"),
            SkipReason::MissingDownloadUrl => write!(f, "no download url"),
            SkipReason::DownloadFailed { error } => write!(f, "download failed: {error}"),
            SkipReason::ExtractFailed { error } => write!(f, "extraction failed: {error}"),
            SkipReason::MalformedId { error } => write!(f, "{error}"),
            SkipReason::MissingExtraction { path } => write!(f, "no extraction directory {path}"),
            SkipReason::UnreadableFile { path, error } => write!(f, "cannot read {path}: {error}"),
            SkipReason::UnreadableFragment { path, error } => {
                write!(f, "cannot read fragment {path}: {error}")
            }
            SkipReason::NoReadableFragments => write!(f, "no readable fragments"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Skipped {
        stage: Stage,
        source: Option<String>,
        id: String,
        reason: SkipReason,
    },
    ObjectFetched {
        source: String,
        id: String,
        content_hash: String,
        remote_updated_at: String,
    },
    SourceCompleted {
        source: String,
        changed: usize,
    },
    SourceFailed {
        source: String,
        error: String,
    },
    FragmentWritten {
        table: String,
        signature: String,
        id: String,
        rows: usize,
    },
    TableConsolidated {
        table: String,
        rows: usize,
        columns: usize,
        duplicates_removed: usize,
    },
}

/// Caller-supplied receiver for pipeline diagnostics.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Forwards every event to `tracing` with a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Skipped {
                stage,
                source,
                id,
                reason,
            } => {
                let source = source.as_deref().unwrap_or("-");
                if reason.is_routine() {
                    debug!(%stage, source, id, %reason, "skipped");
                } else {
                    warn!(%stage, source, id, %reason, "skipped");
                }
            }
            PipelineEvent::ObjectFetched {
                source,
                id,
                content_hash,
                remote_updated_at,
            } => info!(source, id, content_hash, remote_updated_at, "object fetched and extracted"),
            PipelineEvent::SourceCompleted { source, changed } => {
                info!(source, changed, "source crawl complete")
            }
            PipelineEvent::SourceFailed { source, error } => {
                error!(source, error, "source crawl failed")
            }
            PipelineEvent::FragmentWritten {
                table,
                signature,
                id,
                rows,
            } => info!(table, signature, id, rows, "fragment written"),
            PipelineEvent::TableConsolidated {
                table,
                rows,
                columns,
                duplicates_removed,
            } => info!(table, rows, columns, duplicates_removed, "table consolidated"),
        }
    }
}

/// Collects events in memory; used by tests and by callers that want a run report.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn skipped_ids(&self, stage: Stage) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Skipped { stage: s, id, .. } if s == stage => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
