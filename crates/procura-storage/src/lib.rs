//! Manifest persistence, archive fetching, hashing and atomic file replacement.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod manifest;

pub use manifest::{ManifestError, ManifestStore, SqliteManifestStore};

pub const CRATE_NAME: &str = "procura-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streamed SHA-256 of a file on disk.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write `path` through a sibling temp file and rename it into place, so readers
/// only ever observe the previous complete file or the new complete file.
pub fn atomic_replace<F>(path: &Path, write: F) -> anyhow::Result<()>
where
    F: FnOnce(std::fs::File) -> anyhow::Result<()>,
{
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;

    if let Err(err) = write(file) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    std::fs::rename(&temp_path, path).map_err(|err| {
        let _ = std::fs::remove_file(&temp_path);
        anyhow::Error::new(err).context(format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        ))
    })
}

/// Check that `path` holds a readable zip archive (central directory parses).
pub fn validate_zip(path: &Path) -> Result<usize, String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    Ok(archive.len())
}

/// Extract `archive` into `target`, removing any previous extraction first so
/// files from an older version of the same object never survive.
pub fn extract_zip_fresh(archive: &Path, target: &Path) -> anyhow::Result<usize> {
    if target.exists() {
        std::fs::remove_dir_all(target)
            .with_context(|| format!("removing stale extraction {}", target.display()))?;
    }
    std::fs::create_dir_all(target)
        .with_context(|| format!("creating extraction directory {}", target.display()))?;

    let file = std::fs::File::open(archive)
        .with_context(|| format!("opening archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("reading archive {}", archive.display()))?;
    let entries = zip.len();
    if let Err(err) = zip.extract(target) {
        let _ = std::fs::remove_dir_all(target);
        return Err(anyhow::Error::new(err)
            .context(format!("extracting {} into {}", archive.display(), target.display())));
    }
    Ok(entries)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub listing_timeout: Duration,
    pub download_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            listing_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(300),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing download: {0}")]
    Io(#[from] std::io::Error),
    #[error("downloaded file from {url} is not a valid zip archive: {reason}")]
    InvalidArchive { url: String, reason: String },
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

/// HTTP client for listing pages and archive downloads. Every call gets its own
/// timeout and a bounded number of attempts; any failure is retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    listing_timeout: Duration,
    download_timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            listing_timeout: config.listing_timeout,
            download_timeout: config.download_timeout,
            backoff: BackoffPolicy {
                max_attempts: config.backoff.max_attempts.max(1),
                ..config.backoff
            },
        })
    }

    /// GET a small response body (a listing page) into memory.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.with_retries(url, || async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .timeout(self.listing_timeout)
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        })
        .instrument(span)
        .await
    }

    /// Stream `url` into `destination` and accept it only if it is a valid zip.
    /// A transfer that completes but fails validation counts as a failed attempt.
    pub async fn fetch_archive(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let span = info_span!("archive_fetch", url, destination = %destination.display());
        self.with_retries(url, || async {
            self.stream_to_file(url, destination).await?;
            let path: PathBuf = destination.to_path_buf();
            let validation = tokio::task::spawn_blocking(move || validate_zip(&path))
                .await
                .map_err(|e| FetchError::Io(std::io::Error::other(e)))?;
            match validation {
                Ok(_) => Ok(()),
                Err(reason) => Err(FetchError::InvalidArchive {
                    url: url.to_string(),
                    reason,
                }),
            }
        })
        .instrument(span)
        .await
    }

    async fn stream_to_file(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let mut resp = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(destination).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn with_retries<T, F, Fut>(&self, url: &str, mut attempt_fn: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.backoff.max_attempts;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts => {
                    warn!(url, attempt, max_attempts, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
                }
                Err(err) => {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    })
                }
            }
        }
    }
}
