//! Raw page archive, resumable CSV tables, and the rate-limited HTTP fetch layer for FRDD.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frdd_core::SourceId;
use reqwest::header::{HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod checkpoint;

pub use checkpoint::{read_csv_table, write_csv_table, CheckpointTable};

pub const CRATE_NAME: &str = "frdd-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store for fetched pages, grouped by fetch day and source.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: SourceId,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source.as_str())
            .join(format!("{content_hash}.html"))
    }

    /// Writes via a temp file and rename so a crash never leaves a torn page behind.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source: SourceId,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let page = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(page(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(page(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(page(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp page {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 403 is retried too: the review site answers bot suspicion with a temporary 403.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Rotated per request; empty means the reqwest default agent.
    pub user_agents: Vec<String>,
    /// Minimum spacing between two outgoing requests.
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agents: Vec::new(),
            min_interval: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Serializes requests so consecutive calls are at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid user agent header: {0}")]
    InvalidHeader(String),
}

/// Seam between the collection runners and the network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, source: SourceId, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            user_agents: config.user_agents,
            next_agent: AtomicUsize::new(0),
            pacer: RequestPacer::new(config.min_interval),
            backoff: config.backoff,
        })
    }

    fn rotate_user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        self.user_agents.get(index).map(String::as_str)
    }

    fn build_request(&self, url: &str) -> Result<reqwest::RequestBuilder, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(agent) = self.rotate_user_agent() {
            let value = HeaderValue::from_str(agent)
                .map_err(|_| FetchError::InvalidHeader(agent.to_string()))?;
            request = request.header(USER_AGENT, value);
        }
        Ok(request)
    }

    pub async fn fetch_bytes(
        &self,
        source: SourceId,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source = %source, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0usize;

        loop {
            self.pacer.wait_turn().await;
            let response = self.build_request(url)?.send().await;
            let can_retry = attempt < max_retries;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(%status, attempt = attempt + 1, max_retries, ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt = attempt + 1, max_retries, ?delay, "retrying after request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, source: SourceId, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(source, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn identical_pages_are_stored_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-07T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, SourceId::BoxOfficeDetail, b"<html>same</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, SourceId::BoxOfficeDetail, b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20260207").join("box_office_detail")));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn default_backoff_doubles_from_five_seconds_up_to_a_minute() {
        let policy = BackoffPolicy::default();

        let delays: Vec<u64> = (0..6).map(|i| policy.delay_for_attempt(i).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn forbidden_and_throttled_statuses_are_retried_but_not_found_is_not() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn user_agents_rotate_round_robin() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agents: vec!["a".into(), "b".into()],
            ..Default::default()
        })
        .expect("client");
        assert_eq!(fetcher.rotate_user_agent(), Some("a"));
        assert_eq!(fetcher.rotate_user_agent(), Some("b"));
        assert_eq!(fetcher.rotate_user_agent(), Some("a"));
    }
}
