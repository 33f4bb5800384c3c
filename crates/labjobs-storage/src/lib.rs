//! Durable registry persistence, atomic file writes and the polite HTTP fetcher
//! shared by every platform adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use labjobs_core::Registry;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "labjobs-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers
/// only ever observe the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        drop(file);
        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("registry io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const REGISTRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    schema_version: u32,
    #[serde(flatten)]
    registry: Registry,
}

/// Owns the registry files: `current_jobs.json` and the `previous_jobs.json`
/// baseline that held the state before the latest run date.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    pub const CURRENT_FILE: &'static str = "current_jobs.json";
    pub const PREVIOUS_FILE: &'static str = "previous_jobs.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(Self::CURRENT_FILE)
    }

    pub fn previous_path(&self) -> PathBuf {
        self.dir.join(Self::PREVIOUS_FILE)
    }

    /// Latest saved registry, or an empty one on first run.
    pub async fn load(&self) -> Result<Registry, RegistryError> {
        read_registry(&self.current_path()).await
    }

    /// State a run for `date` must diff against. Re-running the date of the
    /// latest save compares against the baseline that preceded it.
    pub async fn load_baseline_for(&self, date: NaiveDate) -> Result<Registry, RegistryError> {
        let current = self.load().await?;
        if current.as_of == Some(date) {
            debug!(%date, "re-run of latest registry date; diffing against previous baseline");
            return read_registry(&self.previous_path()).await;
        }
        if let Some(as_of) = current.as_of.filter(|as_of| *as_of > date) {
            warn!(
                %date,
                %as_of,
                "run date is older than the registry; diffing against current state"
            );
        }
        Ok(current)
    }

    /// Persist `registry` as the current state. When it belongs to a new run
    /// date, the existing current file is first copied to the baseline.
    pub async fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        let current_path = self.current_path();
        let existing = read_registry(&current_path).await?;
        if existing.as_of.is_some() && existing.as_of != registry.as_of {
            let bytes = encode_registry(&existing, &current_path)?;
            self.write(&self.previous_path(), &bytes).await?;
        }

        let bytes = encode_registry(registry, &current_path)?;
        self.write(&current_path, &bytes).await?;
        info!(
            path = %current_path.display(),
            jobs = registry.len(),
            "saved registry"
        );
        Ok(())
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
        write_atomic(path, bytes).await.map_err(|err| RegistryError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("{err:#}")),
        })
    }
}

fn encode_registry(registry: &Registry, path: &Path) -> Result<Vec<u8>, RegistryError> {
    let doc = RegistryDocument {
        schema_version: REGISTRY_SCHEMA_VERSION,
        registry: registry.clone(),
    };
    serde_json::to_vec_pretty(&doc).map_err(|err| RegistryError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other(err),
    })
}

async fn read_registry(path: &Path) -> Result<Registry, RegistryError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::new()),
        Err(source) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let doc: RegistryDocument =
        serde_json::from_slice(&bytes).map_err(|err| RegistryError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if doc.schema_version != REGISTRY_SCHEMA_VERSION {
        return Err(RegistryError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported schema_version {}", doc.schema_version),
        });
    }
    if let Some((key, record)) = doc.registry.misfiled_entry() {
        return Err(RegistryError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("entry {key:?} holds record {:?}", record.id),
        });
    }
    Ok(doc.registry)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
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
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight across all companies.
    pub max_in_flight: usize,
    pub per_company_concurrency: usize,
    /// Minimum gap between request starts for the same company.
    pub request_spacing: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 8,
            per_company_concurrency: 1,
            request_spacing: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A single GET, or a POST with a JSON body.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub json_body: Option<serde_json::Value>,
    pub bearer_token: Option<String>,
    pub accept: &'static str,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            json_body: None,
            bearer_token: None,
            accept: "application/json",
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            json_body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn accept_html(mut self) -> Self {
        self.accept = "text/html,application/xhtml+xml";
        self
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
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
    #[error("http fetcher is shutting down")]
    Shutdown,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_company_limit: usize,
    per_company: Mutex<HashMap<String, Arc<Semaphore>>>,
    next_slot: Mutex<HashMap<String, Instant>>,
    request_spacing: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_company_limit: config.per_company_concurrency.max(1),
            per_company: Mutex::new(HashMap::new()),
            next_slot: Mutex::new(HashMap::new()),
            request_spacing: config.request_spacing,
            backoff: config.backoff,
        })
    }

    async fn company_semaphore(&self, company: &str) -> Arc<Semaphore> {
        let mut map = self.per_company.lock().await;
        map.entry(company.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_company_limit)))
            .clone()
    }

    /// Reserve the next start slot for `company` and sleep until it arrives.
    async fn pace(&self, company: &str) {
        if self.request_spacing.is_zero() {
            return;
        }
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots.get(company).copied().unwrap_or(now).max(now);
            slots.insert(company.to_string(), start + self.request_spacing);
            start - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn fetch(
        &self,
        company: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let per_company = self.company_semaphore(company).await;
        let _company = per_company
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        self.pace(company).await;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        let method = if request.json_body.is_some() { "POST" } else { "GET" };
        let span = info_span!("http_fetch", company, method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(status = status.as_u16(), attempt, ?delay, "retrying after status");
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
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, attempt, ?delay, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    fn build(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = match &request.json_body {
            Some(body) => self.client.post(&request.url).json(body),
            None => self.client.get(&request.url),
        };
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder.header(ACCEPT, request.accept)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use labjobs_core::{JobRecord, Platform};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local endpoint answering its `n`th request with `status_for(n)`.
    async fn status_server(
        status_for: impl Fn(usize) -> u16 + Send + 'static,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/jobs", listener.local_addr().expect("addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => head.extend_from_slice(&buf[..read]),
                    }
                }
                let status = status_for(counter.fetch_add(1, Ordering::SeqCst));
                let body = if status == 200 { "ok" } else { "unavailable" };
                let response = format!(
                    concat!(
                        "HTTP/1.1 {} Stub\r\n",
                        "content-length: {}\r\n",
                        "connection: close\r\n\r\n{}",
                    ),
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (url, hits)
    }

    fn quick_retry_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            request_spacing: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn sample_registry(as_of: NaiveDate, titles: &[(&str, &str)]) -> Registry {
        let mut registry = Registry::from_records(titles.iter().map(|(id, title)| {
            let mut record = JobRecord::new(
                "deepmind",
                "DeepMind",
                Platform::Greenhouse,
                id,
                title,
                &format!("https://boards.greenhouse.io/deepmind/jobs/{id}"),
                date(1),
            );
            record.location = Some("London, UK".to_string());
            record.description = Some("Work on Gemini.".to_string());
            record.last_seen_at = as_of;
            record
        }));
        registry.as_of = Some(as_of);
        registry
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("file.json");

        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_registry_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path().join("registry"));
        let registry = store.load().await.expect("load");
        assert!(registry.is_empty());
        assert_eq!(registry.as_of, None);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_every_field() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path());
        let mut registry =
            sample_registry(date(2), &[("101", "Research Scientist"), ("102", "SRE")]);
        let mut with_dates = registry.get("deepmind:101").unwrap().clone();
        with_dates.posted_at = Some(date(1));
        with_dates.department = Some("Research".to_string());
        registry.insert(with_dates);

        store.save(&registry).await.expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, registry);
    }

    #[tokio::test]
    async fn corrupt_registry_is_fatal_and_left_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path());
        std::fs::write(store.current_path(), b"{ not json").unwrap();

        let err = store.load().await.expect_err("corrupt registry must not load");
        assert!(matches!(err, RegistryError::Corrupt { .. }));
        assert_eq!(std::fs::read(store.current_path()).unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn unsupported_schema_version_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path());
        std::fs::write(
            store.current_path(),
            br#"{"schema_version": 99, "as_of": null, "jobs": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load().await,
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn new_run_date_moves_previous_state_into_baseline() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path());
        let day_two = sample_registry(date(2), &[("1", "Engineer")]);
        let day_three = sample_registry(date(3), &[("1", "Engineer"), ("2", "Researcher")]);

        store.save(&day_two).await.expect("save day two");
        store.save(&day_three).await.expect("save day three");

        assert_eq!(store.load().await.unwrap(), day_three);
        assert_eq!(store.load_baseline_for(date(3)).await.unwrap(), day_two);
        assert_eq!(store.load_baseline_for(date(4)).await.unwrap(), day_three);

        // Re-saving the same date keeps the baseline from the earlier date.
        store.save(&day_three).await.expect("re-save day three");
        assert_eq!(store.load_baseline_for(date(3)).await.unwrap(), day_two);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn unavailable_status_is_retried_until_the_budget_runs_out() {
        let (url, hits) = status_server(|_| 503).await;
        let err = quick_retry_fetcher(2)
            .fetch("openai", &FetchRequest::get(&url))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_returned_without_retrying() {
        let (url, hits) = status_server(|_| 404).await;
        let err = quick_retry_fetcher(3)
            .fetch("anthropic", &FetchRequest::get(&url))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn throttled_request_succeeds_once_the_server_recovers() {
        let (url, hits) = status_server(|n| if n < 2 { 429 } else { 200 }).await;
        let response = quick_retry_fetcher(3)
            .fetch("cohere", &FetchRequest::get(&url))
            .await
            .expect("recovered");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pacing_spaces_requests_for_the_same_company_only() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            request_spacing: Duration::from_millis(40),
            ..Default::default()
        })
        .expect("fetcher");

        let started = std::time::Instant::now();
        fetcher.pace("openai").await;
        fetcher.pace("anthropic").await;
        assert!(started.elapsed() < Duration::from_millis(40));

        fetcher.pace("openai").await;
        fetcher.pace("openai").await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
