//! Snapshot storage, tabular file formats and the retrying HTTP client.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use omx_core::{TabularRecord, SNAPSHOT_TIMESTAMP_FORMAT};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "omx-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Csv,
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unsupported file type `{extension}` for {path}")]
    Unsupported { path: PathBuf, extension: String },
    #[error("{path} is {actual:?}, expected {expected:?}")]
    WrongFormat {
        path: PathBuf,
        expected: FileFormat,
        actual: FileFormat,
    },
    #[error("columns {found:?} do not match record fields {expected:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self, FormatError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("csv") => Ok(Self::Csv),
            other => Err(FormatError::Unsupported {
                path: path.to_path_buf(),
                extension: other.unwrap_or_default().to_string(),
            }),
        }
    }

    /// Resolves the format of `path` and fails unless it is `expected`.
    pub fn require(path: &Path, expected: FileFormat) -> Result<(), FormatError> {
        let actual = Self::from_path(path)?;
        if actual != expected {
            return Err(FormatError::WrongFormat {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FormatError> {
    Ok(serde_json::to_vec_pretty(value)?)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FormatError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Header row from `R::FIELDS`, then one row per record. The header is written
/// even for an empty slice.
pub fn encode_csv<R: TabularRecord>(records: &[R]) -> Result<Vec<u8>, FormatError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(R::FIELDS)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|err| FormatError::Io(err.into_error()))
}

pub fn decode_csv<R: TabularRecord>(bytes: &[u8]) -> Result<Vec<R>, FormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let found: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if !found.iter().map(String::as_str).eq(R::FIELDS.iter().copied()) {
        return Err(FormatError::HeaderMismatch {
            expected: R::FIELDS.iter().map(|f| f.to_string()).collect(),
            found,
        });
    }
    reader
        .deserialize()
        .collect::<Result<Vec<R>, _>>()
        .map_err(FormatError::from)
}

/// Writes `bytes` to a sibling temp file and renames it over `path`. Readers
/// observe either the previous file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("output");
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub async fn write_records<R: TabularRecord>(path: &Path, records: &[R]) -> anyhow::Result<()> {
    FileFormat::require(path, FileFormat::Csv)?;
    let bytes = encode_csv(records).with_context(|| format!("encoding {}", path.display()))?;
    write_atomic(path, &bytes).await
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    FileFormat::require(path, FileFormat::Json)?;
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    decode_json(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Append-only store of raw API resources. Every path carries a fetch
/// timestamp, so repeated extractions never overwrite each other.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    pub fn timestamp(fetched_at: DateTime<Utc>) -> String {
        fetched_at.format(SNAPSHOT_TIMESTAMP_FORMAT).to_string()
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        relative_path: impl AsRef<Path>,
        value: &T,
    ) -> anyhow::Result<StoredSnapshot> {
        let relative_path = relative_path.as_ref();
        FileFormat::require(relative_path, FileFormat::Json)?;
        let bytes = encode_json(value)
            .with_context(|| format!("serializing snapshot {}", relative_path.display()))?;
        self.store_bytes(relative_path, &bytes).await
    }

    async fn store_bytes(
        &self,
        relative_path: &Path,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.root.join(relative_path);
        let stored = |deduplicated| StoredSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.to_path_buf(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        match fs::read(&absolute_path).await {
            Ok(existing) if Self::sha256_hex(&existing) == content_hash => return Ok(stored(true)),
            Ok(_) => debug!(path = %absolute_path.display(), "replacing snapshot with new content"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("checking snapshot path {}", absolute_path.display()))
            }
        }

        write_atomic(&absolute_path, bytes).await?;
        Ok(stored(false))
    }
}

fn sorted_children(dir: &Path, want_dirs: bool) -> anyhow::Result<Vec<PathBuf>> {
    let mut children = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_type()
                .map(|ft| ft.is_dir() == want_dirs)
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    children.sort();
    Ok(children)
}

/// Keeps the most recent snapshot per file name. Paths are sorted descending
/// before deduplication, so the timestamp component decides and the result
/// does not depend on input order.
pub fn filter_latest_snapshots(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by(|a, b| b.cmp(a));
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|path| {
            path.file_name()
                .map(|name| seen.insert(name.to_os_string()))
                .unwrap_or(false)
        })
        .collect()
}

/// Walks `<root>/<entity>/<timestamp>/<key>.json` and returns exactly one path
/// per `(entity, key)`: the one with the greatest timestamp. Entities are
/// visited in name order. Storage is never modified.
pub fn latest_snapshot_paths(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut latest = Vec::new();
    for entity_dir in sorted_children(root, true)? {
        let mut files = Vec::new();
        for stamp_dir in sorted_children(&entity_dir, true)? {
            files.extend(
                sorted_children(&stamp_dir, false)?
                    .into_iter()
                    .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json")),
            );
        }
        latest.extend(filter_latest_snapshots(files));
    }
    Ok(latest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post_json<T: Serialize + ?Sized>(
        url: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut request = Self::get(url);
        request.method = HttpMethod::Post;
        request.body = Some(serde_json::to_vec(body)?);
        Ok(request.header("Content-Type", "application/json"))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Sends one request. Any HTTP status is a successful send; only failures to
/// obtain a response are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
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
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let transport_error = |err: reqwest::Error| FetchError::Transport {
            url: request.url.clone(),
            message: err.to_string(),
        };

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().await.map_err(transport_error)?.to_vec();

        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

/// Wraps a transport with bounded exponential-backoff retry. Non-2xx statuses
/// and transport errors are retried; once `max_retries` is spent the last
/// failure is raised as [`FetchError::RetriesExhausted`].
#[derive(Clone)]
pub struct RetryClient {
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffPolicy,
}

impl RetryClient {
    pub fn new(transport: Arc<dyn HttpTransport>, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            sleeper: Arc::new(TokioSleeper),
            backoff,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn fetch_with_retry(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0usize;

        loop {
            let failure = match self.transport.send(request).await {
                Ok(resp) if resp.is_success() => return Ok(resp),
                Ok(resp) => FetchError::HttpStatus {
                    status: resp.status,
                    url: resp.url,
                },
                Err(err) => err,
            };

            if attempt >= max_retries {
                warn!(url = %request.url, "error fetching {}: {failure}", request.url);
                error!(url = %request.url, "maximum retries reached ({max_retries})");
                return Err(FetchError::RetriesExhausted {
                    url: request.url.clone(),
                    attempts: attempt + 1,
                    last: Box::new(failure),
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            attempt += 1;
            warn!(
                url = %request.url,
                "error fetching {}: {failure}; retrying in {}s (attempt {attempt})",
                request.url,
                delay.as_secs_f64()
            );
            self.sleeper.sleep(delay).await;
        }
    }
}
