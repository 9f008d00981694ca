//! Model file storage
//!
//! The orchestrator treats download, deletion and size queries as calls into
//! a [`ModelStorage`] collaborator. [`FsModelStore`] keeps each model under
//! `<root>/<model_id>/` and fetches files over HTTP(S) with retry and
//! optional SHA-256 verification, or copies them from a local path.

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::future::retry;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::format::FormatDetector;
use crate::progress::ProgressReporter;

/// Where to fetch a model from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSource {
    /// `http(s)://` URL, `file://` URL, or local path
    pub location: String,
    /// File name to store under; defaults to the last path segment
    pub filename: Option<String>,
    /// Expected SHA-256 as lowercase hex
    pub sha256: Option<String>,
}

impl DownloadSource {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            filename: None,
            sha256: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    fn local_path(&self) -> PathBuf {
        PathBuf::from(self.location.strip_prefix("file://").unwrap_or(&self.location))
    }

    fn file_name(&self) -> Option<String> {
        if let Some(name) = &self.filename {
            return Some(name.clone());
        }
        let trimmed = self.location.split(['?', '#']).next().unwrap_or(&self.location);
        trimmed
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

impl From<&str> for DownloadSource {
    fn from(location: &str) -> Self {
        Self::new(location)
    }
}

impl From<String> for DownloadSource {
    fn from(location: String) -> Self {
        Self::new(location)
    }
}

/// A model file present in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredModel {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Storage collaborator used by download/delete/size operations.
#[async_trait]
pub trait ModelStorage: Send + Sync {
    /// Fetch `source` as model `model_id`. Returns the stored file path.
    async fn download(
        &self,
        model_id: &str,
        source: &DownloadSource,
        progress: &ProgressReporter,
    ) -> OrchestratorResult<PathBuf>;

    /// Remove model `model_id`. Returns `false` when nothing was stored.
    async fn delete(&self, model_id: &str) -> OrchestratorResult<bool>;

    /// Bytes stored for `model_id`.
    async fn size_of(&self, model_id: &str) -> OrchestratorResult<u64>;

    /// Models currently stored.
    async fn list(&self) -> OrchestratorResult<Vec<StoredModel>>;
}

/// Filesystem-backed model store.
#[derive(Debug, Clone)]
pub struct FsModelStore {
    root: PathBuf,
    client: Client,
    max_retries: u32,
    timeout: Duration,
}

impl FsModelStore {
    pub fn new(root: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        Self::with_settings(root, 3, Duration::from_secs(600))
    }

    pub fn from_config(config: &OrchestratorConfig) -> OrchestratorResult<Option<Self>> {
        match &config.models_dir {
            Some(dir) => Self::with_settings(
                dir.clone(),
                config.download_retries,
                Duration::from_secs(config.download_timeout_secs),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    pub fn with_settings(
        root: impl Into<PathBuf>,
        max_retries: u32,
        timeout: Duration,
    ) -> OrchestratorResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Storage(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            root: root.into(),
            client,
            max_retries,
            timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, model_id: &str) -> OrchestratorResult<PathBuf> {
        validate_id(model_id)?;
        Ok(self.root.join(model_id))
    }

    /// Primary model file for `model_id`, if stored.
    pub fn locate(&self, model_id: &str) -> Option<PathBuf> {
        let dir = self.model_dir(model_id).ok()?;
        model_files(&dir).into_iter().next()
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        output: &Path,
        progress: &ProgressReporter,
    ) -> OrchestratorResult<u64> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.timeout),
            max_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let attempts = AtomicU32::new(0);
        let max_retries = self.max_retries;

        retry(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match self.fetch_once(url, output, progress).await {
                Ok(bytes) => Ok(bytes),
                Err(FetchError::Permanent(e)) => Err(backoff::Error::permanent(e)),
                Err(FetchError::Transient(e)) if attempt > max_retries => {
                    Err(backoff::Error::permanent(e))
                }
                Err(FetchError::Transient(e)) => {
                    warn!(url, attempt, error = %e, "download attempt failed");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("download of {url} failed: {e}")))
    }

    async fn fetch_once(
        &self,
        url: &str,
        output: &Path,
        progress: &ProgressReporter,
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("HTTP {status}")));
        }

        let total = response.content_length().unwrap_or(0);
        debug!(url, total, "download started");

        let mut file = tokio::fs::File::create(output)
            .await
            .map_err(|e| FetchError::Permanent(format!("cannot create {}: {e}", output.display())))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Transient(format!("read failed: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Permanent(format!("write failed: {e}")))?;
            downloaded += chunk.len() as u64;
            if total > 0 {
                // leave the final step for after verification
                progress.report(
                    (downloaded as f32 / total as f32) * 0.95,
                    format!("{} of {}", format_bytes(downloaded), format_bytes(total)),
                );
            }
        }

        file.sync_all()
            .await
            .map_err(|e| FetchError::Permanent(format!("sync failed: {e}")))?;
        Ok(downloaded)
    }
}

enum FetchError {
    Transient(String),
    Permanent(String),
}

#[async_trait]
impl ModelStorage for FsModelStore {
    async fn download(
        &self,
        model_id: &str,
        source: &DownloadSource,
        progress: &ProgressReporter,
    ) -> OrchestratorResult<PathBuf> {
        let dir = self.model_dir(model_id)?;
        let filename = source.file_name().ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!(
                "cannot derive a file name from '{}'",
                source.location
            ))
        })?;
        validate_id(&filename)?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| OrchestratorError::Storage(format!("cannot create {}: {e}", dir.display())))?;
        let target = dir.join(&filename);
        let partial = dir.join(format!("{filename}.part"));

        info!(model_id, source = %source.location, target = %target.display(), "storing model");
        progress.report(0.0, "starting");

        let bytes = if source.is_remote() {
            self.fetch_with_retry(&source.location, &partial, progress).await?
        } else {
            tokio::fs::copy(source.local_path(), &partial).await.map_err(|e| {
                OrchestratorError::Storage(format!("cannot copy {}: {e}", source.location))
            })?
        };

        if let Some(expected) = &source.sha256 {
            let actual = sha256_file(&partial).await?;
            if &actual != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(OrchestratorError::Storage(format!(
                    "checksum mismatch for '{model_id}': expected {expected}, got {actual}"
                )));
            }
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| OrchestratorError::Storage(format!("cannot finalize download: {e}")))?;
        progress.report(1.0, "stored");

        info!(model_id, size = %format_bytes(bytes), "model stored");
        Ok(target)
    }

    async fn delete(&self, model_id: &str) -> OrchestratorResult<bool> {
        let dir = self.model_dir(model_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(model_id, "model files deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OrchestratorError::Storage(format!(
                "cannot delete {}: {e}",
                dir.display()
            ))),
        }
    }

    async fn size_of(&self, model_id: &str) -> OrchestratorResult<u64> {
        let dir = self.model_dir(model_id)?;
        if !dir.is_dir() {
            return Err(OrchestratorError::Storage(format!(
                "model '{model_id}' is not stored"
            )));
        }
        let mut total = 0u64;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| OrchestratorError::Storage(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::Storage(e.to_string()))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| OrchestratorError::Storage(e.to_string()))?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    async fn list(&self) -> OrchestratorResult<Vec<StoredModel>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_sync(&root))
            .await
            .map_err(|e| OrchestratorError::Storage(e.to_string()))
    }
}

fn list_sync(root: &Path) -> Vec<StoredModel> {
    let Ok(dirs) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut models = Vec::new();
    for dir in dirs.flatten() {
        let path = dir.path();
        if !path.is_dir() {
            continue;
        }
        let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if let Some(file) = model_files(&path).into_iter().next() {
            let size_bytes = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
            models.push(StoredModel {
                id,
                path: file,
                size_bytes,
            });
        }
    }
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models
}

/// Recognized model files in `dir`, sorted by name.
fn model_files(dir: &Path) -> Vec<PathBuf> {
    let detector = FormatDetector::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().is_none_or(|ext| ext != "part"))
        .filter(|p| detector.detect(p).is_known())
        .collect();
    files.sort();
    files
}

fn validate_id(id: &str) -> OrchestratorResult<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(OrchestratorError::InvalidRequest(format!(
            "'{id}' is not a valid storage name"
        )));
    }
    Ok(())
}

async fn sha256_file(path: &Path) -> OrchestratorResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut reader = std::io::BufReader::new(file);
        let mut buffer = [0u8; 8192];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| OrchestratorError::Storage(e.to_string()))?
    .map_err(|e| OrchestratorError::Storage(format!("checksum failed: {e}")))
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
