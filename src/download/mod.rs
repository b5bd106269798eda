//! Centralized download manager: retry/backoff, rate limiting, checksum
//! verification, archive extraction, and a content-addressed cache.

pub mod cache;
pub mod extract;
pub mod rate_limit;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File as AsyncFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::DownloadManagerConfig;
use crate::error::DownloadError;
use crate::events::{EventQueueHandle, StreamEvent, TimestampedEvent};
use crate::models::Phase;
use crate::resource::ResourceController;

use cache::ContentCache;
use extract::ArchiveFormat;
use rate_limit::TokenBucket;

const CHUNK_SIZE_HINT: usize = 64 * 1024;
const DEFAULT_USER_AGENT: &str = "update-all-download-manager/1.0";
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Where a running download reports progress to, if anywhere. Threaded
/// through [`DownloadManager::attempt`] so the chunk loop can emit
/// `Progress` events without `download_with_progress` duplicating the
/// retry/cache/extract logic in `download`.
struct ProgressEmitter<'a> {
    sink: &'a EventQueueHandle,
    plugin: &'a str,
    expected_size: Option<u64>,
    last_emit: std::time::Instant,
}

impl<'a> ProgressEmitter<'a> {
    fn new(sink: &'a EventQueueHandle, plugin: &'a str, expected_size: Option<u64>) -> Self {
        Self { sink, plugin, expected_size, last_emit: std::time::Instant::now() }
    }

    /// Emits a `Progress` event if at least [`PROGRESS_INTERVAL`] has
    /// elapsed since the last one. Always emits on `force` (used for the
    /// final chunk so the last reported total matches what was written).
    fn maybe_emit(&mut self, bytes_downloaded: u64, force: bool) {
        if !force && self.last_emit.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        self.last_emit = std::time::Instant::now();
        let percent = self.expected_size.and_then(|total| {
            if total == 0 {
                None
            } else {
                Some(((bytes_downloaded.min(total) * 100) / total) as u8)
            }
        });
        self.sink.put(TimestampedEvent::new(
            self.plugin,
            StreamEvent::Progress {
                phase: Phase::Download,
                percent,
                message: None,
                bytes_downloaded: Some(bytes_downloaded),
                bytes_total: self.expected_size,
                items_completed: None,
                items_total: None,
            },
        ));
    }
}

/// A checksum a download must satisfy, and the key its cache entry lives
/// under.
#[derive(Debug, Clone)]
pub struct Checksum {
    pub algorithm: String,
    pub hex_digest: String,
}

/// An immutable description of a single download, issued once per call.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub url: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub checksum: Option<Checksum>,
    pub extract: Option<ArchiveFormat>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl DownloadSpec {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_size: None,
            checksum: None,
            extract: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_checksum(mut self, algorithm: impl Into<String>, hex_digest: impl Into<String>) -> Self {
        self.checksum = Some(Checksum { algorithm: algorithm.into(), hex_digest: hex_digest.into() });
        self
    }

    pub fn with_extract(mut self, format: ArchiveFormat) -> Self {
        self.extract = Some(format);
        self
    }
}

/// Outcome of a [`DownloadManager::download`] call.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub success: bool,
    pub final_path: Option<PathBuf>,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub from_cache: bool,
    pub checksum_verified: bool,
    pub error: Option<String>,
}

pub struct DownloadManager {
    client: reqwest::Client,
    cache: ContentCache,
    config: DownloadManagerConfig,
    resources: Arc<ResourceController>,
    rate_limiter: Option<Arc<AsyncMutex<TokenBucket>>>,
}

impl DownloadManager {
    pub fn new(config: DownloadManagerConfig, resources: Arc<ResourceController>) -> Self {
        let rate_limiter = config.bandwidth_limit.map(|bps| Arc::new(AsyncMutex::new(TokenBucket::new(bps))));
        Self {
            client: reqwest::Client::new(),
            cache: ContentCache::new(config.cache_dir.clone()),
            config,
            resources,
            rate_limiter,
        }
    }

    pub async fn download(&self, spec: &DownloadSpec) -> DownloadResult {
        self.download_inner(spec, None).await
    }

    /// Same as [`Self::download`], but emits `PhaseStart(Download)`,
    /// periodic `Progress` events (at most every [`PROGRESS_INTERVAL`]),
    /// and a final `PhaseEnd` + `Completion` through `sink`, tagged with
    /// `plugin`. The returned [`DownloadResult`] is identical either way —
    /// this is the streaming view of the same operation, not a different
    /// one.
    pub async fn download_with_progress(&self, spec: &DownloadSpec, sink: &EventQueueHandle, plugin: &str) -> DownloadResult {
        sink.put(TimestampedEvent::new(plugin, StreamEvent::PhaseStart { phase: Phase::Download }));
        let result = self.download_inner(spec, Some((sink, plugin))).await;
        sink.put(TimestampedEvent::new(
            plugin,
            StreamEvent::PhaseEnd { phase: Phase::Download, success: result.success, error: result.error.clone() },
        ));
        sink.put(TimestampedEvent::new(
            plugin,
            StreamEvent::Completion {
                success: result.success,
                exit_code: if result.success { 0 } else { 1 },
                packages_updated: 0,
                error: result.error.clone(),
            },
        ));
        result
    }

    async fn download_inner(&self, spec: &DownloadSpec, progress: Option<(&EventQueueHandle, &str)>) -> DownloadResult {
        let start = std::time::Instant::now();

        if let Some(checksum) = &spec.checksum {
            if self.cache.contains(&checksum.algorithm, &checksum.hex_digest).await {
                info!(url = %spec.url, "using cached file");
                let cached = self.cache.entry_path(&checksum.algorithm, &checksum.hex_digest);
                if let Err(e) = materialize_from_cache(&cached, &spec.destination, spec.extract).await {
                    return DownloadResult {
                        success: false,
                        final_path: None,
                        bytes_transferred: 0,
                        duration: start.elapsed(),
                        from_cache: true,
                        checksum_verified: false,
                        error: Some(e.to_string()),
                    };
                }
                return DownloadResult {
                    success: true,
                    final_path: Some(spec.destination.clone()),
                    bytes_transferred: 0,
                    duration: start.elapsed(),
                    from_cache: true,
                    checksum_verified: true,
                    error: None,
                };
            }
        }

        let _slot = self.resources.acquire_download_slot().await;

        let max_attempts = self.config.max_retries + 1;
        let mut last_err: Option<DownloadError> = None;

        for attempt in 1..=max_attempts {
            let mut emitter = progress.map(|(sink, plugin)| ProgressEmitter::new(sink, plugin, spec.expected_size));
            match self.attempt(spec, emitter.as_mut()).await {
                Ok((path, bytes)) => {
                    return DownloadResult {
                        success: true,
                        final_path: Some(path),
                        bytes_transferred: bytes,
                        duration: start.elapsed(),
                        from_cache: false,
                        checksum_verified: spec.checksum.is_some(),
                        error: None,
                    };
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(url = %spec.url, attempt, retryable, error = %e, "download attempt failed");
                    last_err = Some(e);
                    if !retryable || attempt == max_attempts {
                        break;
                    }
                    let backoff = self.config.retry_delay.mul_f64(2f64.powi(attempt as i32 - 1));
                    sleep(backoff).await;
                }
            }
        }

        DownloadResult {
            success: false,
            final_path: None,
            bytes_transferred: 0,
            duration: start.elapsed(),
            from_cache: false,
            checksum_verified: false,
            error: last_err.map(|e| e.to_string()),
        }
    }

    async fn attempt(&self, spec: &DownloadSpec, mut progress: Option<&mut ProgressEmitter<'_>>) -> Result<(PathBuf, u64), DownloadError> {
        let dest_dir = spec.destination.parent().unwrap_or(&spec.destination).to_path_buf();
        tokio::fs::create_dir_all(&dest_dir).await.map_err(|e| io_err(&dest_dir, e))?;

        let filename = spec.destination.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "download".to_string());
        let tmp_path = dest_dir.join(format!(".{}.download", filename));

        let mut request = self.client.get(&spec.url).timeout(spec.timeout).header("User-Agent", DEFAULT_USER_AGENT);
        for (k, v) in &spec.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = request.send().await.map_err(DownloadError::Network)?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            return if code == 429 || (500..600).contains(&code) {
                Err(DownloadError::RetryableHttpStatus { status: code, url: spec.url.clone() })
            } else {
                Err(DownloadError::HttpStatus { status: code, url: spec.url.clone() })
            };
        }

        let mut hasher = spec.checksum.as_ref().map(|_| Sha256::new());
        let mut file = AsyncFile::create(&tmp_path).await.map_err(|e| io_err(&tmp_path, e))?;
        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(DownloadError::Network)?;
            if let Some(limiter) = &self.rate_limiter {
                limiter.lock().await.acquire(chunk.len() as u64).await;
            }
            if let Some(h) = hasher.as_mut() {
                h.update(&chunk);
            }
            file.write_all(&chunk).await.map_err(|e| io_err(&tmp_path, e))?;
            total += chunk.len() as u64;
            if let Some(emitter) = progress.as_deref_mut() {
                emitter.maybe_emit(total, false);
            }
        }
        if let Some(emitter) = progress.as_deref_mut() {
            emitter.maybe_emit(total, true);
        }
        file.flush().await.map_err(|e| io_err(&tmp_path, e))?;
        drop(file);
        let _ = CHUNK_SIZE_HINT; // streaming is chunked by the HTTP client; size is advisory only.

        if let (Some(checksum), Some(hasher)) = (&spec.checksum, hasher) {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(&checksum.hex_digest) {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(DownloadError::ChecksumMismatch {
                    path: spec.destination.display().to_string(),
                    expected: checksum.hex_digest.clone(),
                    actual,
                });
            }
        }

        let final_path = if let Some(format) = spec.extract {
            let dest = spec.destination.clone();
            let src = tmp_path.clone();
            tokio::task::spawn_blocking(move || extract::extract(&src, &dest, format))
                .await
                .map_err(|e| DownloadError::Archive { path: spec.destination.display().to_string(), message: e.to_string() })??;
            let _ = tokio::fs::remove_file(&tmp_path).await;
            spec.destination.clone()
        } else {
            tokio::fs::rename(&tmp_path, &spec.destination).await.map_err(|e| io_err(&spec.destination, e))?;
            spec.destination.clone()
        };

        if let Some(checksum) = &spec.checksum {
            if let Err(e) = self.cache.insert(&checksum.algorithm, &checksum.hex_digest, &final_path).await {
                warn!(error = %e, "failed to populate download cache");
            }
        }

        Ok((final_path, total))
    }
}

async fn materialize_from_cache(cached: &std::path::Path, destination: &std::path::Path, extract: Option<ArchiveFormat>) -> Result<(), DownloadError> {
    let _ = extract;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
    }
    let meta = tokio::fs::metadata(cached).await.map_err(|e| io_err(cached, e))?;
    if meta.is_dir() {
        copy_dir(cached, destination).await
    } else {
        tokio::fs::copy(cached, destination).await.map_err(|e| io_err(destination, e))?;
        Ok(())
    }
}

fn copy_dir<'a>(src: &'a std::path::Path, dst: &'a std::path::Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DownloadError>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await.map_err(|e| io_err(dst, e))?;
        let mut entries = tokio::fs::read_dir(src).await.map_err(|e| io_err(src, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(src, e))? {
            let ty = entry.file_type().await.map_err(|e| io_err(&entry.path(), e))?;
            let target = dst.join(entry.file_name());
            if ty.is_dir() {
                copy_dir(&entry.path(), &target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await.map_err(|e| io_err(&target, e))?;
            }
        }
        Ok(())
    })
}

fn io_err(path: &std::path::Path, source: std::io::Error) -> DownloadError {
    DownloadError::Io { path: path.display().to_string(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceLimits;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(cache_dir: PathBuf) -> DownloadManager {
        let config = DownloadManagerConfig { cache_dir, max_retries: 2, retry_delay: Duration::from_millis(10), ..Default::default() };
        let resources = Arc::new(ResourceController::new(ResourceLimits::default()));
        DownloadManager::new(config, resources)
    }

    #[tokio::test]
    async fn scenario_c_retry_then_success_then_cache_hit() {
        let server = MockServer::start().await;
        let body = b"package-bytes".to_vec();
        let digest = hex::encode(Sha256::digest(&body));

        Mock::given(method("GET")).and(path("/pkg.tgz")).respond_with(ResponseTemplate::new(503)).up_to_n_times(2).mount(&server).await;
        Mock::given(method("GET")).and(path("/pkg.tgz")).respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone())).mount(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path().join("cache"));
        let dest = dir.path().join("out/pkg.tgz");
        let spec = DownloadSpec::new(format!("{}/pkg.tgz", server.uri()), dest.clone()).with_checksum("sha256", digest.clone());

        let result = mgr.download(&spec).await;
        assert!(result.success, "{:?}", result.error);
        assert!(!result.from_cache);

        let second = mgr.download(&spec).await;
        assert!(second.success);
        assert!(second.from_cache);
        assert_eq!(second.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn scenario_d_checksum_mismatch_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/bad.bin")).respond_with(ResponseTemplate::new(200).set_body_bytes(b"actual".to_vec())).mount(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path().join("cache"));
        let dest = dir.path().join("bad.bin");
        let spec = DownloadSpec::new(format!("{}/bad.bin", server.uri()), dest.clone()).with_checksum("sha256", "a".repeat(64));

        let result = mgr.download(&spec).await;
        assert!(!result.success);
        assert!(result.error.unwrap().to_lowercase().contains("checksum"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn download_with_progress_emits_phase_start_then_completion_last() {
        use crate::events::EventQueue;

        let server = MockServer::start().await;
        let body = vec![0u8; 8192];
        Mock::given(method("GET")).and(path("/big.bin")).respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone())).mount(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path().join("cache"));
        let dest = dir.path().join("big.bin");
        let mut spec = DownloadSpec::new(format!("{}/big.bin", server.uri()), dest.clone());
        spec.expected_size = Some(body.len() as u64);

        let mut queue = EventQueue::new(16);
        let handle = queue.handle();
        let result = mgr.download_with_progress(&spec, &handle, "demo-plugin").await;
        assert!(result.success, "{:?}", result.error);
        handle.close();

        let mut events = Vec::new();
        while let Some(ev) = queue.recv().await {
            events.push(ev.event);
        }

        assert!(matches!(events.first(), Some(StreamEvent::PhaseStart { phase: Phase::Download })), "{:?}", events.first());
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Progress { phase: Phase::Download, .. })));
        let completion_pos = events.iter().position(|e| e.is_completion()).expect("completion event present");
        assert_eq!(completion_pos, events.len() - 1, "completion must be the last event");
        assert!(matches!(events[completion_pos - 1], StreamEvent::PhaseEnd { phase: Phase::Download, success: true, .. }));
    }

    #[tokio::test]
    async fn non_retryable_4xx_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/missing.bin")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path().join("cache"));
        let spec = DownloadSpec::new(format!("{}/missing.bin", server.uri()), dir.path().join("missing.bin"));
        let result = mgr.download(&spec).await;
        assert!(!result.success);
    }
}
