//! # Error Handling Module
//!
//! Layered error types for the update engine, mirroring the split between a
//! crate-level operational error and a narrower, retry-aware error for the
//! download subsystem.
//!
//! - [`EngineError`] — configuration, scheduling, mutex, process and
//!   rollback failures surfaced by the orchestrator and its collaborators.
//! - [`DownloadError`] — the download manager's own taxonomy, with
//!   [`DownloadError::is_retryable`] driving the retry loop in
//!   [`crate::download`].
//! - [`RollbackError`] — snapshot/restore failures, aggregated per rollback
//!   point rather than propagated individually.

use thiserror::Error;

/// Top-level error for engine operations: scheduling, mutex acquisition,
/// plugin process supervision, and anything that should abort a run before
/// or during execution rather than being folded into a single plugin's
/// [`crate::models::ExecutionResult`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// A plugin descriptor or the set of descriptors for a run was invalid
    /// (duplicate names, unknown dependency, missing required field).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The dependency/mutex graph contains a cycle; reported before any
    /// plugin is started.
    #[error("dependency cycle detected: {cycle}")]
    CyclicDependency { cycle: String },

    /// Wave construction could not make progress though nodes remained —
    /// indicates a scheduler bug, not a user error.
    #[error("scheduler deadlock: {remaining} node(s) unschedulable")]
    SchedulerDeadlock { remaining: usize },

    /// Atomic multi-acquire of a plugin's mutex set did not complete before
    /// its deadline.
    #[error("mutex acquisition timed out for plugin '{plugin}' waiting on {mutexes:?}")]
    MutexTimeout { plugin: String, mutexes: Vec<String> },

    /// The plugin subprocess exited with a non-zero status.
    #[error("plugin '{plugin}' exited with status {exit_code}")]
    ProcessFailure { plugin: String, exit_code: i32 },

    /// A plugin's combined-phase wall-clock timeout elapsed.
    #[error("plugin '{plugin}' timed out after {elapsed_secs}s")]
    Timeout { plugin: String, elapsed_secs: u64 },

    /// Failure reaching or invoking the plugin's executable.
    #[error("failed to spawn plugin '{plugin}': {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    /// A download required by the orchestrator failed; wraps the
    /// download-specific taxonomy.
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    /// A rollback operation did not fully succeed.
    #[error("rollback error: {0}")]
    Rollback(#[from] RollbackError),

    /// Malformed JSON on the plugin event wire (an event line that isn't
    /// valid JSON at all, as opposed to an unrecognized `type`, which is
    /// preserved via [`crate::events::StreamEvent::Unknown`]).
    #[error("malformed plugin event from '{plugin}': {message}")]
    MalformedEvent { plugin: String, message: String },

    /// An invariant the engine relies on was violated at runtime. This
    /// should never happen; its presence indicates a bug.
    #[error("internal invariant violated: {message}")]
    Internal { message: String },

    /// Filesystem I/O failure not otherwise classified.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

/// Download manager error taxonomy. Every variant reports whether the
/// download loop in [`crate::download`] should retry it.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Network-level failure (connection reset, DNS, TLS) reaching the
    /// server at all.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx HTTP status that is not retryable (4xx other than 429).
    #[error("HTTP {status}: {url}")]
    HttpStatus { status: u16, url: String },

    /// HTTP 429 or 5xx: transient, safe to retry with backoff.
    #[error("HTTP {status} (retryable): {url}")]
    RetryableHttpStatus { status: u16, url: String },

    /// The transfer exceeded the per-download timeout.
    #[error("download timed out after {elapsed_secs}s: {url}")]
    Timeout { url: String, elapsed_secs: u64 },

    /// Computed digest did not match the expected checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch { path: String, expected: String, actual: String },

    /// Archive contents could not be parsed or contained an unsafe member
    /// (path traversal, absolute path, device file).
    #[error("archive error for {path}: {message}")]
    Archive { path: String, message: String },

    /// Filesystem failure writing the temp file, moving it into place, or
    /// populating the cache.
    #[error("I/O error for {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    /// The caller requested an unsupported checksum algorithm or archive
    /// format.
    #[error("unsupported {kind}: {value}")]
    Unsupported { kind: &'static str, value: String },
}

impl DownloadError {
    /// Whether the download loop should retry after this error, per the
    /// failure taxonomy: network errors, 429, and 5xx are retryable;
    /// everything else (4xx, checksum mismatch, bad archive, disk I/O) is
    /// not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Network(_) | DownloadError::RetryableHttpStatus { .. })
    }
}

/// Snapshot/rollback error taxonomy.
#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("failed to create snapshot for '{plugin}': {message}")]
    SnapshotCreate { plugin: String, message: String },

    #[error("failed to restore snapshot '{snapshot_dir}': {message}")]
    SnapshotRestore { snapshot_dir: String, message: String },

    #[error("no rollback point found for run '{run_id}'")]
    PointNotFound { run_id: String },

    #[error("rollback partially failed: {succeeded} succeeded, {failed} failed")]
    Partial { succeeded: usize, failed: usize },

    #[error("rollback state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rollback state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_5xx_are_retryable() {
        let e = DownloadError::RetryableHttpStatus { status: 503, url: "http://x".into() };
        assert!(e.is_retryable());
    }

    #[test]
    fn checksum_mismatch_is_not_retryable() {
        let e = DownloadError::ChecksumMismatch {
            path: "/tmp/x".into(),
            expected: "aaaa".into(),
            actual: "bbbb".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn client_4xx_is_not_retryable() {
        let e = DownloadError::HttpStatus { status: 404, url: "http://x".into() };
        assert!(!e.is_retryable());
    }

    #[test]
    fn engine_error_wraps_download_error() {
        let d = DownloadError::HttpStatus { status: 404, url: "http://x".into() };
        let e: EngineError = d.into();
        assert!(matches!(e, EngineError::Download(_)));
    }
}
