//! Snapshot creation and rollback-point bookkeeping.
//!
//! Snapshots are content-agnostic: the engine copies whatever files a
//! plugin names before its EXECUTE phase and restores them by overwrite on
//! rollback. State is persisted to `rollback_state.json` after every
//! mutation so a crash mid-run leaves recoverable state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::RollbackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Full,
    Plugin,
    PackageList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub plugin_name: String,
    pub snapshot_type: SnapshotType,
    pub created_at: DateTime<Utc>,
    pub snapshot_dir: PathBuf,
    /// Original absolute paths that were copied into `snapshot_dir`.
    pub original_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
    NotNeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub snapshots: Vec<Snapshot>,
    pub status: RollbackStatus,
}

/// Creates and restores individual snapshots under a snapshot root
/// directory.
pub struct SnapshotManager {
    snapshot_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self { snapshot_dir: snapshot_dir.into() }
    }

    fn dir_name(plugin_name: &str, now: DateTime<Utc>) -> String {
        format!("{}_{}", plugin_name, now.format("%Y%m%d_%H%M%S_%6f"))
    }

    /// Copies `files` into a new timestamped directory under the snapshot
    /// root and writes a `metadata.json` sidecar. Individual file-copy
    /// failures are logged and skipped rather than aborting the whole
    /// snapshot — a partial snapshot still protects the files that did
    /// copy.
    pub async fn create_snapshot(
        &self,
        plugin_name: &str,
        snapshot_type: SnapshotType,
        files: &[PathBuf],
    ) -> Result<Snapshot, RollbackError> {
        let now = Utc::now();
        let dir = self.snapshot_dir.join(Self::dir_name(plugin_name, now));
        fs::create_dir_all(&dir).await?;

        let mut copied = Vec::new();
        for file in files {
            let Some(file_name) = file.file_name() else { continue };
            let dest = dir.join(file_name);
            match fs::copy(file, &dest).await {
                Ok(_) => copied.push(file.clone()),
                Err(e) => warn!(path = %file.display(), error = %e, "failed to back up file into snapshot, skipping"),
            }
        }

        let snapshot = Snapshot { plugin_name: plugin_name.to_string(), snapshot_type, created_at: now, snapshot_dir: dir.clone(), original_paths: copied };

        let metadata = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(dir.join("metadata.json"), metadata).await?;
        info!(plugin = plugin_name, dir = %snapshot.snapshot_dir.display(), "created snapshot");
        Ok(snapshot)
    }

    /// Restores every file in `snapshot` back to its original path: the
    /// current path is removed first (file or directory), then the backup
    /// is copied back into place, rather than copying over the existing
    /// contents.
    pub async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<(), RollbackError> {
        for original in &snapshot.original_paths {
            let Some(file_name) = original.file_name() else { continue };
            let backup = snapshot.snapshot_dir.join(file_name);

            match fs::metadata(original).await {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(original).await.map_err(|e| RollbackError::SnapshotRestore {
                    snapshot_dir: snapshot.snapshot_dir.display().to_string(),
                    message: e.to_string(),
                })?,
                Ok(_) => fs::remove_file(original).await.map_err(|e| RollbackError::SnapshotRestore {
                    snapshot_dir: snapshot.snapshot_dir.display().to_string(),
                    message: e.to_string(),
                })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(RollbackError::SnapshotRestore { snapshot_dir: snapshot.snapshot_dir.display().to_string(), message: e.to_string() });
                }
            }

            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&backup, original).await.map_err(|e| RollbackError::SnapshotRestore {
                snapshot_dir: snapshot.snapshot_dir.display().to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<(), RollbackError> {
        if fs::metadata(&snapshot.snapshot_dir).await.is_ok() {
            fs::remove_dir_all(&snapshot.snapshot_dir).await?;
        }
        Ok(())
    }

    /// Per-plugin GC: drops snapshots older than `max_age_days`, then caps
    /// the remainder (newest kept first) to `max_per_plugin`. Both
    /// conditions can independently trigger deletion.
    pub async fn cleanup_old_snapshots(&self, plugin_snapshots: &mut Vec<Snapshot>, max_age_days: u32, max_per_plugin: u32) -> Result<usize, RollbackError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        plugin_snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut keep = Vec::new();
        let mut removed = 0;
        for (i, snap) in plugin_snapshots.drain(..).enumerate() {
            let too_old = snap.created_at < cutoff;
            let over_cap = i as u32 >= max_per_plugin;
            if too_old || over_cap {
                self.delete_snapshot(&snap).await?;
                removed += 1;
            } else {
                keep.push(snap);
            }
        }
        *plugin_snapshots = keep;
        Ok(removed)
    }
}

/// Tracks rollback points across a run, persisting to `rollback_state.json`
/// after every mutation.
pub struct RollbackManager {
    state_path: PathBuf,
    snapshots: SnapshotManager,
    points: HashMap<String, RollbackPoint>,
}

impl RollbackManager {
    pub fn new(state_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self { state_path: state_path.into(), snapshots: SnapshotManager::new(snapshot_dir), points: HashMap::new() }
    }

    pub async fn load(state_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Result<Self, RollbackError> {
        let state_path = state_path.into();
        let points = match fs::read(&state_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { state_path, snapshots: SnapshotManager::new(snapshot_dir), points })
    }

    async fn persist(&self) -> Result<(), RollbackError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&self.points)?;
        fs::write(&self.state_path, bytes).await?;
        Ok(())
    }

    pub async fn create_rollback_point(&mut self, run_id: &str) -> Result<(), RollbackError> {
        self.points.insert(run_id.to_string(), RollbackPoint { run_id: run_id.to_string(), created_at: Utc::now(), snapshots: Vec::new(), status: RollbackStatus::Pending });
        self.persist().await
    }

    pub async fn add_snapshot(&mut self, run_id: &str, plugin_name: &str, files: &[PathBuf]) -> Result<(), RollbackError> {
        let snapshot = self.snapshots.create_snapshot(plugin_name, SnapshotType::Plugin, files).await?;
        let point = self.points.get_mut(run_id).ok_or_else(|| RollbackError::PointNotFound { run_id: run_id.to_string() })?;
        point.snapshots.push(snapshot);
        self.persist().await
    }

    /// Restores every snapshot in the run's rollback point, best-effort:
    /// one plugin's restore failure does not prevent attempting the
    /// others. Aggregates to COMPLETED/FAILED/PARTIAL.
    pub async fn execute_rollback(&mut self, run_id: &str) -> Result<RollbackStatus, RollbackError> {
        let point = self.points.get_mut(run_id).ok_or_else(|| RollbackError::PointNotFound { run_id: run_id.to_string() })?;
        point.status = RollbackStatus::InProgress;
        let total = point.snapshots.len();
        if total == 0 {
            point.status = RollbackStatus::NotNeeded;
            self.persist().await?;
            return Ok(RollbackStatus::NotNeeded);
        }

        let mut succeeded = 0;
        for snapshot in &point.snapshots {
            match self.snapshots.restore_snapshot(snapshot).await {
                Ok(()) => succeeded += 1,
                Err(e) => warn!(plugin = %snapshot.plugin_name, error = %e, "snapshot restore failed"),
            }
        }

        let status = if succeeded == total {
            RollbackStatus::Completed
        } else if succeeded == 0 {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Partial
        };
        self.points.get_mut(run_id).unwrap().status = status;
        self.persist().await?;
        Ok(status)
    }

    /// Deletes all snapshots for a successful run and removes its point
    /// entirely.
    pub async fn mark_success(&mut self, run_id: &str) -> Result<(), RollbackError> {
        if let Some(point) = self.points.remove(run_id) {
            for snapshot in &point.snapshots {
                self.snapshots.delete_snapshot(snapshot).await?;
            }
        }
        self.persist().await
    }

    /// Per-plugin snapshot cap plus age GC across every persisted rollback
    /// point — the counterpart to [`RollbackManager::cleanup`]'s
    /// whole-point age-only GC, reachable through the type that actually
    /// owns the persisted state rather than only via a caller-assembled
    /// `Vec<Snapshot>`.
    pub async fn cleanup_old_snapshots(&mut self, max_age_days: u32, max_per_plugin: u32) -> Result<usize, RollbackError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);

        let mut by_plugin: HashMap<String, Vec<(String, usize, DateTime<Utc>)>> = HashMap::new();
        for (run_id, point) in &self.points {
            for (idx, snap) in point.snapshots.iter().enumerate() {
                by_plugin.entry(snap.plugin_name.clone()).or_default().push((run_id.clone(), idx, snap.created_at));
            }
        }

        let mut to_remove: Vec<(String, usize)> = Vec::new();
        for entries in by_plugin.values_mut() {
            entries.sort_by(|a, b| b.2.cmp(&a.2));
            for (i, (run_id, idx, created_at)) in entries.iter().enumerate() {
                if *created_at < cutoff || i as u32 >= max_per_plugin {
                    to_remove.push((run_id.clone(), *idx));
                }
            }
        }

        // Remove highest index first within each run so earlier indices in
        // the same run's Vec stay valid as we go.
        to_remove.sort_by(|a, b| b.1.cmp(&a.1));
        let mut removed = 0;
        for (run_id, idx) in to_remove {
            if let Some(point) = self.points.get_mut(&run_id) {
                if idx < point.snapshots.len() {
                    let snap = point.snapshots.remove(idx);
                    self.snapshots.delete_snapshot(&snap).await?;
                    removed += 1;
                }
            }
        }
        self.persist().await?;
        Ok(removed)
    }

    pub async fn cleanup(&mut self, max_age_days: u32) -> Result<usize, RollbackError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let stale: Vec<String> = self.points.values().filter(|p| p.created_at < cutoff).map(|p| p.run_id.clone()).collect();
        for run_id in &stale {
            if let Some(point) = self.points.remove(run_id) {
                for snapshot in &point.snapshots {
                    self.snapshots.delete_snapshot(snapshot).await?;
                }
            }
        }
        self.persist().await?;
        Ok(stale.len())
    }

    pub fn get_point(&self, run_id: &str) -> Option<&RollbackPoint> {
        self.points.get(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_then_restore_round_trips_contents() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotManager::new(dir.path().join("snapshots"));
        let target = dir.path().join("config.ini");
        tokio::fs::write(&target, b"original").await.unwrap();

        let snap = snapshots.create_snapshot("p", SnapshotType::Plugin, &[target.clone()]).await.unwrap();
        tokio::fs::write(&target, b"mutated").await.unwrap();
        snapshots.restore_snapshot(&snap).await.unwrap();

        let contents = tokio::fs::read(&target).await.unwrap();
        assert_eq!(contents, b"original");
    }

    #[tokio::test]
    async fn scenario_f_partial_rollback() {
        let dir = tempdir().unwrap();
        let mut mgr = RollbackManager::new(dir.path().join("rollback_state.json"), dir.path().join("snapshots"));
        mgr.create_rollback_point("run-1").await.unwrap();

        let file1 = dir.path().join("f1.txt");
        tokio::fs::write(&file1, b"f1").await.unwrap();
        mgr.add_snapshot("run-1", "plugin-1", &[file1.clone()]).await.unwrap();

        // plugin-2's snapshot points at a file that no longer exists by
        // the time we restore, forcing a failed restore for that entry.
        let file2 = dir.path().join("f2.txt");
        tokio::fs::write(&file2, b"f2").await.unwrap();
        mgr.add_snapshot("run-1", "plugin-2", &[file2.clone()]).await.unwrap();
        tokio::fs::remove_dir_all(mgr.get_point("run-1").unwrap().snapshots[1].snapshot_dir.clone()).await.unwrap();

        tokio::fs::write(&file1, b"mutated").await.unwrap();
        let status = mgr.execute_rollback("run-1").await.unwrap();
        assert_eq!(status, RollbackStatus::Partial);
        assert_eq!(tokio::fs::read(&file1).await.unwrap(), b"f1");
    }

    #[tokio::test]
    async fn restore_removes_current_directory_before_copying_back() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotManager::new(dir.path().join("snapshots"));
        let target = dir.path().join("config.ini");
        tokio::fs::write(&target, b"original").await.unwrap();
        let snap = snapshots.create_snapshot("p", SnapshotType::Plugin, &[target.clone()]).await.unwrap();

        tokio::fs::remove_file(&target).await.unwrap();
        tokio::fs::create_dir_all(&target).await.unwrap();
        assert!(tokio::fs::metadata(&target).await.unwrap().is_dir());

        snapshots.restore_snapshot(&snap).await.unwrap();
        let meta = tokio::fs::metadata(&target).await.unwrap();
        assert!(meta.is_file());
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn cleanup_old_snapshots_caps_snapshots_per_plugin() {
        let dir = tempdir().unwrap();
        let mut mgr = RollbackManager::new(dir.path().join("rollback_state.json"), dir.path().join("snapshots"));

        for run in ["run-1", "run-2"] {
            mgr.create_rollback_point(run).await.unwrap();
            let file = dir.path().join(format!("{run}.txt"));
            tokio::fs::write(&file, run).await.unwrap();
            mgr.add_snapshot(run, "plugin-a", &[file]).await.unwrap();
        }

        let removed = mgr.cleanup_old_snapshots(30, 1).await.unwrap();
        assert_eq!(removed, 1);
        let remaining: usize = mgr.points.values().map(|p| p.snapshots.len()).sum();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn mark_success_clears_point_and_snapshots() {
        let dir = tempdir().unwrap();
        let mut mgr = RollbackManager::new(dir.path().join("rollback_state.json"), dir.path().join("snapshots"));
        mgr.create_rollback_point("run-1").await.unwrap();
        let file1 = dir.path().join("f1.txt");
        tokio::fs::write(&file1, b"f1").await.unwrap();
        mgr.add_snapshot("run-1", "plugin-1", &[file1.clone()]).await.unwrap();

        let snap_dir = mgr.get_point("run-1").unwrap().snapshots[0].snapshot_dir.clone();
        mgr.mark_success("run-1").await.unwrap();
        assert!(mgr.get_point("run-1").is_none());
        assert!(tokio::fs::metadata(&snap_dir).await.is_err());
    }
}
