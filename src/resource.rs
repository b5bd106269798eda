//! Bounds parallelism and (best-effort) memory usage across a run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::debug;

/// Limits enforced by a [`ResourceController`].
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_parallel_tasks: usize,
    pub max_parallel_downloads: usize,
    /// Soft ceiling in MiB. 0 disables the check. This engine does not
    /// link a process-inspection crate, so the usage callback defaults to
    /// always reporting 0 and the ceiling is effectively a no-op unless a
    /// caller supplies `with_memory_probe`.
    pub max_memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_parallel_tasks: 4, max_parallel_downloads: 2, max_memory_mb: 0 }
    }
}

type MemoryProbe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Gates task and download concurrency with counting semaphores, and
/// optionally waits for memory headroom before granting a task slot.
pub struct ResourceController {
    limits: ResourceLimits,
    task_slots: Arc<Semaphore>,
    download_slots: Arc<Semaphore>,
    memory_probe: MemoryProbe,
}

impl ResourceController {
    pub fn new(limits: ResourceLimits) -> Self {
        let task_slots = Arc::new(Semaphore::new(limits.max_parallel_tasks));
        let download_slots = Arc::new(Semaphore::new(limits.max_parallel_downloads));
        Self { limits, task_slots, download_slots, memory_probe: Box::new(|| 0) }
    }

    /// Supplies a callback reporting current aggregate memory usage in
    /// MiB, used to gate task slots against `max_memory_mb`.
    pub fn with_memory_probe(mut self, probe: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.memory_probe = Box::new(probe);
        self
    }

    async fn wait_for_memory(&self) {
        if self.limits.max_memory_mb == 0 {
            return;
        }
        while (self.memory_probe)() > self.limits.max_memory_mb {
            debug!("waiting for memory headroom before granting task slot");
            sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn acquire_task_slot(&self) -> OwnedSemaphorePermit {
        self.wait_for_memory().await;
        self.task_slots.clone().acquire_owned().await.expect("task semaphore never closed")
    }

    pub async fn acquire_download_slot(&self) -> OwnedSemaphorePermit {
        self.download_slots.clone().acquire_owned().await.expect("download semaphore never closed")
    }

    pub async fn scoped(&self, task: bool, download: bool) -> ResourceGuard {
        let task_permit = if task { Some(self.acquire_task_slot().await) } else { None };
        let download_permit = if download { Some(self.acquire_download_slot().await) } else { None };
        ResourceGuard { task_permit, download_permit }
    }
}

/// RAII guard releasing its held permits in download-before-task order on
/// drop.
pub struct ResourceGuard {
    task_permit: Option<OwnedSemaphorePermit>,
    download_permit: Option<OwnedSemaphorePermit>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.download_permit.take();
        self.task_permit.take();
    }
}
