//! Periodic "sleepy" workers.
//!
//! A worker alternates between an active phase, where it runs cycles until
//! one reports no progress, and a sleep phase that ends when its period
//! elapses or someone calls [`WorkerHandle::wake`].

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Work driven by a [`WorkerHandle`].
pub trait SleepyWorker: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one active cycle. Returning `false` ends the active phase.
    fn run_cycle(&self) -> impl Future<Output = bool> + Send;

    /// Housekeeping run once before each sleep.
    fn on_sleep(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Observable worker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Active,
    Sleeping,
    Stopped,
}

/// Read access to a worker's phase.
pub trait StatusMonitor: Send + Sync {
    fn status(&self) -> WorkerStatus;
}

struct WorkerShared {
    name: &'static str,
    wake: Notify,
    status: RwLock<WorkerStatus>,
    stopped: AtomicBool,
}

/// Control handle for one worker. Clones share the same worker.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Create a handle for a worker that has not been spawned yet.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(WorkerShared {
                name,
                wake: Notify::new(),
                status: RwLock::new(WorkerStatus::Sleeping),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Cut the current sleep short. A wake while active is remembered.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Current phase.
    pub fn status(&self) -> WorkerStatus {
        *self.inner.status.read()
    }

    /// Stop after the current cycle.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Whether [`WorkerHandle::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Run `worker` on the tokio runtime, sleeping up to `period` between
    /// active phases.
    pub fn spawn<W: SleepyWorker>(&self, worker: Arc<W>, period: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move { handle.run(worker, period).await })
    }

    async fn run<W: SleepyWorker>(&self, worker: Arc<W>, period: Duration) {
        info!(worker = self.inner.name, "Worker started");
        while !self.is_stopped() {
            self.set_status(WorkerStatus::Active);
            let mut cycles = 0u64;
            while !self.is_stopped() && worker.run_cycle().await {
                cycles += 1;
            }
            if self.is_stopped() {
                break;
            }

            worker.on_sleep().await;
            self.set_status(WorkerStatus::Sleeping);
            debug!(worker = self.inner.name, cycles, "Worker sleeping");

            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(period) => {}
            }
        }
        self.set_status(WorkerStatus::Stopped);
        info!(worker = worker.name(), "Worker stopped");
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.inner.status.write() = status;
    }
}

impl StatusMonitor for WorkerHandle {
    fn status(&self) -> WorkerStatus {
        WorkerHandle::status(self)
    }
}
