//! Task spawning abstraction for the engines' background work.
//!
//! Watchdog timers, the schedule poller, encoder exit dispatch and the serial
//! reader all go through a [`TaskSpawner`], so the composition root decides
//! where they run and can wait for them on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Abstraction for spawning named background tasks.
///
/// # Example
///
/// ```ignore
/// spawner.spawn("zone-maintenance", engine.clone().run_maintenance(cancel.clone()));
/// ```
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task.
    fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner that remembers what it started.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
    tasks: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.tasks.lock().iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Waits up to `grace` for every spawned task, then aborts stragglers.
    pub async fn join_all(&self, grace: Duration) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, mut handle) in tasks {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => log::debug!("[Runtime] Task {} finished", name),
                Ok(Err(e)) => log::warn!("[Runtime] Task {} failed: {}", name, e),
                Err(_) => {
                    log::warn!("[Runtime] Task {} did not stop within {:?}, aborting", name, grace);
                    handle.abort();
                }
            }
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::debug!("[Runtime] Spawning task {}", name);
        let handle = self.handle.spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name, handle));
    }
}
