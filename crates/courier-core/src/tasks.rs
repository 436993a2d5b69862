//! Tracked background work
//!
//! Fire-and-forget jobs (watermark publishes, TURN refreshes, ICE accepts)
//! and long-running loops (heartbeat, signaling, queue pumps) are spawned
//! through [`BackgroundTasks`] so that shutdown can cancel them.
//!
//! Jobs and loops live in separate trackers. [`BackgroundTasks::wait_idle`]
//! settles jobs only; loops end at shutdown.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::CourierResult;

/// Owner of every detached task spawned by a transport instance.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    jobs: TaskTracker,
    loops: TaskTracker,
    cancel: CancellationToken,
}

impl BackgroundTasks {
    /// Create an empty task set
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on [`BackgroundTasks::shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether shutdown has begun
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a job whose error is logged and otherwise ignored.
    ///
    /// The job is dropped at its next await point once shutdown begins.
    pub fn spawn_detached<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = CourierResult<()>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!(task = name, "Not spawning task after shutdown");
            return;
        }
        let cancel = self.cancel.clone();
        self.jobs.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "Task cancelled");
                }
                result = job => {
                    if let Err(e) = result {
                        warn!(task = name, error = %e, "Background task failed");
                    }
                }
            }
        });
    }

    /// Spawn a long-running loop that receives the cancellation token.
    pub fn spawn_loop<F, Fut>(&self, name: &'static str, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!(task = name, "Not spawning loop after shutdown");
            return;
        }
        let fut = body(self.cancel.clone());
        self.loops.spawn(fut);
    }

    /// Number of jobs and loops still running
    pub fn len(&self) -> usize {
        self.jobs.len() + self.loops.len()
    }

    /// True if nothing is running
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.loops.is_empty()
    }

    /// Wait until every detached job spawned so far has finished.
    ///
    /// Jobs spawned while waiting are also awaited. Loops are not; they
    /// run until [`BackgroundTasks::shutdown`].
    pub async fn wait_idle(&self) {
        self.jobs.close();
        self.jobs.wait().await;
        self.jobs.reopen();
    }

    /// Cancel every job and loop and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.jobs.close();
        self.loops.close();
        self.jobs.wait().await;
        self.loops.wait().await;
    }
}
