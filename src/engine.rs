//! Shared run context: configuration, worker pool, locks, cancellation,
//! progress, and the scenario handler registry.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use repo_merger_core::handlers::HandlerRegistry;

use crate::config::Config;
use crate::progress::{NoProgress, ProgressEvent, SharedProgress};
use crate::workspace::{WorkspaceLocks, WorkspacePaths};

/// Returned when a run stops at a cancellation checkpoint.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled; completed work was kept and the run can be resumed")]
pub struct Cancelled;

#[derive(Clone)]
pub struct Engine {
    pub workspace_root: PathBuf,
    pub config: Config,
    pub handlers: Arc<HandlerRegistry>,
    pub locks: WorkspaceLocks,
    pub cancel: CancellationToken,
    progress: SharedProgress,
    pool: Arc<Semaphore>,
}

impl Engine {
    pub fn new(workspace_root: &Path, config: Config) -> Self {
        let workers = config.scan.workers.max(1);
        Self {
            workspace_root: workspace_root.to_path_buf(),
            config,
            handlers: Arc::new(HandlerRegistry::with_defaults()),
            locks: WorkspaceLocks::new(),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
            pool: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn paths(&self, identifier: &str) -> WorkspacePaths {
        WorkspacePaths::new(&self.workspace_root, identifier)
    }

    pub fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }

    pub fn report(&self, event: ProgressEvent) {
        self.progress.report(event);
    }

    /// Run blocking work (hashing, git) on the bounded worker pool.
    pub async fn blocking<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;
        tokio::task::spawn_blocking(work)
            .await
            .context("worker task panicked")?
    }

    /// Cancellation checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocking_runs_on_pool() {
        let engine = Engine::new(Path::new("/tmp/ws"), Config::minimal());
        let value = engine.blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn checkpoint_reports_cancellation() {
        let engine = Engine::new(Path::new("/tmp/ws"), Config::minimal());
        assert!(engine.checkpoint().is_ok());
        engine.cancel.cancel();
        let err = engine.checkpoint().unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
