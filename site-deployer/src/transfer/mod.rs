//! Resilient batch transfer of a change set to a remote store.
//!
//! The change set expands into one task per path to upload or delete.
//! A fixed number of workers pull tasks from a shared queue; each worker owns
//! the retry loop of the task it holds. A task that exhausts its attempts is
//! recorded as failed without stopping the rest of the batch, and the batch
//! only returns once every task is terminal.

pub mod backoff;
pub mod progress;

use crate::config::TransferConfig;
use crate::diff::ChangeSet;
use crate::fs::Fingerprint;
use crate::manifest::Manifest;
use crate::remote::RemoteStore;
use crate::utils::errors::{DeployError, RemoteError, Result};
use backoff::Backoff;
use progress::{format_bytes, format_duration, format_speed, spawn_reporter, BatchProgress};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOp {
    Upload,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedTerminal,
}

/// One remote operation for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTask {
    pub path: String,
    pub op: TransferOp,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub status: TaskStatus,
    /// Content the upload must carry, as fingerprinted when the manifest was built
    #[serde(skip)]
    pub expected: Option<Fingerprint>,
}

impl TransferTask {
    pub fn upload(path: impl Into<String>, expected: Option<Fingerprint>) -> Self {
        Self::new(path.into(), TransferOp::Upload, expected)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(path.into(), TransferOp::Delete, None)
    }

    fn new(path: String, op: TransferOp, expected: Option<Fingerprint>) -> Self {
        Self {
            path,
            op,
            attempt: 0,
            last_error: None,
            status: TaskStatus::Pending,
            expected,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::FailedTerminal)
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.status = TaskStatus::FailedTerminal;
    }
}

/// Expand a change set into tasks. Unchanged paths produce none.
pub fn expand(changes: &ChangeSet, current: &Manifest) -> Vec<TransferTask> {
    let uploads = changes
        .upload_paths()
        .map(|path| TransferTask::upload(path, current.get(path).map(|e| e.fingerprint.clone())));
    let deletes = changes.delete_paths().map(TransferTask::delete);
    uploads.chain(deletes).collect()
}

/// Result of a batch: every task is either succeeded or failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub bytes_uploaded: u64,
    pub retries: usize,
    #[serde(skip)]
    pub duration: Duration,
    pub tasks: Vec<TransferTask>,
}

impl TransferReport {
    fn from_tasks(mut tasks: Vec<TransferTask>, bytes_uploaded: u64, retries: usize, duration: Duration) -> Self {
        tasks.sort_by(|a, b| a.path.cmp(&b.path));

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for task in &tasks {
            match task.status {
                TaskStatus::Succeeded => succeeded.push(task.path.clone()),
                _ => failed.push((
                    task.path.clone(),
                    task.last_error.clone().unwrap_or_else(|| "not attempted".to_string()),
                )),
            }
        }

        Self {
            succeeded,
            failed,
            bytes_uploaded,
            retries,
            duration,
            tasks,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tunables for a batch, usually taken from `[transfer]`.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub op_timeout: Duration,
    pub session_attempts: u32,
    pub progress_interval: Duration,
}

impl From<&TransferConfig> for TransferSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            op_timeout: config.op_timeout(),
            session_attempts: config.session_attempts.max(1),
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

/// State shared by the workers of one batch.
struct WorkerContext {
    store: Arc<dyn RemoteStore>,
    local_root: PathBuf,
    settings: TransferSettings,
    progress: Arc<BatchProgress>,
    cancel: CancellationToken,
}

/// Pushes change sets from a local build root to a remote store.
pub struct BatchTransfer {
    store: Arc<dyn RemoteStore>,
    local_root: PathBuf,
    settings: TransferSettings,
    cancel: CancellationToken,
}

impl BatchTransfer {
    pub fn new(store: Arc<dyn RemoteStore>, local_root: impl Into<PathBuf>, settings: TransferSettings) -> Self {
        Self {
            store,
            local_root: local_root.into(),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token; cancelling stops workers from taking new tasks.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Transfer every added, modified and removed path of `changes`.
    ///
    /// Errors only when the remote cannot be reached at all; individual task
    /// failures are reported in [`TransferReport::failed`].
    pub async fn transfer(&self, changes: &ChangeSet, current: &Manifest) -> Result<TransferReport> {
        self.run_tasks(expand(changes, current)).await
    }

    /// Run an explicit task list through the worker pool.
    pub async fn run_tasks(&self, tasks: Vec<TransferTask>) -> Result<TransferReport> {
        let started = Instant::now();
        if tasks.is_empty() {
            return Ok(TransferReport::default());
        }

        self.preflight().await?;

        let total = tasks.len();
        let all_paths: Vec<(String, TransferOp)> = tasks.iter().map(|t| (t.path.clone(), t.op)).collect();
        let worker_count = self.settings.workers.min(total).max(1);

        info!(
            "Starting transfer of {} tasks to {} with {} workers",
            total,
            self.store.describe(),
            worker_count
        );

        let (tx, rx) = mpsc::channel(total);
        for task in tasks {
            // Capacity equals the task count, so this never waits.
            let _ = tx.send(task).await;
        }
        drop(tx);
        let queue = Arc::new(Mutex::new(rx));

        let progress = Arc::new(BatchProgress::new(total));
        let reporter_stop = CancellationToken::new();
        let reporter = spawn_reporter(Arc::clone(&progress), self.settings.progress_interval, reporter_stop.clone());

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            local_root: self.local_root.clone(),
            settings: self.settings.clone(),
            progress: Arc::clone(&progress),
            cancel: self.cancel.clone(),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = Arc::clone(&ctx);
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { worker_loop(worker_id, ctx, queue).await }));
        }

        // Barrier: every worker drains before the batch concludes.
        let mut finished = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(tasks) => finished.extend(tasks),
                Err(e) => warn!("Transfer worker panicked: {}", e),
            }
        }

        // Tasks never dequeued because of cancellation.
        {
            let mut rx = queue.lock().await;
            while let Ok(mut task) = rx.try_recv() {
                task.fail("cancelled before start");
                progress.record_failure();
                finished.push(task);
            }
        }

        // Tasks lost with a panicked worker still need a terminal state.
        let seen: HashSet<String> = finished.iter().map(|t| t.path.clone()).collect();
        for (path, op) in all_paths {
            if !seen.contains(&path) {
                let mut task = TransferTask::new(path, op, None);
                task.fail("transfer worker panicked");
                progress.record_failure();
                finished.push(task);
            }
        }

        reporter_stop.cancel();
        let _ = reporter.await;

        let snap = progress.snapshot();
        let report = TransferReport::from_tasks(finished, snap.bytes_uploaded, snap.retries, started.elapsed());

        info!(
            "Transfer finished: {} succeeded, {} failed, {} retries, {} in {} ({})",
            report.succeeded.len(),
            report.failed.len(),
            report.retries,
            format_bytes(report.bytes_uploaded),
            format_duration(report.duration.as_secs()),
            format_speed(snap.bytes_per_second()),
        );
        for (path, error) in &report.failed {
            warn!(path = %path, "Transfer failed: {}", error);
        }

        Ok(report)
    }

    /// Confirm the remote is reachable, retrying the whole session a few times.
    async fn preflight(&self) -> Result<()> {
        let mut backoff = Backoff::new(self.settings.initial_backoff, self.settings.max_backoff);
        let attempts = self.settings.session_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.settings.op_timeout, self.store.preflight()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Transient(format!(
                    "pre-flight timed out after {:?}",
                    self.settings.op_timeout
                ))),
            };

            let error = match outcome {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= attempts {
                return Err(DeployError::RemoteUnavailable {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = backoff.next_delay();
            warn!(
                remote = %self.store.describe(),
                attempt,
                "Remote pre-flight failed: {}. Retrying in {:?}",
                error,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    queue: Arc<Mutex<mpsc::Receiver<TransferTask>>>,
) -> Vec<TransferTask> {
    let mut done = Vec::new();

    loop {
        if ctx.cancel.is_cancelled() {
            debug!(worker_id, "Worker stopping on cancellation");
            break;
        }

        let next = queue.lock().await.recv().await;
        let Some(task) = next else { break };
        done.push(run_task(&ctx, task).await);
    }

    done
}

/// Drive one task to a terminal state.
async fn run_task(ctx: &WorkerContext, mut task: TransferTask) -> TransferTask {
    let backoff = Backoff::new(ctx.settings.initial_backoff, ctx.settings.max_backoff);
    task.status = TaskStatus::InFlight;

    loop {
        task.attempt += 1;

        let outcome = match tokio::time::timeout(ctx.settings.op_timeout, perform(ctx, &task)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "timed out after {:?}",
                ctx.settings.op_timeout
            ))),
        };

        let error = match outcome {
            Ok(bytes) => {
                task.status = TaskStatus::Succeeded;
                ctx.progress.record_success(bytes);
                debug!(path = %task.path, op = ?task.op, attempt = task.attempt, "Transfer succeeded");
                return task;
            }
            Err(e) => e,
        };

        if !error.is_transient() || task.attempt >= ctx.settings.max_attempts {
            warn!(
                path = %task.path,
                op = ?task.op,
                attempt = task.attempt,
                "Giving up: {}",
                error
            );
            task.fail(error.to_string());
            ctx.progress.record_failure();
            return task;
        }

        task.last_error = Some(error.to_string());
        ctx.progress.record_retry();
        let delay = backoff.delay_for(task.attempt);
        info!(
            path = %task.path,
            attempt = task.attempt,
            "Transient failure ({}), retrying in {:?}",
            error,
            delay
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancel.cancelled() => {
                task.fail(format!("cancelled while retrying: {error}"));
                ctx.progress.record_failure();
                return task;
            }
        }
    }
}

/// Perform one attempt; returns the bytes sent.
async fn perform(ctx: &WorkerContext, task: &TransferTask) -> std::result::Result<u64, RemoteError> {
    match task.op {
        TransferOp::Delete => {
            ctx.store.delete(&task.path).await?;
            Ok(0)
        }
        TransferOp::Upload => {
            let local = ctx.local_root.join(&task.path);
            let bytes = tokio::fs::read(&local)
                .await
                .map_err(|e| RemoteError::Permanent(format!("cannot read {}: {}", local.display(), e)))?;

            if let Some(expected) = &task.expected {
                let actual = Fingerprint::from_bytes(&bytes);
                if &actual != expected {
                    return Err(RemoteError::Permanent(format!(
                        "{} changed since the manifest was built",
                        task.path
                    )));
                }
            }

            let len = bytes.len() as u64;
            ctx.store.upload(&task.path, bytes).await?;
            Ok(len)
        }
    }
}
