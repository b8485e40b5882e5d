//! Deployment coordinator.
//!
//! One cycle walks `Idle → Verifying → Diffing → Transferring → Committing →
//! Done`, or lands in `Aborted` from any of them. The baseline is rewritten
//! only on the `Committing → Done` edge, after every transfer task succeeded.

pub mod lock;

use crate::config::{Config, VerifyConfig};
use crate::diff::{diff, ChangePlan, ChangeSet, ChangeSummary};
use crate::fs::walker::WalkOptions;
use crate::manifest::{build_manifest_blocking, BaselineStore, Manifest};
use crate::remote::RemoteStore;
use crate::transfer::{BatchTransfer, TransferReport, TransferSettings, TransferTask};
use crate::utils::errors::{DeployError, Result};
use crate::verify::{
    verify_with_retry, AssetCheck, CommandRemediation, ExpectedAssets, RetryPolicy, VerificationResult,
};
use lock::CycleLock;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Verifying,
    Diffing,
    Transferring,
    Committing,
    Done,
    Aborted,
}

impl CycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CycleState::Done | CycleState::Aborted)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::Verifying => "verifying",
            CycleState::Diffing => "diffing",
            CycleState::Transferring => "transferring",
            CycleState::Committing => "committing",
            CycleState::Done => "done",
            CycleState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub state: CycleState,
    /// Every state visited, starting at `Idle`
    pub trail: Vec<CycleState>,
    pub changes: ChangeSummary,
    pub verification: Option<VerificationResult>,
    pub remote_verification: Option<VerificationResult>,
    pub transfer: Option<TransferReport>,
    pub abort_reason: Option<String>,
    /// Version of the baseline written by this cycle
    pub committed_version: Option<u64>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            state: CycleState::Idle,
            trail: vec![CycleState::Idle],
            changes: ChangeSummary::default(),
            verification: None,
            remote_verification: None,
            transfer: None,
            abort_reason: None,
            committed_version: None,
        }
    }

    fn transition(&mut self, next: CycleState) {
        info!("Cycle state: {} -> {}", self.state, next);
        self.state = next;
        self.trail.push(next);
    }

    fn abort(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("Cycle aborted while {}: {}", self.state, reason);
        self.transition(CycleState::Aborted);
        self.abort_reason = Some(reason);
        self
    }

    pub fn is_done(&self) -> bool {
        self.state == CycleState::Done
    }

    /// Process exit status: 0 for `Done`, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_done() {
            0
        } else {
            1
        }
    }

    fn log_summary(&self) {
        let c = &self.changes;
        info!(
            "Cycle summary: {} added, {} modified, {} removed, {} unchanged",
            c.added, c.modified, c.removed, c.unchanged
        );
        if let Some(transfer) = &self.transfer {
            info!(
                "Transfers: {} succeeded, {} failed",
                transfer.succeeded.len(),
                transfer.failed.len()
            );
        }
        if let Some(v) = &self.verification {
            info!(
                "Asset verification: {}/{} passing, tolerance {} after {} attempt(s)",
                v.passing,
                v.checked,
                if v.threshold_met { "met" } else { "not met" },
                v.attempts
            );
        }
        match self.state {
            CycleState::Done => info!("Cycle finished: done"),
            _ => warn!(
                "Cycle finished: {} ({})",
                self.state,
                self.abort_reason.as_deref().unwrap_or("unknown reason")
            ),
        }
    }
}

/// Runs deployment cycles for one build root against one remote store.
pub struct DeployCoordinator {
    build_root: PathBuf,
    baseline: BaselineStore,
    walk_options: WalkOptions,
    transfer: BatchTransfer,
    verify: VerifyConfig,
    asset_check: Option<Arc<dyn AssetCheck>>,
    remediation: Option<CommandRemediation>,
    cancel: CancellationToken,
}

impl DeployCoordinator {
    pub fn new(config: &Config, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let build_root = config.site.build_root.clone();
        let baseline_path = config.site.baseline_path();

        let walk_options = WalkOptions {
            max_depth: None,
            exclude_names: config.site.exclude.clone(),
            exclude_paths: vec![baseline_path.clone(), CycleLock::path_for(&baseline_path)],
        };

        let asset_check = if config.verify.enabled {
            asset_check_from_config(&build_root, &config.verify)?
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let transfer = BatchTransfer::new(store, &build_root, TransferSettings::from(&config.transfer))
            .with_cancel(cancel.clone());

        Ok(Self {
            build_root,
            baseline: BaselineStore::new(baseline_path),
            walk_options,
            transfer,
            verify: config.verify.clone(),
            asset_check,
            remediation: config.verify.remediate_command.clone().map(CommandRemediation::new),
            cancel,
        })
    }

    /// Replace the cancellation token; cancelling it stops the running cycle cooperatively.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.transfer = self.transfer.with_cancel(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn with_asset_check(mut self, check: Arc<dyn AssetCheck>) -> Self {
        self.asset_check = Some(check);
        self
    }

    pub fn baseline(&self) -> &BaselineStore {
        &self.baseline
    }

    /// Run one full cycle.
    ///
    /// Returns `Err` only when another cycle holds the lock or the lock file
    /// cannot be created. Every other failure ends the cycle in `Aborted`
    /// with the baseline untouched.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        // The lock may live inside the build root; never create the root for it.
        if let Err(e) = self.check_build_root() {
            let report = CycleReport::new().abort(e.to_string());
            report.log_summary();
            return Ok(report);
        }

        let lock_path = CycleLock::path_for(self.baseline.path());
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let _lock = CycleLock::acquire(lock_path)?;

        let report = self.drive(CycleReport::new()).await;
        report.log_summary();
        Ok(report)
    }

    fn check_build_root(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.build_root).map_err(|source| DeployError::Walk {
            path: self.build_root.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(DeployError::Walk {
                path: self.build_root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "build root is not a directory"),
            });
        }
        Ok(())
    }

    async fn drive(&self, mut report: CycleReport) -> CycleReport {
        report.transition(CycleState::Verifying);
        report.verification = self.verify_assets_soft().await;

        if self.cancel.is_cancelled() {
            return report.abort("cancelled");
        }

        report.transition(CycleState::Diffing);
        let (baseline, current) = match self.load_and_build().await {
            Ok(pair) => pair,
            Err(e) => return report.abort(e.to_string()),
        };
        let changes = diff(baseline.as_ref(), &current);
        report.changes = changes.summary();
        info!(
            "Diffed manifest v{} against {}: {} to upload, {} to delete",
            current.version(),
            baseline
                .as_ref()
                .map(|b| format!("baseline v{}", b.version()))
                .unwrap_or_else(|| "no baseline".to_string()),
            changes.added.len() + changes.modified.len(),
            changes.removed.len()
        );

        if changes.is_empty() {
            info!("No changes since the last deployment");
            report.transition(CycleState::Done);
            return report;
        }

        if self.cancel.is_cancelled() {
            return report.abort("cancelled");
        }

        report.transition(CycleState::Transferring);
        let transfer = match self.transfer.transfer(&changes, &current).await {
            Ok(transfer) => transfer,
            Err(e) => return report.abort(e.to_string()),
        };
        let failed = transfer.failed.len();
        report.transfer = Some(transfer);
        if failed > 0 {
            return report.abort(format!("{failed} transfer task(s) failed"));
        }

        if self.verify.remote_check {
            let result = self.verify_remote(&changes, &current).await;
            let met = result.threshold_met;
            report.remote_verification = Some(result);
            if !met {
                return report.abort("remote state does not match the transferred changes");
            }
        }

        report.transition(CycleState::Committing);
        if let Err(e) = self.baseline.commit(&current) {
            return report.abort(e.to_string());
        }
        report.committed_version = Some(current.version());
        report.transition(CycleState::Done);
        report
    }

    /// Diff the build root against the baseline without touching the remote.
    pub async fn plan(&self) -> Result<ChangePlan> {
        let (baseline, current) = self.load_and_build().await?;
        let changes = diff(baseline.as_ref(), &current);
        Ok(ChangePlan::build(baseline.as_ref(), &current, &changes))
    }

    /// Manifest of the build root as the next cycle would record it.
    pub async fn current_manifest(&self) -> Result<Manifest> {
        let (_, current) = self.load_and_build().await?;
        Ok(current)
    }

    /// Run the asset completeness gate on its own.
    pub async fn verify_assets(&self) -> Result<VerificationResult> {
        if self.asset_check.is_none() {
            return Err(DeployError::Config(
                "no asset check configured (set verify.expected_assets or verify.articles_index)".to_string(),
            ));
        }
        self.verify_assets_soft()
            .await
            .ok_or_else(|| DeployError::Config("asset check unavailable".to_string()))
    }

    async fn load_and_build(&self) -> Result<(Option<Manifest>, Manifest)> {
        let baseline = self.baseline.load()?;
        let mut current = build_manifest_blocking(self.build_root.clone(), self.walk_options.clone()).await?;
        current.set_version(Manifest::next_version(baseline.as_ref()));
        Ok((baseline, current))
    }

    /// Soft gate: a missed tolerance is logged and the cycle continues.
    async fn verify_assets_soft(&self) -> Option<VerificationResult> {
        let check = self.asset_check.as_ref()?;
        let policy = RetryPolicy::new(
            "assets",
            self.verify.max_attempts,
            Duration::from_secs(self.verify.delay_secs),
            self.verify.acceptable_failures,
        )
        .with_cancel(self.cancel.clone());
        let remediation = self.remediation.as_ref();

        let result = verify_with_retry(
            move || async move { VerificationResult::from(check.check_completeness().await) },
            move || async move {
                if let Some(remediation) = remediation {
                    remediation.run().await;
                }
            },
            &policy,
        )
        .await;

        if !result.threshold_met {
            warn!(
                "Continuing with {} missing asset(s): {}",
                result.failing,
                result.failures.iter().take(10).cloned().collect::<Vec<_>>().join(", ")
            );
        }
        Some(result)
    }

    /// Confirm uploads exist and deletes are gone; offenders are re-sent between attempts.
    async fn verify_remote(&self, changes: &ChangeSet, current: &Manifest) -> VerificationResult {
        let uploads: Vec<String> = changes.upload_paths().map(str::to_string).collect();
        let deletes: Vec<String> = changes.delete_paths().map(str::to_string).collect();
        let offenders: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let policy = RetryPolicy::new(
            "remote",
            self.verify.max_attempts,
            Duration::from_secs(self.verify.delay_secs),
            0,
        )
        .with_cancel(self.cancel.clone());

        let (uploads, deletes, offenders) = (&uploads, &deletes, &offenders);
        verify_with_retry(
            move || async move {
                let result = self.remote_offenders(uploads, deletes).await;
                *offenders.lock().await = result.failures.clone();
                result
            },
            move || async move {
                let tasks: Vec<TransferTask> = offenders
                    .lock()
                    .await
                    .iter()
                    .map(|path| {
                        if deletes.contains(path) {
                            TransferTask::delete(path.clone())
                        } else {
                            TransferTask::upload(path.clone(), current.get(path).map(|e| e.fingerprint.clone()))
                        }
                    })
                    .collect();
                if let Err(e) = self.transfer.run_tasks(tasks).await {
                    warn!("Re-transfer of remote offenders failed: {}", e);
                }
            },
            &policy,
        )
        .await
    }

    async fn remote_offenders(&self, uploads: &[String], deletes: &[String]) -> VerificationResult {
        let store = self.transfer.store();
        let mut failures = Vec::new();

        for path in uploads {
            match store.exists(path).await {
                Ok(true) => {}
                Ok(false) => failures.push(path.clone()),
                Err(e) => {
                    warn!(path = %path, "Remote existence check failed: {}", e);
                    failures.push(path.clone());
                }
            }
        }
        for path in deletes {
            match store.exists(path).await {
                Ok(false) => {}
                Ok(true) => failures.push(path.clone()),
                Err(e) => {
                    warn!(path = %path, "Remote existence check failed: {}", e);
                    failures.push(path.clone());
                }
            }
        }

        VerificationResult::from_failures(uploads.len() + deletes.len(), failures)
    }
}

fn asset_check_from_config(build_root: &std::path::Path, verify: &VerifyConfig) -> Result<Option<Arc<dyn AssetCheck>>> {
    if let Some(list) = &verify.expected_assets {
        let assets = ExpectedAssets::from_list_file(build_root, list)?;
        info!("Loaded {} expected assets from {}", assets.expected().len(), list.display());
        return Ok(Some(Arc::new(assets)));
    }
    if let Some(index) = &verify.articles_index {
        let assets = ExpectedAssets::from_articles_index(build_root, index, &verify.asset_templates)?;
        info!("Expecting {} assets derived from {}", assets.expected().len(), index.display());
        return Ok(Some(Arc::new(assets)));
    }
    warn!("Asset verification enabled but neither expected_assets nor articles_index is set");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteKind;
    use crate::remote::LocalDirStore;
    use crate::verify::CompletenessReport;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        build: PathBuf,
        remote: PathBuf,
        config: Config,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let build = dir.path().join("dist");
        let remote = dir.path().join("remote");
        std::fs::create_dir_all(&build).unwrap();

        let mut config = Config::default();
        config.site.build_root = build.clone();
        config.site.baseline_path = Some(dir.path().join("state/baseline.json"));
        config.remote.kind = RemoteKind::Local;
        config.remote.target_dir = remote.to_string_lossy().into_owned();
        config.transfer.initial_backoff_ms = 1;
        config.transfer.max_backoff_ms = 2;

        Fixture {
            _dir: dir,
            build,
            remote,
            config,
        }
    }

    fn coordinator(fx: &Fixture) -> DeployCoordinator {
        let store = Arc::new(LocalDirStore::new(&fx.remote));
        DeployCoordinator::new(&fx.config, store).unwrap()
    }

    #[tokio::test]
    async fn test_first_cycle_uploads_everything() {
        let fx = fixture();
        std::fs::write(fx.build.join("index.html"), "home").unwrap();
        std::fs::create_dir_all(fx.build.join("posts")).unwrap();
        std::fs::write(fx.build.join("posts/one.html"), "one").unwrap();

        let coordinator = coordinator(&fx);
        let report = coordinator.run_cycle().await.unwrap();

        assert_eq!(report.state, CycleState::Done);
        assert_eq!(
            report.trail,
            vec![
                CycleState::Idle,
                CycleState::Verifying,
                CycleState::Diffing,
                CycleState::Transferring,
                CycleState::Committing,
                CycleState::Done
            ]
        );
        assert_eq!(report.changes.added, 2);
        assert_eq!(report.committed_version, Some(1));
        assert_eq!(std::fs::read_to_string(fx.remote.join("posts/one.html")).unwrap(), "one");

        let baseline = coordinator.baseline().load().unwrap().unwrap();
        assert_eq!(baseline.len(), 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_tree_short_circuits() {
        let fx = fixture();
        std::fs::write(fx.build.join("index.html"), "home").unwrap();
        let coordinator = coordinator(&fx);
        coordinator.run_cycle().await.unwrap();

        let before = std::fs::read(coordinator.baseline().path()).unwrap();
        let report = coordinator.run_cycle().await.unwrap();

        assert_eq!(report.state, CycleState::Done);
        assert!(report.transfer.is_none());
        assert!(!report.trail.contains(&CycleState::Transferring));
        assert_eq!(report.changes.unchanged, 1);
        assert_eq!(std::fs::read(coordinator.baseline().path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_baseline_inside_build_root_is_not_deployed() {
        let mut fx = fixture();
        fx.config.site.baseline_path = None;
        std::fs::write(fx.build.join("index.html"), "home").unwrap();

        let coordinator = coordinator(&fx);
        coordinator.run_cycle().await.unwrap();
        let report = coordinator.run_cycle().await.unwrap();

        assert_eq!(report.changes.added, 0);
        assert_eq!(report.changes.unchanged, 1);
        assert!(!fx.remote.join(".sync_manifest.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_baseline_aborts() {
        let fx = fixture();
        std::fs::write(fx.build.join("index.html"), "home").unwrap();
        let coordinator = coordinator(&fx);
        std::fs::create_dir_all(coordinator.baseline().path().parent().unwrap()).unwrap();
        std::fs::write(coordinator.baseline().path(), "{ not json").unwrap();

        let report = coordinator.run_cycle().await.unwrap();
        assert_eq!(report.state, CycleState::Aborted);
        assert_eq!(report.exit_code(), 1);
        assert!(report.abort_reason.unwrap().contains("baseline"));
        assert!(!fx.remote.join("index.html").exists());
    }

    #[tokio::test]
    async fn test_held_lock_rejects_cycle() {
        let fx = fixture();
        let coordinator = coordinator(&fx);
        std::fs::create_dir_all(coordinator.baseline().path().parent().unwrap()).unwrap();
        let _held = CycleLock::acquire(CycleLock::path_for(coordinator.baseline().path())).unwrap();

        let err = coordinator.run_cycle().await.unwrap_err();
        assert!(matches!(err, DeployError::CycleInProgress(_)));
    }

    struct MissingAssets(usize);

    #[async_trait]
    impl AssetCheck for MissingAssets {
        async fn check_completeness(&self) -> CompletenessReport {
            CompletenessReport {
                expected_count: 10,
                present_count: 10 - self.0,
                missing: (0..self.0).map(|i| format!("images/{i}.webp")).collect(),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_asset_gate_does_not_block_deploy() {
        let mut fx = fixture();
        fx.config.verify.max_attempts = 1;
        std::fs::write(fx.build.join("index.html"), "home").unwrap();

        let coordinator = coordinator(&fx).with_asset_check(Arc::new(MissingAssets(4)));
        let report = coordinator.run_cycle().await.unwrap();

        let verification = report.verification.as_ref().unwrap();
        assert!(!verification.threshold_met);
        assert_eq!(verification.failing, 4);
        assert_eq!(report.state, CycleState::Done);
    }

    #[tokio::test]
    async fn test_signal_during_asset_gate_aborts_promptly() {
        let mut fx = fixture();
        fx.config.verify.max_attempts = 5;
        fx.config.verify.delay_secs = 60;
        std::fs::write(fx.build.join("index.html"), "home").unwrap();

        let cancel = CancellationToken::new();
        let coordinator = coordinator(&fx)
            .with_cancel(cancel.clone())
            .with_asset_check(Arc::new(MissingAssets(4)));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), coordinator.run_cycle())
            .await
            .expect("cancellation must cut the verification wait short")
            .unwrap();

        assert_eq!(report.state, CycleState::Aborted);
        assert_eq!(report.abort_reason.as_deref(), Some("cancelled"));
        assert_eq!(report.verification.unwrap().attempts, 1);
        assert!(!fx.remote.exists());
    }

    #[tokio::test]
    async fn test_remote_check_confirms_transfer() {
        let mut fx = fixture();
        fx.config.verify.remote_check = true;
        std::fs::write(fx.build.join("a.html"), "a").unwrap();

        let report = coordinator(&fx).run_cycle().await.unwrap();
        let remote = report.remote_verification.unwrap();
        assert!(remote.threshold_met);
        assert_eq!(remote.checked, 1);
        assert_eq!(report.state, CycleState::Done);
    }

    #[tokio::test]
    async fn test_plan_does_not_touch_remote_or_baseline() {
        let fx = fixture();
        std::fs::write(fx.build.join("index.html"), "home").unwrap();
        let coordinator = coordinator(&fx);

        let plan = coordinator.plan().await.unwrap();
        assert_eq!(plan.summary.added, 1);
        assert_eq!(plan.baseline_version, None);
        assert!(!fx.remote.exists());
        assert!(coordinator.baseline().load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_without_check_is_config_error() {
        let fx = fixture();
        let err = coordinator(&fx).verify_assets().await.unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_aborts() {
        let fx = fixture();
        std::fs::write(fx.build.join("index.html"), "home").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = coordinator(&fx).with_cancel(cancel).run_cycle().await.unwrap();
        assert_eq!(report.state, CycleState::Aborted);
        assert_eq!(report.abort_reason.as_deref(), Some("cancelled"));
    }
}
