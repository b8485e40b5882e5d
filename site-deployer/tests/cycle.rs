use async_trait::async_trait;
use site_deployer::config::{Config, RemoteKind};
use site_deployer::remote::{LocalDirStore, RemoteStore};
use site_deployer::{CycleState, DeployCoordinator, RemoteError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Local directory store that can be told to fail uploads of given paths.
struct ScriptedStore {
    inner: LocalDirStore,
    failing_uploads: Mutex<HashSet<String>>,
    operations: AtomicUsize,
}

impl ScriptedStore {
    fn new(root: &Path) -> Self {
        Self {
            inner: LocalDirStore::new(root),
            failing_uploads: Mutex::new(HashSet::new()),
            operations: AtomicUsize::new(0),
        }
    }

    fn fail_uploads_of(&self, path: &str) {
        self.failing_uploads.lock().unwrap().insert(path.to_string());
    }

    fn heal(&self) {
        self.failing_uploads.lock().unwrap().clear();
    }

    fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for ScriptedStore {
    fn describe(&self) -> String {
        format!("scripted+{}", self.inner.describe())
    }

    async fn preflight(&self) -> Result<(), RemoteError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.inner.preflight().await
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.failing_uploads.lock().unwrap().contains(path) {
            return Err(RemoteError::Transient("connection reset by peer".into()));
        }
        self.inner.upload(path, bytes).await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(path).await
    }
}

struct Site {
    _dir: TempDir,
    build: PathBuf,
    remote: PathBuf,
    config: Config,
}

impl Site {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let build = dir.path().join("dist");
        let remote = dir.path().join("public_html");
        std::fs::create_dir_all(&build).unwrap();

        let mut config = Config::default();
        config.site.build_root = build.clone();
        config.site.baseline_path = Some(dir.path().join(".sync_manifest.json"));
        config.remote.kind = RemoteKind::Local;
        config.remote.target_dir = remote.to_string_lossy().into_owned();
        config.transfer.workers = 2;
        config.transfer.max_attempts = 3;
        config.transfer.initial_backoff_ms = 1;
        config.transfer.max_backoff_ms = 4;

        Self {
            _dir: dir,
            build,
            remote,
            config,
        }
    }

    fn write(&self, path: &str, content: &str) {
        let full = self.build.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn remove(&self, path: &str) {
        std::fs::remove_file(self.build.join(path)).unwrap();
    }

    fn baseline_bytes(&self) -> Vec<u8> {
        std::fs::read(self.config.site.baseline_path()).unwrap()
    }

    fn coordinator(&self, store: Arc<ScriptedStore>) -> DeployCoordinator {
        DeployCoordinator::new(&self.config, store).unwrap()
    }
}

#[tokio::test]
async fn second_run_without_changes_is_a_no_op() {
    let site = Site::new();
    site.write("index.html", "<h1>home</h1>");
    site.write("posts/hello/index.html", "hello");

    let store = Arc::new(ScriptedStore::new(&site.remote));
    let coordinator = site.coordinator(store.clone());

    let first = coordinator.run_cycle().await.unwrap();
    assert_eq!(first.state, CycleState::Done);
    let baseline = site.baseline_bytes();
    let operations = store.operations();

    let second = coordinator.run_cycle().await.unwrap();
    assert_eq!(second.state, CycleState::Done);
    assert_eq!(second.trail, vec![CycleState::Idle, CycleState::Verifying, CycleState::Diffing, CycleState::Done]);
    assert_eq!(second.changes.unchanged, 2);
    assert_eq!(second.changes.transfers(), 0);
    assert_eq!(store.operations(), operations, "no-op cycle must not touch the remote");
    assert_eq!(site.baseline_bytes(), baseline);
}

#[tokio::test]
async fn failed_upload_keeps_baseline_and_deletes_still_apply() {
    let site = Site::new();
    site.write("a.html", "h1");
    site.write("b.html", "h2");

    let store = Arc::new(ScriptedStore::new(&site.remote));
    let coordinator = site.coordinator(store.clone());
    assert!(coordinator.run_cycle().await.unwrap().is_done());
    let baseline = site.baseline_bytes();

    // {a:h1, b:h2} -> {a:h1, c:h3}
    site.remove("b.html");
    site.write("c.html", "h3");
    store.fail_uploads_of("c.html");

    let report = coordinator.run_cycle().await.unwrap();
    assert_eq!(report.state, CycleState::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.changes.added, 1);
    assert_eq!(report.changes.removed, 1);
    assert_eq!(report.changes.unchanged, 1);

    let transfer = report.transfer.unwrap();
    assert_eq!(transfer.succeeded, vec!["b.html".to_string()]);
    assert_eq!(transfer.failed.len(), 1);
    assert_eq!(transfer.failed[0].0, "c.html");
    assert!(!site.remote.join("b.html").exists());

    assert_eq!(site.baseline_bytes(), baseline);
    let stored = coordinator.baseline().load().unwrap().unwrap();
    assert!(stored.contains("a.html") && stored.contains("b.html") && !stored.contains("c.html"));

    // Next cycle retries the same diff and converges; the delete is idempotent.
    store.heal();
    let retry = coordinator.run_cycle().await.unwrap();
    assert_eq!(retry.state, CycleState::Done);
    assert_eq!(retry.changes.added, 1);
    assert_eq!(retry.changes.removed, 1);
    assert_eq!(std::fs::read_to_string(site.remote.join("c.html")).unwrap(), "h3");

    let stored = coordinator.baseline().load().unwrap().unwrap();
    assert_eq!(stored.version(), 2);
    assert_eq!(stored.paths().collect::<Vec<_>>(), vec!["a.html", "c.html"]);
}

#[tokio::test]
async fn modified_content_is_resent_and_touch_is_ignored() {
    let site = Site::new();
    site.write("index.html", "v1");
    site.write("about.html", "same");

    let store = Arc::new(ScriptedStore::new(&site.remote));
    let coordinator = site.coordinator(store);
    coordinator.run_cycle().await.unwrap();

    site.write("index.html", "v2");
    // Rewriting identical bytes only moves the mtime
    site.write("about.html", "same");

    let report = coordinator.run_cycle().await.unwrap();
    assert_eq!(report.state, CycleState::Done);
    assert_eq!(report.changes.modified, 1);
    assert_eq!(report.changes.unchanged, 1);
    assert_eq!(report.transfer.unwrap().succeeded, vec!["index.html".to_string()]);
    assert_eq!(std::fs::read_to_string(site.remote.join("index.html")).unwrap(), "v2");
}

#[tokio::test]
async fn missing_build_root_aborts_without_remote_contact() {
    let mut site = Site::new();
    site.config.site.build_root = site.build.join("does-not-exist");

    let store = Arc::new(ScriptedStore::new(&site.remote));
    let report = site.coordinator(store.clone()).run_cycle().await.unwrap();

    assert_eq!(report.state, CycleState::Aborted);
    assert!(report.abort_reason.is_some());
    assert_eq!(store.operations(), 0);
    assert!(!site.config.site.baseline_path().exists());
}

#[tokio::test]
async fn missing_build_root_with_default_baseline_aborts() {
    let mut site = Site::new();
    let missing = site.build.join("never-generated");
    site.config.site.build_root = missing.clone();
    site.config.site.baseline_path = None;

    let store = Arc::new(ScriptedStore::new(&site.remote));
    let report = site.coordinator(store.clone()).run_cycle().await.unwrap();

    assert_eq!(report.state, CycleState::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.trail, vec![CycleState::Idle, CycleState::Aborted]);
    assert!(report.abort_reason.unwrap().contains("never-generated"));
    assert!(!missing.exists(), "the build root must not be recreated");
    assert_eq!(store.operations(), 0);
}
