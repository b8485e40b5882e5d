//! Remote store abstraction.
//!
//! The engine needs only three operations from the place a site is published
//! to: upload, delete and exists, plus a pre-flight connectivity probe.
//! Deleting an absent path must succeed so that re-running a partially
//! applied batch converges.

pub mod local;
pub mod sftp;

use crate::config::{RemoteConfig, RemoteKind};
use crate::utils::errors::RemoteError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalDirStore;
pub use sftp::SftpStore;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short description for log lines (`sftp://host/dir`)
    fn describe(&self) -> String;

    /// Establish (or confirm) connectivity before a batch starts.
    async fn preflight(&self) -> Result<(), RemoteError>;

    /// Write `bytes` at the root-relative `path`, creating parent directories.
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), RemoteError>;

    /// Remove `path`; an already absent path is not an error.
    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    async fn exists(&self, path: &str) -> Result<bool, RemoteError>;
}

/// Build the configured remote store.
pub fn from_config(remote: &RemoteConfig, op_timeout: Duration) -> Arc<dyn RemoteStore> {
    match remote.kind {
        RemoteKind::Local => Arc::new(LocalDirStore::new(&remote.target_dir)),
        RemoteKind::Sftp => Arc::new(SftpStore::new(
            remote.host.clone(),
            remote.port,
            remote.user.clone(),
            remote.password.clone(),
            remote.target_dir.clone(),
            op_timeout,
        )),
    }
}

/// Reject logical paths that would escape the remote root.
pub fn validate_logical_path(path: &str) -> Result<(), RemoteError> {
    let escapes = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if escapes {
        return Err(RemoteError::Permanent(format!("invalid remote path {path:?}")));
    }
    Ok(())
}
