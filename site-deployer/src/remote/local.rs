//! Remote store backed by a directory on a mounted filesystem.

use super::{validate_logical_path, RemoteStore};
use crate::utils::errors::RemoteError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RemoteError> {
        validate_logical_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl RemoteStore for LocalDirStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn preflight(&self) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RemoteError::from_io(&e))?;
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| RemoteError::from_io(&e))?;
        if !metadata.is_dir() {
            return Err(RemoteError::Permanent(format!("{} is not a directory", self.root.display())));
        }
        Ok(())
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::from_io(&e))?;
        }

        // Write beside the target and rename so readers never see a partial file.
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = target.with_file_name(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&staging, &bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(RemoteError::from_io(&e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(RemoteError::from_io(&e));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::from_io(&e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| RemoteError::from_io(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp_dir.path().join("www"));
        store.preflight().await.unwrap();

        store
            .upload("images/post-1/thumb.webp", b"webp".to_vec())
            .await
            .unwrap();

        let written = std::fs::read(temp_dir.path().join("www/images/post-1/thumb.webp")).unwrap();
        assert_eq!(written, b"webp");
        assert!(store.exists("images/post-1/thumb.webp").await.unwrap());

        // Only the target remains in the directory
        let entries = std::fs::read_dir(temp_dir.path().join("www/images/post-1")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp_dir.path());

        store.upload("old.html", b"bye".to_vec()).await.unwrap();
        store.delete("old.html").await.unwrap();
        assert!(!store.exists("old.html").await.unwrap());

        // Second delete of the same path still succeeds
        store.delete("old.html").await.unwrap();
        store.delete("never/existed.html").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp_dir.path().join("www"));
        let err = store.upload("../outside.html", b"x".to_vec()).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
