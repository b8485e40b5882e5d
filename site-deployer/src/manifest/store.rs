//! Durable storage of the deployed baseline manifest.

use super::Manifest;
use crate::utils::errors::{DeployError, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

/// The baseline is the manifest of the last fully successful deployment.
///
/// Commits go through a temp file in the same directory followed by a rename,
/// so a crash leaves either the old or the new baseline, never a torn file.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the baseline; `None` before the first successful deployment.
    pub fn load(&self) -> Result<Option<Manifest>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = serde_json::from_slice(&content).map_err(|e| DeployError::CorruptBaseline {
            path: self.path.clone(),
            reason: if is_legacy_size_map(&content) {
                format!(
                    "legacy size-only manifest without fingerprints; delete {} to redeploy every file once",
                    self.path.display()
                )
            } else {
                e.to_string()
            },
        })?;

        info!(
            "Loaded baseline v{}: {} files, {} bytes",
            manifest.version(),
            manifest.len(),
            manifest.total_bytes()
        );
        Ok(Some(manifest))
    }

    /// Atomically replace the baseline.
    pub fn commit(&self, manifest: &Manifest) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let json = manifest.to_json_pretty()?;
        let mut temp_file = NamedTempFile::new_in(&parent)?;
        temp_file.write_all(json.as_bytes())?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(&self.path).map_err(|e| DeployError::Io(e.error))?;

        info!(
            "Committed baseline v{} ({} files) to {}",
            manifest.version(),
            manifest.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// The old deploy scripts kept `{ "path": size }` under the same file name.
fn is_legacy_size_map(content: &[u8]) -> bool {
    serde_json::from_slice::<BTreeMap<String, u64>>(content).is_ok()
}
