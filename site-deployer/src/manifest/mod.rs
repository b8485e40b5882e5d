//! Manifest types for differential deployment.
//!
//! A manifest records every regular file under the build root with its
//! content fingerprint, size and mtime. Only the fingerprint decides whether
//! two entries are the same; size and mtime are kept for diagnostics.
//!
//! Serialized as:
//! `{ "version": 3, "generatedAt": "...", "entries": [{ "path", "fingerprint", "size", "mtime" }] }`

pub mod store;

use crate::fs::walker::{walk_directory_with_callback, WalkOptions};
use crate::fs::Fingerprint;
use crate::utils::errors::{DeployError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use store::BaselineStore;

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Path-keyed snapshot of a tree's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ManifestFile", try_from = "ManifestFile")]
pub struct Manifest {
    version: u64,
    generated_at: DateTime<Utc>,
    entries: BTreeMap<String, ManifestEntry>,
}

/// On-disk layout of a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    version: u64,
    generated_at: DateTime<Utc>,
    entries: Vec<ManifestEntry>,
}

impl From<Manifest> for ManifestFile {
    fn from(manifest: Manifest) -> Self {
        ManifestFile {
            version: manifest.version,
            generated_at: manifest.generated_at,
            entries: manifest.entries.into_values().collect(),
        }
    }
}

impl TryFrom<ManifestFile> for Manifest {
    type Error = String;

    fn try_from(file: ManifestFile) -> std::result::Result<Self, Self::Error> {
        let mut manifest = Manifest::with_timestamp(file.version, file.generated_at);
        for entry in file.entries {
            if entry.path.is_empty() {
                return Err("entry with empty path".to_string());
            }
            let path = entry.path.clone();
            if manifest.insert(entry).is_some() {
                return Err(format!("duplicate path {path}"));
            }
        }
        Ok(manifest)
    }
}

impl Manifest {
    pub fn new(version: u64) -> Self {
        Self::with_timestamp(version, Utc::now())
    }

    pub fn with_timestamp(version: u64, generated_at: DateTime<Utc>) -> Self {
        Self {
            version,
            generated_at,
            entries: BTreeMap::new(),
        }
    }

    /// Version a freshly built manifest takes relative to the deployed baseline.
    pub fn next_version(baseline: Option<&Manifest>) -> u64 {
        baseline.map_or(1, |b| b.version + 1)
    }

    /// Insert an entry, returning the one it replaced (paths are unique).
    pub fn insert(&mut self, entry: ManifestEntry) -> Option<ManifestEntry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Fingerprint every regular file under `root`.
///
/// A single unreadable file aborts the build; an incomplete manifest would
/// make deleted-on-remote decisions for files that were merely unreadable.
pub fn build_manifest(root: &Path, options: &WalkOptions) -> Result<Manifest> {
    let mut manifest = Manifest::new(1);
    let mut failure: Option<DeployError> = None;

    walk_directory_with_callback(root, options, |file| {
        if failure.is_some() {
            return;
        }
        match fingerprint_file(&file.path) {
            Ok((fingerprint, size, mtime)) => {
                debug!(path = %file.logical_path, fingerprint = %fingerprint.short(), "Fingerprinted");
                manifest.insert(ManifestEntry {
                    path: file.logical_path,
                    fingerprint,
                    size,
                    mtime,
                });
            }
            Err(source) => {
                failure = Some(DeployError::Walk {
                    path: file.path,
                    source,
                });
            }
        }
    })?;

    if let Some(err) = failure {
        return Err(err);
    }

    info!(
        "Built manifest for {}: {} files, {} bytes",
        root.display(),
        manifest.len(),
        manifest.total_bytes()
    );
    Ok(manifest)
}

/// Run [`build_manifest`] on the blocking pool.
pub async fn build_manifest_blocking(root: PathBuf, options: WalkOptions) -> Result<Manifest> {
    tokio::task::spawn_blocking(move || build_manifest(&root, &options))
        .await
        .map_err(|e| DeployError::Io(std::io::Error::other(e)))?
}

fn fingerprint_file(path: &Path) -> std::io::Result<(Fingerprint, u64, DateTime<Utc>)> {
    let metadata = std::fs::metadata(path)?;
    let fingerprint = Fingerprint::from_file(path)?;
    let mtime = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
    Ok((fingerprint, metadata.len(), mtime))
}
