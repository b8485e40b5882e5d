//! Change detection between the deployed baseline and the current build.
//!
//! Classification compares fingerprints only. A size or mtime match says
//! nothing about content, so neither is consulted.

use crate::manifest::Manifest;
use serde::Serialize;
use std::collections::BTreeSet;

/// Four disjoint path sets covering the union of both manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

/// Counts per category, logged once per cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl ChangeSet {
    /// True when nothing needs to be sent or deleted.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Paths whose bytes must be uploaded: added then modified.
    pub fn upload_paths(&self) -> impl Iterator<Item = &str> {
        self.added.iter().chain(self.modified.iter()).map(String::as_str)
    }

    pub fn delete_paths(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().map(String::as_str)
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.len(),
            removed: self.removed.len(),
            modified: self.modified.len(),
            unchanged: self.unchanged.len(),
        }
    }
}

impl ChangeSummary {
    pub fn transfers(&self) -> usize {
        self.added + self.modified + self.removed
    }
}

/// Classify every path of `baseline ∪ current`.
///
/// Without a baseline (first deployment) every current path is added.
pub fn diff(baseline: Option<&Manifest>, current: &Manifest) -> ChangeSet {
    let mut changes = ChangeSet::default();

    let Some(baseline) = baseline else {
        changes.added = current.paths().map(str::to_string).collect();
        return changes;
    };

    for entry in current.entries() {
        match baseline.get(&entry.path) {
            None => {
                changes.added.insert(entry.path.clone());
            }
            Some(previous) if previous.fingerprint == entry.fingerprint => {
                changes.unchanged.insert(entry.path.clone());
            }
            Some(_) => {
                changes.modified.insert(entry.path.clone());
            }
        }
    }

    changes.removed = baseline
        .paths()
        .filter(|path| !current.contains(path))
        .map(str::to_string)
        .collect();

    changes
}

/// Why a path appears in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    NewFile,
    ContentChanged { previous_size: u64, size: u64 },
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub path: String,
    pub size: u64,
    pub reason: ChangeReason,
}

/// Human-readable differential report, written by `site-deployer plan`.
#[derive(Debug, Clone, Serialize)]
pub struct ChangePlan {
    pub baseline_version: Option<u64>,
    pub current_version: u64,
    pub uploads: Vec<PlannedChange>,
    pub deletes: Vec<PlannedChange>,
    pub summary: ChangeSummary,
    pub upload_bytes: u64,
}

impl ChangePlan {
    pub fn build(baseline: Option<&Manifest>, current: &Manifest, changes: &ChangeSet) -> Self {
        let mut uploads = Vec::new();
        for path in changes.upload_paths() {
            let Some(entry) = current.get(path) else { continue };
            let reason = match baseline.and_then(|b| b.get(path)) {
                Some(previous) => ChangeReason::ContentChanged {
                    previous_size: previous.size,
                    size: entry.size,
                },
                None => ChangeReason::NewFile,
            };
            uploads.push(PlannedChange {
                path: path.to_string(),
                size: entry.size,
                reason,
            });
        }

        let deletes = changes
            .delete_paths()
            .map(|path| PlannedChange {
                path: path.to_string(),
                size: baseline.and_then(|b| b.get(path)).map_or(0, |e| e.size),
                reason: ChangeReason::Removed,
            })
            .collect();

        let upload_bytes = uploads.iter().map(|c| c.size).sum();

        ChangePlan {
            baseline_version: baseline.map(Manifest::version),
            current_version: current.version(),
            uploads,
            deletes,
            summary: changes.summary(),
            upload_bytes,
        }
    }
}
