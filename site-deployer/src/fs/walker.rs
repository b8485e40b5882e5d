//! Directory traversal for manifest building.
//!
//! Only regular files become entries. Directories are descended into,
//! symbolic links are neither followed nor recorded.

use crate::utils::errors::{DeployError, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File or directory names skipped entirely (exact match)
    pub exclude_names: Vec<String>,

    /// Absolute paths skipped entirely, such as a baseline kept inside the root
    pub exclude_paths: Vec<PathBuf>,
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Root-relative path with forward slashes
    pub logical_path: String,

    /// File size in bytes
    pub size: u64,
}

/// Render a root-relative path with `/` separators regardless of host.
pub fn logical_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a directory tree and collect every regular file.
///
/// Fails if the root does not exist, any entry cannot be read, or a file path
/// is not valid UTF-8; a partial listing is never returned.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| files.push(file))?;
    Ok(files)
}

/// Walk a directory tree with a callback for each regular file.
pub fn walk_directory_with_callback<F>(root: &Path, options: &WalkOptions, mut callback: F) -> Result<()>
where
    F: FnMut(FileInfo),
{
    let root_meta = std::fs::metadata(root).map_err(|source| DeployError::Walk {
        path: root.to_path_buf(),
        source,
    })?;
    if !root_meta.is_dir() {
        return Err(DeployError::Walk {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "build root is not a directory"),
        });
    }

    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let entries = walker
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, options));

    for entry in entries {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            DeployError::Walk {
                path,
                source: e.into(),
            }
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| DeployError::Walk {
            path: entry.path().to_path_buf(),
            source: e.into(),
        })?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if relative.to_str().is_none() {
            return Err(DeployError::Walk {
                path: entry.path().to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "path is not valid UTF-8"),
            });
        }

        callback(FileInfo {
            path: entry.path().to_path_buf(),
            logical_path: logical_path(relative),
            size: metadata.len(),
        });
    }

    Ok(())
}

/// Count files in a directory (fast, without collecting)
pub fn count_files(root: &Path, options: &WalkOptions) -> Result<usize> {
    let mut count = 0;
    walk_directory_with_callback(root, options, |_| count += 1)?;
    Ok(count)
}

/// Check if a directory entry should be excluded
fn should_exclude(entry: &DirEntry, options: &WalkOptions) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    if options.exclude_names.iter().any(|name| name.as_str() == file_name) {
        return true;
    }
    options.exclude_paths.iter().any(|p| p.as_path() == entry.path())
}
