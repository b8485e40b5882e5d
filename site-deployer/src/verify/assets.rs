//! Asset completeness checks for the generated site.

use super::VerificationResult;
use crate::utils::errors::{DeployError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What an asset producer reports about its output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletenessReport {
    pub expected_count: usize,
    pub present_count: usize,
    pub missing: Vec<String>,
}

impl From<CompletenessReport> for VerificationResult {
    fn from(report: CompletenessReport) -> Self {
        VerificationResult::from_failures(report.expected_count, report.missing)
    }
}

#[async_trait]
pub trait AssetCheck: Send + Sync {
    async fn check_completeness(&self) -> CompletenessReport;
}

/// A fixed list of root-relative paths that must exist under the build root.
#[derive(Debug, Clone)]
pub struct ExpectedAssets {
    root: PathBuf,
    expected: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ArticleRecord {
    #[serde(default)]
    slug: String,
}

impl ExpectedAssets {
    pub fn new(root: impl Into<PathBuf>, expected: Vec<String>) -> Self {
        Self {
            root: root.into(),
            expected,
        }
    }

    /// Read the list from a file: a JSON array of paths, or one path per line
    /// (blank lines and `#` comments ignored).
    pub fn from_list_file(root: impl Into<PathBuf>, list: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(list)?;
        let trimmed = content.trim_start();
        let expected = if trimmed.starts_with('[') {
            serde_json::from_str::<Vec<String>>(trimmed)?
        } else {
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()
        };
        Ok(Self::new(root, expected))
    }

    /// Expand every article slug in an articles index through each template
    /// (`images/{slug}/thumb.webp`, ...).
    pub fn from_articles_index(root: impl Into<PathBuf>, index: &Path, templates: &[String]) -> Result<Self> {
        let content = std::fs::read_to_string(index)?;
        let articles: Vec<ArticleRecord> = serde_json::from_str(&content)?;
        if templates.is_empty() {
            return Err(DeployError::Config("verify.asset_templates is empty".into()));
        }

        let expected = articles
            .iter()
            .filter(|a| !a.slug.is_empty())
            .flat_map(|a| templates.iter().map(move |t| t.replace("{slug}", &a.slug)))
            .collect();
        Ok(Self::new(root, expected))
    }

    pub fn expected(&self) -> &[String] {
        &self.expected
    }
}

#[async_trait]
impl AssetCheck for ExpectedAssets {
    async fn check_completeness(&self) -> CompletenessReport {
        let mut missing = Vec::new();
        for path in &self.expected {
            if tokio::fs::metadata(self.root.join(path)).await.is_err() {
                missing.push(path.clone());
            }
        }

        CompletenessReport {
            expected_count: self.expected.len(),
            present_count: self.expected.len() - missing.len(),
            missing,
        }
    }
}

/// Remediation that shells out to the asset generator.
#[derive(Debug, Clone)]
pub struct CommandRemediation {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandRemediation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run the command. Failures are logged; remediation is best-effort.
    pub async fn run(&self) {
        info!(command = %self.command, "Running remediation");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        match cmd.status().await {
            Ok(status) if status.success() => info!("Remediation finished"),
            Ok(status) => warn!(command = %self.command, "Remediation exited with {}", status),
            Err(e) => warn!(command = %self.command, "Failed to start remediation: {}", e),
        }
    }
}
