//! Configuration management for the deployer.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! `DEPLOY__<SECTION>__<KEY>` variables override file values; the variable
//! names used by the older deploy scripts (`LOCAL_DIRECTORY`, `FTP_HOST`, ...)
//! fill in anything left unset.

use crate::utils::errors::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "site-deployer.toml";

/// Name of the baseline manifest when it lives inside the build root.
pub const DEFAULT_BASELINE_NAME: &str = ".sync_manifest.json";

const ENV_PREFIX: &str = "DEPLOY";

const LEGACY_ENV: &[(&str, &str)] = &[
    ("LOCAL_DIRECTORY", "site.build_root"),
    ("FTP_HOST", "remote.host"),
    ("FTP_USER", "remote.user"),
    ("FTP_PASS", "remote.password"),
    ("REMOTE_DIRECTORY", "remote.target_dir"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Root of the generated site
    #[serde(default = "default_build_root")]
    pub build_root: PathBuf,

    /// Where the deployed baseline manifest lives (default: inside the build root)
    #[serde(default)]
    pub baseline_path: Option<PathBuf>,

    /// File names that never enter a manifest
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// A directory on a mounted filesystem
    Local,
    /// An SSH host reached over SFTP
    Sftp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_kind")]
    pub kind: RemoteKind,

    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Remote directory the site is published into
    #[serde(default = "default_target_dir")]
    pub target_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Concurrent transfer workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per task before it is marked failed
    #[serde(default = "default_transfer_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Timeout for a single remote operation
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,

    /// Pre-flight connection attempts for the whole batch
    #[serde(default = "default_session_attempts")]
    pub session_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Run the asset completeness gate before diffing
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_verify_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_verify_delay_secs")]
    pub delay_secs: u64,

    /// Missing assets tolerated without further remediation
    #[serde(default)]
    pub acceptable_failures: usize,

    /// File listing the root-relative paths that must exist after generation
    #[serde(default)]
    pub expected_assets: Option<PathBuf>,

    /// Articles index (`[{ "slug": ... }]`) expanded through `asset_templates`
    #[serde(default)]
    pub articles_index: Option<PathBuf>,

    #[serde(default = "default_asset_templates")]
    pub asset_templates: Vec<String>,

    /// Shell command that regenerates missing assets
    #[serde(default)]
    pub remediate_command: Option<String>,

    /// Confirm uploads and deletes on the remote before committing the baseline
    #[serde(default)]
    pub remote_check: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_build_root() -> PathBuf {
    PathBuf::from("dist")
}

fn default_exclude() -> Vec<String> {
    vec![
        DEFAULT_BASELINE_NAME.to_string(),
        ".differential_sync.json".to_string(),
        ".deploy.lock".to_string(),
        ".DS_Store".to_string(),
    ]
}

fn default_remote_kind() -> RemoteKind {
    RemoteKind::Sftp
}

fn default_ssh_port() -> u16 {
    22
}

fn default_target_dir() -> String {
    "public_html".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_transfer_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_op_timeout_secs() -> u64 {
    60
}

fn default_session_attempts() -> u32 {
    3
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_delay_secs() -> u64 {
    5
}

fn default_asset_templates() -> Vec<String> {
    vec!["images/{slug}/thumb.webp".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            build_root: default_build_root(),
            baseline_path: None,
            exclude: default_exclude(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: default_remote_kind(),
            host: String::new(),
            port: default_ssh_port(),
            user: String::new(),
            password: String::new(),
            target_dir: default_target_dir(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_transfer_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            op_timeout_secs: default_op_timeout_secs(),
            session_attempts: default_session_attempts(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_verify_attempts(),
            delay_secs: default_verify_delay_secs(),
            acceptable_failures: 0,
            expected_assets: None,
            articles_index: None,
            asset_templates: default_asset_templates(),
            remediate_command: None,
            remote_check: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SiteConfig {
    /// Resolved location of the baseline manifest
    pub fn baseline_path(&self) -> PathBuf {
        self.baseline_path
            .clone()
            .unwrap_or_else(|| self.build_root.join(DEFAULT_BASELINE_NAME))
    }
}

impl TransferConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file (or the default file if present),
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        for (var, key) in LEGACY_ENV {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_default(*key, value).map_err(config_error)?;
            }
        }

        builder = match path {
            Some(path) => builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml).required(true),
            ),
            None => builder.add_source(
                config::File::new(DEFAULT_CONFIG_FILE, config::FileFormat::Toml).required(false),
            ),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: Config = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| DeployError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.site.build_root.as_os_str().is_empty() {
            return Err(DeployError::Config("site.build_root is empty".into()));
        }
        if self.transfer.workers == 0 {
            return Err(DeployError::Config("transfer.workers must be at least 1".into()));
        }
        if self.transfer.max_attempts == 0 || self.transfer.session_attempts == 0 {
            return Err(DeployError::Config(
                "transfer.max_attempts and transfer.session_attempts must be at least 1".into(),
            ));
        }
        if self.verify.max_attempts == 0 {
            return Err(DeployError::Config("verify.max_attempts must be at least 1".into()));
        }
        if self.remote.kind == RemoteKind::Sftp
            && (self.remote.host.is_empty() || self.remote.user.is_empty())
        {
            return Err(DeployError::Config(
                "remote.host and remote.user are required for sftp".into(),
            ));
        }
        if self.remote.target_dir.is_empty() {
            return Err(DeployError::Config("remote.target_dir is empty".into()));
        }
        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> DeployError {
    DeployError::Config(err.to_string())
}
