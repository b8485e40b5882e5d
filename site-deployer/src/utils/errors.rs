//! Custom error types for the deployment engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt baseline manifest {}: {reason}", path.display())]
    CorruptBaseline { path: PathBuf, reason: String },

    #[error("Another deployment cycle holds the lock at {}", .0.display())]
    CycleInProgress(PathBuf),

    #[error("Remote store unavailable after {attempts} attempts: {last_error}")]
    RemoteUnavailable { attempts: u32, last_error: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Deployment cancelled")]
    Cancelled,
}

impl DeployError {
    /// Structural failures mean local data is suspect; they abort a cycle without retry.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DeployError::Walk { .. }
                | DeployError::CorruptBaseline { .. }
                | DeployError::Io(_)
                | DeployError::Serialization(_)
        )
    }
}

/// Errors reported by a remote store operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeouts, resets, refused connections. Worth another attempt.
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Classify a local or transport I/O error.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                RemoteError::Permanent(err.to_string())
            }
            _ => RemoteError::Transient(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_structural_classification() {
        let corrupt = DeployError::CorruptBaseline {
            path: PathBuf::from("/site/.sync_manifest.json"),
            reason: "duplicate path".to_string(),
        };
        assert!(corrupt.is_structural());
        assert!(!DeployError::Cancelled.is_structural());
        assert!(!DeployError::RemoteUnavailable { attempts: 3, last_error: "refused".into() }.is_structural());
    }

    #[test]
    fn test_remote_error_from_io() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(RemoteError::from_io(&reset).is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(RemoteError::from_io(&denied), RemoteError::Permanent("denied".to_string()));

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(RemoteError::from_io(&missing), RemoteError::NotFound(_)));
    }
}
