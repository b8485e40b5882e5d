//! Remote store reached over SFTP.
//!
//! libssh2 is blocking, so every operation runs on the blocking pool with a
//! session taken from a small pool. Sessions that hit a transport error are
//! dropped instead of returned.

use super::{validate_logical_path, RemoteStore};
use crate::utils::errors::RemoteError;
use async_trait::async_trait;
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::collections::HashSet;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

// libssh2 SFTP status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;

#[derive(Debug, Clone)]
struct SftpSettings {
    host: String,
    port: u16,
    user: String,
    password: String,
    target_dir: String,
    timeout: Duration,
}

pub struct SftpStore {
    settings: Arc<SftpSettings>,
    pool: Arc<Mutex<Vec<Session>>>,
    known_dirs: Arc<Mutex<HashSet<PathBuf>>>,
}

impl SftpStore {
    pub fn new(
        host: String,
        port: u16,
        user: String,
        password: String,
        target_dir: String,
        timeout: Duration,
    ) -> Self {
        Self {
            settings: Arc::new(SftpSettings {
                host,
                port,
                user,
                password,
                target_dir,
                timeout,
            }),
            pool: Arc::new(Mutex::new(Vec::new())),
            known_dirs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn remote_path(settings: &SftpSettings, path: &str) -> PathBuf {
        let root = settings.target_dir.trim_end_matches('/');
        if root.is_empty() {
            PathBuf::from(format!("/{path}"))
        } else {
            PathBuf::from(format!("{root}/{path}"))
        }
    }

    /// Run `op` against an SFTP channel on the blocking pool.
    async fn with_sftp<T, F>(&self, op: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp, &SftpSettings, &Mutex<HashSet<PathBuf>>) -> Result<T, RemoteError> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        let pool = Arc::clone(&self.pool);
        let known_dirs = Arc::clone(&self.known_dirs);

        tokio::task::spawn_blocking(move || {
            let pooled = pool.lock().unwrap_or_else(|p| p.into_inner()).pop();
            let session = match pooled {
                Some(session) => session,
                None => connect(&settings)?,
            };

            let result = session
                .sftp()
                .map_err(classify)
                .and_then(|sftp| op(&sftp, &settings, &known_dirs));

            if !matches!(result, Err(RemoteError::Transient(_))) {
                pool.lock().unwrap_or_else(|p| p.into_inner()).push(session);
            }
            result
        })
        .await
        .map_err(|e| RemoteError::Transient(format!("sftp worker failed: {e}")))?
    }
}

fn connect(settings: &SftpSettings) -> Result<Session, RemoteError> {
    let addr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| RemoteError::Transient(format!("resolve {}: {}", settings.host, e)))?
        .next()
        .ok_or_else(|| RemoteError::Permanent(format!("no address for {}", settings.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, settings.timeout).map_err(|e| RemoteError::from_io(&e))?;
    let mut session = Session::new().map_err(classify)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(settings.timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake().map_err(classify)?;

    session
        .userauth_password(&settings.user, &settings.password)
        .map_err(|e| RemoteError::Permanent(format!("SSH authentication failed: {e}")))?;
    if !session.authenticated() {
        return Err(RemoteError::Permanent("SSH authentication failed".into()));
    }

    debug!(host = %settings.host, "SFTP session established");
    Ok(session)
}

fn classify(err: ssh2::Error) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => RemoteError::NotFound(err.to_string()),
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => RemoteError::Permanent(err.to_string()),
        _ => RemoteError::Transient(err.to_string()),
    }
}

/// `mkdir -p` for `dir`, remembering directories already confirmed.
fn ensure_dir(sftp: &Sftp, dir: &Path, known_dirs: &Mutex<HashSet<PathBuf>>) -> Result<(), RemoteError> {
    if known_dirs.lock().unwrap_or_else(|p| p.into_inner()).contains(dir) {
        return Ok(());
    }

    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str() == "/" {
            continue;
        }
        if sftp.stat(&current).is_err() {
            if let Err(e) = sftp.mkdir(&current, 0o755) {
                // Another worker may have created it in the meantime.
                if sftp.stat(&current).is_err() {
                    return Err(classify(e));
                }
            }
        }
    }

    known_dirs
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(dir.to_path_buf());
    Ok(())
}

/// Unique sibling of `target` for one upload attempt.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4()))
}

fn write_staging(sftp: &Sftp, staging: &Path, bytes: &[u8]) -> Result<(), RemoteError> {
    let mut file = sftp.create(staging).map_err(classify)?;
    file.write_all(bytes).map_err(|e| RemoteError::from_io(&e))?;
    file.flush().map_err(|e| RemoteError::from_io(&e))?;
    Ok(())
}

#[async_trait]
impl RemoteStore for SftpStore {
    fn describe(&self) -> String {
        format!("sftp://{}@{}:{}/{}", self.settings.user, self.settings.host, self.settings.port, self.settings.target_dir.trim_start_matches('/'))
    }

    async fn preflight(&self) -> Result<(), RemoteError> {
        self.with_sftp(|sftp, settings, known_dirs| {
            let root = PathBuf::from(settings.target_dir.trim_end_matches('/'));
            ensure_dir(sftp, &root, known_dirs)?;
            info!(host = %settings.host, target = %root.display(), "SFTP pre-flight passed");
            Ok(())
        })
        .await
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        validate_logical_path(path)?;
        let path = path.to_string();

        self.with_sftp(move |sftp, settings, known_dirs| {
            let target = SftpStore::remote_path(settings, &path);
            if let Some(parent) = target.parent() {
                ensure_dir(sftp, parent, known_dirs)?;
            }

            let staging = staging_path(&target);
            if let Err(e) = write_staging(sftp, &staging, &bytes) {
                let _ = sftp.unlink(&staging);
                return Err(e);
            }

            let flags = Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE);
            if let Err(first) = sftp.rename(&staging, &target, flags) {
                // SFTP v3 servers refuse to rename over an existing file. Only
                // replace the target when our staging copy is still in place.
                if sftp.stat(&staging).is_err() {
                    return Err(RemoteError::Transient(format!(
                        "staging file for {} vanished before rename: {}",
                        target.display(),
                        first
                    )));
                }
                if sftp.stat(&target).is_err() {
                    let _ = sftp.unlink(&staging);
                    return Err(classify(first));
                }
                let _ = sftp.unlink(&target);
                if let Err(e) = sftp.rename(&staging, &target, None) {
                    let _ = sftp.unlink(&staging);
                    return Err(classify(e));
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        validate_logical_path(path)?;
        let path = path.to_string();

        self.with_sftp(move |sftp, settings, _| {
            let target = SftpStore::remote_path(settings, &path);
            match sftp.unlink(&target).map_err(classify) {
                Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        validate_logical_path(path)?;
        let path = path.to_string();

        self.with_sftp(move |sftp, settings, _| {
            let target = SftpStore::remote_path(settings, &path);
            match sftp.stat(&target).map_err(classify) {
                Ok(_) => Ok(true),
                Err(RemoteError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
