//! Worker process management.
//!
//! The sandbox runs as a `keybridge-worker` child process with a clean
//! environment. The host talks to it over length-delimited JSON frames on the
//! child's stdin/stdout; the first frame is always a `configure` signal.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use keybridge_error::BridgeError;

use crate::config::BridgeConfig;
use crate::envelope::{CorrelationId, Signal};
use crate::frame::write_message;
use crate::transport::{spawn_stream_link, Link};

/// File name of the worker binary.
pub const WORKER_BIN_NAME: &str = "keybridge-worker";

/// Environment variable overriding the worker binary location.
pub const WORKER_BIN_ENV: &str = "KEYBRIDGE_WORKER_BIN";

/// Environment variable that makes the worker's stderr visible.
pub const DEBUG_ENV: &str = "KEYBRIDGE_DEBUG";

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    link_task: JoinHandle<()>,
}

impl WorkerProcess {
    /// OS process id, if the process is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the worker and wait for it to exit, for at most `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> Result<Option<ExitStatus>, BridgeError> {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "worker already gone");
        }
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Some(status.map_err(|e| {
                BridgeError::Internal(anyhow::anyhow!("failed to reap worker: {}", e))
            })?),
            Err(_) => None,
        };
        self.link_task.abort();
        Ok(status)
    }
}

/// Spawn the worker at `binary` and connect a [`Link`] to it.
pub async fn spawn_worker(
    binary: &Path,
    config: &BridgeConfig,
) -> Result<(Link, WorkerProcess), BridgeError> {
    let mut child = Command::new(binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if std::env::var(DEBUG_ENV).is_ok() {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            BridgeError::Internal(anyhow::anyhow!(
                "failed to spawn worker at {}: {}",
                binary.display(),
                e
            ))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Internal(anyhow::anyhow!("no stdin on worker")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Internal(anyhow::anyhow!("no stdout on worker")))?;

    let configure = Signal::Configure {
        storage_timeout_ms: config.storage_timeout.as_millis() as u64,
        max_message_size: config.max_message_size,
    }
    .into_envelope(CorrelationId::new());
    write_message(&mut stdin, &configure).await.map_err(|e| {
        BridgeError::Internal(anyhow::anyhow!("failed to configure worker: {}", e))
    })?;

    let (link, link_task) = spawn_stream_link(BufReader::new(stdout), stdin, config.max_message_size);
    tracing::debug!(pid = child.id(), binary = %binary.display(), "worker spawned");
    Ok((link, WorkerProcess { child, link_task }))
}

/// Find the worker binary.
///
/// Search order:
/// 1. `configured` (from the config file; must be absolute)
/// 2. `KEYBRIDGE_WORKER_BIN` (must be absolute)
/// 3. Next to the current executable, or its parent directory
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf, BridgeError> {
    if let Some(path) = configured {
        if !path.is_absolute() {
            return Err(BridgeError::InvalidArgument(format!(
                "worker.path must be an absolute path, got: {}",
                path.display()
            )));
        }
        validate_binary_permissions(path)?;
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(BridgeError::InvalidArgument(format!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let worker = dir.join(WORKER_BIN_NAME);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
            // Test binaries live in target/<profile>/deps/
            if let Some(parent) = dir.parent() {
                let worker = parent.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(BridgeError::Internal(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside keybridge"
    )))
}

/// Reject world-writable binaries (Unix only).
fn validate_binary_permissions(path: &Path) -> Result<(), BridgeError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        BridgeError::Internal(anyhow::anyhow!(
            "cannot read metadata for {}: {}",
            path.display(),
            e
        ))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(BridgeError::Internal(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                path.display(),
                mode,
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rejects_relative_env_var() {
        std::env::set_var(WORKER_BIN_ENV, "./relative/path");
        let result = find_worker_binary(None);
        std::env::remove_var(WORKER_BIN_ENV);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    fn rejects_relative_configured_path() {
        let err = find_worker_binary(Some(Path::new("bin/keybridge-worker"))).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn configured_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join(WORKER_BIN_NAME);
        let err = find_worker_binary(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("cannot read metadata"));
    }

    #[test]
    #[serial]
    fn not_found_error_guides_user() {
        std::env::remove_var(WORKER_BIN_ENV);
        if let Err(e) = find_worker_binary(None) {
            let msg = e.to_string();
            assert!(!msg.contains("PATH"), "error should not mention PATH: {msg}");
            assert!(msg.contains(WORKER_BIN_ENV), "error should guide user: {msg}");
        }
        // If Ok, the binary was found next to the test executable
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn rejects_world_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary(None);
        std::env::remove_var(WORKER_BIN_ENV);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn accepts_secure_configured_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(find_worker_binary(Some(&bin)).unwrap(), bin);
    }

    #[tokio::test]
    async fn spawn_reports_missing_binary() {
        let err = spawn_worker(Path::new("/nonexistent/keybridge-worker"), &BridgeConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn worker"));
    }
}
