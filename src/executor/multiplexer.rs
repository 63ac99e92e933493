use crate::models::HostSpec;
use crate::services::{ConnectionError, PooledConnection};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens, probes and tears down reusable transports.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Establishes a transport reachable through `control_path`. Costs one handshake.
    async fn open(
        &self,
        host: &HostSpec,
        identity: &Path,
        control_path: &Path,
    ) -> Result<(), ConnectionError>;

    /// Cheap liveness probe that does not run a remote command.
    async fn check(&self, conn: &PooledConnection) -> bool;

    async fn close(&self, conn: &PooledConnection) -> Result<(), ConnectionError>;
}

/// OpenSSH `ControlMaster` sockets.
#[derive(Debug, Clone)]
pub struct SshMultiplexer {
    ssh_path: PathBuf,
    connect_timeout: Duration,
    control_persist: Duration,
}

impl SshMultiplexer {
    pub fn new(ssh_path: impl Into<PathBuf>, connect_timeout: Duration, control_persist: Duration) -> Self {
        Self {
            ssh_path: ssh_path.into(),
            connect_timeout,
            control_persist,
        }
    }

    fn control_command(&self, op: &str, conn: &PooledConnection) -> Command {
        let mut cmd = Command::new(&self.ssh_path);
        cmd.arg("-O")
            .arg(op)
            .arg("-o")
            .arg(format!("ControlPath={}", conn.control_path.display()))
            .arg("--")
            .arg(&conn.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Multiplexer for SshMultiplexer {
    async fn open(
        &self,
        host: &HostSpec,
        identity: &Path,
        control_path: &Path,
    ) -> Result<(), ConnectionError> {
        if let Some(dir) = control_path.parent() {
            create_private_dir(dir)?;
        }
        // The master keeps running in the background, so its stderr goes to a
        // log file instead of a pipe nobody would ever close.
        let log_path = control_path.with_extension("log");
        let _ = std::fs::remove_file(&log_path);

        let mut cmd = Command::new(&self.ssh_path);
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ControlMaster=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!("ControlPersist={}", self.control_persist.as_secs()))
            .args(["-o", "IdentitiesOnly=yes"])
            .arg("-i")
            .arg(identity)
            .arg("-p")
            .arg(host.port.to_string())
            .arg("-E")
            .arg(&log_path)
            .args(["-f", "-N", "--"])
            .arg(host.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let deadline = self.connect_timeout + CONTROL_TIMEOUT;
        let status = tokio::time::timeout(deadline, cmd.status())
            .await
            .map_err(|_| ConnectionError::Timeout(host.destination()))?
            .map_err(|e| ConnectionError::Open {
                destination: host.destination(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            let reason = std::fs::read_to_string(&log_path)
                .ok()
                .and_then(|log| log.lines().last().map(str::to_string))
                .unwrap_or_else(|| format!("ssh exited with {status}"));
            return Err(ConnectionError::Open {
                destination: host.destination(),
                reason,
            });
        }

        tracing::info!(destination = %host.destination(), "opened multiplexed transport");
        Ok(())
    }

    async fn check(&self, conn: &PooledConnection) -> bool {
        if !tokio::fs::try_exists(&conn.control_path).await.unwrap_or(false) {
            return false;
        }
        let mut cmd = self.control_command("check", conn);
        match tokio::time::timeout(CONTROL_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::warn!(key = %conn.key, "liveness check failed to run: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    async fn close(&self, conn: &PooledConnection) -> Result<(), ConnectionError> {
        let mut cmd = self.control_command("exit", conn);
        let result = tokio::time::timeout(CONTROL_TIMEOUT, cmd.status()).await;
        let _ = std::fs::remove_file(&conn.control_path);
        let _ = std::fs::remove_file(conn.control_path.with_extension("log"));

        match result {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(ConnectionError::Close {
                key: conn.key.clone(),
                reason: format!("ssh exited with {status}"),
            }),
            Ok(Err(e)) => Err(ConnectionError::Close {
                key: conn.key.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ConnectionError::Timeout(conn.destination.clone())),
        }
    }
}

fn create_private_dir(dir: &Path) -> Result<(), ConnectionError> {
    crate::paths::ensure_private_dir(dir).map_err(|e| ConnectionError::Open {
        destination: dir.display().to_string(),
        reason: e.to_string(),
    })
}
