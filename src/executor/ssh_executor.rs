use crate::models::{Channel, HostSpec, ProcessState};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const READ_CHUNK_SIZE: usize = 8192;
const CHUNK_CHANNEL_CAPACITY: usize = 64;
const RAW_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn remote command: {0}")]
    SpawnFailed(String),

    #[error("IO error while supervising process: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellMode {
    /// `sh -c` under a fixed minimal environment.
    #[default]
    Raw,
    /// `bash -ic`, so rc-file aliases and functions are available.
    Interactive,
}

/// How the ssh client reaches the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Multiplexed { control_path: PathBuf },
    OneShot,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub mode: ShellMode,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Killed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration: Duration,
    pub termination: Termination,
}

impl ExecutionResult {
    pub fn state(&self) -> ProcessState {
        match self.termination {
            Termination::Killed => ProcessState::Killed,
            Termination::TimedOut => ProcessState::TimedOut,
            Termination::Exited if self.success => ProcessState::Completed,
            Termination::Exited => ProcessState::Failed,
        }
    }
}

/// Spawns remote commands through the `ssh` client binary.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_path: PathBuf,
    connect_timeout: Duration,
    kill_grace: Duration,
}

impl SshExecutor {
    pub fn new(ssh_path: impl Into<PathBuf>, connect_timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            ssh_path: ssh_path.into(),
            connect_timeout,
            kill_grace,
        }
    }

    pub fn start(
        &self,
        command: &str,
        host: &HostSpec,
        identity: &Path,
        transport: &Transport,
        options: &ExecOptions,
    ) -> Result<RunningProcess, ExecError> {
        let args = self.build_args(command, host, identity, transport, options.mode)?;

        let mut cmd = Command::new(&self.ssh_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            ExecError::SpawnFailed(format!("{}: {}", self.ssh_path.display(), e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ExecError::SpawnFailed("Failed to get process ID".to_string()))?;

        tracing::debug!(pid, host = %host.id, "spawned ssh");

        Ok(RunningProcess {
            pid,
            child,
            started: Instant::now(),
            timeout: options.timeout,
            kill_grace: self.kill_grace,
        })
    }

    fn build_args(
        &self,
        command: &str,
        host: &HostSpec,
        identity: &Path,
        transport: &Transport,
        mode: ShellMode,
    ) -> Result<Vec<String>, ExecError> {
        if command.trim().is_empty() {
            return Err(ExecError::InvalidCommand("command is empty".to_string()));
        }
        if host.user.starts_with('-') || host.hostname.starts_with('-') {
            return Err(ExecError::InvalidCommand(format!(
                "refusing option-like destination for host {}",
                host.id
            )));
        }

        let control_path = match transport {
            Transport::Multiplexed { control_path } => control_path.display().to_string(),
            Transport::OneShot => "none".to_string(),
        };

        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={control_path}"),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-i".to_string(),
            identity.display().to_string(),
            "-p".to_string(),
            host.port.to_string(),
            "--".to_string(),
            host.destination(),
        ];
        args.push(remote_command(command, mode)?);
        Ok(args)
    }
}

/// Wraps the user command as a single quoted argument for the remote shell.
pub fn remote_command(command: &str, mode: ShellMode) -> Result<String, ExecError> {
    let quoted = shlex::try_quote(command)
        .map_err(|e| ExecError::InvalidCommand(e.to_string()))?;
    Ok(match mode {
        ShellMode::Raw => format!("env -i PATH={RAW_PATH} LANG=C.UTF-8 sh -c {quoted}"),
        ShellMode::Interactive => format!("bash -ic {quoted}"),
    })
}

pub struct RunningProcess {
    pub pid: u32,
    child: Child,
    started: Instant,
    timeout: Duration,
    kill_grace: Duration,
}

impl RunningProcess {
    /// Starts readers for stdout and stderr. The receiver closes once both reach EOF.
    pub fn output(&mut self) -> Result<mpsc::Receiver<(Channel, Vec<u8>)>, ExecError> {
        let stdout = self.child.stdout.take().ok_or_else(|| {
            ExecError::Io(std::io::Error::other("stdout pipe was not available"))
        })?;
        let stderr = self.child.stderr.take().ok_or_else(|| {
            ExecError::Io(std::io::Error::other("stderr pipe was not available"))
        })?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(pump(stdout, Channel::Stdout, tx.clone()));
        tokio::spawn(pump(stderr, Channel::Stderr, tx));
        Ok(rx)
    }

    /// Waits for exit, cancellation or the timeout, whichever comes first.
    ///
    /// Cancellation and timeout both terminate the process group and wait for
    /// the child to be reaped before returning.
    pub async fn wait(mut self, cancel: CancellationToken) -> Result<ExecutionResult, ExecError> {
        enum Wake {
            Exited(ExitStatus),
            Stop(Termination),
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let wake = tokio::select! {
            status = self.child.wait() => Wake::Exited(status?),
            _ = cancel.cancelled() => Wake::Stop(Termination::Killed),
            _ = &mut deadline => Wake::Stop(Termination::TimedOut),
        };

        match wake {
            Wake::Exited(status) => {
                let termination = if was_signalled(&status) {
                    Termination::Killed
                } else {
                    Termination::Exited
                };
                Ok(self.result(status.code(), termination))
            }
            Wake::Stop(termination) => {
                tracing::info!(pid = self.pid, ?termination, "terminating process");
                self.terminate().await?;
                Ok(self.result(None, termination))
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), ExecError> {
        if let Err(e) = signal_process(self.pid) {
            tracing::debug!(pid = self.pid, "SIGTERM failed: {}", e);
        }

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                tracing::warn!(pid = self.pid, "process ignored SIGTERM, killing");
                #[cfg(unix)]
                let _ = kill_group(self.pid);
                self.child.kill().await?;
            }
        }
        Ok(())
    }

    fn result(&self, exit_code: Option<i32>, termination: Termination) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            success: termination == Termination::Exited && exit_code == Some(0),
            duration: self.started.elapsed(),
            termination,
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    channel: Channel,
    tx: mpsc::Sender<(Channel, Vec<u8>)>,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((channel, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(?channel, "read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn was_signalled(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn was_signalled(_status: &ExitStatus) -> bool {
    false
}

/// Sends SIGTERM to the process group led by `pid`, falling back to the pid alone.
#[cfg(unix)]
pub fn signal_process(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    match killpg(pid, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(_) => kill(pid, Signal::SIGTERM).map_err(std::io::Error::from),
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(std::io::Error::from)
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn signal_process(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signalling by pid is only supported on unix",
    ))
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}
