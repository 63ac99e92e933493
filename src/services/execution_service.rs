use crate::config::ExecutionConfig;
use crate::error::{AppError, Result};
use crate::executor::{
    ExecError, ExecOptions, ExecutionResult, LineSplitter, RunningProcess, ShellMode, SshExecutor,
    Transport, is_alive, signal_process,
};
use crate::models::{Channel, ProcessHandle, ProcessState};
use crate::repository::{AuthorizationStore, ExecutionRepository, HostDirectory, KeyMaterialProvider};
use crate::services::{ConnectionPool, OutputBroadcaster, PoolLease, Publisher, Subscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Closed channels stay subscribable this long for clients that connect late.
const CHANNEL_LINGER: Duration = Duration::from_secs(300);
/// Output still buffered in the pipes is read for at most this long after exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StartExecution {
    pub command: String,
    pub host_id: String,
    pub owner_id: String,
    pub mode: ShellMode,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(ProcessState),
    AlreadyFinished(ProcessState),
}

#[derive(Clone)]
pub struct ExecutionService {
    exec_repo: ExecutionRepository,
    owners: Arc<dyn AuthorizationStore>,
    hosts: Arc<dyn HostDirectory>,
    keys: Arc<dyn KeyMaterialProvider>,
    pool: ConnectionPool,
    executor: SshExecutor,
    broadcaster: OutputBroadcaster,
    settings: Arc<ExecutionConfig>,
    running: Arc<Mutex<HashMap<String, RunControl>>>,
}

struct RunControl {
    cancel: CancellationToken,
    finished: watch::Receiver<Option<ProcessState>>,
}

/// Everything the supervision task owns for one execution.
struct Run {
    process_id: String,
    process: RunningProcess,
    output: mpsc::Receiver<(Channel, Vec<u8>)>,
    publisher: Publisher,
    cancel: CancellationToken,
    lease: Option<PoolLease>,
    finished: watch::Sender<Option<ProcessState>>,
}

impl ExecutionService {
    pub fn new(
        exec_repo: ExecutionRepository,
        owners: Arc<dyn AuthorizationStore>,
        hosts: Arc<dyn HostDirectory>,
        keys: Arc<dyn KeyMaterialProvider>,
        pool: ConnectionPool,
        executor: SshExecutor,
        settings: ExecutionConfig,
    ) -> Self {
        let broadcaster = OutputBroadcaster::new(
            settings.event_buffer,
            settings.batch_window(),
            CHANNEL_LINGER,
        );
        Self {
            exec_repo,
            owners,
            hosts,
            keys,
            pool,
            executor,
            broadcaster,
            settings: Arc::new(settings),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Starts a remote command and returns its process id without waiting for it.
    pub async fn start_execution(&self, req: StartExecution) -> Result<String> {
        let command = req.command.trim();
        if command.is_empty() {
            return Err(AppError::InvalidRequest(
                "Command cannot be empty".to_string(),
            ));
        }
        if req.owner_id.trim().is_empty() {
            return Err(AppError::Unauthenticated);
        }

        let host = self.hosts.resolve(&req.host_id).await?;
        if !host.active {
            return Err(AppError::HostInactive(host.id));
        }
        let identity = self.keys.key_path(&host.identity)?;

        self.purge_expired().await;

        let ttl_ms = self.settings.handle_ttl().as_millis() as i64;
        let handle = ProcessHandle::new(&req.owner_id, &host, command, ttl_ms);
        let process_id = handle.id.clone();
        self.exec_repo.create(&handle).await?;
        self.owners
            .record_ownership(&process_id, &req.owner_id)
            .await?;

        let publisher = self.broadcaster.open(&process_id);
        publisher.emit(Channel::Status, format!("Executing: {command}"));

        let lease = match self.pool.acquire(&host, &identity).await {
            Ok(lease) => Some(lease),
            Err(e) => {
                tracing::warn!(host = %host.id, "falling back to one-shot transport: {}", e);
                None
            }
        };
        let transport = lease
            .as_ref()
            .map(PoolLease::transport)
            .unwrap_or(Transport::OneShot);
        let options = ExecOptions {
            mode: req.mode,
            timeout: self.settings.timeout_for(req.timeout_secs),
        };

        let spawned = self
            .executor
            .start(command, &host, &identity, &transport, &options)
            .and_then(|mut process| {
                let output = process.output()?;
                Ok((process, output))
            });
        let (process, output) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.fail_before_running(&process_id, &publisher, &e).await;
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(None);
        self.running_map().insert(
            process_id.clone(),
            RunControl {
                cancel: cancel.clone(),
                finished: finished_rx,
            },
        );

        match self.exec_repo.mark_running(&process_id, process.pid).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(process_id = %process_id, "stopped before it started running");
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!(process_id = %process_id, "failed to record pid: {}", e);
                cancel.cancel();
            }
        }

        tracing::info!(
            process_id = %process_id,
            pid = process.pid,
            host = %host.id,
            transport = lease.as_ref().map(|l| l.connection().key.as_str()).unwrap_or("one-shot"),
            channels = self.broadcaster.channel_count(),
            "execution started"
        );

        let service = self.clone();
        tokio::spawn(service.supervise(Run {
            process_id: process_id.clone(),
            process,
            output,
            publisher,
            cancel,
            lease,
            finished: finished_tx,
        }));

        Ok(process_id)
    }

    /// Terminates a running execution owned by `requester_id`. Idempotent.
    pub async fn stop_execution(&self, process_id: &str, requester_id: &str) -> Result<StopOutcome> {
        let handle = self.exec_repo.get(process_id).await?;
        self.authorize(process_id, requester_id).await?;
        if handle.state.is_terminal() {
            return Ok(StopOutcome::AlreadyFinished(handle.state));
        }

        let control = self
            .running_map()
            .get(process_id)
            .map(|c| (c.cancel.clone(), c.finished.clone()));

        if let Some((cancel, mut finished)) = control {
            tracing::info!(process_id = %process_id, "stop requested");
            cancel.cancel();
            let deadline = self.settings.kill_grace() + STOP_SLACK;
            let settled = tokio::time::timeout(deadline, finished.wait_for(Option::is_some))
                .await
                .ok()
                .and_then(|r| r.ok().and_then(|state| *state));
            if let Some(state) = settled {
                return Ok(match state {
                    ProcessState::Killed => StopOutcome::Stopped(state),
                    other => StopOutcome::AlreadyFinished(other),
                });
            }
            tracing::warn!(process_id = %process_id, "supervisor did not settle, marking killed");
        }

        // Supervised elsewhere (or lost): signal the recorded pid directly.
        if let Some(pid) = handle.os_pid {
            if is_alive(pid) {
                if let Err(e) = signal_process(pid) {
                    tracing::warn!(process_id = %process_id, pid, "failed to signal: {}", e);
                }
            }
        }
        if self
            .exec_repo
            .finish(process_id, ProcessState::Killed, None, "🛑 Command stopped")
            .await?
        {
            Ok(StopOutcome::Stopped(ProcessState::Killed))
        } else {
            let state = self.exec_repo.get(process_id).await?.state;
            Ok(StopOutcome::AlreadyFinished(state))
        }
    }

    pub async fn get_status(&self, process_id: &str, requester_id: &str) -> Result<ProcessHandle> {
        let handle = self.exec_repo.get(process_id).await?;
        self.authorize(process_id, requester_id).await?;
        Ok(handle)
    }

    /// Attaches the live output stream for an execution owned by `requester_id`.
    pub async fn subscribe(&self, process_id: &str, requester_id: &str) -> Result<Subscription> {
        let allowed = self.owners.check_ownership(process_id, requester_id).await?;
        Ok(self.broadcaster.subscribe(process_id, |_| allowed)?)
    }

    /// Cancels every supervised execution and tears down pooled transports.
    pub async fn shutdown(&self) {
        let controls: Vec<_> = self
            .running_map()
            .values()
            .map(|c| (c.cancel.clone(), c.finished.clone()))
            .collect();
        for (cancel, _) in &controls {
            cancel.cancel();
        }
        let deadline = self.settings.kill_grace() + STOP_SLACK;
        for (_, mut finished) in controls {
            let _ = tokio::time::timeout(deadline, finished.wait_for(Option::is_some)).await;
        }
        if let Err(e) = self.pool.evict_all().await {
            tracing::warn!("failed to evict pooled transports: {}", e);
        }
    }

    async fn supervise(self, run: Run) {
        let Run {
            process_id,
            process,
            mut output,
            publisher,
            cancel,
            lease,
            finished,
        } = run;

        let mut splitter = LineSplitter::new(self.settings.noise_filters.clone())
            .with_max_line_bytes(self.settings.max_line_bytes);
        let wait = process.wait(cancel);
        tokio::pin!(wait);

        let mut output_open = true;
        let result = loop {
            tokio::select! {
                chunk = output.recv(), if output_open => match chunk {
                    Some((channel, bytes)) => {
                        for line in splitter.feed(channel, &bytes) {
                            publisher.emit(channel, line);
                        }
                    }
                    None => output_open = false,
                },
                result = &mut wait => break result,
            }
        };

        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
            while let Some((channel, bytes)) = output.recv().await {
                for line in splitter.feed(channel, &bytes) {
                    publisher.emit(channel, line);
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(process_id = %process_id, "output still open after exit, truncating");
        }
        for channel in [Channel::Stdout, Channel::Stderr] {
            if let Some(line) = splitter.flush(channel) {
                publisher.emit(channel, line);
            }
        }

        let (state, exit_code, summary) = match result {
            Ok(result) => (result.state(), result.exit_code, summarize(&result)),
            Err(e) => {
                tracing::error!(process_id = %process_id, "lost track of process: {}", e);
                (ProcessState::Failed, None, format!("❌ Lost track of process: {e}"))
            }
        };

        let state = self
            .settle(&process_id, &publisher, state, exit_code, summary)
            .await;

        drop(lease);
        self.running_map().remove(&process_id);
        let _ = finished.send(Some(state));
        tracing::info!(process_id = %process_id, %state, ?exit_code, "execution finished");
    }

    async fn fail_before_running(
        &self,
        process_id: &str,
        publisher: &Publisher,
        error: &ExecError,
    ) {
        tracing::warn!(process_id = %process_id, "failed to start: {}", error);
        let message = format!("❌ Failed to start command: {error}");
        self.settle(process_id, publisher, ProcessState::Failed, None, message)
            .await;
    }

    /// Records the outcome and publishes the terminal event. The event goes
    /// out even when the store fails, so subscribers always see an end.
    async fn settle(
        &self,
        process_id: &str,
        publisher: &Publisher,
        state: ProcessState,
        exit_code: Option<i32>,
        summary: String,
    ) -> ProcessState {
        match self
            .exec_repo
            .finish(process_id, state, exit_code, &summary)
            .await
        {
            Ok(true) => {
                publisher.finish(state, summary);
                state
            }
            // Someone else recorded the outcome first; report theirs.
            Ok(false) => match self.exec_repo.get(process_id).await {
                Ok(stored) => {
                    publisher.finish(stored.state, stored.message.unwrap_or(summary));
                    stored.state
                }
                Err(_) => {
                    publisher.finish(state, summary);
                    state
                }
            },
            Err(e) => {
                tracing::error!(process_id = %process_id, "failed to persist final state: {}", e);
                publisher.finish(state, summary);
                state
            }
        }
    }

    async fn authorize(&self, process_id: &str, requester_id: &str) -> Result<()> {
        if self.owners.check_ownership(process_id, requester_id).await? {
            Ok(())
        } else {
            Err(AppError::AuthorizationDenied(process_id.to_string()))
        }
    }

    async fn purge_expired(&self) {
        if let Err(e) = self.exec_repo.purge_expired().await {
            tracing::warn!("failed to purge expired executions: {}", e);
        }
        if let Err(e) = self.owners.purge_expired().await {
            tracing::warn!("failed to purge expired ownership: {}", e);
        }
    }

    fn running_map(&self) -> MutexGuard<'_, HashMap<String, RunControl>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn summarize(result: &ExecutionResult) -> String {
    let secs = result.duration.as_secs_f64();
    let exit_code = result
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_string());
    match result.state() {
        ProcessState::Completed => format!(
            "✅ Command completed successfully (Exit Code: {exit_code}, Duration: {secs:.2}s)"
        ),
        ProcessState::Killed => format!("🛑 Command stopped (Duration: {secs:.2}s)"),
        ProcessState::TimedOut => format!("⏱️ Command timed out (Duration: {secs:.2}s)"),
        _ => format!("❌ Command failed (Exit Code: {exit_code}, Duration: {secs:.2}s)"),
    }
}
