use crate::models::ProcessHandle;
use crate::services::StopOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    pub command: String,
    pub host_id: String,
    /// Run through `bash -ic` instead of a bare `sh -c`.
    pub bash: Option<bool>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StartExecutionResponse {
    pub process_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: String,
    pub host_id: String,
    pub destination: String,
    pub command: String,
    pub state: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

pub(crate) fn rfc3339(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339()
}

impl From<ProcessHandle> for ExecutionResponse {
    fn from(handle: ProcessHandle) -> Self {
        Self {
            destination: format!("{}@{}:{}", handle.user, handle.hostname, handle.port),
            id: handle.id,
            host_id: handle.host_id,
            command: handle.command,
            state: handle.state.to_string(),
            pid: handle.os_pid,
            exit_code: handle.exit_code,
            message: handle.message,
            started_at: rfc3339(handle.started_at),
            ended_at: handle.ended_at.map(rfc3339),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StopExecutionResponse {
    pub message: String,
    pub state: String,
}

impl From<StopOutcome> for StopExecutionResponse {
    fn from(outcome: StopOutcome) -> Self {
        let (message, state) = match outcome {
            StopOutcome::Stopped(state) => ("Execution stopped", state),
            StopOutcome::AlreadyFinished(state) => ("Execution already finished", state),
        };
        Self {
            message: message.to_string(),
            state: state.to_string(),
        }
    }
}
