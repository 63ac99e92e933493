use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessHandle {
    pub id: String,
    pub owner_id: String,
    pub host_id: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub command: String,
    pub state: ProcessState,
    pub os_pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub expires_at: i64,
}

impl ProcessHandle {
    pub fn new(owner_id: &str, host: &crate::models::HostSpec, command: &str, ttl_ms: i64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            host_id: host.id.clone(),
            hostname: host.hostname.clone(),
            port: host.port,
            user: host.user.clone(),
            command: command.to_string(),
            state: ProcessState::Pending,
            os_pid: None,
            exit_code: None,
            message: None,
            started_at: now,
            ended_at: None,
            expires_at: now + ttl_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Killed = 4,
    TimedOut = 5,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
