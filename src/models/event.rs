use crate::models::ProcessState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
    Status,
}

/// One unit of streamed output for a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputEvent {
    pub process_id: String,
    pub channel: Channel,
    pub payload: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Set only on the final status event of a process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<ProcessState>,
}

impl OutputEvent {
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}
