//! Server-sent event framing for execution output.
//!
//! Every record is `data: <json>\n\n` where the JSON object carries
//! `type`, `data`, `process_id` and `timestamp`. A terminal event becomes a
//! `status` record with the summary followed by a `complete` record, after
//! which the stream ends.

use crate::models::{Channel, OutputEvent, ProcessHandle};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct WireRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a str,
    process_id: &'a str,
    timestamp: String,
}

fn push_record(out: &mut String, kind: &'static str, data: &str, process_id: &str, at: DateTime<Utc>) {
    let record = WireRecord {
        kind,
        data,
        process_id,
        timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    // Serializing a struct of strings cannot fail.
    if let Ok(json) = serde_json::to_string(&record) {
        out.push_str("data: ");
        out.push_str(&json);
        out.push_str("\n\n");
    }
}

fn record_type(channel: Channel) -> &'static str {
    match channel {
        Channel::Stdout => "output",
        Channel::Stderr => "error",
        Channel::Status => "status",
    }
}

/// Encodes one batch as a single write.
pub fn encode_batch(events: &[OutputEvent]) -> String {
    let mut out = String::new();
    for event in events {
        push_record(
            &mut out,
            record_type(event.channel),
            &event.payload,
            &event.process_id,
            event.timestamp,
        );
        if let Some(state) = event.terminal {
            push_record(&mut out, "complete", state.as_str(), &event.process_id, event.timestamp);
        }
    }
    out
}

/// Replays the outcome of an execution whose live channel is already gone.
pub fn encode_settled(handle: &ProcessHandle) -> String {
    let at = handle
        .ended_at
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    let summary = handle
        .message
        .clone()
        .unwrap_or_else(|| format!("Execution {}", handle.state));

    let mut out = String::new();
    push_record(&mut out, "status", &summary, &handle.id, at);
    push_record(&mut out, "complete", handle.state.as_str(), &handle.id, at);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessState;
    use serde_json::Value;

    fn event(channel: Channel, payload: &str, sequence: u64, terminal: Option<ProcessState>) -> OutputEvent {
        OutputEvent {
            process_id: "p-1".to_string(),
            channel,
            payload: payload.to_string(),
            sequence,
            timestamp: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap(),
            terminal,
        }
    }

    fn records(wire: &str) -> Vec<Value> {
        assert!(wire.ends_with("\n\n"));
        wire.trim_end()
            .split("\n\n")
            .map(|unit| {
                let json = unit.strip_prefix("data: ").expect("data prefix");
                serde_json::from_str(json).unwrap()
            })
            .collect()
    }

    #[test]
    fn frames_each_event_with_channel_type() {
        let wire = encode_batch(&[
            event(Channel::Status, "Executing: uptime", 1, None),
            event(Channel::Stdout, "up 3 days", 2, None),
            event(Channel::Stderr, "warning: x", 3, None),
        ]);

        let records = records(&wire);
        let kinds: Vec<_> = records.iter().map(|r| r["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, ["status", "output", "error"]);
        assert_eq!(records[1]["data"], "up 3 days");
        assert_eq!(records[1]["process_id"], "p-1");
        assert_eq!(records[1]["timestamp"], "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn exact_bytes_of_one_record() {
        let wire = encode_batch(&[event(Channel::Stdout, "hi \"there\"", 1, None)]);
        assert_eq!(
            wire,
            "data: {\"type\":\"output\",\"data\":\"hi \\\"there\\\"\",\"process_id\":\"p-1\",\"timestamp\":\"2023-11-14T22:13:20.123Z\"}\n\n"
        );
    }

    #[test]
    fn terminal_event_is_followed_by_complete() {
        let wire = encode_batch(&[event(
            Channel::Status,
            "⏱️ Command timed out (Duration: 1.00s)",
            9,
            Some(ProcessState::TimedOut),
        )]);

        let records = records(&wire);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "status");
        assert_eq!(records[1]["type"], "complete");
        assert_eq!(records[1]["data"], "timed_out");
    }

    #[test]
    fn settled_handle_replays_summary() {
        let host = crate::models::HostSpec {
            id: "web".to_string(),
            hostname: "web.internal".to_string(),
            port: 22,
            user: "ops".to_string(),
            identity: "ops".to_string(),
            active: true,
        };
        let mut handle = ProcessHandle::new("alice", &host, "true", 60_000);
        handle.state = ProcessState::Completed;
        handle.message = Some("✅ done".to_string());
        handle.ended_at = Some(1_700_000_000_123);

        let records = records(&encode_settled(&handle));
        assert_eq!(records[0]["data"], "✅ done");
        assert_eq!(records[1]["type"], "complete");
        assert_eq!(records[1]["data"], "completed");
        assert_eq!(records[1]["process_id"], handle.id.as_str());
    }
}
