//! Per-process output channels with a single live subscriber.
//!
//! Each channel is a bounded ring buffer. When the subscriber is slow or
//! absent the oldest events are dropped and the subscriber later receives one
//! `status` gap marker carrying the sequence of the last dropped event, so
//! observed sequences stay strictly increasing. Producers never block.

use crate::models::{Channel, OutputEvent, ProcessState};
use chrono::Utc;
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("No output channel for execution {0}")]
    NotFound(String),

    #[error("Execution {0} already has a live subscriber")]
    AlreadySubscribed(String),

    #[error("Not authorized to subscribe to execution {0}")]
    Unauthorized(String),
}

#[derive(Clone)]
pub struct OutputBroadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    channels: Mutex<HashMap<String, Arc<ProcessChannel>>>,
    capacity: usize,
    batch_window: Duration,
    linger: Duration,
}

struct ProcessChannel {
    process_id: String,
    state: Mutex<ChannelState>,
    notify: Notify,
}

#[derive(Default)]
struct ChannelState {
    buffer: VecDeque<OutputEvent>,
    next_sequence: u64,
    gap: Option<Gap>,
    closed_at: Option<Instant>,
    subscribed: bool,
}

struct Gap {
    dropped: u64,
    last_sequence: u64,
}

impl OutputBroadcaster {
    pub fn new(capacity: usize, batch_window: Duration, linger: Duration) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                batch_window,
                linger,
            }),
        }
    }

    /// Creates the channel for a new process and returns its producer side.
    pub fn open(&self, process_id: &str) -> Publisher {
        let channel = Arc::new(ProcessChannel {
            process_id: process_id.to_string(),
            state: Mutex::new(ChannelState {
                next_sequence: 1,
                ..ChannelState::default()
            }),
            notify: Notify::new(),
        });

        let mut channels = lock(&self.inner.channels);
        let linger = self.inner.linger;
        channels.retain(|_, existing| {
            let state = lock(&existing.state);
            !matches!(state.closed_at, Some(at) if at.elapsed() >= linger && !state.subscribed)
        });
        channels.insert(process_id.to_string(), channel.clone());

        Publisher {
            channel,
            capacity: self.inner.capacity,
        }
    }

    /// Attaches the single live subscriber after `authorize` approves it.
    pub fn subscribe(
        &self,
        process_id: &str,
        authorize: impl FnOnce(&str) -> bool,
    ) -> Result<Subscription, BroadcastError> {
        let channel = lock(&self.inner.channels)
            .get(process_id)
            .cloned()
            .ok_or_else(|| BroadcastError::NotFound(process_id.to_string()))?;

        if !authorize(process_id) {
            return Err(BroadcastError::Unauthorized(process_id.to_string()));
        }

        {
            let mut state = lock(&channel.state);
            if state.subscribed {
                return Err(BroadcastError::AlreadySubscribed(process_id.to_string()));
            }
            state.subscribed = true;
        }

        Ok(Subscription {
            channel,
            broadcaster: self.inner.clone(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }
}

impl BroadcasterInner {
    fn remove(&self, process_id: &str) {
        lock(&self.channels).remove(process_id);
    }
}

/// Producer side of one process channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<ProcessChannel>,
    capacity: usize,
}

impl Publisher {
    /// Appends a line. Returns `false` once the channel has been finished.
    pub fn emit(&self, channel: Channel, payload: impl Into<String>) -> bool {
        self.push(channel, payload.into(), None)
    }

    /// Emits the terminal status event and closes the channel.
    /// Only the first call has any effect.
    pub fn finish(&self, state: ProcessState, summary: impl Into<String>) -> bool {
        self.push(Channel::Status, summary.into(), Some(state))
    }

    fn push(&self, channel: Channel, payload: String, terminal: Option<ProcessState>) -> bool {
        {
            let mut state = lock(&self.channel.state);
            if state.closed_at.is_some() {
                return false;
            }

            let event = OutputEvent {
                process_id: self.channel.process_id.clone(),
                channel,
                payload,
                sequence: state.next_sequence,
                timestamp: Utc::now(),
                terminal,
            };
            state.next_sequence += 1;

            if state.buffer.len() >= self.capacity {
                if let Some(dropped) = state.buffer.pop_front() {
                    let gap = state.gap.get_or_insert(Gap {
                        dropped: 0,
                        last_sequence: 0,
                    });
                    gap.dropped += 1;
                    gap.last_sequence = dropped.sequence;
                }
            }
            state.buffer.push_back(event);
            if terminal.is_some() {
                state.closed_at = Some(Instant::now());
            }
        }
        self.channel.notify.notify_one();
        true
    }
}

/// Consumer side of one process channel.
pub struct Subscription {
    channel: Arc<ProcessChannel>,
    broadcaster: Arc<BroadcasterInner>,
    pending: VecDeque<OutputEvent>,
    done: bool,
}

impl Subscription {
    /// Waits for events, then gathers whatever arrives within the batch
    /// window. Returns `None` after the terminal event has been delivered.
    pub async fn next_batch(&mut self) -> Option<Vec<OutputEvent>> {
        if !self.pending.is_empty() {
            return Some(self.pending.drain(..).collect());
        }
        if self.done {
            return None;
        }

        loop {
            let (ready, closed) = {
                let state = lock(&self.channel.state);
                (
                    !state.buffer.is_empty() || state.gap.is_some(),
                    state.closed_at.is_some(),
                )
            };
            if ready {
                if !closed && !self.broadcaster.batch_window.is_zero() {
                    tokio::time::sleep(self.broadcaster.batch_window).await;
                }
                break;
            }
            self.channel.notify.notified().await;
        }

        let batch = self.drain();
        if batch.last().is_some_and(OutputEvent::is_terminal) {
            self.done = true;
            self.broadcaster.remove(&self.channel.process_id);
        }
        Some(batch)
    }

    pub async fn next(&mut self) -> Option<OutputEvent> {
        if self.pending.is_empty() {
            let batch = self.next_batch().await?;
            self.pending.extend(batch);
        }
        self.pending.pop_front()
    }

    pub fn into_stream(self) -> impl Stream<Item = Vec<OutputEvent>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let batch = sub.next_batch().await?;
            Some((batch, sub))
        })
    }

    fn drain(&self) -> Vec<OutputEvent> {
        let mut state = lock(&self.channel.state);
        let mut batch = Vec::with_capacity(state.buffer.len() + 1);
        if let Some(gap) = state.gap.take() {
            batch.push(OutputEvent {
                process_id: self.channel.process_id.clone(),
                channel: Channel::Status,
                payload: format!("[{} lines dropped]", gap.dropped),
                sequence: gap.last_sequence,
                timestamp: Utc::now(),
                terminal: None,
            });
        }
        batch.extend(state.buffer.drain(..));
        batch
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.channel.state).subscribed = false;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
