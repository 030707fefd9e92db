//! Progress publishing
//!
//! The engine only depends on [`ProgressChannel::publish`]. The broadcast
//! implementation fans every event out to any number of observers (the SSE
//! endpoint opens one subscription per connected client).

use log::trace;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Default capacity of the broadcast buffer
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One published event
#[derive(Debug, Clone, Serialize)]
pub struct QueueEvent {
    /// Event name, prefixed with the queue name (e.g. `transcode:progress`)
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Fire-and-forget publisher of queue events
pub trait ProgressChannel: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Broadcast publisher backed by `tokio::sync::broadcast`
///
/// Publishing never blocks and never fails: events are dropped when nobody is
/// subscribed, and slow subscribers skip the events they lagged behind on.
#[derive(Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressChannel for BroadcastChannel {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = QueueEvent {
            topic: topic.to_string(),
            payload,
        };
        if self.tx.send(event).is_err() {
            trace!("No observers for {}", topic);
        }
    }
}

/// Minimum-interval gate for progress publication
///
/// Emissions inside the window are coalesced: the caller records that a newer
/// value is waiting and publishes it when [`ProgressThrottle::flush_due`]
/// reports the window has elapsed.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: false,
        }
    }

    /// Record a new value at `now`.
    ///
    /// Returns `Ok(())` when it may be published immediately, otherwise
    /// `Err(wait)` with the time left in the current window.
    pub fn offer(&mut self, now: Instant) -> Result<(), Duration> {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = true;
                Err(self.interval - now.duration_since(last))
            }
            _ => {
                self.last_emit = Some(now);
                self.pending = false;
                Ok(())
            }
        }
    }

    /// Whether a coalesced value is waiting and its window has elapsed.
    /// Marks it as published when it returns true.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.pending = false;
            self.last_emit = Some(now);
        }
        due
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Forget all state; used when a new job starts
    pub fn reset(&mut self) {
        self.last_emit = None;
        self.pending = false;
    }
}
