//! Structured event fan-out.
//!
//! The engine reports state changes, alerts, and timer activity as
//! [`Event`] records through a broadcast channel. Delivery is best-effort
//! and non-blocking: no receiver, a lagged receiver, or a dropped receiver
//! never stalls or fails engine work. An external fan-out layer (WebSocket
//! or otherwise) subscribes at this seam.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of an event's log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    #[default]
    Info,
    /// User-visible alert (hardware communication problems, aborted
    /// acquisitions, storage failures).
    Alert,
}

/// One notification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub instrument: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<String>,
    #[serde(default)]
    pub level: EventLevel,
}

impl Event {
    fn base(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            channel: None,
            log: None,
            state: None,
            action: None,
            timer: None,
            level: EventLevel::Info,
        }
    }

    pub fn log(instrument: &str, message: impl Into<String>) -> Self {
        Self {
            log: Some(message.into()),
            ..Self::base(instrument)
        }
    }

    pub fn alert(instrument: &str, message: impl Into<String>) -> Self {
        Self {
            log: Some(message.into()),
            level: EventLevel::Alert,
            ..Self::base(instrument)
        }
    }

    pub fn state(instrument: &str, state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Self::base(instrument)
        }
    }

    pub fn action(instrument: &str, action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::base(instrument)
        }
    }

    pub fn timer(instrument: &str, timer: impl Into<String>) -> Self {
        Self {
            timer: Some(timer.into()),
            ..Self::base(instrument)
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Best-effort broadcast sender for engine events.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Event>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget emit. A send error just means nobody is listening.
    pub fn emit(&self, event: Event) {
        if event.level == EventLevel::Alert {
            tracing::warn!(instrument = %event.instrument, event = ?event, "alert");
        } else {
            tracing::debug!(instrument = %event.instrument, event = ?event, "event");
        }
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
