use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::backend::Level;
use crate::config::EventsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Input,
    Error,
}

impl EventLevel {
    fn log_level(self) -> log::Level {
        match self {
            EventLevel::Info | EventLevel::Input => log::Level::Info,
            EventLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub fn between(old: Level, new: Level) -> Option<Edge> {
        match (old, new) {
            (Level::Low, Level::High) => Some(Edge::Rising),
            (Level::High, Level::Low) => Some(Edge::Falling),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Edge::Rising => "rising",
            Edge::Falling => "falling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    pub message: String,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<Edge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Level>,
}

impl EventRecord {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: epoch_millis(),
            message: message.into(),
            level,
            pin: None,
            edge: None,
            value: None,
        }
    }

    pub fn edge(pin: u32, edge: Edge, value: Level) -> Self {
        Self {
            pin: Some(pin),
            edge: Some(edge),
            value: Some(value),
            ..Self::new(
                EventLevel::Input,
                format!("Pin {pin} {} edge detected (value: {value})", edge.as_str()),
            )
        }
    }
}

/// What a subscriber receives: a record, or a heartbeat after an idle interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedItem {
    Event(EventRecord),
    Heartbeat {
        #[serde(rename = "timestamp")]
        timestamp_ms: u64,
    },
}

/// Fan-out of event records to any number of subscribers.
///
/// Each subscriber owns a bounded queue. Publishing never waits: when a
/// subscriber's queue is full the new record is dropped for that subscriber
/// only, and subscribers that went away are pruned.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<EventRecord>>>,
    capacity: usize,
    heartbeat_interval: Duration,
}

impl EventBus {
    pub fn new(capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            heartbeat_interval,
        }
    }

    pub fn from_config(cfg: &EventsConfig) -> Arc<Self> {
        Arc::new(Self::new(cfg.capacity, cfg.heartbeat_interval()))
    }

    pub fn publish(&self, record: EventRecord) {
        log::log!(record.level.log_level(), "{}", record.message);

        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(record.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(EventRecord::new(EventLevel::Info, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(EventRecord::new(EventLevel::Error, message));
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        EventSubscription {
            rx,
            heartbeat_interval: self.heartbeat_interval,
            idle_deadline: Instant::now() + self.heartbeat_interval,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

pub struct EventSubscription {
    rx: mpsc::Receiver<EventRecord>,
    heartbeat_interval: Duration,
    /// When the next heartbeat is due; survives a cancelled `next()`.
    idle_deadline: Instant,
}

impl EventSubscription {
    /// Waits for the next record, yielding a heartbeat when none arrives
    /// within the heartbeat interval. `None` once the bus is gone.
    ///
    /// Cancel safe. Dropping the future does not postpone the heartbeat.
    pub async fn next(&mut self) -> Option<FeedItem> {
        let item = match tokio::time::timeout_at(self.idle_deadline, self.rx.recv()).await {
            Ok(Some(record)) => FeedItem::Event(record),
            Ok(None) => return None,
            Err(_) => FeedItem::Heartbeat {
                timestamp_ms: epoch_millis(),
            },
        };
        self.idle_deadline = Instant::now() + self.heartbeat_interval;
        Some(item)
    }

    /// Returns an already queued record without waiting.
    pub fn try_next(&mut self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
