//! Event output
//!
//! Flow reports and ICMP transactions leave the crate as `Event`s through a
//! `Publisher`. The flow worker batches its reports with a `Spooler` and
//! hands each batch over in one call.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default number of events buffered before a flush
pub const DEFAULT_SPOOL_SIZE: usize = 5000;

/// Timestamped bag of dotted-key fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: Map::new(),
        }
    }

    pub fn put(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Event sink
pub trait Publisher: Send + Sync {
    fn publish_all(&self, events: Vec<Event>);

    fn publish(&self, event: Event) {
        self.publish_all(vec![event]);
    }
}

/// Forwards batches over a bounded channel, dropping them when full
pub struct ChannelPublisher {
    tx: mpsc::Sender<Vec<Event>>,
    dropped: AtomicU64,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<Event>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost to a full or closed channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Publisher for ChannelPublisher {
    fn publish_all(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let count = events.len() as u64;
        if let Err(e) = self.tx.try_send(events) {
            self.dropped.fetch_add(count, Ordering::Relaxed);
            warn!("Dropping {} events: {}", count, e);
        }
    }
}

/// Writes one JSON document per line to stdout
#[derive(Debug, Default)]
pub struct StdoutPublisher;

impl Publisher for StdoutPublisher {
    fn publish_all(&self, events: Vec<Event>) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for event in events {
            let line = match event.to_json() {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if let Err(e) = writeln!(out, "{}", line) {
                warn!("Failed to write event: {}", e);
                return;
            }
        }
        let _ = out.flush();
    }
}

/// Keeps everything in memory; used when embedding and in tests
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<Event>>,
    batches: AtomicU64,
}

impl MemoryPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain collected events
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `publish_all` calls seen
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Publisher for MemoryPublisher {
    fn publish_all(&self, events: Vec<Event>) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.lock().extend(events);
    }
}

/// Buffers events and forwards them in batches
pub struct Spooler {
    publisher: Arc<dyn Publisher>,
    events: Vec<Event>,
    max_buffer_size: usize,
}

impl Spooler {
    pub fn new(publisher: Arc<dyn Publisher>, max_buffer_size: usize) -> Self {
        let max_buffer_size = max_buffer_size.max(1);
        Self {
            publisher,
            events: Vec::with_capacity(max_buffer_size.min(1024)),
            max_buffer_size,
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
        if self.events.len() >= self.max_buffer_size {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.events);
        debug!("Flushing {} events", batch.len());
        self.publisher.publish_all(batch);
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }
}

impl Drop for Spooler {
    fn drop(&mut self) {
        self.flush();
    }
}
