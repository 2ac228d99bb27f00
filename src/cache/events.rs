//! Purge events.
//!
//! Content mutations, settings changes and operator actions are published here and drained in
//! batches by the purge consumer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_QUEUE_LEN: &str = "spry_purge_event_queue_len";

/// Monotonic per-process sequence number.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct PurgeEvent {
    /// Idempotency key; the planner ignores repeated ids.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl PurgeEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A content entity was created, updated or deleted.
    EntityChanged { entity_id: u64 },
    /// A single URL needs to be refreshed.
    UrlChanged { url: String },
    /// Global settings changed; every page may render differently.
    SettingsChanged,
    /// An operator asked for a full purge.
    PurgeRequested,
}

impl EventKind {
    /// Whether the event invalidates the whole cache.
    pub fn is_global(&self) -> bool {
        matches!(self, Self::SettingsChanged | Self::PurgeRequested)
    }
}

pub struct EventQueue {
    queue: Mutex<VecDeque<PurgeEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, kind: EventKind) {
        let event = PurgeEvent::new(kind, self.next_epoch());
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Purge event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        queue.push_back(event);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Remove up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<PurgeEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
