//! Purge trigger.
//!
//! Entry point for content and settings writers: publish an event and optionally consume it
//! straight away.

use std::sync::Arc;

use tracing::debug;

use super::consumer::PurgeConsumer;
use super::events::{EventKind, EventQueue};

pub struct PurgeTrigger {
    enabled: bool,
    queue: Arc<EventQueue>,
    consumer: Arc<PurgeConsumer>,
}

impl PurgeTrigger {
    pub fn new(consumer: Arc<PurgeConsumer>) -> Self {
        Self {
            enabled: consumer.cache().config().is_enabled(),
            queue: Arc::clone(consumer.queue()),
            consumer,
        }
    }

    /// Publish `kind`; with `consume_now` the batch is processed before returning.
    pub async fn trigger(&self, kind: EventKind, consume_now: bool) {
        if !self.enabled {
            debug!(event_kind = ?kind, "Purge trigger skipped: cache disabled");
            return;
        }

        self.queue.publish(kind);

        if consume_now {
            self.consumer.consume().await;
        }
    }

    pub async fn entity_changed(&self, entity_id: u64) {
        self.trigger(EventKind::EntityChanged { entity_id }, true)
            .await;
    }

    pub async fn url_changed(&self, url: &str) {
        self.trigger(
            EventKind::UrlChanged {
                url: url.to_string(),
            },
            true,
        )
        .await;
    }

    pub async fn settings_changed(&self) {
        self.trigger(EventKind::SettingsChanged, true).await;
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}
