//! Purge consumer.
//!
//! Drains the event queue, plans the batch and executes it against the page cache, which in
//! turn notifies the CDN.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument};
use uuid::Uuid;

use super::events::EventQueue;
use super::planner::PurgePlan;
use super::service::CacheStore;

const METRIC_PURGE_CONSUME_MS: &str = "spry_purge_consume_ms";

pub struct PurgeConsumer {
    cache: Arc<CacheStore>,
    queue: Arc<EventQueue>,
    batch_limit: usize,
}

impl PurgeConsumer {
    pub fn new(cache: Arc<CacheStore>, queue: Arc<EventQueue>) -> Self {
        let batch_limit = cache.config().consume_batch_limit;
        Self {
            cache,
            queue,
            batch_limit,
        }
    }

    /// Consume one batch. Returns whether any events were processed.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> bool {
        let started_at = Instant::now();
        let events = self.queue.drain(self.batch_limit);
        if events.is_empty() {
            return false;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = PurgePlan::from_events(events);
        info!(event_count, event_ids = ?event_ids, plan = %plan, "Purge consumption starting");

        let mut removed = 0;
        let mode = if plan.purge_all {
            removed += self.cache.purge_all(true).await.removed;
            "all"
        } else {
            for entity_id in &plan.entities {
                removed += self.cache.purge_entity(*entity_id, true).await.removed;
            }
            for url in &plan.urls {
                removed += self.cache.purge_url(url, true).await.removed;
            }
            "targeted"
        };

        info!(event_count, removed, mode, "Purge consumption complete");
        histogram!(METRIC_PURGE_CONSUME_MS, "mode" => mode)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        true
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use url::Url;

    use super::*;
    use crate::application::{request::RequestContext, rules::RuleChain};
    use crate::cache::{CacheConfig, NoEntities, events::EventKind};
    use crate::cdn::CdnGateway;

    fn consumer(dir: &TempDir, batch_limit: usize) -> PurgeConsumer {
        let config = CacheConfig {
            consume_batch_limit: batch_limit,
            ..CacheConfig::default()
        }
        .with_directory(dir.path());
        let cache = CacheStore::new(
            config,
            RuleChain::new(),
            Arc::new(NoEntities),
            Arc::new(CdnGateway::disabled()),
            Url::parse("https://example.com/").expect("url"),
        );
        PurgeConsumer::new(Arc::new(cache), Arc::new(EventQueue::new()))
    }

    fn seed(cache: &CacheStore, url: &str) {
        let ctx = RequestContext::get(url);
        let html = format!("<html><body>{}</body></html>", "x".repeat(400));
        assert!(cache.process_output(&cache.key(&ctx), &ctx, &html, None));
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        assert!(!consumer(&dir, 10).consume().await);
    }

    #[tokio::test]
    async fn url_events_remove_only_their_pages() {
        let dir = TempDir::new().expect("temp dir");
        let consumer = consumer(&dir, 10);
        seed(consumer.cache(), "/about/");
        seed(consumer.cache(), "/contact/");

        consumer.queue().publish(EventKind::UrlChanged {
            url: "/about/".to_string(),
        });
        assert!(consumer.consume().await);

        assert_eq!(consumer.cache().stats().expect("stats").files, 1);
    }

    #[tokio::test]
    async fn settings_change_purges_everything() {
        let dir = TempDir::new().expect("temp dir");
        let consumer = consumer(&dir, 10);
        seed(consumer.cache(), "/a/");
        seed(consumer.cache(), "/b/");

        consumer.queue().publish(EventKind::SettingsChanged);
        consumer.consume().await;

        assert_eq!(consumer.cache().stats().expect("stats").files, 0);
    }

    #[tokio::test]
    async fn consume_respects_batch_limit() {
        let dir = TempDir::new().expect("temp dir");
        let consumer = consumer(&dir, 2);
        for id in 0..5 {
            consumer
                .queue()
                .publish(EventKind::EntityChanged { entity_id: id });
        }

        consumer.consume().await;
        assert_eq!(consumer.queue().len(), 3);
    }
}
