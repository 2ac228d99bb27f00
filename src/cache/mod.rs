//! Page cache.
//!
//! Rendered HTML is stored on disk under a key derived from the normalized URL and the request's
//! variation factors (device class, language, selected cookies, rule-injected factors):
//!
//! - [`CacheStore`] decides eligibility, derives keys, stores and serves entries, and purges by
//!   URL, entity or globally, forwarding purges to the CDN gateway
//! - [`page_cache_layer`] wires the store into an axum render router
//! - [`PurgeTrigger`] and [`PurgeConsumer`] batch purge events from content writers
//!
//! ```toml
//! [cache]
//! enabled = true
//! ttl_seconds = 3600
//! vary_device = true
//! vary_cookies = ["currency"]
//! languages = ["en", "de"]
//! ```

mod config;
mod consumer;
mod entities;
mod events;
mod keys;
mod middleware;
mod planner;
mod serve;
mod service;
mod store;
mod trigger;

pub use config::CacheConfig;
pub use consumer::PurgeConsumer;
pub use entities::{EntityResolver, NoEntities};
pub use events::{Epoch, EventKind, EventQueue, PurgeEvent};
pub use keys::{
    DEFAULT_EXCLUDED_QUERY_PARAMS, DeviceClass, PageKey, VariationFactors, normalize_url, page_key,
};
pub use middleware::{CacheEntity, PageCacheState, page_cache_layer};
pub use planner::PurgePlan;
pub use serve::{X_CACHE, conditional_response, entity_tag};
pub use service::{CacheStore, PurgeReport};
pub use store::{CachedPage, EntryMeta, PageStore, StoreError, StoreStats};
pub use trigger::PurgeTrigger;
