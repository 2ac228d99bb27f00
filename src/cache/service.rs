//! Page cache facade used by the render pipeline, the purge consumer and the admin surfaces.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use axum::{http::HeaderMap, response::Response};
use metrics::counter;
use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::application::{request::RequestContext, rules::RuleChain};
use crate::cdn::{CdnGateway, ProviderResult, PurgeScope};

use super::{
    config::CacheConfig,
    entities::EntityResolver,
    keys::{DeviceClass, PageKey, VariationFactors, normalize_url, page_key},
    serve::conditional_response,
    store::{EntryMeta, PageStore, StoreError, StoreStats},
};

const METRIC_HIT: &str = "spry_page_cache_hit_total";
const METRIC_MISS: &str = "spry_page_cache_miss_total";
const METRIC_STORE_FAILED: &str = "spry_page_cache_store_failed_total";
const METRIC_PURGED: &str = "spry_page_cache_purged_total";

/// Query parameters that always bypass the cache.
const BYPASS_QUERY_PARAMS: &[&str] = &["nocache", "preview"];
const LANG_PARAM: &str = "lang";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub cdn: Vec<ProviderResult>,
}

pub struct CacheStore {
    config: CacheConfig,
    /// Query parameters dropped from keys; includes `lang` when it feeds the language factor.
    excluded_params: Vec<String>,
    store: PageStore,
    rules: RuleChain,
    resolver: Arc<dyn EntityResolver>,
    cdn: Arc<CdnGateway>,
    site_url: Url,
}

impl CacheStore {
    pub fn new(
        config: CacheConfig,
        rules: RuleChain,
        resolver: Arc<dyn EntityResolver>,
        cdn: Arc<CdnGateway>,
        site_url: Url,
    ) -> Self {
        let store = PageStore::new(config.directory.clone());
        let mut excluded_params = config.excluded_query_params.clone();
        if config.varies_by_language() {
            excluded_params.push(LANG_PARAM.to_string());
        }
        Self {
            config,
            excluded_params,
            store,
            rules,
            resolver,
            cdn,
            site_url,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn page_store(&self) -> &PageStore {
        &self.store
    }

    pub fn is_tester(&self, ctx: &RequestContext) -> bool {
        self.config.is_tester(ctx.client_ip, &ctx.roles)
    }

    /// Base eligibility followed by the rule chain, which has the final say.
    pub fn should_cache(&self, ctx: &RequestContext) -> bool {
        let base = self.base_eligibility(ctx);
        self.rules.should_cache(base, ctx)
    }

    fn base_eligibility(&self, ctx: &RequestContext) -> bool {
        if !self.config.enabled || !ctx.is_read_only() {
            return false;
        }

        let path = ctx.path();
        if self
            .config
            .excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return false;
        }

        if ctx.cookies.keys().any(|name| {
            self.config
                .bypass_cookie_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        }) {
            return false;
        }

        if BYPASS_QUERY_PARAMS
            .iter()
            .any(|param| ctx.query_param(param).is_some())
        {
            return false;
        }

        !self.is_tester(ctx)
    }

    pub fn ttl(&self, ctx: &RequestContext) -> Duration {
        self.rules.cache_ttl(self.config.ttl, ctx)
    }

    pub fn normalize(&self, url: &str) -> String {
        normalize_url(url, &self.excluded_params)
    }

    /// Language factor: a configured code as first path segment, else a matching `lang` query
    /// parameter.
    pub fn language_for(&self, ctx: &RequestContext) -> Option<String> {
        if !self.config.varies_by_language() {
            return None;
        }

        let first_segment = ctx
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if self.config.languages.contains(&first_segment) {
            return Some(first_segment);
        }

        ctx.query_param(LANG_PARAM)
            .map(|lang| lang.to_ascii_lowercase())
            .filter(|lang| self.config.languages.contains(lang))
    }

    pub fn factors(&self, ctx: &RequestContext) -> VariationFactors {
        let device = self
            .config
            .vary_device
            .then(|| DeviceClass::detect(ctx.user_agent.as_deref()));

        let cookies = self
            .config
            .vary_cookies
            .iter()
            .filter_map(|name| {
                ctx.cookie(name)
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect();

        VariationFactors {
            device,
            language: self.language_for(ctx),
            cookies,
            extra: self.rules.key_factors(ctx),
        }
    }

    pub fn key(&self, ctx: &RequestContext) -> PageKey {
        self.key_for(&ctx.url, &self.factors(ctx))
    }

    pub fn key_for(&self, url: &str, factors: &VariationFactors) -> PageKey {
        page_key(&self.normalize(url), factors)
    }

    pub fn has_valid(&self, key: &PageKey, ctx: &RequestContext) -> bool {
        match self.store.read_meta(key) {
            Ok(Some(meta)) => {
                self.is_fresh(&meta, self.ttl(ctx), OffsetDateTime::now_utc())
                    && self.store.root().join(format!("{key}.html")).exists()
            }
            Ok(None) => false,
            Err(err) => {
                warn!(key = %key, error = %err, "Page cache lookup failed");
                false
            }
        }
    }

    fn is_fresh(&self, meta: &EntryMeta, ttl: Duration, now: OffsetDateTime) -> bool {
        now - meta.created < ttl
    }

    /// Persist rendered HTML. Failures are logged and reported as `false`, never raised.
    #[instrument(skip(self, html), fields(key = %key))]
    pub fn store(&self, key: &PageKey, url: &str, html: &str, entity_id: Option<u64>) -> bool {
        let meta = EntryMeta {
            url: self.normalize(url),
            size: html.len() as u64,
            created: OffsetDateTime::now_utc(),
            entity_id,
        };

        match self.store.write(key, html, &meta) {
            Ok(()) => {
                debug!(url = %meta.url, bytes = meta.size, "Stored page");
                true
            }
            Err(err) => {
                counter!(METRIC_STORE_FAILED).increment(1);
                warn!(url = %meta.url, error = %err, "Failed to store page; serving uncached");
                false
            }
        }
    }

    /// Build the hit response for `key`, or `None` when the entry vanished or is unreadable.
    pub fn serve(
        &self,
        key: &PageKey,
        ctx: &RequestContext,
        request_headers: &HeaderMap,
    ) -> Option<Response> {
        let page = match self.store.read(key) {
            Ok(Some(page)) => page,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to read cached page");
                return None;
            }
        };

        counter!(METRIC_HIT).increment(1);
        let head_only = ctx.method == axum::http::Method::HEAD;
        Some(conditional_response(
            &page,
            self.ttl(ctx),
            request_headers,
            head_only,
            OffsetDateTime::now_utc(),
        ))
    }

    pub fn record_miss(&self) {
        counter!(METRIC_MISS).increment(1);
    }

    /// Offer freshly rendered HTML for storage. Only complete documents of at least the
    /// configured size are kept; the stored copy gains a footer comment.
    pub fn process_output(
        &self,
        key: &PageKey,
        ctx: &RequestContext,
        html: &str,
        entity_id: Option<u64>,
    ) -> bool {
        if html.len() < self.config.min_html_bytes {
            debug!(url = %ctx.url, bytes = html.len(), "Output too small to cache");
            return false;
        }
        if !html.to_ascii_lowercase().contains("</html>") {
            debug!(url = %ctx.url, "Output is not a complete document");
            return false;
        }

        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let stored = format!("{html}\n<!-- cached by spry @ {stamp} -->");
        self.store(key, &ctx.url, &stored, entity_id)
    }

    #[instrument(skip(self))]
    pub async fn purge_all(&self, notify_cdn: bool) -> PurgeReport {
        let removed = match self.store.clear() {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, "Page cache clear failed");
                0
            }
        };
        counter!(METRIC_PURGED).increment(removed as u64);
        info!(removed, "Purged page cache");

        let cdn = if notify_cdn {
            self.cdn.purge(PurgeScope::All).await
        } else {
            Vec::new()
        };
        PurgeReport { removed, cdn }
    }

    #[instrument(skip(self))]
    pub async fn purge_url(&self, url: &str, notify_cdn: bool) -> PurgeReport {
        let normalized = self.normalize(url);
        let removed = self.remove_variants(&normalized);
        info!(url = %normalized, removed, "Purged URL variants");

        let cdn = if notify_cdn {
            self.cdn
                .purge(PurgeScope::Urls(self.absolute_urls([normalized.as_str()])))
                .await
        } else {
            Vec::new()
        };
        PurgeReport { removed, cdn }
    }

    /// Purge every URL related to an entity, then notify the CDN once for the whole set.
    #[instrument(skip(self))]
    pub async fn purge_entity(&self, entity_id: u64, notify_cdn: bool) -> PurgeReport {
        let urls: BTreeSet<String> = self
            .resolver
            .related_urls(entity_id)
            .iter()
            .map(|url| self.normalize(url))
            .collect();

        let removed = urls.iter().map(|url| self.remove_variants(url)).sum();
        info!(entity_id, urls = urls.len(), removed, "Purged entity pages");

        let cdn = if notify_cdn && !urls.is_empty() {
            self.cdn
                .purge(PurgeScope::Urls(
                    self.absolute_urls(urls.iter().map(String::as_str)),
                ))
                .await
        } else {
            Vec::new()
        };
        PurgeReport { removed, cdn }
    }

    /// Delete every variation of one normalized URL: the device × language cross-product, plus
    /// any stored entry whose metadata names the URL (cookie and rule-injected variants).
    fn remove_variants(&self, normalized: &str) -> usize {
        let mut keys = BTreeSet::new();

        let devices: Vec<Option<DeviceClass>> = if self.config.vary_device {
            DeviceClass::ALL.into_iter().map(Some).collect()
        } else {
            vec![None]
        };
        let languages: Vec<Option<String>> = std::iter::once(None)
            .chain(self.config.languages.iter().cloned().map(Some))
            .collect();

        for device in &devices {
            for language in &languages {
                let factors = VariationFactors {
                    device: *device,
                    language: language.clone(),
                    ..VariationFactors::default()
                };
                keys.insert(page_key(normalized, &factors));
            }
        }

        match self.store.entries() {
            Ok(entries) => keys.extend(
                entries
                    .into_iter()
                    .filter(|(_, meta)| meta.url == normalized)
                    .map(|(key, _)| key),
            ),
            Err(err) => warn!(url = %normalized, error = %err, "Page cache scan failed"),
        }

        let mut removed = 0;
        for key in &keys {
            match self.store.remove(key) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(key = %key, error = %err, "Failed to remove cached page"),
            }
        }
        counter!(METRIC_PURGED).increment(removed as u64);
        removed
    }

    fn absolute_urls<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        paths
            .into_iter()
            .filter_map(|path| self.site_url.join(path).ok())
            .map(String::from)
            .collect()
    }

    /// Remove entries older than the configured TTL. Returns the number removed.
    #[instrument(skip(self))]
    pub fn cleanup_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let entries = match self.store.entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "Page cache scan failed during cleanup");
                return 0;
            }
        };

        let mut removed = 0;
        for (key, meta) in entries {
            if self.is_fresh(&meta, self.config.ttl, now) {
                continue;
            }
            match self.store.remove(&key) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(key = %key, error = %err, "Failed to remove expired page"),
            }
        }
        counter!(METRIC_PURGED).increment(removed as u64);
        info!(removed, "Expired page cache entries removed");
        removed
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::application::rules::Rule;
    use crate::cdn::testing::RecordingProvider;
    use crate::config::TestModeSettings;
    use tempfile::TempDir;

    struct Entities(HashMap<u64, Vec<String>>);

    impl EntityResolver for Entities {
        fn related_urls(&self, entity_id: u64) -> Vec<String> {
            self.0.get(&entity_id).cloned().unwrap_or_default()
        }
    }

    fn document(title: &str) -> String {
        format!(
            "<!doctype html><html><head><title>{title}</title></head><body>{}</body></html>",
            "x".repeat(300)
        )
    }

    fn site() -> Url {
        Url::parse("https://example.com/").expect("url")
    }

    fn cache_with(
        dir: &TempDir,
        config: CacheConfig,
        rules: RuleChain,
        cdn: CdnGateway,
    ) -> CacheStore {
        let resolver = Entities(HashMap::from([(
            42,
            vec!["/about/".to_string(), "/".to_string()],
        )]));
        CacheStore::new(
            config.with_directory(dir.path()),
            rules,
            Arc::new(resolver),
            Arc::new(cdn),
            site(),
        )
    }

    fn cache(dir: &TempDir) -> CacheStore {
        cache_with(
            dir,
            CacheConfig::default(),
            RuleChain::new(),
            CdnGateway::disabled(),
        )
    }

    #[test]
    fn base_eligibility_rules() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);

        assert!(cache.should_cache(&RequestContext::get("/about/")));
        assert!(!cache.should_cache(&RequestContext::get("/admin/settings")));
        assert!(!cache.should_cache(&RequestContext::get("/about/?preview=1")));
        assert!(!cache.should_cache(
            &RequestContext::get("/about/").with_cookie("session_abc", "1")
        ));
        let post = RequestContext {
            method: axum::http::Method::POST,
            ..RequestContext::get("/about/")
        };
        assert!(!cache.should_cache(&post));
    }

    #[test]
    fn testers_bypass_the_cache() {
        let dir = TempDir::new().expect("temp dir");
        let ip = "192.0.2.7".parse().expect("ip");
        let config = CacheConfig::default().with_test_mode(&TestModeSettings {
            enabled: true,
            allowed_roles: Vec::new(),
            allowed_ips: vec![ip],
        });
        let cache = cache_with(&dir, config, RuleChain::new(), CdnGateway::disabled());

        assert!(!cache.should_cache(&RequestContext::get("/").with_client_ip(ip)));
        assert!(cache.should_cache(&RequestContext::get("/")));
    }

    #[test]
    fn rule_chain_has_the_final_say() {
        struct CacheNothing;
        impl Rule for CacheNothing {
            fn name(&self) -> &str {
                "cache-nothing"
            }
            fn should_cache(&self, _current: bool, _ctx: &RequestContext) -> bool {
                false
            }
        }

        let dir = TempDir::new().expect("temp dir");
        let cache = cache_with(
            &dir,
            CacheConfig::default(),
            RuleChain::new().with(CacheNothing),
            CdnGateway::disabled(),
        );
        assert!(!cache.should_cache(&RequestContext::get("/about/")));
    }

    #[test]
    fn key_ignores_tracking_parameters() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);

        assert_eq!(
            cache.key(&RequestContext::get("/about/?utm_campaign=spring")),
            cache.key(&RequestContext::get("/about/"))
        );
    }

    #[test]
    fn language_comes_from_path_then_query() {
        let dir = TempDir::new().expect("temp dir");
        let config = CacheConfig {
            languages: vec!["de".to_string(), "fr".to_string()],
            ..CacheConfig::default()
        };
        let cache = cache_with(&dir, config, RuleChain::new(), CdnGateway::disabled());

        assert_eq!(
            cache.language_for(&RequestContext::get("/DE/kontakt/")),
            Some("de".to_string())
        );
        assert_eq!(
            cache.language_for(&RequestContext::get("/contact/?lang=fr")),
            Some("fr".to_string())
        );
        assert_eq!(cache.language_for(&RequestContext::get("/contact/?lang=it")), None);
    }

    #[test]
    fn process_output_rejects_fragments_and_tiny_bodies() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let ctx = RequestContext::get("/about/");
        let key = cache.key(&ctx);

        assert!(!cache.process_output(&key, &ctx, "<html></html>", None));
        assert!(!cache.process_output(&key, &ctx, &"<p>x</p>".repeat(100), None));
        assert!(cache.process_output(&key, &ctx, &document("About"), None));

        let page = cache.page_store().read(&key).expect("read").expect("stored");
        let body = String::from_utf8(page.body.to_vec()).expect("utf8");
        assert!(body.contains("<!-- cached by spry @ "));
        assert!(cache.has_valid(&key, &ctx));
    }

    #[test]
    fn store_failure_is_soft() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").expect("seed blocker");
        let cache = CacheStore::new(
            CacheConfig::default().with_directory(&blocker),
            RuleChain::new(),
            Arc::new(crate::cache::NoEntities),
            Arc::new(CdnGateway::disabled()),
            site(),
        );
        let ctx = RequestContext::get("/about/");

        assert!(!cache.store(&cache.key(&ctx), "/about/", &document("About"), None));
    }

    #[test]
    fn expired_entries_are_invalid_and_swept() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let ctx = RequestContext::get("/old/");
        let key = cache.key(&ctx);
        let meta = EntryMeta {
            url: "/old/".to_string(),
            size: 4,
            created: OffsetDateTime::now_utc() - cache.config().ttl - time::Duration::seconds(1),
            entity_id: None,
        };
        cache
            .page_store()
            .write(&key, "stale", &meta)
            .expect("seed");

        assert!(!cache.has_valid(&key, &ctx));
        assert_eq!(cache.cleanup_expired(), 1);
        assert!(cache.page_store().read(&key).expect("read").is_none());
    }

    #[tokio::test]
    async fn purge_url_removes_device_language_and_cookie_variants() {
        let dir = TempDir::new().expect("temp dir");
        let provider = RecordingProvider::ok("edge");
        let config = CacheConfig {
            vary_device: true,
            vary_cookies: vec!["currency".to_string()],
            languages: vec!["de".to_string()],
            ..CacheConfig::default()
        };
        let cache = cache_with(
            &dir,
            config,
            RuleChain::new(),
            CdnGateway::new(vec![provider.clone()]),
        );

        let variants = [
            RequestContext::get("/about/"),
            RequestContext::get("/about/").with_user_agent("Mozilla/5.0 (iPhone) Mobile"),
            RequestContext::get("/about/?lang=de"),
            RequestContext::get("/about/").with_cookie("currency", "EUR"),
        ];
        for ctx in &variants {
            assert!(cache.process_output(&cache.key(ctx), ctx, &document("About"), None));
        }
        let other = RequestContext::get("/contact/");
        cache.process_output(&cache.key(&other), &other, &document("Contact"), None);

        let report = cache.purge_url("https://example.com/about/", true).await;

        assert_eq!(report.removed, 4);
        assert_eq!(cache.stats().expect("stats").files, 1);
        assert_eq!(
            provider.calls(),
            vec![PurgeScope::Urls(vec!["https://example.com/about/".to_string()])]
        );
    }

    #[tokio::test]
    async fn purge_entity_cascades_to_related_urls_and_calls_cdn_once() {
        let dir = TempDir::new().expect("temp dir");
        let provider = RecordingProvider::ok("edge");
        let cache = cache_with(
            &dir,
            CacheConfig::default(),
            RuleChain::new(),
            CdnGateway::new(vec![provider.clone()]),
        );
        for url in ["/about/", "/", "/unrelated/"] {
            let ctx = RequestContext::get(url);
            cache.process_output(&cache.key(&ctx), &ctx, &document(url), Some(42));
        }

        let report = cache.purge_entity(42, true).await;

        assert_eq!(report.removed, 2);
        assert_eq!(report.cdn.len(), 1);
        assert_eq!(provider.calls().len(), 1);
        assert!(cache.has_valid(
            &cache.key(&RequestContext::get("/unrelated/")),
            &RequestContext::get("/unrelated/")
        ));
    }

    #[tokio::test]
    async fn purge_all_reports_count_and_skips_cdn_when_asked() {
        let dir = TempDir::new().expect("temp dir");
        let provider = RecordingProvider::ok("edge");
        let cache = cache_with(
            &dir,
            CacheConfig::default(),
            RuleChain::new(),
            CdnGateway::new(vec![provider.clone()]),
        );
        for url in ["/a/", "/b/"] {
            let ctx = RequestContext::get(url);
            cache.process_output(&cache.key(&ctx), &ctx, &document(url), None);
        }

        let report = cache.purge_all(false).await;

        assert_eq!(report.removed, 2);
        assert!(report.cdn.is_empty());
        assert!(provider.calls().is_empty());
    }
}
