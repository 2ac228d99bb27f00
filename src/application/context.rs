//! Wiring of the long-lived components from resolved settings.

use std::{fs, io, sync::Arc};

use tracing::{info, warn};

use crate::{
    application::{error::AppError, rules::RuleChain},
    assets::{HeadDirectives, MergeEngine},
    cache::{CacheConfig, CacheStore, EventQueue, PurgeConsumer, PurgeTrigger},
    cdn::CdnGateway,
    config::Settings,
    infra::{
        http::{AdminState, ClientLimits},
        site::SiteManifest,
    },
    preload::{HttpFetcher, JsonDocument, PreloadLimits, PreloadRecommendationEngine},
};

pub struct AppContext {
    pub settings: Settings,
    pub manifest: Arc<SiteManifest>,
    pub cache: Arc<CacheStore>,
    pub consumer: Arc<PurgeConsumer>,
    pub trigger: Arc<PurgeTrigger>,
    pub merge: Arc<MergeEngine>,
    pub preload: Arc<PreloadRecommendationEngine>,
}

impl AppContext {
    pub fn build(settings: Settings, rules: RuleChain) -> Result<Self, AppError> {
        let manifest = Arc::new(match settings.site.manifest.as_deref() {
            Some(path) => {
                let manifest = SiteManifest::load(path, &settings.site.url)?;
                info!(path = %path.display(), entities = manifest.len(), "Loaded site manifest");
                manifest
            }
            None => SiteManifest::empty(settings.site.url.clone()),
        });

        let cdn = Arc::new(CdnGateway::from_settings(&settings.cdn)?);
        let config = CacheConfig::from(&settings.cache).with_test_mode(&settings.test_mode);
        let cache = Arc::new(CacheStore::new(
            config,
            rules.clone(),
            manifest.clone(),
            cdn,
            settings.site.url.clone(),
        ));
        let consumer = Arc::new(PurgeConsumer::new(
            cache.clone(),
            Arc::new(EventQueue::new()),
        ));
        let trigger = Arc::new(PurgeTrigger::new(consumer.clone()));

        let merge = Arc::new(MergeEngine::from_settings(&settings, rules)?);

        let fetcher = HttpFetcher::with_limits(ClientLimits::new(
            settings.preload.crawl_timeout,
            settings.preload.max_redirects,
        ))?;
        let preload = Arc::new(PreloadRecommendationEngine::new(
            manifest.clone(),
            Arc::new(fetcher),
            PreloadLimits::from(&settings.preload),
            JsonDocument::new(settings.preload.state_path.clone()),
            JsonDocument::new(settings.preload.config_path.clone()),
        )?);

        Ok(Self {
            settings,
            manifest,
            cache,
            consumer,
            trigger,
            merge,
            preload,
        })
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            cache: self.cache.clone(),
            trigger: self.trigger.clone(),
            merge: self.merge.clone(),
            preload: self.preload.clone(),
        }
    }

    /// Render-time head directives: configured critical CSS plus the accepted preload entries.
    /// An unreadable critical CSS file is logged and skipped.
    pub fn head_directives(&self) -> HeadDirectives {
        let critical_css = self.settings.merge.critical_css.as_deref().and_then(|path| {
            match fs::read_to_string(path) {
                Ok(css) => Some(css),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to read critical CSS");
                    None
                }
            }
        });
        HeadDirectives::new(
            critical_css,
            self.preload.configured(),
            self.merge.classifier().rules().clone(),
        )
    }
}
