//! Preload recommendation passes and operator decisions.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, btree_map::Entry},
    num::NonZeroUsize,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use metrics::histogram;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::PreloadSettings,
    util::lock::{rw_read, rw_write},
};

use super::{
    PreloadError,
    analyze::{extract_font_urls, scan_head},
    crawl::ResourceFetcher,
    state::{JsonDocument, PreloadConfig, PreloadState, RejectedAt},
    types::{Observation, PreloadEntry, Recommendation, ResourceType, recommendation_id},
};

const SOURCE: &str = "preload::engine";
const METRIC_PASS_MS: &str = "spry_preload_pass_ms";

/// Stylesheets above this size are not worth preloading.
pub const STYLE_SIZE_LIMIT: u64 = 180_000;
/// Scripts above this size are not worth preloading.
pub const SCRIPT_SIZE_LIMIT: u64 = 200_000;

/// Pages worth crawling, supplied by the site.
pub trait ContentSource: Send + Sync {
    fn home_url(&self) -> Url;

    /// Permalinks of the `limit` most recently published entries, newest first.
    fn recent_entries(&self, limit: usize) -> Vec<Url>;

    fn top_pages(&self) -> Vec<Url>;
}

#[derive(Debug, Clone)]
pub struct PreloadLimits {
    pub recent_entries: usize,
    pub max_candidates: NonZeroUsize,
    pub max_recommendations: NonZeroUsize,
    pub stale_after: Duration,
    pub probe_sizes: bool,
}

impl From<&PreloadSettings> for PreloadLimits {
    fn from(settings: &PreloadSettings) -> Self {
        Self {
            recent_entries: settings.recent_entries,
            max_candidates: settings.max_candidates,
            max_recommendations: settings.max_recommendations,
            stale_after: settings.stale_after,
            probe_sizes: settings.probe_sizes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub candidates: usize,
    pub crawled: usize,
    pub failed: usize,
    pub recommendations: usize,
}

pub struct PreloadRecommendationEngine {
    source: Arc<dyn ContentSource>,
    fetcher: Arc<dyn ResourceFetcher>,
    limits: PreloadLimits,
    state_doc: JsonDocument<PreloadState>,
    config_doc: JsonDocument<PreloadConfig>,
    state: RwLock<PreloadState>,
    config: RwLock<PreloadConfig>,
}

impl PreloadRecommendationEngine {
    pub fn new(
        source: Arc<dyn ContentSource>,
        fetcher: Arc<dyn ResourceFetcher>,
        limits: PreloadLimits,
        state_doc: JsonDocument<PreloadState>,
        config_doc: JsonDocument<PreloadConfig>,
    ) -> Result<Self, PreloadError> {
        let state = state_doc.load()?;
        let config = config_doc.load()?;
        Ok(Self {
            source,
            fetcher,
            limits,
            state_doc,
            config_doc,
            state: RwLock::new(state),
            config: RwLock::new(config),
        })
    }

    /// Home page, then recent entries, then top pages; deduplicated and capped.
    pub fn candidates(&self) -> Vec<Url> {
        let mut seen = HashSet::new();
        std::iter::once(self.source.home_url())
            .chain(self.source.recent_entries(self.limits.recent_entries))
            .chain(self.source.top_pages())
            .filter(|url| seen.insert(url.as_str().to_string()))
            .take(self.limits.max_candidates.get())
            .collect()
    }

    /// Preload-worthy resources in the head of `page`.
    pub async fn analyze_url(&self, page: &Url) -> Result<Vec<Observation>, PreloadError> {
        let html = self.fetcher.fetch_text(page).await?;
        let mut observations = Vec::new();

        for resource in scan_head(&html, page) {
            if resource.is_font_provider() {
                match self.fetcher.fetch_text(&resource.url).await {
                    Ok(css) => {
                        observations.extend(extract_font_urls(&css, &resource.url).into_iter().map(
                            |url| Observation {
                                url,
                                resource_type: ResourceType::Font,
                                position: resource.position,
                                size: None,
                            },
                        ));
                    }
                    Err(err) => {
                        debug!(
                            target = SOURCE,
                            url = %resource.url,
                            error = %err,
                            "Font stylesheet unavailable"
                        );
                    }
                }
            }

            let size = if self.limits.probe_sizes {
                self.fetcher.content_length(&resource.url).await
            } else {
                None
            };
            let limit = match resource.resource_type {
                ResourceType::Style => STYLE_SIZE_LIMIT,
                ResourceType::Script => SCRIPT_SIZE_LIMIT,
                ResourceType::Font => u64::MAX,
            };
            if size.is_some_and(|size| size > limit) {
                debug!(target = SOURCE, url = %resource.url, size, "Skipping oversized resource");
                continue;
            }

            observations.push(Observation {
                url: resource.url,
                resource_type: resource.resource_type,
                position: resource.position,
                size,
            });
        }
        Ok(observations)
    }

    /// Crawl every candidate sequentially, fold observations into the stored set and prune it.
    /// Unreachable pages are skipped.
    pub async fn run(&self) -> Result<PassReport, PreloadError> {
        let started = Instant::now();
        let candidates = self.candidates();
        let mut observed = Vec::new();
        let mut failed = 0;

        for page in &candidates {
            match self.analyze_url(page).await {
                Ok(found) => observed.extend(found.into_iter().map(|obs| (page.to_string(), obs))),
                Err(err) => {
                    failed += 1;
                    warn!(
                        target = SOURCE,
                        url = %page,
                        error = %err,
                        "Skipping page in preload pass"
                    );
                }
            }
        }

        let configured = rw_read(&self.config, SOURCE, "run").entries.clone();
        let now = OffsetDateTime::now_utc();
        let recommendations = {
            let mut guard = rw_write(&self.state, SOURCE, "run");
            let state = &mut *guard;
            let mut seen = HashSet::new();
            for (page, observation) in observed {
                seen.insert(merge_observation(
                    &mut state.recommendations,
                    observation,
                    &page,
                    now,
                ));
            }
            prune(
                &mut state.recommendations,
                &state.rejected,
                &configured,
                &seen,
                now,
                self.limits.stale_after,
                self.limits.max_recommendations.get(),
            );
            state.last_run = Some(now);
            self.state_doc.save(state)?;
            state.recommendations.len()
        };

        let report = PassReport {
            candidates: candidates.len(),
            crawled: candidates.len() - failed,
            failed,
            recommendations,
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_PASS_MS).record(elapsed_ms);
        info!(
            target = SOURCE,
            candidates = report.candidates,
            failed = report.failed,
            recommendations = report.recommendations,
            elapsed_ms = elapsed_ms as u64,
            "Preload pass complete"
        );
        Ok(report)
    }

    /// Current recommendations, best first.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let state = rw_read(&self.state, SOURCE, "recommendations");
        let mut ranked: Vec<Recommendation> = state.recommendations.values().cloned().collect();
        ranked.sort_by(|a, b| a.rank().cmp(&b.rank()));
        ranked
    }

    /// Dismissed ids and when they were dismissed.
    pub fn rejected(&self) -> BTreeMap<String, OffsetDateTime> {
        rw_read(&self.state, SOURCE, "rejected")
            .rejected
            .iter()
            .map(|(id, at)| (id.clone(), at.0))
            .collect()
    }

    pub fn last_run(&self) -> Option<OffsetDateTime> {
        rw_read(&self.state, SOURCE, "last_run").last_run
    }

    /// Entries of the live preload configuration.
    pub fn configured(&self) -> Vec<PreloadEntry> {
        rw_read(&self.config, SOURCE, "configured").entries.clone()
    }

    /// Move a recommendation into the live preload configuration.
    ///
    /// Both documents are written before memory changes. When the state cannot be saved the
    /// configuration document is restored.
    pub fn accept(&self, id: &str) -> Result<Recommendation, PreloadError> {
        let mut state = rw_write(&self.state, SOURCE, "accept");
        let mut config = rw_write(&self.config, SOURCE, "accept");

        let mut next_state = state.clone();
        let Some(recommendation) = next_state.recommendations.remove(id) else {
            return Err(PreloadError::UnknownRecommendation(id.to_string()));
        };
        next_state.rejected.remove(id);

        let mut next_config = config.clone();
        let entry = recommendation.to_entry();
        if !next_config.contains(&entry) {
            next_config.entries.push(entry);
        }

        self.config_doc.save(&next_config)?;
        if let Err(err) = self.state_doc.save(&next_state) {
            if let Err(restore) = self.config_doc.save(&config) {
                warn!(
                    target = SOURCE,
                    id,
                    error = %restore,
                    "Failed to restore preload configuration"
                );
            }
            return Err(err);
        }
        *state = next_state;
        *config = next_config;

        info!(target = SOURCE, id, url = %recommendation.url, "Preload recommendation accepted");
        Ok(recommendation)
    }

    /// Drop a recommendation and keep it from being suggested again.
    pub fn reject(&self, id: &str) -> Result<Recommendation, PreloadError> {
        let mut state = rw_write(&self.state, SOURCE, "reject");
        let mut next = state.clone();
        let Some(recommendation) = next.recommendations.remove(id) else {
            return Err(PreloadError::UnknownRecommendation(id.to_string()));
        };
        next.rejected
            .insert(id.to_string(), RejectedAt(OffsetDateTime::now_utc()));
        self.state_doc.save(&next)?;
        *state = next;

        info!(target = SOURCE, id, url = %recommendation.url, "Preload recommendation rejected");
        Ok(recommendation)
    }
}

/// Fold one observation into `recommendations`, returning its id.
///
/// A repeat sighting unions the observing pages, keeps the earliest position, fills an unknown
/// size and refreshes `last_seen`.
pub fn merge_observation(
    recommendations: &mut BTreeMap<String, Recommendation>,
    observation: Observation,
    page: &str,
    now: OffsetDateTime,
) -> String {
    let id = recommendation_id(observation.resource_type, &observation.url);
    match recommendations.entry(id.clone()) {
        Entry::Occupied(mut occupied) => {
            let existing = occupied.get_mut();
            existing.pages.insert(page.to_string());
            existing.position = existing.position.min(observation.position);
            if existing.size.is_none() {
                existing.size = observation.size;
            }
            existing.last_seen = now;
        }
        Entry::Vacant(vacant) => {
            let mut url = observation.url;
            url.set_fragment(None);
            vacant.insert(Recommendation {
                id: id.clone(),
                url: url.into(),
                resource_type: observation.resource_type,
                position: observation.position,
                size: observation.size,
                pages: BTreeSet::from([page.to_string()]),
                first_seen: now,
                last_seen: now,
            });
        }
    }
    id
}

/// Drop rejected, already configured and stale recommendations, then keep the best `cap`.
pub fn prune(
    recommendations: &mut BTreeMap<String, Recommendation>,
    rejected: &BTreeMap<String, RejectedAt>,
    configured: &[PreloadEntry],
    seen_this_pass: &HashSet<String>,
    now: OffsetDateTime,
    stale_after: Duration,
    cap: usize,
) {
    recommendations.retain(|id, recommendation| {
        let configured_already = configured.iter().any(|entry| {
            entry.resource_type == recommendation.resource_type && entry.url == recommendation.url
        });
        let fresh = seen_this_pass.contains(id) || now - recommendation.last_seen <= stale_after;
        !rejected.contains_key(id) && !configured_already && fresh
    });

    if recommendations.len() <= cap {
        return;
    }
    let mut ranked: Vec<&Recommendation> = recommendations.values().collect();
    ranked.sort_by(|a, b| a.rank().cmp(&b.rank()));
    let keep: HashSet<String> = ranked.into_iter().take(cap).map(|r| r.id.clone()).collect();
    recommendations.retain(|id, _| keep.contains(id));
}
