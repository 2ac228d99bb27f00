//! Ordered rule chain consulted by the page cache and the merge engine.
//!
//! Each rule receives the value produced by the rules before it and returns a possibly modified
//! value. Every hook defaults to passing the value through, so a rule only implements the hooks it
//! cares about.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use crate::preload::PreloadEntry;

use super::request::RequestContext;

pub trait Rule: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn should_cache(&self, current: bool, _ctx: &RequestContext) -> bool {
        current
    }

    fn cache_ttl(&self, current: Duration, _ctx: &RequestContext) -> Duration {
        current
    }

    /// Extra variation factors folded into the page cache key.
    fn key_factors(
        &self,
        factors: BTreeMap<String, String>,
        _ctx: &RequestContext,
    ) -> BTreeMap<String, String> {
        factors
    }

    fn exclude_handles(&self, handles: Vec<String>, _ctx: &RequestContext) -> Vec<String> {
        handles
    }

    fn can_merge(&self, current: bool, _handle: &str) -> bool {
        current
    }

    fn can_defer(&self, current: bool, _handle: &str) -> bool {
        current
    }

    fn critical_css_content(&self, css: String, _ctx: &RequestContext) -> String {
        css
    }

    fn preload_assets(
        &self,
        assets: Vec<PreloadEntry>,
        _ctx: &RequestContext,
    ) -> Vec<PreloadEntry> {
        assets
    }
}

/// Rules in registration order.
#[derive(Clone, Default)]
pub struct RuleChain {
    rules: Vec<Arc<dyn Rule>>,
}

impl fmt::Debug for RuleChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|rule| rule.name()))
            .finish()
    }
}

impl RuleChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn push(&mut self, rule: Arc<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn should_cache(&self, initial: bool, ctx: &RequestContext) -> bool {
        self.rules
            .iter()
            .fold(initial, |current, rule| rule.should_cache(current, ctx))
    }

    pub fn cache_ttl(&self, initial: Duration, ctx: &RequestContext) -> Duration {
        self.rules
            .iter()
            .fold(initial, |current, rule| rule.cache_ttl(current, ctx))
    }

    pub fn key_factors(&self, ctx: &RequestContext) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .fold(BTreeMap::new(), |factors, rule| rule.key_factors(factors, ctx))
    }

    pub fn exclude_handles(&self, initial: Vec<String>, ctx: &RequestContext) -> Vec<String> {
        self.rules
            .iter()
            .fold(initial, |handles, rule| rule.exclude_handles(handles, ctx))
    }

    pub fn can_merge(&self, initial: bool, handle: &str) -> bool {
        self.rules
            .iter()
            .fold(initial, |current, rule| rule.can_merge(current, handle))
    }

    pub fn can_defer(&self, initial: bool, handle: &str) -> bool {
        self.rules
            .iter()
            .fold(initial, |current, rule| rule.can_defer(current, handle))
    }

    pub fn critical_css_content(&self, initial: String, ctx: &RequestContext) -> String {
        self.rules
            .iter()
            .fold(initial, |css, rule| rule.critical_css_content(css, ctx))
    }

    pub fn preload_assets(
        &self,
        initial: Vec<PreloadEntry>,
        ctx: &RequestContext,
    ) -> Vec<PreloadEntry> {
        self.rules
            .iter()
            .fold(initial, |assets, rule| rule.preload_assets(assets, ctx))
    }
}
