//! Group classification and merge/defer eligibility.

use std::collections::{BTreeMap, HashSet};

use crate::application::rules::RuleChain;
use crate::config::{CompatSettings, MergeSettings};

use super::types::{AssetDescriptor, AssetGroup};

/// Indicators of page builders and visual composers (group C).
const BUILDER_INDICATORS: &[&str] = &[
    "elementor",
    "divi",
    "et-builder",
    "fl-builder",
    "beaver-builder",
    "js_composer",
    "wpbakery",
    "vc_",
    "oxygen",
    "brizy",
    "bricks",
    "siteorigin",
    "fusion-builder",
    "thrive",
    "gutenberg-blocks",
];

/// Indicators of core and theme assets (group A).
const CORE_INDICATORS: &[&str] = &[
    "/wp-includes/",
    "/wp-admin/",
    "/themes/",
    "/theme/",
    "/core/",
];

const CORE_HANDLE_PREFIXES: &[&str] = &["wp-", "jquery", "theme-", "core-"];

/// Indicators of widely used plugins (group B).
const PLUGIN_INDICATORS: &[&str] = &[
    "woocommerce",
    "contact-form-7",
    "wpcf7",
    "yoast",
    "jetpack",
    "gravityforms",
    "wpforms",
    "akismet",
    "mailchimp",
    "polylang",
    "wpml",
];

/// Assets that break when concatenated: payment widgets, analytics and tag managers, live
/// preview tooling.
const MERGE_BLACKLIST: &[&str] = &[
    "stripe",
    "paypal",
    "braintree",
    "square-payment",
    "klarna",
    "google-analytics",
    "googletagmanager",
    "gtag",
    "gtm",
    "analytics",
    "facebook-pixel",
    "fbevents",
    "hotjar",
    "clarity",
    "customize-preview",
    "customize-selective-refresh",
    "admin-bar",
    "live-preview",
    "recaptcha",
];

/// Framework handles other scripts rely on synchronously.
const BASELINE_HANDLES: &[&str] = &[
    "jquery",
    "jquery-core",
    "jquery-migrate",
    "wp-polyfill",
    "wp-hooks",
    "wp-i18n",
    "regenerator-runtime",
];

#[derive(Debug, Clone, Default)]
pub struct AssetClassifier {
    /// Lowercase handle to group.
    overrides: BTreeMap<String, AssetGroup>,
    excluded: HashSet<String>,
    no_defer: HashSet<String>,
    rules: RuleChain,
}

impl AssetClassifier {
    pub fn new(merge: &MergeSettings, compat: &CompatSettings, rules: RuleChain) -> Self {
        let excluded = merge
            .exclude_handles
            .iter()
            .chain(&compat.exclude_handles)
            .map(|handle| handle.to_ascii_lowercase())
            .collect();
        let no_defer = merge
            .no_defer_handles
            .iter()
            .chain(&compat.no_defer_handles)
            .map(|handle| handle.to_ascii_lowercase())
            .collect();

        Self {
            overrides: merge.group_overrides.clone(),
            excluded,
            no_defer,
            rules,
        }
    }

    pub fn rules(&self) -> &RuleChain {
        &self.rules
    }

    /// Group for `handle` served from `src`. A manual override always wins.
    pub fn classify(&self, handle: &str, src: &str) -> AssetGroup {
        let handle = handle.to_ascii_lowercase();
        if let Some(group) = self.overrides.get(&handle) {
            return *group;
        }

        let src = src.to_ascii_lowercase();
        let mentions = |indicator: &&str| handle.contains(*indicator) || src.contains(*indicator);

        if BUILDER_INDICATORS.iter().any(mentions) {
            return AssetGroup::C;
        }
        if CORE_INDICATORS.iter().any(|indicator| src.contains(indicator))
            || CORE_HANDLE_PREFIXES
                .iter()
                .any(|prefix| handle.starts_with(prefix))
        {
            return AssetGroup::A;
        }
        if PLUGIN_INDICATORS.iter().any(mentions) {
            return AssetGroup::B;
        }
        AssetGroup::D
    }

    pub fn group_of(&self, asset: &AssetDescriptor) -> AssetGroup {
        self.classify(&asset.handle, &asset.src)
    }

    pub fn can_merge(&self, asset: &AssetDescriptor) -> bool {
        let handle = asset.handle.to_ascii_lowercase();
        let src = asset.src.to_ascii_lowercase();
        let eligible = !self.excluded.contains(&handle)
            && !MERGE_BLACKLIST
                .iter()
                .any(|pattern| handle.contains(pattern) || src.contains(pattern));
        self.rules.can_merge(eligible, &asset.handle)
    }

    pub fn can_defer(&self, handle: &str) -> bool {
        let lowered = handle.to_ascii_lowercase();
        let eligible =
            !self.no_defer.contains(&lowered) && !BASELINE_HANDLES.contains(&lowered.as_str());
        self.rules.can_defer(eligible, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::rules::Rule;

    fn classifier() -> AssetClassifier {
        AssetClassifier::new(
            &MergeSettings::default(),
            &CompatSettings::default(),
            RuleChain::new(),
        )
    }

    #[test]
    fn classification_by_indicator() {
        let classifier = classifier();

        assert_eq!(
            classifier.classify("elementor-frontend", "/plugins/elementor/a.css"),
            AssetGroup::C
        );
        assert_eq!(
            classifier.classify("twentytwenty-style", "/wp-content/themes/tt/style.css"),
            AssetGroup::A
        );
        assert_eq!(
            classifier.classify("wc-blocks", "/wp-content/plugins/woocommerce/blocks.css"),
            AssetGroup::B
        );
        assert_eq!(
            classifier.classify("slider", "/wp-content/plugins/slider/s.css"),
            AssetGroup::D
        );
    }

    #[test]
    fn manual_override_is_case_insensitive_and_wins() {
        let mut merge = MergeSettings::default();
        merge
            .group_overrides
            .insert("elementor-frontend".to_string(), AssetGroup::A);
        let classifier = AssetClassifier::new(&merge, &CompatSettings::default(), RuleChain::new());

        assert_eq!(
            classifier.classify("Elementor-Frontend", "/plugins/elementor/a.css"),
            AssetGroup::A
        );
    }

    #[test]
    fn exclusions_and_blacklist_block_merging() {
        let compat = CompatSettings {
            exclude_handles: vec!["Fragile".to_string()],
            no_defer_handles: vec!["inline-config".to_string()],
        };
        let classifier =
            AssetClassifier::new(&MergeSettings::default(), &compat, RuleChain::new());

        assert!(classifier.can_merge(&AssetDescriptor::script("app", "/app.js")));
        assert!(!classifier.can_merge(&AssetDescriptor::script("fragile", "/f.js")));
        assert!(!classifier.can_merge(&AssetDescriptor::script(
            "checkout",
            "https://js.stripe.com/v3/"
        )));
        assert!(!classifier.can_merge(&AssetDescriptor::script("gtag", "/gtag.js")));

        assert!(classifier.can_defer("app"));
        assert!(!classifier.can_defer("jquery-core"));
        assert!(!classifier.can_defer("inline-config"));
    }

    #[test]
    fn rules_get_the_final_word() {
        struct NeverMergeApp;
        impl Rule for NeverMergeApp {
            fn name(&self) -> &str {
                "never-merge-app"
            }
            fn can_merge(&self, current: bool, handle: &str) -> bool {
                current && handle != "app"
            }
            fn can_defer(&self, _current: bool, handle: &str) -> bool {
                handle == "jquery"
            }
        }

        let classifier = AssetClassifier::new(
            &MergeSettings::default(),
            &CompatSettings::default(),
            RuleChain::new().with(NeverMergeApp),
        );

        assert!(!classifier.can_merge(&AssetDescriptor::script("app", "/app.js")));
        assert!(classifier.can_defer("jquery"));
        assert!(!classifier.can_defer("app"));
    }
}
