//! Bundle construction and render-time substitution.

pub mod bundle;
mod css;
mod fetch;
mod fonts;
mod js;
pub mod staleness;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use dashmap::DashMap;
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{
    application::{request::RequestContext, rules::RuleChain},
    config::{Settings, TestModeSettings},
    infra::{
        error::InfraError,
        http::{ClientLimits, build_client},
    },
};

use super::{
    classify::AssetClassifier,
    render::AssetReference,
    types::{AssetDescriptor, AssetGroup, AssetKind, DependencyTree},
};

pub use bundle::{Bundle, BundleMeta, BundleStore};
pub use css::{minify_css, rewrite_urls};
pub use fetch::{FetchError, FetchedSource, SourceFetcher};
pub use fonts::{FontCollaborator, SwapFontDisplay};
pub use js::minify_js;
pub use staleness::{MtimeStaleness, StalenessPolicy};

const SOURCE: &str = "assets::merge";
const METRIC_BUILT: &str = "spry_bundle_built_total";
const METRIC_REUSED: &str = "spry_bundle_reused_total";
const METRIC_FALLBACK: &str = "spry_merge_fallback_total";

/// Hex characters of the content-hash key kept in artifact names.
const KEY_LEN: usize = 32;
const REMOTE_MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("bundle io at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode bundle metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no {kind} source in group {group} could be fetched")]
    NoSources { kind: AssetKind, group: AssetGroup },
}

impl MergeError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Per-kind switches taken from the merge settings.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub css_groups: Vec<AssetGroup>,
    pub js_groups: Vec<AssetGroup>,
    pub minify_css: bool,
    pub minify_js: bool,
    pub defer_scripts: bool,
}

impl MergeOptions {
    pub fn enabled_groups(&self, kind: AssetKind) -> &[AssetGroup] {
        match kind {
            AssetKind::Style => &self.css_groups,
            AssetKind::Script => &self.js_groups,
        }
    }

    fn minify(&self, kind: AssetKind) -> bool {
        match kind {
            AssetKind::Style => self.minify_css,
            AssetKind::Script => self.minify_js,
        }
    }
}

pub struct MergeEngine {
    classifier: AssetClassifier,
    fetcher: SourceFetcher,
    bundles: BundleStore,
    options: MergeOptions,
    test_mode: TestModeSettings,
    staleness: Arc<dyn StalenessPolicy>,
    fonts: Arc<dyn FontCollaborator>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl MergeEngine {
    pub fn new(
        classifier: AssetClassifier,
        fetcher: SourceFetcher,
        bundles: BundleStore,
        options: MergeOptions,
        test_mode: TestModeSettings,
    ) -> Self {
        Self {
            classifier,
            fetcher,
            bundles,
            options,
            test_mode,
            staleness: Arc::new(MtimeStaleness),
            fonts: Arc::new(SwapFontDisplay),
            locks: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &Settings, rules: RuleChain) -> Result<Self, InfraError> {
        let merge = &settings.merge;
        let client = build_client(ClientLimits::new(
            merge.remote_fetch_timeout,
            REMOTE_MAX_REDIRECTS,
        ))?;
        let fetcher = SourceFetcher::new(
            settings.site.url.clone(),
            settings.site.document_root.clone(),
            client,
            merge.remote_cache_ttl,
            merge.remote_cache_capacity,
        );
        let options = MergeOptions {
            css_groups: merge.css_groups.clone(),
            js_groups: merge.js_groups.clone(),
            minify_css: merge.minify_css,
            minify_js: merge.minify_js,
            defer_scripts: merge.defer_scripts,
        };

        Ok(Self::new(
            AssetClassifier::new(merge, &settings.compat, rules),
            fetcher,
            BundleStore::new(merge.bundle_dir.clone(), merge.bundle_url.clone()),
            options,
            settings.test_mode.clone(),
        ))
    }

    pub fn with_staleness(mut self, staleness: Arc<dyn StalenessPolicy>) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_fonts(mut self, fonts: Arc<dyn FontCollaborator>) -> Self {
        self.fonts = fonts;
        self
    }

    pub fn classifier(&self) -> &AssetClassifier {
        &self.classifier
    }

    pub fn bundles(&self) -> &BundleStore {
        &self.bundles
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Mergeable assets of `tree` bucketed by group, keeping dependency order inside each bucket.
    /// Stylesheets scoped to a specific medium are never merged.
    pub fn group_assets(
        &self,
        tree: &DependencyTree,
        enabled: &[AssetGroup],
    ) -> BTreeMap<AssetGroup, Vec<AssetDescriptor>> {
        self.group_assets_excluding(tree, enabled, &HashSet::new())
    }

    fn group_assets_excluding(
        &self,
        tree: &DependencyTree,
        enabled: &[AssetGroup],
        excluded: &HashSet<String>,
    ) -> BTreeMap<AssetGroup, Vec<AssetDescriptor>> {
        let mut groups: BTreeMap<AssetGroup, Vec<AssetDescriptor>> = BTreeMap::new();
        for asset in tree {
            if let Some(group) = self.bundle_group(asset, enabled, excluded) {
                groups.entry(group).or_default().push(asset.clone());
            }
        }
        groups
    }

    fn bundle_group(
        &self,
        asset: &AssetDescriptor,
        enabled: &[AssetGroup],
        excluded: &HashSet<String>,
    ) -> Option<AssetGroup> {
        if excluded.contains(&asset.handle) || !self.classifier.can_merge(asset) {
            return None;
        }
        if asset.kind == AssetKind::Style && !asset.is_all_media() {
            return None;
        }
        let group = self.classifier.group_of(asset);
        enabled.contains(&group).then_some(group)
    }

    /// Mergeable assets split into runs that can each be delivered at their first member's
    /// position. A member starts a new run when one of its dependencies would otherwise be
    /// delivered after the run begins.
    fn plan_segments(
        &self,
        tree: &DependencyTree,
        enabled: &[AssetGroup],
        excluded: &HashSet<String>,
    ) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut open: HashMap<AssetGroup, usize> = HashMap::new();
        let mut planned: HashMap<&str, usize> = HashMap::new();

        for (pos, asset) in tree.iter().enumerate() {
            let Some(group) = self.bundle_group(asset, enabled, excluded) else {
                planned.insert(asset.handle.as_str(), pos);
                continue;
            };

            let joinable = open.get(&group).copied().filter(|&idx| {
                let segment = &segments[idx];
                asset.deps.iter().all(|dep| {
                    segment.contains(dep)
                        || planned
                            .get(dep.as_str())
                            .is_none_or(|&at| at < segment.start)
                })
            });
            let idx = joinable.unwrap_or_else(|| {
                segments.push(Segment {
                    group,
                    start: pos,
                    assets: Vec::new(),
                });
                open.insert(group, segments.len() - 1);
                segments.len() - 1
            });
            segments[idx].assets.push(asset.clone());
            planned.insert(asset.handle.as_str(), segments[idx].start);
        }
        segments
    }

    /// Content-hash key over the ordered `(handle, version)` pairs.
    pub fn cache_key(assets: &[AssetDescriptor]) -> String {
        let mut hasher = Sha256::new();
        for asset in assets {
            hasher.update(asset.handle.as_bytes());
            hasher.update([0]);
            hasher.update(asset.version.as_deref().unwrap_or("").as_bytes());
            hasher.update([0xff]);
        }
        let mut key = hex::encode(hasher.finalize());
        key.truncate(KEY_LEN);
        key
    }

    /// Bundle for `assets`, reusing a fresh artifact when one exists.
    ///
    /// Unreachable sources are skipped and the bundle is built from the rest. Concurrent calls for
    /// the same key wait for one build instead of repeating it.
    pub async fn merge(
        &self,
        kind: AssetKind,
        group: AssetGroup,
        assets: &[AssetDescriptor],
    ) -> Result<Bundle, MergeError> {
        let key = Self::cache_key(assets);
        if let Some(bundle) = self.fresh(kind, group, &key)? {
            counter!(METRIC_REUSED, "type" => kind.as_str()).increment(1);
            return Ok(bundle);
        }

        let lock_key = format!("{kind}-{group}-{key}");
        let lock = self.locks.entry(lock_key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            match self.fresh(kind, group, &key)? {
                Some(bundle) => {
                    counter!(METRIC_REUSED, "type" => kind.as_str()).increment(1);
                    Ok(bundle)
                }
                None => self.build(kind, group, key, assets).await,
            }
        };
        self.locks
            .remove_if(&lock_key, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    fn fresh(
        &self,
        kind: AssetKind,
        group: AssetGroup,
        key: &str,
    ) -> Result<Option<Bundle>, MergeError> {
        Ok(self
            .bundles
            .load(kind, group, key)?
            .filter(|bundle| !self.staleness.is_stale(&bundle.path, &bundle.meta.local_files)))
    }

    async fn build(
        &self,
        kind: AssetKind,
        group: AssetGroup,
        key: String,
        assets: &[AssetDescriptor],
    ) -> Result<Bundle, MergeError> {
        let started = Instant::now();
        let minify = self.options.minify(kind);
        let mut content = String::new();
        let mut handles = Vec::with_capacity(assets.len());
        let mut sources = Vec::with_capacity(assets.len());
        let mut local_files = Vec::new();

        for asset in assets {
            let fetched = match self.fetcher.fetch(&asset.src).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        handle = %asset.handle,
                        src = %asset.src,
                        error = %err,
                        "Skipping unreachable asset source"
                    );
                    continue;
                }
            };

            let body = match kind {
                AssetKind::Style => {
                    let rewritten = rewrite_urls(&fetched.content, &fetched.base);
                    if minify { minify_css(&rewritten) } else { rewritten }
                }
                AssetKind::Script if minify => minify_js(&fetched.content),
                AssetKind::Script => fetched.content.to_string(),
            };

            content.push_str(&format!("/* {}: {} */\n", asset.handle, asset.src));
            let body = body.trim_end();
            content.push_str(body);
            if kind == AssetKind::Script && !body.ends_with(';') {
                content.push(';');
            }
            content.push('\n');

            handles.push(asset.handle.clone());
            sources.push(asset.src.clone());
            local_files.extend(fetched.local_path);
        }

        if handles.is_empty() {
            return Err(MergeError::NoSources { kind, group });
        }
        if kind == AssetKind::Style {
            content = self.fonts.enforce_display(&content);
        }

        let meta = BundleMeta {
            kind,
            group,
            key,
            handles,
            sources,
            local_files,
            size: content.len() as u64,
            created: OffsetDateTime::now_utc(),
        };
        let bundle = self.bundles.write(&content, meta)?;

        counter!(METRIC_BUILT, "type" => kind.as_str()).increment(1);
        info!(
            target = SOURCE,
            kind = %kind,
            group = %group,
            key = %bundle.meta.key,
            handles = bundle.meta.handles.len(),
            size = bundle.meta.size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bundle built"
        );
        Ok(bundle)
    }

    /// References to emit for `tree`. Each mergeable run of a group is collapsed into one bundle
    /// placed where its first bundled member stood, and no reference ever precedes one of its
    /// dependencies. Members skipped during the build and every member of a failed run keep their
    /// own references.
    pub async fn optimize(
        &self,
        kind: AssetKind,
        tree: &DependencyTree,
        ctx: &RequestContext,
    ) -> Vec<AssetReference> {
        if self.test_mode.enabled && !self.test_mode.admits(ctx.client_ip, &ctx.roles) {
            debug!(target = SOURCE, url = %ctx.url, "Test mode active; serving unmerged assets");
            return tree
                .iter()
                .map(|asset| AssetReference::single(asset, false))
                .collect();
        }

        let excluded: HashSet<String> = self
            .classifier
            .rules()
            .exclude_handles(Vec::new(), ctx)
            .into_iter()
            .collect();
        let segments = self.plan_segments(tree, self.options.enabled_groups(kind), &excluded);

        let mut bundles: Vec<(Bundle, bool)> = Vec::with_capacity(segments.len());
        for segment in segments {
            match self.merge(kind, segment.group, &segment.assets).await {
                Ok(bundle) => {
                    let defer = kind == AssetKind::Script
                        && self.options.defer_scripts
                        && bundle
                            .meta
                            .handles
                            .iter()
                            .all(|handle| self.classifier.can_defer(handle));
                    bundles.push((bundle, defer));
                }
                Err(err) => {
                    counter!(METRIC_FALLBACK, "type" => kind.as_str()).increment(1);
                    warn!(
                        target = SOURCE,
                        kind = %kind,
                        group = %segment.group,
                        error = %err,
                        "Merge failed; falling back to individual assets"
                    );
                }
            }
        }

        // Members skipped during a build are delivered on their own, which can land them after a
        // bundle that needs them. Such bundles are dissolved until the order holds.
        let mut active = vec![true; bundles.len()];
        loop {
            let placement = self.place(kind, tree, &bundles, &active);
            match placement.misordered_bundle(tree) {
                Some(idx) => {
                    counter!(METRIC_FALLBACK, "type" => kind.as_str()).increment(1);
                    debug!(
                        target = SOURCE,
                        kind = %kind,
                        key = %bundles[idx].0.meta.key,
                        "Bundle would precede a dependency; delivering members individually"
                    );
                    active[idx] = false;
                }
                None => return placement.into_references(tree),
            }
        }
    }

    fn place(
        &self,
        kind: AssetKind,
        tree: &DependencyTree,
        bundles: &[(Bundle, bool)],
        active: &[bool],
    ) -> Placement {
        let mut anchors: HashMap<&str, usize> = HashMap::new();
        let mut owner: HashMap<String, usize> = HashMap::new();
        for (idx, (bundle, _)) in bundles.iter().enumerate() {
            if !active[idx] {
                continue;
            }
            if let Some(first) = bundle.meta.handles.first() {
                anchors.insert(first.as_str(), idx);
            }
            for handle in &bundle.meta.handles {
                owner.insert(handle.clone(), idx);
            }
        }

        let mut references = Vec::with_capacity(tree.len());
        let mut at: HashMap<String, usize> = HashMap::new();
        for asset in tree {
            if let Some(&idx) = anchors.get(asset.handle.as_str()) {
                let (bundle, defer) = &bundles[idx];
                for handle in &bundle.meta.handles {
                    at.insert(handle.clone(), references.len());
                }
                references.push(AssetReference::bundle(bundle, *defer));
            } else if !owner.contains_key(&asset.handle) {
                let defer = kind == AssetKind::Script
                    && self.options.defer_scripts
                    && self.classifier.can_defer(&asset.handle);
                at.insert(asset.handle.clone(), references.len());
                references.push(AssetReference::single(asset, defer));
            }
        }

        Placement {
            references,
            at,
            owner,
        }
    }
}

/// A run of same-group assets merged into one bundle.
#[derive(Debug)]
struct Segment {
    group: AssetGroup,
    /// Tree position of the first member.
    start: usize,
    assets: Vec<AssetDescriptor>,
}

impl Segment {
    fn contains(&self, handle: &str) -> bool {
        self.assets.iter().any(|asset| asset.handle == handle)
    }
}

/// Emitted references plus where each handle ended up.
struct Placement {
    references: Vec<AssetReference>,
    /// Handle -> index into `references`.
    at: HashMap<String, usize>,
    /// Bundled handle -> index of its bundle.
    owner: HashMap<String, usize>,
}

impl Placement {
    /// Bundle to dissolve when some asset is delivered before one of its dependencies.
    fn misordered_bundle(&self, tree: &DependencyTree) -> Option<usize> {
        let positions: HashMap<&str, usize> = tree
            .iter()
            .enumerate()
            .map(|(pos, asset)| (asset.handle.as_str(), pos))
            .collect();

        for (pos, asset) in tree.iter().enumerate() {
            let Some(&emitted) = self.at.get(&asset.handle) else {
                continue;
            };
            for dep in &asset.deps {
                // Unknown dependencies and cycle back-edges carry no ordering.
                if positions.get(dep.as_str()).is_none_or(|&dep_pos| dep_pos >= pos) {
                    continue;
                }
                let Some(&dep_emitted) = self.at.get(dep) else {
                    continue;
                };
                if dep_emitted > emitted {
                    return self
                        .owner
                        .get(&asset.handle)
                        .or_else(|| self.owner.get(dep))
                        .copied();
                }
            }
        }
        None
    }

    /// Final references. A deferred script runs after every blocking one, so a blocking
    /// reference keeps its dependencies blocking too.
    fn into_references(mut self, tree: &DependencyTree) -> Vec<AssetReference> {
        let mut members: Vec<Vec<&AssetDescriptor>> = vec![Vec::new(); self.references.len()];
        for asset in tree {
            if let Some(&idx) = self.at.get(&asset.handle) {
                members[idx].push(asset);
            }
        }
        for idx in (0..self.references.len()).rev() {
            if self.references[idx].defer {
                continue;
            }
            for asset in &members[idx] {
                for dep in &asset.deps {
                    if let Some(&dep_idx) = self.at.get(dep)
                        && dep_idx < idx
                    {
                        self.references[dep_idx].defer = false;
                    }
                }
            }
        }
        self.references
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, num::NonZeroUsize, time::Duration};

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tempfile::TempDir;
    use url::Url;

    use super::*;
    use crate::{
        application::rules::Rule,
        assets::graph::DependencyGraphBuilder,
        assets::types::AssetRegistry,
        config::{CompatSettings, MergeSettings},
    };

    struct Fixture {
        _root: TempDir,
        docs: PathBuf,
        engine: MergeEngine,
    }

    fn fixture(options: MergeOptions, rules: RuleChain, test_mode: TestModeSettings) -> Fixture {
        let root = TempDir::new().expect("temp dir");
        let docs = root.path().join("public");
        fs::create_dir_all(docs.join("wp-content/themes/t")).expect("theme dir");
        fs::create_dir_all(docs.join("wp-content/plugins/p")).expect("plugin dir");

        let fetcher = SourceFetcher::new(
            Url::parse("https://example.test/").expect("url"),
            &docs,
            reqwest::Client::new(),
            Duration::from_secs(60),
            NonZeroUsize::new(8).expect("capacity"),
        );
        let classifier =
            AssetClassifier::new(&MergeSettings::default(), &CompatSettings::default(), rules);
        let engine = MergeEngine::new(
            classifier,
            fetcher,
            BundleStore::new(root.path().join("bundles"), "/bundles"),
            options,
            test_mode,
        );
        Fixture {
            _root: root,
            docs,
            engine,
        }
    }

    fn all_groups() -> MergeOptions {
        MergeOptions {
            css_groups: AssetGroup::ALL.to_vec(),
            js_groups: AssetGroup::ALL.to_vec(),
            minify_css: true,
            minify_js: true,
            defer_scripts: true,
        }
    }

    fn tree(assets: Vec<AssetDescriptor>) -> DependencyTree {
        let handles: Vec<String> = assets.iter().map(|a| a.handle.clone()).collect();
        let registry: AssetRegistry = assets.into_iter().collect();
        DependencyGraphBuilder::new().build(&registry, &handles)
    }

    #[test]
    fn cache_key_tracks_versions() {
        let a1 = AssetDescriptor::script("a", "/a.js").with_version("1");
        let b1 = AssetDescriptor::script("b", "/b.js")
            .with_version("1")
            .with_deps(["a"]);

        let key = MergeEngine::cache_key(&[a1.clone(), b1.clone()]);
        assert_eq!(key.len(), KEY_LEN);
        assert_eq!(key, MergeEngine::cache_key(&[a1.clone(), b1.clone()]));

        let a2 = a1.clone().with_version("2");
        assert_ne!(key, MergeEngine::cache_key(&[a2, b1.clone()]));
        assert_ne!(key, MergeEngine::cache_key(&[b1, a1]));
    }

    #[test]
    fn grouping_skips_print_media_and_disabled_groups() {
        let options = MergeOptions {
            css_groups: vec![AssetGroup::A],
            ..all_groups()
        };
        let fx = fixture(options, RuleChain::new(), TestModeSettings::default());
        let tree = tree(vec![
            AssetDescriptor::style("theme", "/wp-content/themes/t/style.css"),
            AssetDescriptor::style("theme-print", "/wp-content/themes/t/print.css")
                .with_media("print"),
            AssetDescriptor::style("other", "/vendor/other.css"),
        ]);

        let groups = fx.engine.group_assets(&tree, &[AssetGroup::A]);

        assert_eq!(groups.len(), 1);
        let handles: Vec<&str> = groups[&AssetGroup::A]
            .iter()
            .map(|a| a.handle.as_str())
            .collect();
        assert_eq!(handles, ["theme"]);
    }

    #[test]
    fn merge_builds_then_reuses_bundle() {
        let fx = fixture(all_groups(), RuleChain::new(), TestModeSettings::default());
        fs::write(
            fx.docs.join("wp-content/themes/t/style.css"),
            "/* theme */\nbody { margin : 0px; background: url(img/bg.png); }\n@font-face { font-family: T; src: url(t.woff2); }",
        )
        .expect("seed css");
        let assets = vec![
            AssetDescriptor::style("theme", "/wp-content/themes/t/style.css").with_version("3"),
            AssetDescriptor::style("missing", "/wp-content/themes/t/none.css"),
        ];

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let (first, second) = metrics::with_local_recorder(&recorder, || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime")
                .block_on(async {
                    let first = fx
                        .engine
                        .merge(AssetKind::Style, AssetGroup::A, &assets)
                        .await
                        .expect("merge");
                    let second = fx
                        .engine
                        .merge(AssetKind::Style, AssetGroup::A, &assets)
                        .await
                        .expect("merge again");
                    (first, second)
                })
        });

        assert_eq!(first, second);
        assert_eq!(first.meta.handles, ["theme"]);
        assert_eq!(first.meta.local_files.len(), 1);
        let css = fs::read_to_string(&first.path).expect("bundle");
        assert!(css.starts_with("/* theme: /wp-content/themes/t/style.css */\n"));
        assert!(css.contains("margin:0"));
        assert!(css.contains(r#"url("https://example.test/wp-content/themes/t/img/bg.png")"#));
        assert!(css.contains("font-display:swap"));

        let counters: Vec<(String, u64)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(count) => Some((key.key().name().to_string(), count)),
                _ => None,
            })
            .collect();
        assert!(counters.contains(&(METRIC_BUILT.to_string(), 1)));
        assert!(counters.contains(&(METRIC_REUSED.to_string(), 1)));
    }

    #[tokio::test]
    async fn merge_without_any_source_fails() {
        let fx = fixture(all_groups(), RuleChain::new(), TestModeSettings::default());
        let err = fx
            .engine
            .merge(
                AssetKind::Script,
                AssetGroup::D,
                &[AssetDescriptor::script("gone", "/gone.js")],
            )
            .await
            .expect_err("nothing to merge");
        assert!(matches!(err, MergeError::NoSources { .. }));
    }

    #[tokio::test]
    async fn optimize_places_bundle_at_first_member_and_defers() {
        let fx = fixture(all_groups(), RuleChain::new(), TestModeSettings::default());
        fs::write(fx.docs.join("wp-content/themes/t/a.js"), "var a = 1").expect("seed");
        fs::write(fx.docs.join("wp-content/themes/t/b.js"), "var b = a + 1;").expect("seed");
        let tree = tree(vec![
            AssetDescriptor::script("jquery", "http://127.0.0.1:9/jquery.js"),
            AssetDescriptor::script("theme-a", "/wp-content/themes/t/a.js"),
            AssetDescriptor::script("theme-b", "/wp-content/themes/t/b.js").with_deps(["theme-a"]),
            AssetDescriptor::script("stripe-checkout", "https://js.stripe.com/v3/"),
        ]);

        let refs = fx
            .engine
            .optimize(AssetKind::Script, &tree, &RequestContext::get("/"))
            .await;

        // jquery shares the theme group but its host refuses connections, so it stays separate.
        let bundle_pos = refs.iter().position(|r| r.bundle).expect("bundle emitted");
        let bundle = &refs[bundle_pos];
        assert_eq!(bundle.handles, ["theme-a", "theme-b"]);
        assert!(bundle.defer);
        assert_eq!(refs[0].handles, ["jquery"]);
        assert!(!refs[0].defer);
        assert_eq!(bundle_pos, 1);
        assert_eq!(refs.len(), 3);
        let stripe = refs
            .iter()
            .find(|r| r.handles == ["stripe-checkout"])
            .expect("stripe kept");
        assert!(!stripe.bundle);
        let content = fs::read_to_string(fx.engine.bundles().dir().join(
            bundle.url.trim_start_matches("/bundles/"),
        ))
        .expect("bundle file");
        assert_eq!(
            content,
            "/* theme-a: /wp-content/themes/t/a.js */\nvar a=1;\n/* theme-b: /wp-content/themes/t/b.js */\nvar b=a + 1;\n"
        );
    }

    fn assert_dependencies_first(refs: &[AssetReference], tree: &DependencyTree) {
        let delivered_at = |handle: &str| {
            refs.iter()
                .position(|r| r.handles.iter().any(|h| h == handle))
                .unwrap_or_else(|| panic!("{handle} not delivered"))
        };
        for asset in tree {
            for dep in &asset.deps {
                assert!(
                    delivered_at(dep) <= delivered_at(&asset.handle),
                    "{} delivered before its dependency {dep}",
                    asset.handle
                );
            }
        }
    }

    #[tokio::test]
    async fn bundle_splits_around_an_unmergeable_dependency() {
        let options = MergeOptions {
            defer_scripts: false,
            ..all_groups()
        };
        let fx = fixture(options, RuleChain::new(), TestModeSettings::default());
        fs::write(fx.docs.join("wp-content/themes/t/a.js"), "var a = 1;").expect("seed");
        fs::write(fx.docs.join("wp-content/themes/t/b.js"), "pay(a);").expect("seed");
        let tree = tree(vec![
            AssetDescriptor::script("theme-a", "/wp-content/themes/t/a.js"),
            AssetDescriptor::script("stripe-x", "https://js.stripe.com/v3/"),
            AssetDescriptor::script("theme-b", "/wp-content/themes/t/b.js").with_deps(["stripe-x"]),
        ]);

        let refs = fx
            .engine
            .optimize(AssetKind::Script, &tree, &RequestContext::get("/"))
            .await;

        let handles: Vec<Vec<String>> = refs.iter().map(|r| r.handles.clone()).collect();
        assert_eq!(handles, [["theme-a"], ["stripe-x"], ["theme-b"]]);
        assert!(refs[0].bundle && refs[2].bundle);
        assert_ne!(refs[0].id, refs[2].id);
        assert_dependencies_first(&refs, &tree);
    }

    #[tokio::test]
    async fn cross_group_dependencies_keep_their_order() {
        let fx = fixture(all_groups(), RuleChain::new(), TestModeSettings::default());
        fs::write(fx.docs.join("wp-content/themes/t/a.css"), "a{}").expect("seed");
        fs::write(fx.docs.join("wp-content/themes/t/b.css"), "b{}").expect("seed");
        fs::write(fx.docs.join("wp-content/plugins/p/woo.css"), "w{}").expect("seed");
        let tree = tree(vec![
            AssetDescriptor::style("theme-a", "/wp-content/themes/t/a.css"),
            AssetDescriptor::style("woocommerce-general", "/wp-content/plugins/p/woo.css"),
            AssetDescriptor::style("theme-b", "/wp-content/themes/t/b.css")
                .with_deps(["woocommerce-general"]),
        ]);

        let refs = fx
            .engine
            .optimize(AssetKind::Style, &tree, &RequestContext::get("/"))
            .await;

        assert!(refs.iter().all(|r| r.bundle));
        assert_eq!(refs.len(), 3);
        assert_dependencies_first(&refs, &tree);
    }

    #[tokio::test]
    async fn bundle_needing_a_skipped_member_is_dissolved() {
        let fx = fixture(all_groups(), RuleChain::new(), TestModeSettings::default());
        fs::write(fx.docs.join("wp-content/themes/t/a.js"), "var a = 1;").expect("seed");
        fs::write(fx.docs.join("wp-content/themes/t/c.js"), "use(b);").expect("seed");
        let tree = tree(vec![
            AssetDescriptor::script("theme-a", "/wp-content/themes/t/a.js"),
            AssetDescriptor::script("theme-b", "/wp-content/themes/t/missing.js"),
            AssetDescriptor::script("theme-c", "/wp-content/themes/t/c.js").with_deps(["theme-b"]),
        ]);

        let refs = fx
            .engine
            .optimize(AssetKind::Script, &tree, &RequestContext::get("/"))
            .await;

        assert!(refs.iter().all(|r| !r.bundle));
        assert_eq!(refs.len(), 3);
        assert_dependencies_first(&refs, &tree);
    }

    struct KeepSeparate;

    impl Rule for KeepSeparate {
        fn name(&self) -> &str {
            "keep-separate"
        }

        fn exclude_handles(&self, mut handles: Vec<String>, _ctx: &RequestContext) -> Vec<String> {
            handles.push("theme-b".to_string());
            handles
        }
    }

    #[tokio::test]
    async fn rule_exclusions_keep_assets_individual() {
        let fx = fixture(
            all_groups(),
            RuleChain::new().with(KeepSeparate),
            TestModeSettings::default(),
        );
        fs::write(fx.docs.join("wp-content/themes/t/a.css"), "a{}").expect("seed");
        fs::write(fx.docs.join("wp-content/themes/t/b.css"), "b{}").expect("seed");
        let tree = tree(vec![
            AssetDescriptor::style("theme-a", "/wp-content/themes/t/a.css"),
            AssetDescriptor::style("theme-b", "/wp-content/themes/t/b.css").with_version("9"),
        ]);

        let refs = fx
            .engine
            .optimize(AssetKind::Style, &tree, &RequestContext::get("/"))
            .await;

        assert_eq!(refs.len(), 2);
        assert!(refs[0].bundle);
        assert_eq!(refs[1].url, "/wp-content/themes/t/b.css?ver=9");
        assert!(!refs[1].bundle);
    }

    #[tokio::test]
    async fn test_mode_limits_merging_to_testers() {
        let test_mode = TestModeSettings {
            enabled: true,
            allowed_roles: vec!["administrator".to_string()],
            allowed_ips: Vec::new(),
        };
        let fx = fixture(all_groups(), RuleChain::new(), test_mode);
        fs::write(fx.docs.join("wp-content/themes/t/a.css"), "a{}").expect("seed");
        let tree = tree(vec![AssetDescriptor::style(
            "theme-a",
            "/wp-content/themes/t/a.css",
        )]);

        let visitor = fx
            .engine
            .optimize(AssetKind::Style, &tree, &RequestContext::get("/"))
            .await;
        assert!(!visitor[0].bundle);

        let tester = RequestContext::get("/").with_roles(vec!["administrator".to_string()]);
        let tester_refs = fx.engine.optimize(AssetKind::Style, &tree, &tester).await;
        assert!(tester_refs[0].bundle);
    }
}
