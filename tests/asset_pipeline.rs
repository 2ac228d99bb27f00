//! Dependency graph → merge → render, wired from settings the way the binary does it.

use std::{fs, path::Path};

use spry::{
    application::{context::AppContext, request::RequestContext, rules::RuleChain},
    assets::{AssetDescriptor, AssetKind, AssetRegistry, DependencyGraphBuilder, MergeEngine},
    config,
};
use tempfile::TempDir;

fn context(root: &Path) -> AppContext {
    let docs = root.join("public");
    fs::create_dir_all(docs.join("wp-content/themes/t")).expect("theme dir");
    fs::write(docs.join("wp-content/themes/t/a.css"), "a { color: red; }").expect("seed");
    fs::write(docs.join("wp-content/themes/t/b.css"), "b { color: blue; }").expect("seed");
    fs::write(root.join("critical.css"), "body{margin:0}").expect("seed");
    fs::write(
        root.join("preload.json"),
        r#"{"entries": [{"url": "https://example.test/fonts/inter.woff2", "type": "font"}]}"#,
    )
    .expect("seed");

    let settings = config::from_toml(&format!(
        r#"
        [site]
        url = "https://example.test/"
        document_root = "{root}/public"

        [cache]
        directory = "{root}/pages"

        [merge]
        css_groups = ["a", "b"]
        bundle_dir = "{root}/bundles"
        bundle_url = "/bundles"
        critical_css = "{root}/critical.css"

        [preload]
        state_path = "{root}/preload-state.json"
        config_path = "{root}/preload.json"
        "#,
        root = root.display()
    ))
    .expect("settings");

    AppContext::build(settings, RuleChain::new()).expect("context")
}

fn registry(a_version: &str) -> AssetRegistry {
    [
        AssetDescriptor::style("theme-a", "/wp-content/themes/t/a.css").with_version(a_version),
        AssetDescriptor::style("theme-b", "/wp-content/themes/t/b.css")
            .with_version("1")
            .with_deps(["theme-a"]),
    ]
    .into_iter()
    .collect()
}

#[test]
fn dependencies_come_first_and_key_follows_versions() {
    let builder = DependencyGraphBuilder::new();
    let tree = builder.build(&registry("1"), &["theme-b", "theme-a"]);
    assert_eq!(tree.handles(), ["theme-a", "theme-b"]);

    let assets: Vec<AssetDescriptor> = tree.iter().cloned().collect();
    let key = MergeEngine::cache_key(&assets);
    let again: Vec<AssetDescriptor> = builder
        .build(&registry("1"), &["theme-b", "theme-a"])
        .iter()
        .cloned()
        .collect();
    assert_eq!(key, MergeEngine::cache_key(&again));

    let bumped: Vec<AssetDescriptor> = builder
        .build(&registry("2"), &["theme-b", "theme-a"])
        .iter()
        .cloned()
        .collect();
    assert_ne!(key, MergeEngine::cache_key(&bumped));
}

#[tokio::test]
async fn queued_styles_render_as_one_bundle_with_head_directives() {
    let root = TempDir::new().expect("temp dir");
    let app = context(root.path());
    let ctx = RequestContext::get("/");

    let tree = DependencyGraphBuilder::new().build(&registry("1"), &["theme-b"]);
    let styles = app.merge.optimize(AssetKind::Style, &tree, &ctx).await;
    assert_eq!(styles.len(), 1);
    assert!(styles[0].bundle);
    assert_eq!(styles[0].handles, ["theme-a", "theme-b"]);
    assert!(styles[0].url.starts_with("/bundles/style-a-"));

    let reused = app.merge.optimize(AssetKind::Style, &tree, &ctx).await;
    assert_eq!(reused[0].url, styles[0].url);

    let head = app.head_directives().render(&ctx, &styles, &[]);
    let critical = head.find("spry-critical-css").expect("critical css");
    let preload = head
        .find(r#"<link rel="preload" href="https://example.test/fonts/inter.woff2" as="font" crossorigin>"#)
        .expect("preload link");
    let bundle = head.find(&styles[0].url).expect("bundle link");
    assert!(critical < preload && preload < bundle);

    let bumped = DependencyGraphBuilder::new().build(&registry("2"), &["theme-b"]);
    let rebuilt = app.merge.optimize(AssetKind::Style, &bumped, &ctx).await;
    assert_ne!(rebuilt[0].url, styles[0].url);

    let bundles = app.merge.bundles();
    assert_eq!(bundles.stats().expect("stats").files, 2);
    assert_eq!(bundles.purge_all().expect("purge"), 2);
    assert_eq!(bundles.stats().expect("stats").files, 0);
}
