//! Page cache behaviour through an axum render router.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    middleware,
    response::{Html, IntoResponse},
    routing::get,
};
use http_body_util::BodyExt;
use spry::{
    application::rules::RuleChain,
    cache::{
        CacheConfig, CacheStore, DeviceClass, NoEntities, PageCacheState, VariationFactors,
        X_CACHE, page_cache_layer,
    },
    cdn::CdnGateway,
    infra::site::SiteManifest,
};
use tempfile::TempDir;
use tower::ServiceExt;
use url::Url;

fn site_url() -> Url {
    Url::parse("https://example.test/").expect("url")
}

fn page() -> String {
    format!(
        "<!doctype html><html><head><title>About</title></head><body>{}</body></html>",
        "<p>About this site.</p>".repeat(20)
    )
}

fn render_router(cache: Arc<CacheStore>, renders: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/about/",
            get(move || {
                let renders = renders.clone();
                async move {
                    renders.fetch_add(1, Ordering::SeqCst);
                    Html(page())
                }
            }),
        )
        .layer(middleware::from_fn_with_state(
            PageCacheState::new(cache),
            page_cache_layer,
        ))
}

async fn get_about(router: &Router) -> (StatusCode, String, String) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/about/")
                .header(header::USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64)")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let marker = response
        .headers()
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (
        status,
        marker,
        String::from_utf8(body.to_vec()).expect("utf-8"),
    )
}

#[tokio::test]
async fn second_request_is_served_from_storage() {
    let dir = TempDir::new().expect("temp dir");
    let cache = Arc::new(CacheStore::new(
        CacheConfig::default().with_directory(dir.path()),
        RuleChain::new(),
        Arc::new(NoEntities),
        Arc::new(CdnGateway::disabled()),
        site_url(),
    ));
    let renders = Arc::new(AtomicUsize::new(0));
    let router = render_router(cache.clone(), renders.clone());

    let (first_status, first_marker, first_body) = get_about(&router).await;
    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(first_marker, "MISS");
    assert_eq!(cache.stats().expect("stats").files, 1);

    let (second_status, second_marker, second_body) = get_about(&router).await;
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(second_marker, "HIT");
    assert_eq!(renders.load(Ordering::SeqCst), 1);

    assert!(second_body.starts_with(&first_body));
    assert!(second_body.contains("<!-- cached by spry @ "));
    assert!(!first_body.contains("cached by spry"));
}

#[tokio::test]
async fn disabled_cache_always_renders() {
    let dir = TempDir::new().expect("temp dir");
    let config = CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    }
    .with_directory(dir.path());
    let cache = Arc::new(CacheStore::new(
        config,
        RuleChain::new(),
        Arc::new(NoEntities),
        Arc::new(CdnGateway::disabled()),
        site_url(),
    ));
    let renders = Arc::new(AtomicUsize::new(0));
    let router = render_router(cache, renders.clone());

    let (_, first_marker, _) = get_about(&router).await;
    let (_, second_marker, _) = get_about(&router).await;

    assert_eq!(first_marker, "");
    assert_eq!(second_marker, "");
    assert_eq!(renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn entity_purge_removes_every_variation_and_pinned_home() {
    let dir = TempDir::new().expect("temp dir");
    let manifest_path = dir.path().join("site.json");
    std::fs::write(
        &manifest_path,
        r#"{"entities": [{"id": 42, "permalink": "/about/", "pinned": true}]}"#,
    )
    .expect("manifest");
    let manifest = SiteManifest::load(&manifest_path, &site_url()).expect("manifest");

    let config = CacheConfig {
        languages: vec!["en".to_string(), "de".to_string()],
        ..CacheConfig::default()
    }
    .with_directory(dir.path().join("pages"));
    let cache = CacheStore::new(
        config,
        RuleChain::new(),
        Arc::new(manifest),
        Arc::new(CdnGateway::disabled()),
        site_url(),
    );

    let html = page();
    let variants = [
        ("/about/", Some(DeviceClass::Desktop), None),
        ("/about/", Some(DeviceClass::Mobile), Some("de")),
        ("/about/", Some(DeviceClass::Tablet), Some("en")),
        ("/", Some(DeviceClass::Desktop), None),
        ("/contact/", Some(DeviceClass::Desktop), None),
    ];
    for (url, device, language) in variants {
        let factors = VariationFactors {
            device,
            language: language.map(str::to_string),
            ..VariationFactors::default()
        };
        assert!(cache.store(&cache.key_for(url, &factors), url, &html, None));
    }

    let report = cache.purge_entity(42, true).await;

    assert_eq!(report.removed, 4);
    assert!(report.cdn.is_empty());
    let remaining = cache.page_store().entries().expect("entries");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].1.url, cache.normalize("/contact/"));
}

const OVERSIZED: usize = 9 * 1024 * 1024;

fn oversized_router(cache: Arc<CacheStore>) -> Router {
    Router::new()
        .route(
            "/archive/",
            get(|| async { Html(format!("<html><body>{}</body></html>", "x".repeat(OVERSIZED))) }),
        )
        .route(
            "/stream/",
            get(|| async {
                let chunks = (0..9).map(|_| Ok::<_, std::io::Error>(vec![b'y'; 1024 * 1024]));
                (
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    Body::from_stream(futures::stream::iter(chunks)),
                )
                    .into_response()
            }),
        )
        .layer(middleware::from_fn_with_state(
            PageCacheState::new(cache),
            page_cache_layer,
        ))
}

async fn body_len(router: &Router, uri: &str) -> (StatusCode, usize) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, body.len())
}

#[tokio::test]
async fn oversized_pages_are_delivered_uncached() {
    let dir = TempDir::new().expect("temp dir");
    let cache = Arc::new(CacheStore::new(
        CacheConfig::default().with_directory(dir.path()),
        RuleChain::new(),
        Arc::new(NoEntities),
        Arc::new(CdnGateway::disabled()),
        site_url(),
    ));
    let router = oversized_router(cache.clone());

    let (status, len) = body_len(&router, "/archive/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(len, OVERSIZED + "<html><body></body></html>".len());

    let (status, len) = body_len(&router, "/stream/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(len, OVERSIZED);

    assert_eq!(cache.stats().expect("stats").files, 0);
}
