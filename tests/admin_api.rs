//! Admin API routes exercised in-process.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use spry::{
    application::{context::AppContext, rules::RuleChain},
    config,
    infra::http::build_admin_router,
};
use tempfile::TempDir;
use tower::ServiceExt;

fn router(root: &TempDir) -> (AppContext, Router) {
    let settings = config::from_toml(&format!(
        r#"
        [site]
        url = "https://example.test/"

        [cache]
        directory = "{root}/pages"

        [merge]
        bundle_dir = "{root}/bundles"

        [preload]
        state_path = "{root}/preload-state.json"
        config_path = "{root}/preload.json"
        "#,
        root = root.path().display(),
    ))
    .expect("settings");
    let app = AppContext::build(settings, RuleChain::new()).expect("context");
    let router = build_admin_router(app.admin_state());
    (app, router)
}

async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    json: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match json {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(request.body(body).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn health_and_stats_report_an_empty_deployment() {
    let root = TempDir::new().expect("temp dir");
    let (_app, router) = router(&root);

    let (status, body) = call(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&router, Method::GET, "/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pages"]["files"], 0);
    assert_eq!(body["bundles"]["files"], 0);
    assert!(body["pages"]["oldest"].is_null());
}

#[tokio::test]
async fn purges_return_reports() {
    let root = TempDir::new().expect("temp dir");
    let (app, router) = router(&root);
    let key = app.cache.key_for("/about/", &Default::default());
    assert!(app.cache.store(&key, "/about/", "<html></html>", Some(3)));

    let (status, body) = call(
        &router,
        Method::POST,
        "/purge/url",
        Some(r#"{"url": "/about/", "no_cdn": true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);
    assert_eq!(body["cdn"], serde_json::json!([]));

    let (status, body) = call(&router, Method::POST, "/purge/all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);

    let (status, body) = call(&router, Method::POST, "/purge/entity/9", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);

    let (status, body) = call(&router, Method::POST, "/bundles/purge", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);
}

#[tokio::test]
async fn invalid_requests_map_to_json_errors() {
    let root = TempDir::new().expect("temp dir");
    let (_app, router) = router(&root);

    let (status, body) = call(
        &router,
        Method::POST,
        "/purge/url",
        Some(r#"{"url": "  "}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(&router, Method::POST, "/preload/deadbeef/reject", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["hint"], "unknown recommendation `deadbeef`");

    let (status, body) = call(&router, Method::GET, "/preload/recommendations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recommendations"], serde_json::json!([]));
    assert_eq!(body["rejected"], serde_json::json!({}));
}

#[tokio::test]
async fn change_notifications_are_queued_for_the_consumer() {
    let root = TempDir::new().expect("temp dir");
    let (app, router) = router(&root);
    let key = app.cache.key_for("/about/", &Default::default());
    assert!(app.cache.store(&key, "/about/", "<html></html>", None));

    let (status, body) = call(&router, Method::POST, "/events/entity/9", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], 1);

    let (status, body) = call(
        &router,
        Method::POST,
        "/events/url",
        Some(r#"{"url": "/about/"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], 2);

    let (status, _) = call(&router, Method::POST, "/events/url", Some(r#"{"url": ""}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&router, Method::POST, "/events/settings", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], 3);
    assert_eq!(app.cache.stats().expect("stats").files, 1);

    assert!(app.consumer.consume().await);
    assert!(app.trigger.queue().is_empty());
    assert_eq!(app.cache.stats().expect("stats").files, 0);
}
