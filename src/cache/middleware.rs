//! Page cache middleware for the origin's render router.
//!
//! Eligible requests are answered from storage when a fresh entry exists. Misses run the inner
//! handler and offer complete HTML responses back to the cache.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use bytes::BytesMut;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use crate::application::request::{RequestContext, VisitorRoles};

use super::{CacheStore, serve::X_CACHE};

/// Upper bound on buffered response bodies.
const MAX_BUFFERED_BODY: usize = 8 * 1024 * 1024;

/// Response extension naming the content entity a page renders, recorded in the entry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntity(pub u64);

#[derive(Clone)]
pub struct PageCacheState {
    pub cache: Arc<CacheStore>,
}

impl PageCacheState {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(state): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cache = state.cache;
    let roles = request
        .extensions()
        .get::<VisitorRoles>()
        .map(|roles| roles.0.clone())
        .unwrap_or_default();
    let ctx = RequestContext::from_parts(request.method(), request.uri(), request.headers())
        .with_roles(roles);

    if !cache.should_cache(&ctx) {
        return next.run(request).await;
    }

    let key = cache.key(&ctx);
    if cache.has_valid(&key, &ctx)
        && let Some(response) = cache.serve(&key, &ctx, request.headers())
    {
        debug!(cache = "page", outcome = "hit", key = %key, "Serving cached page");
        return response;
    }

    cache.record_miss();
    debug!(cache = "page", outcome = "miss", key = %key, "Rendering page");
    let response = next.run(request).await;

    if ctx.method != Method::GET || !is_storable(&response) {
        return response;
    }

    let entity_id = response.extensions().get::<CacheEntity>().map(|entity| entity.0);
    let (mut parts, body) = response.into_parts();
    parts
        .headers
        .insert(X_CACHE, HeaderValue::from_static("MISS"));

    if body.size_hint().lower() > MAX_BUFFERED_BODY as u64 {
        debug!(url = %ctx.url, "Rendered page exceeds the buffer limit; not caching");
        return Response::from_parts(parts, body);
    }

    let bytes = match buffer_page(body).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Passthrough(body) => {
            debug!(url = %ctx.url, "Rendered page not buffered; not caching");
            return Response::from_parts(parts, body);
        }
    };

    match std::str::from_utf8(&bytes) {
        Ok(html) => {
            cache.process_output(&key, &ctx, html, entity_id);
        }
        Err(_) => debug!(url = %ctx.url, "Rendered page is not UTF-8; not caching"),
    }

    Response::from_parts(parts, Body::from(bytes))
}

enum Buffered {
    Complete(Bytes),
    /// Body handed back unchanged: what was read so far followed by the rest of the stream.
    Passthrough(Body),
}

/// Buffer `body` up to [`MAX_BUFFERED_BODY`]. Oversized or failing bodies are relayed to the
/// client as they are.
async fn buffer_page(mut body: Body) -> Buffered {
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buffer.extend_from_slice(&data);
                if buffer.len() > MAX_BUFFERED_BODY {
                    let head = stream::once(async move { Ok(buffer.freeze()) });
                    return Buffered::Passthrough(Body::from_stream(
                        head.chain(body.into_data_stream()),
                    ));
                }
            }
            Err(err) => {
                warn!(error = %err, "Rendered page body failed while buffering");
                let read = stream::iter([Ok(buffer.freeze()), Err(err)]);
                return Buffered::Passthrough(Body::from_stream(read));
            }
        }
    }
    Buffered::Complete(buffer.freeze())
}

fn is_storable(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }
    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("text/html"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, content_type: &str) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).expect("header"),
        );
        response
    }

    #[test]
    fn only_plain_html_successes_are_storable() {
        assert!(is_storable(&response(StatusCode::OK, "text/html; charset=utf-8")));
        assert!(!is_storable(&response(StatusCode::OK, "application/json")));
        assert!(!is_storable(&response(StatusCode::NOT_FOUND, "text/html")));

        let mut with_cookie = response(StatusCode::OK, "text/html");
        with_cookie
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static("a=b"));
        assert!(!is_storable(&with_cookie));
    }
}
