//! Conditional HTTP responses for cached pages.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};

use super::store::CachedPage;

pub const X_CACHE: &str = "x-cache";

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn format_http_date(at: OffsetDateTime) -> Option<String> {
    at.to_offset(UtcOffset::UTC).format(HTTP_DATE).ok()
}

pub fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(raw.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Strong validator derived from the stored bytes.
pub fn entity_tag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", &hex::encode(digest)[..32])
}

/// Build the response for a cache hit: `304 Not Modified` when the request's validators match,
/// otherwise the full payload (headers only for `HEAD`).
pub fn conditional_response(
    page: &CachedPage,
    ttl: Duration,
    request_headers: &HeaderMap,
    head_only: bool,
    now: OffsetDateTime,
) -> Response {
    let etag = entity_tag(&page.body);
    let last_modified = page.meta.created;

    let not_modified = match request_headers.get(header::IF_NONE_MATCH) {
        Some(value) => value
            .to_str()
            .map(|candidates| etag_matches(candidates, &etag))
            .unwrap_or(false),
        None => request_headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date)
            .is_some_and(|since| last_modified.unix_timestamp() <= since.unix_timestamp()),
    };

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let mut response = if head_only {
            Response::new(Body::empty())
        } else {
            Response::new(Body::from(page.body.clone()))
        };
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(page.body.len()));
        response
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", ttl.as_secs())) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    let expires_at = now + ttl;
    if let Some(value) = format_http_date(expires_at).and_then(|s| HeaderValue::from_str(&s).ok())
    {
        headers.insert(header::EXPIRES, value);
    }
    if let Some(value) =
        format_http_date(last_modified).and_then(|s| HeaderValue::from_str(&s).ok())
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));

    response
}

fn etag_matches(candidates: &str, etag: &str) -> bool {
    candidates.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
    })
}
