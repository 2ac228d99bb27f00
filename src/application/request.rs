//! Per-request view consumed by the cache, the merge engine and the rule chain.

use std::{collections::BTreeMap, net::IpAddr};

use axum::http::{HeaderMap, Method, Uri, header};
use url::form_urlencoded;

/// Roles of the authenticated visitor, inserted as a request extension by the origin.
#[derive(Debug, Clone, Default)]
pub struct VisitorRoles(pub Vec<String>);

/// Snapshot of the request attributes that influence caching and asset delivery.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Path and query as requested, e.g. `/about/?ref=nav`.
    pub url: String,
    pub user_agent: Option<String>,
    pub cookies: BTreeMap<String, String>,
    pub client_ip: Option<IpAddr>,
    pub roles: Vec<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            method: Method::GET,
            url: "/".to_string(),
            user_agent: None,
            cookies: BTreeMap::new(),
            client_ip: None,
            roles: Vec::new(),
        }
    }
}

impl RequestContext {
    /// A plain GET for `url` with no headers.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut cookies = BTreeMap::new();
        for value in headers.get_all(header::COOKIE) {
            if let Ok(raw) = value.to_str() {
                cookies.extend(parse_cookie_header(raw));
            }
        }

        Self {
            method: method.clone(),
            url,
            user_agent,
            cookies,
            client_ip: client_ip(headers),
            roles: Vec::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn path(&self) -> &str {
        let without_fragment = self.url.split('#').next().unwrap_or_default();
        without_fragment.split('?').next().unwrap_or_default()
    }

    pub fn query(&self) -> Option<&str> {
        let without_fragment = self.url.split('#').next().unwrap_or_default();
        without_fragment.split_once('?').map(|(_, query)| query)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query()?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn is_read_only(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

fn parse_cookie_header(raw: &str) -> impl Iterator<Item = (String, String)> + '_ {
    raw.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
    })
}

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn from_parts_collects_cookies_agent_and_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("currency=EUR; session_token=abc"),
        );
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let uri: Uri = "/shop/?page=2".parse().expect("uri");

        let ctx = RequestContext::from_parts(&Method::GET, &uri, &headers);

        assert_eq!(ctx.url, "/shop/?page=2");
        assert_eq!(ctx.path(), "/shop/");
        assert_eq!(ctx.query_param("page").as_deref(), Some("2"));
        assert_eq!(ctx.cookie("currency"), Some("EUR"));
        assert_eq!(ctx.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(
            ctx.client_ip,
            Some("203.0.113.9".parse().expect("ip literal"))
        );
    }

    #[test]
    fn path_ignores_fragment_and_query() {
        let ctx = RequestContext::get("/docs/?q=1#intro");
        assert_eq!(ctx.path(), "/docs/");
        assert_eq!(ctx.query(), Some("q=1"));
    }
}
