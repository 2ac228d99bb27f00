//! Outbound HTTP client construction.
//!
//! Every outbound call (remote asset fetch, preload crawl, CDN purge) goes through a client with
//! an explicit timeout and redirect cap so a slow peer degrades to a recoverable error.

use std::time::Duration;

use reqwest::{Client, redirect::Policy};

use crate::infra::error::InfraError;

pub const USER_AGENT: &str = concat!("spry/", env!("CARGO_PKG_VERSION"));

/// Timeout and redirect limits for one family of outbound calls.
#[derive(Debug, Clone, Copy)]
pub struct ClientLimits {
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl ClientLimits {
    pub const fn new(timeout: Duration, max_redirects: usize) -> Self {
        Self {
            timeout,
            max_redirects,
        }
    }
}

pub fn build_client(limits: ClientLimits) -> Result<Client, InfraError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(limits.timeout)
        .connect_timeout(limits.timeout)
        .redirect(Policy::limited(limits.max_redirects))
        .build()
        .map_err(|err| InfraError::http(format!("failed to build http client: {err}")))
}
