//! Page cache configuration derived from the `[cache]` and `[test_mode]` sections.

use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::config::{CacheSettings, TestModeSettings};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub ttl: Duration,
    pub vary_device: bool,
    pub vary_cookies: Vec<String>,
    pub excluded_query_params: Vec<String>,
    /// Lowercase language codes; empty disables language variation.
    pub languages: Vec<String>,
    pub excluded_paths: Vec<String>,
    pub bypass_cookie_prefixes: Vec<String>,
    pub min_html_bytes: usize,
    /// Auto-consume interval for queued purge events.
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: usize,
    pub test_mode: TestModeSettings,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            directory: settings.directory.clone(),
            ttl: settings.ttl,
            vary_device: settings.vary_device,
            vary_cookies: settings.vary_cookies.clone(),
            excluded_query_params: settings.excluded_query_params.clone(),
            languages: settings.languages.clone(),
            excluded_paths: settings.excluded_paths.clone(),
            bypass_cookie_prefixes: settings.bypass_cookie_prefixes.clone(),
            min_html_bytes: settings.min_html_bytes,
            auto_consume_interval: settings.auto_consume_interval,
            consume_batch_limit: settings.consume_batch_limit.get(),
            test_mode: TestModeSettings::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_test_mode(mut self, test_mode: &TestModeSettings) -> Self {
        self.test_mode = test_mode.clone();
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a visitor is part of the test-mode audience.
    pub fn is_tester(&self, client_ip: Option<IpAddr>, roles: &[String]) -> bool {
        self.test_mode.admits(client_ip, roles)
    }

    pub fn varies_by_language(&self) -> bool {
        !self.languages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_settings_defaults() {
        let config = CacheConfig::default();
        assert!(config.is_enabled());
        assert!(!config.vary_device);
        assert!(!config.varies_by_language());
        assert_eq!(config.consume_batch_limit, 100);
        assert!(config.excluded_paths.iter().any(|path| path == "/admin"));
    }

    #[test]
    fn tester_requires_enabled_test_mode() {
        let ip: IpAddr = "10.1.1.1".parse().expect("ip");
        let mut test_mode = TestModeSettings {
            enabled: false,
            allowed_roles: vec!["editor".to_string()],
            allowed_ips: vec![ip],
        };
        let config = CacheConfig::default().with_test_mode(&test_mode);
        assert!(!config.is_tester(Some(ip), &[]));

        test_mode.enabled = true;
        let config = config.with_test_mode(&test_mode);
        assert!(config.is_tester(Some(ip), &[]));
        assert!(config.is_tester(None, &["editor".to_string()]));
        assert!(!config.is_tester(None, &["subscriber".to_string()]));
    }
}
