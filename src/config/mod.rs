//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::assets::AssetGroup;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "spry";
const DEFAULT_SITE_URL: &str = "http://localhost/";
const DEFAULT_DOCUMENT_ROOT: &str = "public";
const DEFAULT_CACHE_DIR: &str = "var/cache/pages";
const DEFAULT_CACHE_TTL_SECS: u64 = 36_000;
const DEFAULT_MIN_HTML_BYTES: usize = 255;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_BUNDLE_DIR: &str = "public/spry-bundles";
const DEFAULT_BUNDLE_URL: &str = "/spry-bundles";
const DEFAULT_REMOTE_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REMOTE_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_REMOTE_CACHE_CAPACITY: usize = 64;
const DEFAULT_PRELOAD_STATE_PATH: &str = "var/spry/preload-state.json";
const DEFAULT_PRELOAD_CONFIG_PATH: &str = "var/spry/preload.json";
const DEFAULT_PRELOAD_RECENT_ENTRIES: usize = 5;
const DEFAULT_PRELOAD_MAX_CANDIDATES: usize = 10;
const DEFAULT_PRELOAD_CRAWL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PRELOAD_MAX_REDIRECTS: usize = 3;
const DEFAULT_PRELOAD_MAX_RECOMMENDATIONS: usize = 20;
const DEFAULT_PRELOAD_STALE_AFTER_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_CDN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_BUNNY_API_BASE: &str = "https://api.bunny.net";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 3101;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_PRELOAD_SCHEDULE: &str = "0 30 3 * * *";
const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 * * * *";

/// Command-line arguments for the spry binary.
#[derive(Debug, Parser)]
#[command(
    name = "spry",
    version,
    about = "Page cache, asset merge engine and preload recommender"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SPRY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the admin API, the purge consumer and the scheduled jobs.
    Serve(Box<ServeArgs>),
    /// Purge page cache entries (and the configured CDNs).
    Purge(PurgeArgs),
    /// Report a content or settings change; the resulting purges go through the event pipeline.
    Notify(NotifyArgs),
    /// Remove page cache entries older than the configured TTL.
    Cleanup,
    /// Print page cache and bundle statistics.
    Stats(StatsArgs),
    /// Preload recommendation operations.
    Preload(PreloadArgs),
    /// Merged bundle maintenance.
    Bundles(BundlesArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the page cache directory.
    #[arg(
        long = "cache-dir",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub cache_dir: Option<PathBuf>,

    /// Override the site manifest path.
    #[arg(
        long = "site-manifest",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub site_manifest: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the admin listener host.
    #[arg(long = "admin-host", value_name = "HOST")]
    pub admin_host: Option<String>,

    /// Override the admin listener port.
    #[arg(long = "admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Toggle the scheduled preload and cleanup jobs.
    #[arg(
        long = "scheduler-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub scheduler_enabled: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(subcommand)]
    pub command: PurgeCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum PurgeCommand {
    /// Remove every page cache entry.
    All {
        /// Skip the CDN fan-out.
        #[arg(long = "no-cdn")]
        no_cdn: bool,
    },
    /// Remove every variation of one URL.
    Url {
        #[arg(value_name = "URL")]
        url: String,
        /// Skip the CDN fan-out.
        #[arg(long = "no-cdn")]
        no_cdn: bool,
    },
    /// Remove the pages related to one content entity.
    Entity {
        #[arg(value_name = "ID")]
        id: u64,
        /// Skip the CDN fan-out.
        #[arg(long = "no-cdn")]
        no_cdn: bool,
    },
}

#[derive(Debug, Args, Clone)]
pub struct NotifyArgs {
    #[command(subcommand)]
    pub command: NotifyCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum NotifyCommand {
    /// A content entity was created, updated or deleted.
    Entity {
        #[arg(value_name = "ID")]
        id: u64,
    },
    /// One URL changed.
    Url {
        #[arg(value_name = "URL")]
        url: String,
    },
    /// Site-wide settings changed.
    Settings,
}

#[derive(Debug, Args, Clone, Default)]
pub struct StatsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PreloadArgs {
    #[command(subcommand)]
    pub command: PreloadCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum PreloadCommand {
    /// Crawl candidate pages and refresh the recommendations.
    Run,
    /// List current recommendations.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Copy a recommendation into the preload configuration.
    Accept {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Dismiss a recommendation and remember the dismissal.
    Reject {
        #[arg(value_name = "ID")]
        id: String,
    },
}

#[derive(Debug, Args, Clone)]
pub struct BundlesArgs {
    #[command(subcommand)]
    pub command: BundlesCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum BundlesCommand {
    /// Delete every merged bundle and its metadata.
    Purge,
    /// Print bundle statistics.
    Stats,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub site: SiteSettings,
    pub cache: CacheSettings,
    pub merge: MergeSettings,
    pub preload: PreloadSettings,
    pub cdn: CdnSettings,
    pub compat: CompatSettings,
    pub test_mode: TestModeSettings,
    pub admin: AdminSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub url: Url,
    pub document_root: PathBuf,
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub ttl: Duration,
    pub vary_device: bool,
    pub vary_cookies: Vec<String>,
    pub excluded_query_params: Vec<String>,
    pub languages: Vec<String>,
    pub excluded_paths: Vec<String>,
    pub bypass_cookie_prefixes: Vec<String>,
    pub min_html_bytes: usize,
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub css_groups: Vec<AssetGroup>,
    pub js_groups: Vec<AssetGroup>,
    pub minify_css: bool,
    pub minify_js: bool,
    pub defer_scripts: bool,
    pub bundle_dir: PathBuf,
    pub bundle_url: String,
    pub group_overrides: BTreeMap<String, AssetGroup>,
    pub exclude_handles: Vec<String>,
    pub no_defer_handles: Vec<String>,
    pub critical_css: Option<PathBuf>,
    pub remote_fetch_timeout: Duration,
    pub remote_cache_ttl: Duration,
    pub remote_cache_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub state_path: PathBuf,
    pub config_path: PathBuf,
    pub recent_entries: usize,
    pub max_candidates: NonZeroUsize,
    pub crawl_timeout: Duration,
    pub max_redirects: usize,
    pub probe_sizes: bool,
    pub max_recommendations: NonZeroUsize,
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct CdnSettings {
    pub timeout: Duration,
    pub cloudflare: Option<CloudflareSettings>,
    pub bunny: Option<BunnySettings>,
}

#[derive(Debug, Clone)]
pub struct CloudflareSettings {
    pub api_base: String,
    pub zone_id: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BunnySettings {
    pub api_base: String,
    pub pull_zone_id: Option<String>,
    pub access_key: Option<String>,
}

/// Exclusion lists supplied by plugin-compatibility detection.
#[derive(Debug, Clone, Default)]
pub struct CompatSettings {
    pub exclude_handles: Vec<String>,
    pub no_defer_handles: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TestModeSettings {
    pub enabled: bool,
    pub allowed_roles: Vec<String>,
    pub allowed_ips: Vec<IpAddr>,
}

impl TestModeSettings {
    /// Whether a visitor belongs to the test-mode audience. Always false while test mode is off.
    pub fn admits(&self, client_ip: Option<IpAddr>, roles: &[String]) -> bool {
        if !self.enabled {
            return false;
        }
        let ip_allowed = client_ip.is_some_and(|ip| self.allowed_ips.contains(&ip));
        let role_allowed = roles
            .iter()
            .any(|role| self.allowed_roles.iter().any(|allowed| allowed == role));
        ip_allowed || role_allowed
    }
}

#[derive(Debug, Clone)]
pub struct AdminSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub preload_schedule: String,
    pub cleanup_schedule: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("SPRY")
            .separator("__")
            .list_separator(",")
            .try_parsing(true)
            .with_list_parse_key("cache.vary_cookies")
            .with_list_parse_key("cache.excluded_query_params")
            .with_list_parse_key("cache.languages"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Serve(args)) = cli.command.as_ref() {
        raw.apply_serve_overrides(&args.overrides);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

/// Resolve settings from a single TOML document, skipping the file, environment and CLI layers.
pub fn from_toml(source: &str) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(source, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    site: RawSiteSettings,
    cache: RawCacheSettings,
    merge: RawMergeSettings,
    preload: RawPreloadSettings,
    cdn: RawCdnSettings,
    compat: RawCompatSettings,
    test_mode: RawTestModeSettings,
    admin: RawAdminSettings,
    scheduler: RawSchedulerSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.cache.directory = Some(dir.clone());
        }
        if let Some(path) = overrides.site_manifest.as_ref() {
            self.site.manifest = Some(path.clone());
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.admin_host.as_ref() {
            self.admin.host = Some(host.clone());
        }
        if let Some(port) = overrides.admin_port {
            self.admin.port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.admin.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            site,
            cache,
            merge,
            preload,
            cdn,
            compat,
            test_mode,
            admin,
            scheduler,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            site: build_site_settings(site)?,
            cache: build_cache_settings(cache)?,
            merge: build_merge_settings(merge)?,
            preload: build_preload_settings(preload)?,
            cdn: build_cdn_settings(cdn)?,
            compat: build_compat_settings(compat),
            test_mode: build_test_mode_settings(test_mode)?,
            admin: build_admin_settings(admin)?,
            scheduler: build_scheduler_settings(scheduler)?,
        })
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(DEFAULT_CACHE_DIR),
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            vary_device: false,
            vary_cookies: Vec::new(),
            excluded_query_params: Vec::new(),
            languages: Vec::new(),
            excluded_paths: default_excluded_paths(),
            bypass_cookie_prefixes: default_bypass_cookie_prefixes(),
            min_html_bytes: DEFAULT_MIN_HTML_BYTES,
            auto_consume_interval: Duration::from_millis(DEFAULT_AUTO_CONSUME_INTERVAL_MS),
            consume_batch_limit: NonZeroUsize::new(DEFAULT_CONSUME_BATCH_LIMIT)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            css_groups: vec![AssetGroup::A, AssetGroup::B],
            js_groups: vec![AssetGroup::A],
            minify_css: true,
            minify_js: true,
            defer_scripts: true,
            bundle_dir: PathBuf::from(DEFAULT_BUNDLE_DIR),
            bundle_url: DEFAULT_BUNDLE_URL.to_string(),
            group_overrides: BTreeMap::new(),
            exclude_handles: Vec::new(),
            no_defer_handles: Vec::new(),
            critical_css: None,
            remote_fetch_timeout: Duration::from_secs(DEFAULT_REMOTE_FETCH_TIMEOUT_SECS),
            remote_cache_ttl: Duration::from_secs(DEFAULT_REMOTE_CACHE_TTL_SECS),
            remote_cache_capacity: NonZeroUsize::new(DEFAULT_REMOTE_CACHE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_PRELOAD_STATE_PATH),
            config_path: PathBuf::from(DEFAULT_PRELOAD_CONFIG_PATH),
            recent_entries: DEFAULT_PRELOAD_RECENT_ENTRIES,
            max_candidates: NonZeroUsize::new(DEFAULT_PRELOAD_MAX_CANDIDATES)
                .unwrap_or(NonZeroUsize::MIN),
            crawl_timeout: Duration::from_secs(DEFAULT_PRELOAD_CRAWL_TIMEOUT_SECS),
            max_redirects: DEFAULT_PRELOAD_MAX_REDIRECTS,
            probe_sizes: true,
            max_recommendations: NonZeroUsize::new(DEFAULT_PRELOAD_MAX_RECOMMENDATIONS)
                .unwrap_or(NonZeroUsize::MIN),
            stale_after: Duration::from_secs(DEFAULT_PRELOAD_STALE_AFTER_SECS),
        }
    }
}

impl Default for CdnSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_CDN_TIMEOUT_SECS),
            cloudflare: None,
            bunny: None,
        }
    }
}

fn default_excluded_paths() -> Vec<String> {
    ["/admin", "/login", "/cart", "/checkout", "/my-account", "/feed"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_bypass_cookie_prefixes() -> Vec<String> {
    ["session_", "logged_in_", "comment_author_", "cart_"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let raw_url = site.url.unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
    let mut url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("site.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid("site.url", "scheme must be http or https"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    let document_root = non_empty_path(
        site.document_root,
        DEFAULT_DOCUMENT_ROOT,
        "site.document_root",
    )?;

    Ok(SiteSettings {
        url,
        document_root,
        manifest: site.manifest.filter(|path| !path.as_os_str().is_empty()),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheSettings::default();

    let ttl_seconds = cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    if ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.ttl_seconds",
            "must be greater than zero",
        ));
    }

    let interval_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(DEFAULT_AUTO_CONSUME_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }

    let batch_limit = non_zero_usize(
        cache
            .consume_batch_limit
            .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
        "cache.consume_batch_limit",
    )?;

    let languages = normalized_list(cache.languages)
        .into_iter()
        .map(|code| code.to_ascii_lowercase())
        .collect();

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        directory: non_empty_path(cache.directory, DEFAULT_CACHE_DIR, "cache.directory")?,
        ttl: Duration::from_secs(ttl_seconds),
        vary_device: cache.vary_device.unwrap_or(defaults.vary_device),
        vary_cookies: normalized_list(cache.vary_cookies),
        excluded_query_params: normalized_list(cache.excluded_query_params),
        languages,
        excluded_paths: cache
            .excluded_paths
            .map(|paths| normalized_list(Some(paths)))
            .unwrap_or(defaults.excluded_paths),
        bypass_cookie_prefixes: cache
            .bypass_cookie_prefixes
            .map(|prefixes| normalized_list(Some(prefixes)))
            .unwrap_or(defaults.bypass_cookie_prefixes),
        min_html_bytes: cache.min_html_bytes.unwrap_or(DEFAULT_MIN_HTML_BYTES),
        auto_consume_interval: Duration::from_millis(interval_ms),
        consume_batch_limit: batch_limit,
    })
}

fn build_merge_settings(merge: RawMergeSettings) -> Result<MergeSettings, LoadError> {
    let defaults = MergeSettings::default();

    let css_groups = match merge.css_groups {
        Some(groups) => parse_groups(groups, "merge.css_groups")?,
        None => defaults.css_groups,
    };
    let js_groups = match merge.js_groups {
        Some(groups) => parse_groups(groups, "merge.js_groups")?,
        None => defaults.js_groups,
    };

    let mut group_overrides = BTreeMap::new();
    for (handle, group) in merge.group_overrides.unwrap_or_default() {
        let group = AssetGroup::from_str(&group)
            .map_err(|reason| LoadError::invalid("merge.group_overrides", reason))?;
        group_overrides.insert(handle.trim().to_ascii_lowercase(), group);
    }

    let bundle_url = merge
        .bundle_url
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .unwrap_or(defaults.bundle_url);
    if bundle_url.is_empty() {
        return Err(LoadError::invalid("merge.bundle_url", "must not be empty"));
    }

    let timeout_secs = merge
        .remote_fetch_timeout_seconds
        .unwrap_or(DEFAULT_REMOTE_FETCH_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "merge.remote_fetch_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(MergeSettings {
        css_groups,
        js_groups,
        minify_css: merge.minify_css.unwrap_or(defaults.minify_css),
        minify_js: merge.minify_js.unwrap_or(defaults.minify_js),
        defer_scripts: merge.defer_scripts.unwrap_or(defaults.defer_scripts),
        bundle_dir: non_empty_path(merge.bundle_dir, DEFAULT_BUNDLE_DIR, "merge.bundle_dir")?,
        bundle_url,
        group_overrides,
        exclude_handles: normalized_list(merge.exclude_handles),
        no_defer_handles: normalized_list(merge.no_defer_handles),
        critical_css: merge.critical_css.filter(|path| !path.as_os_str().is_empty()),
        remote_fetch_timeout: Duration::from_secs(timeout_secs),
        remote_cache_ttl: Duration::from_secs(
            merge
                .remote_cache_ttl_seconds
                .unwrap_or(DEFAULT_REMOTE_CACHE_TTL_SECS),
        ),
        remote_cache_capacity: non_zero_usize(
            merge
                .remote_cache_capacity
                .unwrap_or(DEFAULT_REMOTE_CACHE_CAPACITY),
            "merge.remote_cache_capacity",
        )?,
    })
}

fn build_preload_settings(preload: RawPreloadSettings) -> Result<PreloadSettings, LoadError> {
    let timeout_secs = preload
        .crawl_timeout_seconds
        .unwrap_or(DEFAULT_PRELOAD_CRAWL_TIMEOUT_SECS);
    if !(1..=120).contains(&timeout_secs) {
        return Err(LoadError::invalid(
            "preload.crawl_timeout_seconds",
            "must be between 1 and 120",
        ));
    }

    let stale_after_secs = preload
        .stale_after_seconds
        .unwrap_or(DEFAULT_PRELOAD_STALE_AFTER_SECS);
    if stale_after_secs == 0 {
        return Err(LoadError::invalid(
            "preload.stale_after_seconds",
            "must be greater than zero",
        ));
    }

    Ok(PreloadSettings {
        state_path: non_empty_path(
            preload.state_path,
            DEFAULT_PRELOAD_STATE_PATH,
            "preload.state_path",
        )?,
        config_path: non_empty_path(
            preload.config_path,
            DEFAULT_PRELOAD_CONFIG_PATH,
            "preload.config_path",
        )?,
        recent_entries: preload
            .recent_entries
            .unwrap_or(DEFAULT_PRELOAD_RECENT_ENTRIES),
        max_candidates: non_zero_usize(
            preload
                .max_candidates
                .unwrap_or(DEFAULT_PRELOAD_MAX_CANDIDATES),
            "preload.max_candidates",
        )?,
        crawl_timeout: Duration::from_secs(timeout_secs),
        max_redirects: preload
            .max_redirects
            .unwrap_or(DEFAULT_PRELOAD_MAX_REDIRECTS),
        probe_sizes: preload.probe_sizes.unwrap_or(true),
        max_recommendations: non_zero_usize(
            preload
                .max_recommendations
                .unwrap_or(DEFAULT_PRELOAD_MAX_RECOMMENDATIONS),
            "preload.max_recommendations",
        )?,
        stale_after: Duration::from_secs(stale_after_secs),
    })
}

fn build_cdn_settings(cdn: RawCdnSettings) -> Result<CdnSettings, LoadError> {
    let timeout_secs = cdn.timeout_seconds.unwrap_or(DEFAULT_CDN_TIMEOUT_SECS);
    if !(1..=120).contains(&timeout_secs) {
        return Err(LoadError::invalid(
            "cdn.timeout_seconds",
            "must be between 1 and 120",
        ));
    }

    let cloudflare = cdn
        .cloudflare
        .filter(|raw| raw.enabled.unwrap_or(false))
        .map(|raw| CloudflareSettings {
            api_base: trimmed_base(raw.api_base, DEFAULT_CLOUDFLARE_API_BASE),
            zone_id: non_blank(raw.zone_id),
            api_token: non_blank(raw.api_token),
        });

    let bunny = cdn
        .bunny
        .filter(|raw| raw.enabled.unwrap_or(false))
        .map(|raw| BunnySettings {
            api_base: trimmed_base(raw.api_base, DEFAULT_BUNNY_API_BASE),
            pull_zone_id: non_blank(raw.pull_zone_id),
            access_key: non_blank(raw.access_key),
        });

    Ok(CdnSettings {
        timeout: Duration::from_secs(timeout_secs),
        cloudflare,
        bunny,
    })
}

fn build_compat_settings(compat: RawCompatSettings) -> CompatSettings {
    CompatSettings {
        exclude_handles: normalized_list(compat.exclude_handles),
        no_defer_handles: normalized_list(compat.no_defer_handles),
    }
}

fn build_test_mode_settings(
    test_mode: RawTestModeSettings,
) -> Result<TestModeSettings, LoadError> {
    let mut allowed_ips = Vec::new();
    for raw in normalized_list(test_mode.allowed_ips) {
        let ip = raw.parse::<IpAddr>().map_err(|err| {
            LoadError::invalid("test_mode.allowed_ips", format!("`{raw}`: {err}"))
        })?;
        allowed_ips.push(ip);
    }

    Ok(TestModeSettings {
        enabled: test_mode.enabled.unwrap_or(false),
        allowed_roles: normalized_list(test_mode.allowed_roles),
        allowed_ips,
    })
}

fn build_admin_settings(admin: RawAdminSettings) -> Result<AdminSettings, LoadError> {
    let host = admin.host.unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());
    let port = admin.port.unwrap_or(DEFAULT_ADMIN_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "admin.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("admin.addr", reason))?;

    let graceful_secs = admin
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "admin.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(AdminSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
) -> Result<SchedulerSettings, LoadError> {
    let preload_schedule = scheduler
        .preload_schedule
        .unwrap_or_else(|| DEFAULT_PRELOAD_SCHEDULE.to_string());
    validate_schedule(&preload_schedule, "scheduler.preload_schedule")?;

    let cleanup_schedule = scheduler
        .cleanup_schedule
        .unwrap_or_else(|| DEFAULT_CLEANUP_SCHEDULE.to_string());
    validate_schedule(&cleanup_schedule, "scheduler.cleanup_schedule")?;

    Ok(SchedulerSettings {
        enabled: scheduler.enabled.unwrap_or(true),
        preload_schedule,
        cleanup_schedule,
    })
}

fn validate_schedule(expression: &str, key: &'static str) -> Result<(), LoadError> {
    apalis_cron::Schedule::from_str(expression)
        .map(|_| ())
        .map_err(|err| LoadError::invalid(key, format!("invalid cron expression: {err}")))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    url: Option<String>,
    document_root: Option<PathBuf>,
    manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    ttl_seconds: Option<u64>,
    vary_device: Option<bool>,
    vary_cookies: Option<Vec<String>>,
    excluded_query_params: Option<Vec<String>>,
    languages: Option<Vec<String>>,
    excluded_paths: Option<Vec<String>>,
    bypass_cookie_prefixes: Option<Vec<String>>,
    min_html_bytes: Option<usize>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMergeSettings {
    css_groups: Option<Vec<String>>,
    js_groups: Option<Vec<String>>,
    minify_css: Option<bool>,
    minify_js: Option<bool>,
    defer_scripts: Option<bool>,
    bundle_dir: Option<PathBuf>,
    bundle_url: Option<String>,
    group_overrides: Option<BTreeMap<String, String>>,
    exclude_handles: Option<Vec<String>>,
    no_defer_handles: Option<Vec<String>>,
    critical_css: Option<PathBuf>,
    remote_fetch_timeout_seconds: Option<u64>,
    remote_cache_ttl_seconds: Option<u64>,
    remote_cache_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreloadSettings {
    state_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    recent_entries: Option<usize>,
    max_candidates: Option<usize>,
    crawl_timeout_seconds: Option<u64>,
    max_redirects: Option<usize>,
    probe_sizes: Option<bool>,
    max_recommendations: Option<usize>,
    stale_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCdnSettings {
    timeout_seconds: Option<u64>,
    cloudflare: Option<RawCloudflareSettings>,
    bunny: Option<RawBunnySettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCloudflareSettings {
    enabled: Option<bool>,
    api_base: Option<String>,
    zone_id: Option<String>,
    api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBunnySettings {
    enabled: Option<bool>,
    api_base: Option<String>,
    pull_zone_id: Option<String>,
    access_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompatSettings {
    exclude_handles: Option<Vec<String>>,
    no_defer_handles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTestModeSettings {
    enabled: Option<bool>,
    allowed_roles: Option<Vec<String>>,
    allowed_ips: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAdminSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    enabled: Option<bool>,
    preload_schedule: Option<String>,
    cleanup_schedule: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

fn normalized_list(values: Option<Vec<String>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values.unwrap_or_default() {
        let trimmed = value.trim();
        if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn parse_groups(values: Vec<String>, key: &'static str) -> Result<Vec<AssetGroup>, LoadError> {
    let mut groups = Vec::new();
    for value in normalized_list(Some(values)) {
        let group =
            AssetGroup::from_str(&value).map_err(|reason| LoadError::invalid(key, reason))?;
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    Ok(groups)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn trimmed_base(value: Option<String>, default: &str) -> String {
    non_blank(value)
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}
