//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::PageThread;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP and crawl loop settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Media download settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Where archived data and the download queue live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Outbound transports
    #[serde(default)]
    pub egress: EgressConfig,

    /// Sites to archive
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values once, before anything is built from them.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.max_concurrent == 0 {
            return Err(AppError::validation("crawler.max_concurrent must be > 0"));
        }
        if self.egress.probe_attempts == 0 {
            return Err(AppError::validation("egress.probe_attempts must be > 0"));
        }
        url::Url::parse(&self.egress.probe_url)?;
        for proxy in &self.egress.proxies {
            proxy.proxy_url()?;
        }

        if self.sources.is_empty() {
            return Err(AppError::validation("No sources defined"));
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(AppError::validation(format!(
                    "Duplicate source name '{}'",
                    source.name
                )));
            }
            source.validate()?;
        }
        Ok(())
    }
}

/// HTTP client and crawl loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Minimum spacing between two fetches against the same site
    #[serde(default = "defaults::api_delay")]
    pub api_delay_ms: u64,

    /// Minimum spacing between the starts of two listing scans
    #[serde(default = "defaults::scrape_interval")]
    pub scrape_interval_secs: u64,

    /// Maximum concurrent fetches
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Also read board archives where the engine has one
    #[serde(default)]
    pub read_archive: bool,

    /// Run one cycle and exit instead of polling forever
    #[serde(default)]
    pub single_pass: bool,
}

impl CrawlerConfig {
    pub fn api_delay(&self) -> Duration {
        Duration::from_millis(self.api_delay_ms)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            api_delay_ms: defaults::api_delay(),
            scrape_interval_secs: defaults::scrape_interval(),
            max_concurrent: defaults::max_concurrent(),
            read_archive: false,
            single_pass: false,
        }
    }
}

/// Media download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Temporary location for in-flight files
    #[serde(default = "defaults::staging_dir")]
    pub staging_dir: PathBuf,

    /// Download full-size media
    #[serde(default = "defaults::enabled")]
    pub full_media: bool,

    /// Download thumbnails
    #[serde(default = "defaults::enabled")]
    pub thumbnails: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            staging_dir: defaults::staging_dir(),
            full_media: true,
            thumbnails: true,
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the filesystem sink
    #[serde(default = "defaults::storage_root")]
    pub root: PathBuf,

    /// Download queue file
    #[serde(default = "defaults::queue_file")]
    pub queue_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: defaults::storage_root(),
            queue_file: defaults::queue_file(),
        }
    }
}

/// Outbound transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// URL fetched to health-check each transport at startup
    #[serde(default = "defaults::probe_url")]
    pub probe_url: String,

    /// Probe attempts per transport before it is dropped
    #[serde(default = "defaults::probe_attempts")]
    pub probe_attempts: u32,

    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            probe_url: defaults::probe_url(),
            probe_attempts: defaults::probe_attempts(),
            proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    fn scheme(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5h",
        }
    }
}

/// One proxy egress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Name used in logs; defaults to the endpoint
    #[serde(default)]
    pub name: Option<String>,

    pub kind: ProxyKind,

    /// `host:port`, or a full URL
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Full proxy URL with the scheme implied by `kind`.
    pub fn proxy_url(&self) -> Result<url::Url> {
        let raw = if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("{}://{}", self.kind.scheme(), self.url)
        };
        Ok(url::Url::parse(&raw)?)
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.url.clone())
    }
}

/// Supported source engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Yotsuba,
    Vichan,
    LynxChan,
}

/// One site to archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique site name, used in pointers and storage paths
    pub name: String,

    pub engine: EngineKind,

    /// Base URL of the JSON API
    pub api_url: String,

    /// Base URL for media, when it differs from `api_url`
    #[serde(default)]
    pub media_url: Option<String>,

    /// Per-site override of `crawler.api_delay_ms`
    #[serde(default)]
    pub api_delay_ms: Option<u64>,

    #[serde(default)]
    pub boards: Vec<BoardConfig>,
}

impl SourceConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains('/') {
            return Err(AppError::validation(format!(
                "Invalid source name '{}'",
                self.name
            )));
        }
        url::Url::parse(&self.api_url)?;
        if let Some(media) = &self.media_url {
            url::Url::parse(media)?;
        }
        if self.boards.is_empty() {
            return Err(AppError::validation(format!(
                "Source '{}' has no boards",
                self.name
            )));
        }
        let mut boards = HashSet::new();
        for board in &self.boards {
            if board.name.trim().is_empty() || !boards.insert(board.name.as_str()) {
                return Err(AppError::validation(format!(
                    "Source '{}' has an empty or duplicate board '{}'",
                    self.name, board.name
                )));
            }
            board.compile_filter()?;
        }
        Ok(())
    }

    pub fn media_base(&self) -> &str {
        self.media_url.as_deref().unwrap_or(&self.api_url)
    }

    pub fn api_delay(&self, crawler: &CrawlerConfig) -> Duration {
        self.api_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| crawler.api_delay())
    }
}

/// One board and its optional content filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub name: String,

    /// Only threads whose subject matches
    #[serde(default)]
    pub subject_filter: Option<String>,

    /// Only threads whose opening post text matches
    #[serde(default)]
    pub content_filter: Option<String>,

    /// Reject threads whose subject or text matches
    #[serde(default)]
    pub blacklist: Option<String>,
}

impl BoardConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject_filter: None,
            content_filter: None,
            blacklist: None,
        }
    }

    /// Compile the board's filters.
    pub fn compile_filter(&self) -> Result<ThreadFilter> {
        let compile = |pattern: &Option<String>| pattern.as_deref().map(Regex::new).transpose();
        Ok(ThreadFilter {
            subject: compile(&self.subject_filter)?,
            content: compile(&self.content_filter)?,
            blacklist: compile(&self.blacklist)?,
        })
    }
}

/// Compiled board filter applied to listing entries.
///
/// A listing entry that carries no subject or excerpt cannot be judged and
/// always passes.
#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    subject: Option<Regex>,
    content: Option<Regex>,
    blacklist: Option<Regex>,
}

impl ThreadFilter {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.content.is_none() && self.blacklist.is_none()
    }

    pub fn accepts(&self, thread: &PageThread) -> bool {
        if self.is_empty() || (thread.subject.is_none() && thread.excerpt.is_none()) {
            return true;
        }
        let subject = thread.subject.as_deref().unwrap_or("");
        let excerpt = thread.excerpt.as_deref().unwrap_or("");

        if let Some(blacklist) = &self.blacklist {
            if blacklist.is_match(subject) || blacklist.is_match(excerpt) {
                return false;
            }
        }

        match (&self.subject, &self.content) {
            (None, None) => true,
            (Some(s), None) => s.is_match(subject),
            (None, Some(c)) => c.is_match(excerpt),
            (Some(s), Some(c)) => s.is_match(subject) || c.is_match(excerpt),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; thread-archiver/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn api_delay() -> u64 {
        1000
    }
    pub fn scrape_interval() -> u64 {
        60
    }
    pub fn max_concurrent() -> usize {
        4
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn staging_dir() -> PathBuf {
        PathBuf::from("data/staging")
    }
    pub fn storage_root() -> PathBuf {
        PathBuf::from("data/archive")
    }
    pub fn queue_file() -> PathBuf {
        PathBuf::from("data/queue.json")
    }
    pub fn probe_url() -> String {
        "https://www.example.com/".into()
    }
    pub fn probe_attempts() -> u32 {
        4
    }
}
