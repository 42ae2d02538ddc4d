//! Configuration file parser for feedwire.toml.
//!
//! The file is loaded once at startup and the resulting `Config` is immutable
//! for the lifetime of the process. Unknown keys are ignored by serde (with
//! `deny_unknown_fields` off), though we log a warning when the file contains
//! potential typos. Title filters are compiled at load time so an invalid
//! pattern is rejected before any feed is polled.
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Structurally valid TOML that describes an unusable setup
    /// (duplicate feed ids, empty URLs, unparseable filter patterns).
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`. An empty `feeds` array is
/// legal: the scheduler simply idles until shutdown.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IRC connection settings.
    pub irc: IrcConfig,

    /// Operational limits: backoff, flood control, delivery retries.
    pub limits: Limits,

    /// Optional remote summarizer. Absent API key disables it.
    pub summarizer: SummarizerConfig,

    /// Watched feeds. Each gets its own polling task.
    pub feeds: Vec<FeedConfig>,

    /// Path to the SQLite dedup store.
    pub db_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            irc: IrcConfig::default(),
            limits: Limits::default(),
            summarizer: SummarizerConfig::default(),
            feeds: Vec::new(),
            db_path: "feedwire.db".to_string(),
        }
    }
}

/// IRC server connection settings.
///
/// Custom Debug impl masks `password` to prevent secret leakage in logs,
/// error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct IrcConfig {
    /// Server hostname.
    pub server: String,

    /// Server port (plain TCP).
    pub port: u16,

    /// Nickname to register with. On collision the client appends `_`.
    pub nick: String,

    /// Optional server password, sent as PASS before registration.
    pub password: Option<String>,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            server: "irc.libera.chat".to_string(),
            port: 6667,
            nick: "feedwire".to_string(),
            password: None,
        }
    }
}

/// Mask the server password in Debug output.
impl std::fmt::Debug for IrcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("nick", &self.nick)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Operational limits shared by the scheduler and dispatcher.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Backoff multiplier applied per consecutive failure.
    pub backoff_factor: u32,

    /// Exponent cap for backoff growth.
    pub backoff_cap: u32,

    /// Minimum gap between messages to the same channel, in milliseconds.
    pub flood_interval_ms: u64,

    /// Delivery attempts per message before it is dropped.
    pub dispatch_max_attempts: u32,

    /// Per-request timeout for feed fetches, in seconds.
    pub fetch_timeout_secs: u64,

    /// Entries whose published time is older than this are recorded but not
    /// announced. 0 disables the window.
    pub max_entry_age_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            backoff_factor: 2,
            backoff_cap: 6,
            flood_interval_ms: 1000,
            dispatch_max_attempts: 5,
            fetch_timeout_secs: 30,
            max_entry_age_secs: 0,
        }
    }
}

impl Limits {
    pub fn flood_interval(&self) -> Duration {
        Duration::from_millis(self.flood_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Remote summarizer settings.
///
/// Custom Debug impl masks `api_key`, same as the IRC password.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// API key. `None` disables summarization entirely.
    pub api_key: Option<String>,

    /// Per-call timeout in seconds. On expiry the formatter falls back to
    /// a truncated body excerpt.
    pub timeout_secs: u64,

    /// Maximum input bytes sent per request. Longer bodies are cut at a
    /// char boundary.
    pub max_input_bytes: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            timeout_secs: 10,
            max_input_bytes: 10_000,
        }
    }
}

impl std::fmt::Debug for SummarizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizerConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("max_input_bytes", &self.max_input_bytes)
            .finish()
    }
}

/// A single watched feed.
#[derive(Clone, Debug, Deserialize)]
pub struct FeedConfig {
    /// Stable identifier. Used as the dedup partition key, so renaming a
    /// feed id re-announces its backlog on the next first poll.
    pub id: String,

    /// Feed URL (RSS or Atom).
    pub url: String,

    /// Seconds between polls of this feed.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Channels this feed announces to. Must be non-empty.
    pub channels: Vec<String>,

    /// Title filter patterns. An entry is announced only when its title
    /// matches at least one pattern (case-insensitive). Empty = announce all.
    #[serde(default)]
    pub filters: Vec<String>,

    /// Compiled form of `filters`, built during `Config::load`.
    #[serde(skip)]
    pub compiled_filters: Vec<Regex>,
}

fn default_poll_interval_secs() -> u64 {
    300
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Whether an entry with this title passes the feed's filters.
    pub fn wants(&self, title: &str) -> bool {
        if self.compiled_filters.is_empty() {
            return true;
        }
        self.compiled_filters.iter().any(|re| re.is_match(title))
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → `Err(ConfigError::Io)` (the path is operator-supplied)
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Duplicate feed ids, invalid or non-HTTP URLs, empty channel lists,
    ///   invalid filter regexes → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid slurping a maliciously
        // large or corrupted file into memory.
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect likely typos.
        if let Ok(raw) = content.parse::<toml::Table>() {
            Self::warn_unknown_keys(&raw);
        }

        let mut config: Config = toml::from_str(&content)?;
        config.validate_and_compile()?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            server = %config.irc.server,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn warn_unknown_keys(raw: &toml::Table) {
        let known_top = ["irc", "limits", "summarizer", "feeds", "db_path"];
        for key in raw.keys() {
            if !known_top.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }
        let sections: [(&str, &[&str]); 3] = [
            ("irc", &["server", "port", "nick", "password"]),
            (
                "limits",
                &[
                    "backoff_factor",
                    "backoff_cap",
                    "flood_interval_ms",
                    "dispatch_max_attempts",
                    "fetch_timeout_secs",
                    "max_entry_age_secs",
                ],
            ),
            ("summarizer", &["api_key", "timeout_secs", "max_input_bytes"]),
        ];
        for (section, known) in sections {
            if let Some(toml::Value::Table(table)) = raw.get(section) {
                for key in table.keys() {
                    if !known.contains(&key.as_str()) {
                        tracing::warn!(
                            section = %section,
                            key = %key,
                            "Unknown key in config section, ignoring"
                        );
                    }
                }
            }
        }
    }

    fn validate_and_compile(&mut self) -> Result<(), ConfigError> {
        let mut seen_ids = std::collections::HashSet::new();
        for feed in &mut self.feeds {
            if feed.id.trim().is_empty() {
                return Err(ConfigError::Invalid("feed with empty id".to_string()));
            }
            if !seen_ids.insert(feed.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate feed id: {}",
                    feed.id
                )));
            }
            let parsed = url::Url::parse(feed.url.trim()).map_err(|e| {
                ConfigError::Invalid(format!("feed {} has an invalid url: {}", feed.id, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "feed {} url must be http or https, got {}",
                    feed.id,
                    parsed.scheme()
                )));
            }
            if feed.channels.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "feed {} has no channels",
                    feed.id
                )));
            }
            feed.compiled_filters = feed
                .filters
                .iter()
                .map(|pattern| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| {
                            ConfigError::Invalid(format!(
                                "feed {} has an invalid filter {:?}: {}",
                                feed.id, pattern, e
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        if self.limits.backoff_factor == 0 {
            return Err(ConfigError::Invalid(
                "limits.backoff_factor must be at least 1".to_string(),
            ));
        }
        if self.limits.dispatch_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "limits.dispatch_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
