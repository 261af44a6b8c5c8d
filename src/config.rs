//! Harvest configuration.
//!
//! One [`HarvestConfig`] is created per harvest and handed to the executor,
//! the HTTP fetcher and the pipeline. Values come from defaults, then
//! `HARVEST_*` environment variables (see [`HarvestConfig::from_env`]), then
//! whatever the embedding caller overrides through the `with_*` builders.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::harvest::planner::DEFAULT_MAX_PAGES;

pub const DEFAULT_ENDPOINT: &str = "https://www.zillow.com/async-create-search-page-state";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";
pub const DEFAULT_SEARCH_TERM: &str = "Los Angeles CA";
pub const DEFAULT_REGION_ID: u64 = 12447;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Retry policy
// ============================================================================

/// Bounded retry with exponential backoff and additive jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per page, first try included
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the uniformly random delay added to each backoff
    #[serde(with = "duration_ms")]
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff plus a random jitter in `[0, jitter]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff_for(attempt) + Duration::from_millis(jitter)
    }
}

// ============================================================================
// Block detection
// ============================================================================

/// Response signatures that mean the source refused automated access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSignatures {
    /// HTTP statuses treated as a block
    pub statuses: Vec<u16>,
    /// Case-insensitive body substrings treated as a block
    pub markers: Vec<String>,
}

impl Default for BlockSignatures {
    fn default() -> Self {
        Self {
            statuses: vec![403, 429],
            markers: vec![
                "captcha".to_string(),
                "px-captcha".to_string(),
                "access to this page has been denied".to_string(),
                "perimeterx".to_string(),
            ],
        }
    }
}

impl BlockSignatures {
    /// Returns the first signature that matches, if any.
    pub fn detect(&self, status: u16, body: &[u8]) -> Option<String> {
        if self.statuses.contains(&status) {
            return Some(format!("HTTP {status}"));
        }
        if self.markers.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(body).to_ascii_lowercase();
        self.markers
            .iter()
            .find(|m| !m.is_empty() && text.contains(&m.to_ascii_lowercase()))
            .map(|m| format!("response matched block marker {m:?}"))
    }
}

// ============================================================================
// Harvest configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Timeout for a single fetch attempt (default: 30s)
    #[serde(with = "duration_ms")]
    pub page_timeout: Duration,

    /// Deadline for the whole harvest; `None` means unbounded
    #[serde(with = "option_duration_ms")]
    pub harvest_timeout: Option<Duration>,

    /// Maximum simultaneous in-flight fetches
    pub concurrency: usize,

    /// Largest page count a harvest may request
    pub max_pages: usize,

    pub retry: RetryPolicy,
    pub block: BlockSignatures,

    pub endpoint: String,
    pub user_agent: String,
    pub search_term: String,
    pub region_id: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(30),
            harvest_timeout: None,
            concurrency: 2,
            max_pages: DEFAULT_MAX_PAGES,
            retry: RetryPolicy::default(),
            block: BlockSignatures::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            search_term: DEFAULT_SEARCH_TERM.to_string(),
            region_id: DEFAULT_REGION_ID,
        }
    }
}

impl HarvestConfig {
    /// Defaults overridden by `HARVEST_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str| parse_var::<u64, _>(&lookup, key);

        if let Some(ms) = millis("HARVEST_PAGE_TIMEOUT_MS")? {
            config.page_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("HARVEST_TIMEOUT_MS")? {
            config.harvest_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(n) = parse_var(&lookup, "HARVEST_CONCURRENCY")? {
            config.concurrency = n;
        }
        if let Some(n) = parse_var(&lookup, "HARVEST_MAX_PAGES")? {
            config.max_pages = n;
        }
        if let Some(n) = parse_var(&lookup, "HARVEST_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = millis("HARVEST_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("HARVEST_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("HARVEST_JITTER_MS")? {
            config.retry.jitter = Duration::from_millis(ms);
        }
        if let Some(endpoint) = lookup("HARVEST_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(user_agent) = lookup("HARVEST_USER_AGENT") {
            config.user_agent = user_agent;
        }
        if let Some(term) = lookup("HARVEST_SEARCH_TERM") {
            config.search_term = term;
        }
        if let Some(id) = parse_var(&lookup, "HARVEST_REGION_ID")? {
            config.region_id = id;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    pub fn with_harvest_timeout(mut self, timeout: Duration) -> Self {
        self.harvest_timeout = Some(timeout);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_block_signatures(mut self, block: BlockSignatures) -> Self {
        self.block = block;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.max_pages == 0 {
            return Err(ConfigError::Invalid("max_pages must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.page_timeout.is_zero() {
            return Err(ConfigError::Invalid("page_timeout must be non-zero".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T, L>(lookup: &L, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
