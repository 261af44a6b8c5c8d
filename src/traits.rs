use crate::model::{PageRequest, RawPage};
use async_trait::async_trait;
use thiserror::Error;

/// Caller configuration errors, raised before any fetch happens.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error(
        "Invalid search region: west={west}, east={east}, south={south}, north={north} \
         (need west < east and south < north)"
    )]
    InvalidRegion {
        west: f64,
        east: f64,
        south: f64,
        north: f64,
    },
    #[error("Invalid page count: {0} (must be at least 1 and within the page limit)")]
    InvalidPageCount(usize),
}

/// Per-page fetch failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch timed out")]
    Timeout,
    #[error("HTTP error: status {status}")]
    Http { status: u16 },
    /// Rate limit, CAPTCHA or IP ban. Applies to the whole session.
    #[error("Blocked by source: {reason}")]
    Blocked { reason: String },
    #[error("Network error: {0}")]
    Network(String),
    /// The harvest was cancelled before this fetch could finish.
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Http { status } => (500..600).contains(status),
            FetchError::Blocked { .. } | FetchError::Cancelled => false,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, FetchError::Blocked { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Malformed page {page}: {reason}")]
    MalformedPage { page: usize, reason: String },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Returns the data source this fetcher talks to (e.g. an endpoint URL).
    fn source_id(&self) -> &str;

    /// Issues a single fetch for one page. No retries; the executor owns that.
    async fn fetch(&self, request: &PageRequest) -> Result<RawPage, FetchError>;
}
