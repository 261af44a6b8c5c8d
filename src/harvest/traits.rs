//! Core traits and types for the harvest pipeline.
//!
//! This module defines:
//! - The normalization seam via [`PageNormalizer`]
//! - The harvest lifecycle via [`HarvestState`]
//! - Per-page skip bookkeeping via [`SkippedPage`] and [`SkipReason`]

use serde::{Deserialize, Serialize};

use crate::model::{PropertyRecord, RawPage};
use crate::traits::{FetchError, NormalizeError};

// ============================================================================
// Normalizer Trait
// ============================================================================

/// Turns one fetched page into canonical records.
///
/// Implementations must tolerate partially missing data: a field that cannot
/// be read becomes [`Field::Unknown`](crate::model::Field::Unknown) and a
/// listing that cannot be identified is dropped on its own. Only a payload
/// that is not the expected envelope at all is a
/// [`NormalizeError::MalformedPage`].
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the pipeline runs normalization on
/// the blocking thread pool.
pub trait PageNormalizer: Send + Sync {
    /// Extracts the records of one page.
    fn normalize(&self, page: &RawPage) -> Result<NormalizedPage, NormalizeError>;

    /// Returns a human-readable name for this normalizer, used in logs.
    fn name(&self) -> &'static str;
}

/// Records extracted from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPage {
    /// 0-based page index
    pub page: usize,

    /// Records in the order they appear on the page
    pub records: Vec<PropertyRecord>,

    /// Listings skipped because they had no identifier or were not objects
    pub dropped: usize,

    /// Total result count advertised by the source, if present
    pub total_results: Option<u64>,
}

// ============================================================================
// Harvest State Machine
// ============================================================================

/// Lifecycle of one harvest run.
///
/// ```text
/// Planned → Fetching → Normalizing → Aggregating → Completed
///              ├──→ Aborted   (source blocked the session)
///              └──→ TimedOut  (global harvest deadline expired)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestState {
    Planned,
    Fetching,
    Normalizing,
    Aggregating,
    Completed,
    Aborted,
    TimedOut,
}

impl HarvestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HarvestState::Completed | HarvestState::Aborted | HarvestState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: HarvestState) -> bool {
        use HarvestState::*;
        matches!(
            (self, next),
            (Planned, Fetching)
                | (Fetching, Normalizing)
                | (Fetching, Aborted)
                | (Fetching, TimedOut)
                | (Normalizing, Aggregating)
                | (Aggregating, Completed)
        )
    }
}

// ============================================================================
// Skipped Pages
// ============================================================================

/// A page that contributed no records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPage {
    pub page: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Fetch failed after exhausting retries (or with a non-retryable error)
    Failed { error: String },
    /// The source blocked this fetch
    Blocked { reason: String },
    /// Not fetched because the harvest was aborted
    Cancelled,
    /// Fetched, but the payload was not a recognizable envelope
    Malformed { reason: String },
    /// Still pending when the harvest deadline expired
    TimedOut,
}

impl From<&FetchError> for SkipReason {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Blocked { reason } => SkipReason::Blocked {
                reason: reason.clone(),
            },
            FetchError::Cancelled => SkipReason::Cancelled,
            other => SkipReason::Failed {
                error: other.to_string(),
            },
        }
    }
}

impl From<NormalizeError> for SkipReason {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::MalformedPage { reason, .. } => SkipReason::Malformed { reason },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
