//! Harvest module - paginated listing collection pipeline.
//!
//! This module provides the stages of a harvest run:
//! - **Planning**: [`RequestPlanner`] expands a region and page count into page requests
//! - **Normalization**: [`RecordNormalizer`] maps raw payloads onto canonical records
//! - **Aggregation**: [`ResultAggregator`] deduplicates records in first-seen order
//! - **Pipeline**: Async orchestration via [`pipeline::HarvestPipeline`]
//! - **Output**: JSON export via [`output::HarvestDataset`]

pub mod aggregator;
pub mod normalizer;
pub mod output;
pub mod pipeline;
pub mod planner;
pub mod traits;

// Re-export commonly used types
pub use traits::{HarvestState, NormalizedPage, PageNormalizer, SkipReason, SkippedPage};

pub use aggregator::ResultAggregator;
pub use normalizer::RecordNormalizer;
pub use output::{DatasetMetadata, HarvestDataset, OutputError};
pub use pipeline::{HarvestPipeline, HarvestReport, HarvestStats};
pub use planner::{PageRequests, RequestPlanner};
