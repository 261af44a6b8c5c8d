//! JSON export of a finished harvest.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::harvest::pipeline::HarvestReport;
use crate::harvest::traits::{HarvestState, SkippedPage};
use crate::model::{HarvestResult, SearchRegion};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to serialize harvest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write harvest file: {0}")]
    Io(#[from] std::io::Error),
}

/// File layout: run metadata plus the record array.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestDataset {
    pub metadata: DatasetMetadata,
    pub results: HarvestResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetMetadata {
    pub search_area: SearchRegion,
    pub pages_requested: usize,
    pub pages_received: usize,
    pub total_properties: usize,
    /// Result count advertised by the source, if any page reported it
    pub total_results: Option<u64>,
    pub execution_time: DateTime<Utc>,
    pub state: HarvestState,
    pub skipped_pages: Vec<SkippedPage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl HarvestDataset {
    pub fn from_report(
        report: &HarvestReport,
        search_area: SearchRegion,
        execution_time: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata: DatasetMetadata {
                search_area,
                pages_requested: report.stats.pages_requested,
                pages_received: report.stats.pages_received,
                total_properties: report.result.len(),
                total_results: report.stats.total_results,
                execution_time,
                state: report.state,
                skipped_pages: report.skipped_pages.clone(),
                warning: report.warning.clone(),
            },
            results: report.result.clone(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, OutputError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub async fn write_json(&self, path: &Path) -> Result<(), OutputError> {
        let bytes = self.to_json()?;
        tokio::fs::write(path, &bytes).await?;
        info!(path = %path.display(), bytes = bytes.len(), "Harvest saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::pipeline::HarvestStats;
    use crate::harvest::traits::SkipReason;
    use crate::model::{Field, PropertyRecord};

    fn report() -> HarvestReport {
        let mut record = PropertyRecord::new("20595672");
        record.price = Field::Known(1_250_000.0);
        HarvestReport {
            state: HarvestState::Aborted,
            result: HarvestResult::try_from(vec![record]).unwrap(),
            skipped_pages: vec![SkippedPage {
                page: 1,
                reason: SkipReason::Blocked {
                    reason: "HTTP 429".into(),
                },
            }],
            warning: Some("Harvest aborted".into()),
            stats: HarvestStats {
                pages_requested: 2,
                pages_received: 1,
                records_seen: 1,
                total_results: Some(812),
                ..HarvestStats::default()
            },
        }
    }

    #[test]
    fn test_dataset_layout() {
        let region = SearchRegion::new(-118.7, -118.1, 33.7, 34.3).unwrap();
        let dataset = HarvestDataset::from_report(&report(), region, Utc::now());
        let json: serde_json::Value = serde_json::from_slice(&dataset.to_json().unwrap()).unwrap();

        assert_eq!(json["metadata"]["pages_requested"], 2);
        assert_eq!(json["metadata"]["pages_received"], 1);
        assert_eq!(json["metadata"]["total_properties"], 1);
        assert_eq!(json["metadata"]["state"], "aborted");
        assert_eq!(json["metadata"]["search_area"]["west"], -118.7);
        assert_eq!(json["metadata"]["skipped_pages"][0]["reason"]["kind"], "blocked");
        assert_eq!(json["results"][0]["id"], "20595672");
        assert_eq!(json["results"][0]["zestimate"], "unknown");
    }

    #[tokio::test]
    async fn test_write_json_creates_file() {
        let region = SearchRegion::new(-118.7, -118.1, 33.7, 34.3).unwrap();
        let dataset = HarvestDataset::from_report(&report(), region, Utc::now());
        let path = std::env::temp_dir().join(format!(
            "listing_harvest_{}_{}.json",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos()
        ));

        dataset.write_json(&path).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let records: HarvestResult = serde_json::from_value(written["results"].clone()).unwrap();
        assert_eq!(records.ids().collect::<Vec<_>>(), vec!["20595672"]);

        std::fs::remove_file(path).ok();
    }
}
