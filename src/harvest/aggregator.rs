//! First-seen-order accumulation with identifier deduplication.

use std::collections::HashSet;

use crate::harvest::traits::{SkipReason, SkippedPage};
use crate::model::{HarvestResult, PropertyRecord};

/// Collects records across pages.
///
/// A record whose identifier was already seen is discarded; the first version
/// wins. Not synchronized: the pipeline feeds it from a single task, in
/// page-index order.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    records: Vec<PropertyRecord>,
    seen: HashSet<String>,
    duplicates: usize,
    skipped: Vec<SkippedPage>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Returns `false` if it was a duplicate and got dropped.
    pub fn push(&mut self, record: PropertyRecord) -> bool {
        if self.seen.contains(&record.id) {
            self.duplicates += 1;
            return false;
        }
        self.seen.insert(record.id.clone());
        self.records.push(record);
        true
    }

    /// Adds all records of one page. Returns how many were kept.
    pub fn extend<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = PropertyRecord>,
    {
        records
            .into_iter()
            .map(|record| self.push(record))
            .filter(|kept| *kept)
            .count()
    }

    pub fn record_skipped(&mut self, page: usize, reason: SkipReason) {
        self.skipped.push(SkippedPage { page, reason });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn skipped(&self) -> &[SkippedPage] {
        &self.skipped
    }

    pub fn finish(self) -> (HarvestResult, Vec<SkippedPage>) {
        (HarvestResult::from_unique(self.records), self.skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;

    fn record(id: &str, price: f64) -> PropertyRecord {
        let mut record = PropertyRecord::new(id);
        record.price = Field::Known(price);
        record
    }

    #[test]
    fn test_keeps_first_seen_version() {
        let mut aggregator = ResultAggregator::new();
        aggregator.extend(vec![record("20595672", 900_000.0), record("1", 1.0)]);
        let kept = aggregator.extend(vec![record("20595672", 950_000.0), record("2", 2.0)]);

        assert_eq!(kept, 1);
        assert_eq!(aggregator.duplicates(), 1);

        let (result, _) = aggregator.finish();
        assert_eq!(result.ids().collect::<Vec<_>>(), vec!["20595672", "1", "2"]);
        assert_eq!(
            result.get("20595672").unwrap().price,
            Field::Known(900_000.0)
        );
    }

    #[test]
    fn test_duplicates_within_a_page() {
        let mut aggregator = ResultAggregator::new();
        assert!(aggregator.push(record("a", 1.0)));
        assert!(!aggregator.push(record("a", 2.0)));
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn test_tracks_skipped_pages() {
        let mut aggregator = ResultAggregator::new();
        aggregator.record_skipped(2, SkipReason::Cancelled);
        aggregator.record_skipped(
            4,
            SkipReason::Failed {
                error: "HTTP error: status 500".into(),
            },
        );

        assert_eq!(aggregator.skipped_count(), 2);
        let (result, skipped) = aggregator.finish();
        assert!(result.is_empty());
        assert_eq!(skipped[0].page, 2);
    }
}
