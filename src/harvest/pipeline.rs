//! Harvest pipeline executor.
//!
//! This module provides the [`HarvestPipeline`] coordinator that runs the
//! harvest stages (Fetching → Normalizing → Aggregating) with:
//! - Concurrent page fetches bounded by the [`FetchExecutor`] semaphore
//! - Cooperative cancellation when the source blocks the session
//! - An optional global deadline for the whole harvest
//! - Deterministic output: pages are merged in page-index order, never in
//!   completion order
//! - Structured logging via `tracing`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::HarvestConfig;
use crate::executor::FetchExecutor;
use crate::harvest::aggregator::ResultAggregator;
use crate::harvest::normalizer::RecordNormalizer;
use crate::harvest::planner::{PageRequests, RequestPlanner};
use crate::harvest::traits::{
    HarvestState, NormalizedPage, PageNormalizer, SkipReason, SkippedPage,
};
use crate::model::{HarvestResult, RawPage, SearchRegion};
use crate::traits::{FetchError, NormalizeError, PageFetcher, PlanError};

type FetchOutcome = (usize, Result<RawPage, FetchError>);

// ============================================================================
// Pipeline Types
// ============================================================================

/// Outcome of one harvest run.
///
/// Always produced once planning succeeds; per-page problems show up in
/// `skipped_pages` and a non-`Completed` `state`, never as an error.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    /// Terminal state: `Completed`, `Aborted` or `TimedOut`
    pub state: HarvestState,

    /// Records of every page that made it, in first-seen order
    pub result: HarvestResult,

    /// Pages that contributed nothing, in page-index order
    pub skipped_pages: Vec<SkippedPage>,

    /// Set when the source blocked the session and the harvest was aborted
    pub warning: Option<String>,

    pub stats: HarvestStats,
}

impl HarvestReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped_pages.len()
    }

    /// True unless every requested page was harvested.
    pub fn is_partial(&self) -> bool {
        self.state != HarvestState::Completed || !self.skipped_pages.is_empty()
    }
}

/// Statistics about the harvest operation.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct HarvestStats {
    pub pages_requested: usize,

    /// Pages fetched and normalized successfully
    pub pages_received: usize,

    /// Records extracted before deduplication
    pub records_seen: usize,

    pub duplicates_dropped: usize,

    /// Listings the normalizer could not identify
    pub listings_dropped: usize,

    /// Result count advertised by the source (first page that reports it)
    pub total_results: Option<u64>,

    /// Time spent fetching (milliseconds)
    pub fetch_duration_ms: u64,

    /// Time spent normalizing (milliseconds)
    pub normalize_duration_ms: u64,

    /// Total time spent on the entire harvest (milliseconds)
    pub total_duration_ms: u64,
}

struct StateTracker {
    state: HarvestState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: HarvestState::Planned,
        }
    }

    fn advance(&mut self, next: HarvestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid harvest transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "Harvest state transition");
        self.state = next;
    }
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// End-to-end harvest: plan, fetch, normalize, aggregate.
///
/// # Example
///
/// ```ignore
/// use listing_harvester::client::HttpPageFetcher;
/// use listing_harvester::harvest::HarvestPipeline;
/// use listing_harvester::{HarvestConfig, SearchRegion};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = HarvestConfig::default();
///     let fetcher = HttpPageFetcher::new(&config)?;
///     let pipeline = HarvestPipeline::new(fetcher)
///         .with_timeout(std::time::Duration::from_secs(120));
///
///     let region = SearchRegion::new(-118.67, -118.16, 33.70, 34.34)?;
///     let report = pipeline.run(region, 5).await?;
///     println!("{:?}: {} records", report.state, report.result.len());
///     Ok(())
/// }
/// ```
pub struct HarvestPipeline<F, N = RecordNormalizer>
where
    F: PageFetcher + 'static,
    N: PageNormalizer + 'static,
{
    fetcher: Arc<F>,
    normalizer: Arc<N>,
    executor: Arc<FetchExecutor>,

    /// Deadline for the fetch stage (default: none)
    harvest_timeout: Option<Duration>,

    max_pages: usize,
}

impl<F> HarvestPipeline<F, RecordNormalizer>
where
    F: PageFetcher + 'static,
{
    /// Creates a pipeline with the default configuration and [`RecordNormalizer`].
    pub fn new(fetcher: F) -> Self {
        Self::from_config(fetcher, RecordNormalizer::new(), &HarvestConfig::default())
    }
}

impl<F, N> HarvestPipeline<F, N>
where
    F: PageFetcher + 'static,
    N: PageNormalizer + 'static,
{
    pub fn from_config(fetcher: F, normalizer: N, config: &HarvestConfig) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            normalizer: Arc::new(normalizer),
            executor: Arc::new(FetchExecutor::from_config(config)),
            harvest_timeout: config.harvest_timeout,
            max_pages: config.max_pages,
        }
    }

    pub fn with_normalizer<M>(self, normalizer: M) -> HarvestPipeline<F, M>
    where
        M: PageNormalizer + 'static,
    {
        HarvestPipeline {
            fetcher: self.fetcher,
            normalizer: Arc::new(normalizer),
            executor: self.executor,
            harvest_timeout: self.harvest_timeout,
            max_pages: self.max_pages,
        }
    }

    pub fn with_executor(mut self, executor: FetchExecutor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Sets the harvest deadline.
    ///
    /// The deadline covers fetching: once it expires, outstanding fetches are
    /// cancelled and the run ends `TimedOut`. Pages that arrived in time are
    /// still normalized and aggregated afterwards, without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.harvest_timeout = Some(timeout);
        self
    }

    /// Plans and executes a harvest.
    ///
    /// # Errors
    ///
    /// Only [`PlanError::InvalidPageCount`], for zero pages or more than the
    /// configured `max_pages` (region validity is enforced by
    /// [`SearchRegion::new`]). Fetch and parse problems degrade the report
    /// instead.
    pub async fn run(&self, region: SearchRegion, pages: usize) -> Result<HarvestReport, PlanError> {
        let planner = RequestPlanner::with_max_pages(region, pages, self.max_pages)?;
        Ok(self.execute(&planner).await)
    }

    /// Executes a planned harvest.
    #[instrument(skip(self, planner), fields(pages = planner.pages(), source = self.fetcher.source_id()))]
    pub async fn execute(&self, planner: &RequestPlanner) -> HarvestReport {
        let start = Instant::now();
        let pages = planner.pages();
        let mut state = StateTracker::new();
        let mut stats = HarvestStats {
            pages_requested: pages,
            ..HarvestStats::default()
        };

        // ====================================================================
        // Stage 1: Fetching
        // ====================================================================

        info!("Starting fetch stage");
        state.advance(HarvestState::Fetching);

        let cancel = CancellationToken::new();
        // Every page reports at most once
        let (tx, mut rx) = mpsc::unbounded_channel::<FetchOutcome>();
        let dispatcher = self.spawn_dispatcher(planner.iter(), tx, cancel.clone());

        let mut fetched: BTreeMap<usize, Result<RawPage, FetchError>> = BTreeMap::new();
        let collect = async {
            while let Some((page, outcome)) = rx.recv().await {
                fetched.insert(page, outcome);
            }
        };
        let timed_out = match self.harvest_timeout {
            Some(limit) => timeout(limit, collect).await.is_err(),
            None => {
                collect.await;
                false
            }
        };

        if timed_out {
            warn!(
                timeout_ms = self.harvest_timeout.map(|d| d.as_millis() as u64),
                "Harvest deadline expired, cancelling outstanding fetches"
            );
            cancel.cancel();
            // Dropping the dispatcher's JoinSet aborts in-flight fetches
            dispatcher.abort();
            while let Ok((page, outcome)) = rx.try_recv() {
                fetched.insert(page, outcome);
            }
        } else if let Err(e) = dispatcher.await {
            warn!(error = %e, "Fetch dispatcher did not finish cleanly");
        }

        stats.fetch_duration_ms = start.elapsed().as_millis() as u64;

        let blocked = fetched.iter().find_map(|(page, outcome)| match outcome {
            Err(FetchError::Blocked { reason }) => Some((*page, reason.clone())),
            _ => None,
        });
        let warning = blocked.as_ref().map(|(page, reason)| {
            format!("Harvest aborted: source blocked automated access at page {page} ({reason})")
        });

        let terminal = if timed_out {
            HarvestState::TimedOut
        } else if blocked.is_some() {
            HarvestState::Aborted
        } else {
            HarvestState::Completed
        };

        info!(
            duration_ms = stats.fetch_duration_ms,
            fetched = fetched.values().filter(|o| o.is_ok()).count(),
            "Fetch stage completed"
        );

        // Aborted/TimedOut runs still fold in every page that arrived
        if terminal != HarvestState::Completed {
            state.advance(terminal);
            if let Some(message) = &warning {
                warn!("{message}");
            }
        }

        let mut slots: BTreeMap<usize, Result<NormalizedPage, SkipReason>> = BTreeMap::new();
        let mut raw_pages = Vec::with_capacity(fetched.len());
        for page in 0..pages {
            let slot = match fetched.remove(&page) {
                Some(Ok(raw)) => {
                    raw_pages.push(raw);
                    continue;
                }
                Some(Err(err)) => SkipReason::from(&err),
                None if timed_out => SkipReason::TimedOut,
                None => SkipReason::Failed {
                    error: "fetch task ended without reporting".to_string(),
                },
            };
            slots.insert(page, Err(slot));
        }

        // ====================================================================
        // Stage 2: Normalizing
        // ====================================================================

        if terminal == HarvestState::Completed {
            state.advance(HarvestState::Normalizing);
        }
        info!(
            pages = raw_pages.len(),
            normalizer = self.normalizer.name(),
            "Starting normalization stage"
        );
        let normalize_start = Instant::now();

        for (page, normalized) in self.normalize_all(raw_pages).await {
            let slot = match normalized {
                Ok(normalized) => Ok(normalized),
                Err(err) => {
                    warn!(page, error = %err, "Skipping malformed page");
                    Err(SkipReason::from(err))
                }
            };
            slots.insert(page, slot);
        }

        stats.normalize_duration_ms = normalize_start.elapsed().as_millis() as u64;

        // ====================================================================
        // Stage 3: Aggregating
        // ====================================================================

        if terminal == HarvestState::Completed {
            state.advance(HarvestState::Aggregating);
        }

        let mut aggregator = ResultAggregator::new();
        for (page, slot) in slots {
            match slot {
                Ok(normalized) => {
                    stats.pages_received += 1;
                    stats.records_seen += normalized.records.len();
                    stats.listings_dropped += normalized.dropped;
                    if stats.total_results.is_none() {
                        stats.total_results = normalized.total_results;
                    }
                    let kept = aggregator.extend(normalized.records);
                    debug!(page, kept, "Page aggregated");
                }
                Err(reason) => aggregator.record_skipped(page, reason),
            }
        }

        stats.duplicates_dropped = aggregator.duplicates();
        let (result, skipped_pages) = aggregator.finish();

        if terminal == HarvestState::Completed {
            state.advance(HarvestState::Completed);
        }
        stats.total_duration_ms = start.elapsed().as_millis() as u64;

        info!(
            state = ?state.state,
            records = result.len(),
            skipped = skipped_pages.len(),
            duplicates = stats.duplicates_dropped,
            duration_ms = stats.total_duration_ms,
            "Harvest finished"
        );

        HarvestReport {
            state: state.state,
            result,
            skipped_pages,
            warning,
            stats,
        }
    }

    /// Dispatches fetches in page order. A permit is taken before each task
    /// is spawned, so with a limit of 1 pages are fetched strictly in sequence.
    fn spawn_dispatcher(
        &self,
        requests: PageRequests,
        tx: mpsc::UnboundedSender<FetchOutcome>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let executor = Arc::clone(&self.executor);

        tokio::spawn(async move {
            let mut tasks = JoinSet::new();

            for request in requests {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = executor.acquire() => permit.ok(),
                };

                let Some(permit) = permit else {
                    if tx.send((request.page(), Err(FetchError::Cancelled))).is_err() {
                        break;
                    }
                    continue;
                };

                let fetcher = Arc::clone(&fetcher);
                let executor = Arc::clone(&executor);
                let tx = tx.clone();
                let cancel = cancel.clone();

                tasks.spawn(async move {
                    // Held until the outcome is sent, so a blocked page cancels
                    // the token before the next page can get a permit
                    let _permit = permit;
                    let page = request.page();
                    let outcome = executor.fetch(fetcher.as_ref(), &request, &cancel).await;

                    match &outcome {
                        Ok(_) => {}
                        Err(FetchError::Blocked { reason }) => {
                            warn!(page, %reason, "Source blocked the session, cancelling remaining fetches");
                            cancel.cancel();
                        }
                        Err(FetchError::Cancelled) => debug!(page, "Fetch cancelled"),
                        Err(err) => warn!(page, error = %err, "Page fetch failed, skipping"),
                    }

                    let _ = tx.send((page, outcome));
                });
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Fetch task did not complete");
                }
            }
        })
    }

    /// Normalizes pages on the blocking pool, preserving input order.
    async fn normalize_all(
        &self,
        raw_pages: Vec<RawPage>,
    ) -> Vec<(usize, Result<NormalizedPage, NormalizeError>)> {
        if raw_pages.is_empty() {
            return Vec::new();
        }

        let indices: Vec<usize> = raw_pages.iter().map(RawPage::page).collect();
        let normalizer = Arc::clone(&self.normalizer);

        let task = tokio::task::spawn_blocking(move || {
            raw_pages
                .iter()
                .map(|raw| (raw.page(), normalizer.normalize(raw)))
                .collect::<Vec<_>>()
        });

        match task.await {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!(error = %e, "Normalization task failed");
                indices
                    .into_iter()
                    .map(|page| {
                        let err = NormalizeError::MalformedPage {
                            page,
                            reason: format!("normalizer task failed: {e}"),
                        };
                        (page, Err(err))
                    })
                    .collect()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::model::{Field, PageRequest, Payload};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    enum MockPage {
        Listings(Vec<Value>),
        Slow(Duration, Vec<Value>),
        Bytes(Vec<u8>),
        Fail(FetchError),
        SlowFail(Duration, FetchError),
    }

    // Mock fetcher for testing; pages without a script return no listings
    struct MockFetcher {
        pages: HashMap<usize, MockPage>,
        calls: Mutex<Vec<usize>>,
    }

    impl MockFetcher {
        fn new(pages: impl IntoIterator<Item = (usize, MockPage)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn empty() -> Self {
            Self::new(Vec::new())
        }

        fn calls(&self) -> Vec<usize> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort_unstable();
            calls.dedup();
            calls
        }
    }

    #[async_trait]
    impl PageFetcher for MockFetcher {
        fn source_id(&self) -> &str {
            "mock"
        }

        async fn fetch(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
            self.calls.lock().unwrap().push(request.page());
            let envelope = |listings: &Vec<Value>| {
                Payload::Json(json!({ "cat1": { "searchResults": { "listResults": listings } } }))
            };
            match self.pages.get(&request.page()) {
                None => Ok(RawPage::new(*request, envelope(&Vec::new()))),
                Some(MockPage::Listings(listings)) => Ok(RawPage::new(*request, envelope(listings))),
                Some(MockPage::Slow(delay, listings)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(RawPage::new(*request, envelope(listings)))
                }
                Some(MockPage::Bytes(bytes)) => {
                    Ok(RawPage::new(*request, Payload::Bytes(bytes.clone())))
                }
                Some(MockPage::Fail(err)) => Err(err.clone()),
                Some(MockPage::SlowFail(delay, err)) => {
                    tokio::time::sleep(*delay).await;
                    Err(err.clone())
                }
            }
        }
    }

    // Records the highest number of fetches running at the same time
    struct TrackingFetcher {
        inner: MockFetcher,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TrackingFetcher {
        fn new(inner: MockFetcher) -> Self {
            Self {
                inner,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageFetcher for TrackingFetcher {
        fn source_id(&self) -> &str {
            "tracking"
        }

        async fn fetch(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let outcome = self.inner.fetch(request).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn listing(id: &str, price: u64) -> Value {
        json!({ "zpid": id, "unformattedPrice": price, "addressCity": "Los Angeles" })
    }

    fn region() -> SearchRegion {
        SearchRegion::new(-118.668176, -118.155289, 33.703652, 34.337306).unwrap()
    }

    fn fast_executor(concurrency: usize, max_attempts: u32) -> FetchExecutor {
        FetchExecutor::new(concurrency).with_retry(RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        })
    }

    fn ids(report: &HarvestReport) -> Vec<String> {
        report.result.ids().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_pipeline_execution() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Listings(vec![listing("1", 100), listing("2", 200)])),
            (1, MockPage::Listings(vec![listing("3", 300)])),
            (2, MockPage::Listings(vec![listing("4", 400), listing("5", 500)])),
        ]);
        let pipeline = HarvestPipeline::new(fetcher);

        let report = pipeline.run(region(), 3).await.unwrap();

        assert_eq!(report.state, HarvestState::Completed);
        assert_eq!(ids(&report), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(report.skipped_count(), 0);
        assert!(report.warning.is_none());
        assert!(!report.is_partial());
        assert_eq!(report.stats.pages_requested, 3);
        assert_eq!(report.stats.pages_received, 3);
        assert_eq!(report.stats.records_seen, 5);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_keeps_first_page_version() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Listings(vec![listing("20595672", 900_000)])),
            (1, MockPage::Listings(vec![listing("20595672", 950_000), listing("7", 1)])),
        ]);
        let pipeline = HarvestPipeline::new(fetcher).with_executor(fast_executor(2, 1));

        let report = pipeline.run(region(), 2).await.unwrap();

        assert_eq!(ids(&report), vec!["20595672", "7"]);
        assert_eq!(
            report.result.get("20595672").unwrap().price,
            Field::Known(900_000.0)
        );
        assert_eq!(report.stats.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_blocked_page_aborts_with_partial_result() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Listings(vec![listing("a", 1)])),
            (1, MockPage::Listings(vec![listing("b", 2)])),
            (
                2,
                MockPage::Fail(FetchError::Blocked {
                    reason: "HTTP 403".into(),
                }),
            ),
            (3, MockPage::Listings(vec![listing("d", 4)])),
            (4, MockPage::Listings(vec![listing("e", 5)])),
        ]);
        let pipeline = HarvestPipeline::new(fetcher).with_executor(fast_executor(1, 3));

        let report = pipeline.run(region(), 5).await.unwrap();

        assert_eq!(report.state, HarvestState::Aborted);
        assert_eq!(ids(&report), vec!["a", "b"]);
        assert_eq!(report.skipped_count(), 3);
        assert_eq!(
            report.skipped_pages[0],
            SkippedPage {
                page: 2,
                reason: SkipReason::Blocked {
                    reason: "HTTP 403".into()
                }
            }
        );
        assert_eq!(report.skipped_pages[1].reason, SkipReason::Cancelled);
        assert_eq!(report.skipped_pages[2].reason, SkipReason::Cancelled);
        assert!(report.warning.as_deref().unwrap().contains("page 2"));
        assert_eq!(pipeline.fetcher.calls(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_in_flight_fetches_never_exceed_concurrency() {
        let fetcher = TrackingFetcher::new(MockFetcher::new((0..6).map(|page| {
            let listings = vec![listing(&format!("p{page}"), 1)];
            (page, MockPage::Slow(Duration::from_millis(30), listings))
        })));
        let pipeline = HarvestPipeline::new(fetcher).with_executor(fast_executor(2, 1));

        let report = pipeline.run(region(), 6).await.unwrap();

        assert_eq!(report.state, HarvestState::Completed);
        assert_eq!(report.result.len(), 6);
        assert!(pipeline.fetcher.peak() <= 2, "peak was {}", pipeline.fetcher.peak());
        assert!(pipeline.fetcher.peak() >= 1);
    }

    #[tokio::test]
    async fn test_block_keeps_pages_already_dispatched() {
        let blocked = FetchError::Blocked {
            reason: "HTTP 429".into(),
        };
        let fetcher = TrackingFetcher::new(MockFetcher::new([
            (0, MockPage::Listings(vec![listing("a", 1)])),
            (1, MockPage::Listings(vec![listing("b", 2)])),
            (2, MockPage::SlowFail(Duration::from_millis(150), blocked)),
            (
                3,
                MockPage::Slow(Duration::from_millis(10), vec![listing("d", 4)]),
            ),
            (
                4,
                MockPage::Slow(Duration::from_millis(300), vec![listing("e", 5)]),
            ),
            (5, MockPage::Listings(vec![listing("f", 6)])),
        ]));
        let pipeline = HarvestPipeline::new(fetcher).with_executor(fast_executor(2, 1));

        let report = pipeline.run(region(), 6).await.unwrap();

        assert_eq!(report.state, HarvestState::Aborted);
        assert!(pipeline.fetcher.peak() <= 2);

        // Page 3 ran next to the blocked page and finished first
        let kept = ids(&report);
        assert!(kept.contains(&"d".to_string()), "kept {kept:?}");
        assert!(!kept.contains(&"f".to_string()));

        let reason_for = |page: usize| {
            report
                .skipped_pages
                .iter()
                .find(|s| s.page == page)
                .map(|s| s.reason.clone())
        };
        assert!(matches!(reason_for(2), Some(SkipReason::Blocked { .. })));
        assert_eq!(reason_for(5), Some(SkipReason::Cancelled));
        assert!(!pipeline.fetcher.inner.calls().contains(&5));
    }

    #[tokio::test]
    async fn test_exhausted_retries_skip_page_without_failing_harvest() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Listings(vec![listing("a", 1)])),
            (1, MockPage::Fail(FetchError::Http { status: 500 })),
            (2, MockPage::Listings(vec![listing("c", 3)])),
        ]);
        let pipeline = HarvestPipeline::new(fetcher).with_executor(fast_executor(2, 2));

        let report = pipeline.run(region(), 3).await.unwrap();

        assert_eq!(report.state, HarvestState::Completed);
        assert_eq!(ids(&report), vec!["a", "c"]);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped_pages[0].page, 1);
        assert!(matches!(
            report.skipped_pages[0].reason,
            SkipReason::Failed { .. }
        ));
        assert!(report.is_partial());
    }

    #[tokio::test]
    async fn test_malformed_page_is_skipped() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Bytes(b"<html>captcha-free but not json</html>".to_vec())),
            (1, MockPage::Listings(vec![listing("b", 2)])),
        ]);
        let pipeline = HarvestPipeline::new(fetcher);

        let report = pipeline.run(region(), 2).await.unwrap();

        assert_eq!(report.state, HarvestState::Completed);
        assert_eq!(ids(&report), vec!["b"]);
        assert!(matches!(
            report.skipped_pages[0].reason,
            SkipReason::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_harvest_timeout_returns_partial_result() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Listings(vec![listing("fast", 1)])),
            (
                1,
                MockPage::Slow(Duration::from_secs(10), vec![listing("slow", 2)]),
            ),
        ]);
        let pipeline = HarvestPipeline::new(fetcher)
            .with_executor(fast_executor(2, 1))
            .with_timeout(Duration::from_millis(200));

        let report = pipeline.run(region(), 2).await.unwrap();

        assert_eq!(report.state, HarvestState::TimedOut);
        assert_eq!(ids(&report), vec!["fast"]);
        assert_eq!(
            report.skipped_pages,
            vec![SkippedPage {
                page: 1,
                reason: SkipReason::TimedOut
            }]
        );
        assert!(report.stats.total_duration_ms < 10_000);
    }

    #[tokio::test]
    async fn test_output_order_ignores_completion_order() {
        // Later pages finish first
        let build = || {
            MockFetcher::new((0..4).map(|page| {
                let delay = Duration::from_millis(20 * (4 - page as u64));
                let listings = vec![listing(&format!("p{page}-a"), 1), listing("shared", 2)];
                (page, MockPage::Slow(delay, listings))
            }))
        };

        let first = HarvestPipeline::new(build())
            .with_executor(fast_executor(4, 1))
            .run(region(), 4)
            .await
            .unwrap();
        let second = HarvestPipeline::new(build())
            .with_executor(fast_executor(4, 1))
            .run(region(), 4)
            .await
            .unwrap();

        assert_eq!(
            ids(&first),
            vec!["p0-a", "shared", "p1-a", "p2-a", "p3-a"]
        );
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_run_rejects_zero_pages() {
        let pipeline = HarvestPipeline::new(MockFetcher::empty());
        let err = pipeline.run(region(), 0).await.unwrap_err();
        assert_eq!(err, PlanError::InvalidPageCount(0));
        assert!(pipeline.fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_page_count_over_limit() {
        let pipeline = HarvestPipeline::new(MockFetcher::empty());
        let err = pipeline.run(region(), usize::MAX).await.unwrap_err();
        assert_eq!(err, PlanError::InvalidPageCount(usize::MAX));
        assert!(pipeline.fetcher.calls().is_empty());

        let config = HarvestConfig::default().with_max_pages(3);
        let pipeline =
            HarvestPipeline::from_config(MockFetcher::empty(), RecordNormalizer::new(), &config);
        assert_eq!(
            pipeline.run(region(), 4).await.unwrap_err(),
            PlanError::InvalidPageCount(4)
        );
        assert_eq!(pipeline.run(region(), 3).await.unwrap().stats.pages_received, 3);
    }

    struct CountingNormalizer;

    impl PageNormalizer for CountingNormalizer {
        fn normalize(&self, page: &RawPage) -> Result<NormalizedPage, NormalizeError> {
            Ok(NormalizedPage {
                page: page.page(),
                records: vec![crate::model::PropertyRecord::new(format!(
                    "page-{}",
                    page.page()
                ))],
                dropped: 0,
                total_results: Some(99),
            })
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct SlowNormalizer(Duration);

    impl PageNormalizer for SlowNormalizer {
        fn normalize(&self, page: &RawPage) -> Result<NormalizedPage, NormalizeError> {
            std::thread::sleep(self.0);
            RecordNormalizer::new().normalize(page)
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_timeout_bounds_fetching_only() {
        let fetcher = MockFetcher::new([
            (0, MockPage::Listings(vec![listing("a", 1)])),
            (1, MockPage::Listings(vec![listing("b", 2)])),
        ]);
        let pipeline = HarvestPipeline::new(fetcher)
            .with_executor(fast_executor(2, 1))
            .with_timeout(Duration::from_millis(100))
            .with_normalizer(SlowNormalizer(Duration::from_millis(150)));

        let report = pipeline.run(region(), 2).await.unwrap();

        assert_eq!(report.state, HarvestState::Completed);
        assert_eq!(ids(&report), vec!["a", "b"]);
        assert!(report.stats.normalize_duration_ms >= 100);
    }

    #[tokio::test]
    async fn test_custom_normalizer() {
        let pipeline = HarvestPipeline::new(MockFetcher::empty()).with_normalizer(CountingNormalizer);

        let report = pipeline.run(region(), 3).await.unwrap();

        assert_eq!(ids(&report), vec!["page-0", "page-1", "page-2"]);
        assert_eq!(report.stats.total_results, Some(99));
    }
}
