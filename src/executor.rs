use crate::config::{HarvestConfig, RetryPolicy};
use crate::model::{PageRequest, RawPage};
use crate::traits::{FetchError, PageFetcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Runs page fetches with a per-attempt timeout, bounded retries and a cap on
/// simultaneous in-flight fetches.
pub struct FetchExecutor {
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    page_timeout: Duration,
}

impl FetchExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            retry: RetryPolicy::default(),
            page_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(config.concurrency)
            .with_retry(config.retry.clone())
            .with_page_timeout(config.page_timeout)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reserves one in-flight slot. Hold the permit for the duration of the fetch.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, FetchError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Cancelled)
    }

    /// Acquires a slot, then fetches with retries.
    pub async fn execute<F>(
        &self,
        fetcher: &F,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<RawPage, FetchError>
    where
        F: PageFetcher + ?Sized,
    {
        let _permit = self.acquire().await?;
        self.fetch(fetcher, request, cancel).await
    }

    /// Fetches one page with retries. The caller is responsible for holding a
    /// permit from [`acquire`](Self::acquire).
    ///
    /// Transient errors are retried until the policy's attempt budget runs
    /// out; `Blocked` and non-5xx HTTP errors are returned immediately.
    /// Cancellation is checked before every attempt and interrupts backoff.
    #[instrument(skip(self, fetcher, request, cancel), fields(page = request.page(), source = fetcher.source_id()))]
    pub async fn fetch<F>(
        &self,
        fetcher: &F,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<RawPage, FetchError>
    where
        F: PageFetcher + ?Sized,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let started = Instant::now();
            let result = match timeout(self.page_timeout, fetcher.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(page) => {
                    debug!(attempt, duration_ms, "Page fetched");
                    return Ok(page);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        duration_ms,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient fetch failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, duration_ms, error = %err, "Fetch failed");
                    return Err(err);
                }
            }
        }
    }
}
