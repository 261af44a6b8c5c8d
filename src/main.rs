use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use listing_harvester::client::HttpPageFetcher;
use listing_harvester::harvest::{HarvestDataset, HarvestPipeline, RecordNormalizer};
use listing_harvester::{HarvestConfig, SearchRegion};

/// Collects property listings for a map region, page by page.
#[derive(Parser, Debug)]
#[command(name = "listing-harvester", version)]
struct Cli {
    /// Western boundary (longitude)
    #[arg(long, default_value_t = -118.668176, allow_hyphen_values = true)]
    west: f64,

    /// Eastern boundary (longitude)
    #[arg(long, default_value_t = -118.155289, allow_hyphen_values = true)]
    east: f64,

    /// Southern boundary (latitude)
    #[arg(long, default_value_t = 33.703652, allow_hyphen_values = true)]
    south: f64,

    /// Northern boundary (latitude)
    #[arg(long, default_value_t = 34.337306, allow_hyphen_values = true)]
    north: f64,

    /// Number of result pages to fetch
    #[arg(long, default_value_t = 5)]
    pages: usize,

    /// Where to write the JSON dataset
    #[arg(long, short, default_value = "zillow_data.json")]
    output: PathBuf,

    /// Maximum simultaneous fetches (overrides HARVEST_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-attempt timeout in seconds (overrides HARVEST_PAGE_TIMEOUT_MS)
    #[arg(long)]
    page_timeout_secs: Option<u64>,

    /// Deadline for the whole run in seconds (overrides HARVEST_TIMEOUT_MS)
    #[arg(long)]
    harvest_timeout_secs: Option<u64>,

    /// Attempts per page, first try included (overrides HARVEST_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,
}

impl Cli {
    fn apply(&self, mut config: HarvestConfig) -> HarvestConfig {
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(secs) = self.page_timeout_secs {
            config = config.with_page_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.harvest_timeout_secs {
            config = config.with_harvest_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.apply(HarvestConfig::from_env().context("Failed to load configuration")?);
    config.validate().context("Invalid configuration")?;

    let region = SearchRegion::new(cli.west, cli.east, cli.south, cli.north)?;
    let fetcher = HttpPageFetcher::new(&config).context("Failed to create HTTP client")?;
    let pipeline = HarvestPipeline::from_config(fetcher, RecordNormalizer::new(), &config);

    info!(
        pages = cli.pages,
        concurrency = config.concurrency,
        endpoint = %config.endpoint,
        "Starting listing harvest"
    );

    let execution_time = Utc::now();
    let report = pipeline.run(region, cli.pages).await?;

    let dataset = HarvestDataset::from_report(&report, region, execution_time);
    dataset
        .write_json(&cli.output)
        .await
        .with_context(|| format!("Failed to save results to {}", cli.output.display()))?;

    if let Some(message) = &report.warning {
        warn!("{message}");
    }
    info!(
        state = ?report.state,
        "Retrieved {}/{} pages, {} properties collected",
        report.stats.pages_received,
        report.stats.pages_requested,
        report.result.len()
    );

    Ok(())
}
