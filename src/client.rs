//! reqwest-backed [`PageFetcher`] for the public map-search endpoint.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, ORIGIN};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{BlockSignatures, HarvestConfig};
use crate::model::{PageRequest, Payload, RawPage};
use crate::traits::{FetchError, PageFetcher};

const ORIGIN_URL: &str = "https://www.zillow.com";
const SORT_ORDER: &str = "globalrelevanceex";
const REQUEST_ID: u32 = 6;

/// Non-geographic parts of the search query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub search_term: String,
    pub region_id: u64,
}

impl SearchQuery {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            search_term: config.search_term.clone(),
            region_id: config.region_id,
        }
    }
}

pub struct HttpPageFetcher {
    client: Client,
    endpoint: String,
    query: SearchQuery,
    block: BlockSignatures,
}

impl HttpPageFetcher {
    /// Builds the HTTP client. Timeouts are left to the executor.
    pub fn new(config: &HarvestConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(default_headers())
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            query: SearchQuery::from_config(config),
            block: config.block.clone(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    fn source_id(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        let response = self
            .client
            .put(&self.endpoint)
            .json(&search_payload(request, &self.query))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!(page = request.page(), status, bytes = body.len(), "Response received");

        classify_response(status, &body, &self.block)?;
        Ok(RawPage::new(*request, Payload::Bytes(body.to_vec())))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Http {
                status: status.as_u16(),
            }
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB,en;q=0.5"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ORIGIN, HeaderValue::from_static(ORIGIN_URL));
    headers
}

/// Request body for one page. The endpoint numbers pages from 1.
pub fn search_payload(request: &PageRequest, query: &SearchQuery) -> Value {
    let region = request.region();
    json!({
        "searchQueryState": {
            "pagination": { "currentPage": request.page() + 1 },
            "mapBounds": {
                "west": region.west(),
                "east": region.east(),
                "south": region.south(),
                "north": region.north(),
            },
            "usersSearchTerm": query.search_term,
            "regionSelection": [{ "regionId": query.region_id }],
            "filterState": { "sortSelection": { "value": SORT_ORDER } },
            "isListVisible": true,
        },
        "wants": { "cat1": ["listResults"], "cat2": ["total"] },
        "requestId": REQUEST_ID,
    })
}

/// Maps a response to a fetch error, if it is one. Block signatures are
/// checked before the status class so a 200 CAPTCHA page still counts.
pub fn classify_response(
    status: u16,
    body: &[u8],
    block: &BlockSignatures,
) -> Result<(), FetchError> {
    if let Some(reason) = block.detect(status, body) {
        return Err(FetchError::Blocked { reason });
    }
    if !(200..300).contains(&status) {
        return Err(FetchError::Http { status });
    }
    Ok(())
}
