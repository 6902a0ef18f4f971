// =============================================================================
// Perplexity Search Fetcher: market news and SEC filings
// =============================================================================
//
// POST /search
//
// Two modes share one client:
//   - News:       domain-filtered market news for the ticker.
//   - SecFilings: `search_mode = "sec"`, most recent periodic filing.
//
// Results become passages (title + snippet) that the verification stage
// matches claims against.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{FetchError, Fetcher, Passage, SourceRecord};
use crate::types::WorkKey;

const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";

const NEWS_DOMAINS: &[&str] = &[
    "cnbc.com",
    "bloomberg.com",
    "reuters.com",
    "marketwatch.com",
    "investor.com",
];

const NEWS_MAX_RESULTS: u32 = 5;
const SNIPPET_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    News,
    SecFilings,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: String,
    max_results: u32,
    max_tokens_per_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_domain_filter: Option<&'a [&'a str]>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Clone)]
pub struct PerplexityFetcher {
    name: String,
    mode: SearchMode,
    api_key: String,
    base_url: String,
    freshness_secs: u64,
    client: reqwest::Client,
}

impl PerplexityFetcher {
    pub fn new(
        name: impl Into<String>,
        mode: SearchMode,
        api_key: impl Into<String>,
        freshness_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build Perplexity HTTP client")?;

        Ok(Self {
            name: name.into(),
            mode,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            freshness_secs,
            client,
        })
    }

    fn request(&self, key: &WorkKey) -> SearchRequest<'static> {
        match self.mode {
            SearchMode::News => SearchRequest {
                query: format!(
                    "{} market analysis {}",
                    key.entity_id,
                    key.as_of.format("%B %Y")
                ),
                max_results: NEWS_MAX_RESULTS,
                max_tokens_per_page: 2048,
                search_mode: None,
                search_domain_filter: Some(NEWS_DOMAINS),
            },
            SearchMode::SecFilings => SearchRequest {
                query: format!("{} 10-Q {}", key.entity_id, key.as_of.year()),
                max_results: 1,
                max_tokens_per_page: 4096,
                search_mode: Some("sec"),
                search_domain_filter: None,
            },
        }
    }
}

#[async_trait]
impl Fetcher for PerplexityFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name, mode = ?self.mode), name = "perplexity::fetch")]
    async fn fetch(&self, key: &WorkKey) -> Result<SourceRecord, FetchError> {
        let url = format!("{}/search", self.base_url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request(key))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&self.name, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(&self.name, status));
        }

        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::malformed(&self.name, e))?;

        let record = build_record(&self.name, self.mode, key, body, self.freshness_secs)?;
        debug!(entity = %key.entity_id, passages = record.passages().len(), "search results parsed");
        Ok(record)
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Turn search results into a record. An empty result set is malformed: the
/// source answered but told us nothing.
pub fn build_record(
    source: &str,
    mode: SearchMode,
    key: &WorkKey,
    body: SearchResponse,
    freshness_secs: u64,
) -> Result<SourceRecord, FetchError> {
    if body.results.is_empty() {
        return Err(FetchError::malformed(
            source,
            format!("no search results for {}", key.entity_id),
        ));
    }

    let mut record = SourceRecord::new(source, key.clone(), freshness_secs);
    let newest = body
        .results
        .iter()
        .filter_map(|r| r.date.as_deref().and_then(parse_date))
        .max();
    if let Some(at) = newest {
        record = record.published_at(at);
    }

    match mode {
        SearchMode::News => {
            record = record.with_field("news_count", body.results.len() as u64);
        }
        SearchMode::SecFilings => {
            record = record.with_field("filing_type", "10-Q");
            if let Some(at) = newest {
                record = record.with_field("filed_date", at.date_naive().to_string());
            }
        }
    }

    for r in body.results {
        record = record.with_passage(Passage {
            title: r.title,
            text: truncate(&r.snippet, SNIPPET_MAX_CHARS),
            url: r.url,
        });
    }
    Ok(record)
}

impl std::fmt::Debug for PerplexityFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerplexityFetcher")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
