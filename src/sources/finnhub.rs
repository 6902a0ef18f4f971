// =============================================================================
// Finnhub Fundamentals Fetcher
// =============================================================================
//
// GET /api/v1/stock/metric?symbol=..&metric=all
//
// The free tier allows 60 requests per minute; the quota itself is enforced
// by the fetch client, not here.  SECURITY: the API token is never logged.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{FetchError, Fetcher, SourceRecord};
use crate::types::WorkKey;

const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1";

/// Finnhub metric name → merged-context field name.
const METRIC_FIELDS: &[(&str, &str)] = &[
    ("peTTM", "pe_ratio"),
    ("revenueGrowthTTMYoy", "revenue_growth_yoy"),
    ("epsTTM", "eps"),
    ("52WeekHigh", "week52_high"),
    ("52WeekLow", "week52_low"),
    ("marketCapitalization", "market_cap_millions"),
    ("dividendYieldIndicatedAnnual", "dividend_yield"),
    ("pbAnnual", "price_to_book"),
];

/// Fallbacks used when the primary metric is missing.
const METRIC_FALLBACKS: &[(&str, &str)] = &[
    ("peBasicExclExtraTTM", "pe_ratio"),
    ("revenueGrowthQuarterlyYoy", "revenue_growth_yoy"),
];

#[derive(Clone)]
pub struct FinnhubFetcher {
    name: String,
    api_key: String,
    base_url: String,
    freshness_secs: u64,
    client: reqwest::Client,
}

impl FinnhubFetcher {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>, freshness_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build Finnhub HTTP client")?;

        Ok(Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            freshness_secs,
            client,
        })
    }
}

#[async_trait]
impl Fetcher for FinnhubFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name), name = "finnhub::fetch")]
    async fn fetch(&self, key: &WorkKey) -> Result<SourceRecord, FetchError> {
        let url = format!("{}/stock/metric", self.base_url);

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", key.entity_id.as_str()),
                ("metric", "all"),
                ("token", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&self.name, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(&self.name, status));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::malformed(&self.name, e))?;

        let record = parse_metrics(&self.name, key, &body, self.freshness_secs)?;
        debug!(entity = %key.entity_id, fields = record.fields().len(), "finnhub metrics parsed");
        Ok(record)
    }
}

/// Turn a `/stock/metric` response into a record.
pub fn parse_metrics(
    source: &str,
    key: &WorkKey,
    body: &Value,
    freshness_secs: u64,
) -> Result<SourceRecord, FetchError> {
    let metrics = body
        .get("metric")
        .and_then(Value::as_object)
        .ok_or_else(|| FetchError::malformed(source, "response missing 'metric' object"))?;

    let mut record = SourceRecord::new(source, key.clone(), freshness_secs);
    for (metric, field) in METRIC_FIELDS {
        if let Some(v) = metrics.get(*metric).and_then(Value::as_f64) {
            record = record.with_field(*field, v);
        }
    }
    for (metric, field) in METRIC_FALLBACKS {
        if record.fields().contains_key(*field) {
            continue;
        }
        if let Some(v) = metrics.get(*metric).and_then(Value::as_f64) {
            record = record.with_field(*field, v);
        }
    }

    if record.is_empty() {
        return Err(FetchError::malformed(
            source,
            format!("no usable metrics for {}", key.entity_id),
        ));
    }
    Ok(record)
}

impl std::fmt::Debug for FinnhubFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinnhubFetcher")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn key() -> WorkKey {
        WorkKey::new("AAPL", NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
    }

    #[test]
    fn parses_known_metrics() {
        let body = json!({
            "metric": {
                "peTTM": 28.5,
                "revenueGrowthTTMYoy": 12.5,
                "epsTTM": 6.05,
                "52WeekHigh": 195.87,
                "52WeekLow": 152.34,
                "unrelated": "ignored"
            },
            "symbol": "AAPL"
        });
        let record = parse_metrics("finnhub", &key(), &body, 86_400).unwrap();
        assert_eq!(record.fields()["pe_ratio"], json!(28.5));
        assert_eq!(record.fields()["week52_low"], json!(152.34));
        assert!(!record.fields().contains_key("unrelated"));
    }

    #[test]
    fn falls_back_when_primary_metric_missing() {
        let body = json!({ "metric": { "peBasicExclExtraTTM": 31.0 } });
        let record = parse_metrics("finnhub", &key(), &body, 86_400).unwrap();
        assert_eq!(record.fields()["pe_ratio"], json!(31.0));
    }

    #[test]
    fn empty_metrics_are_malformed() {
        let err = parse_metrics("finnhub", &key(), &json!({ "metric": {} }), 60).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse { .. }));
        let err = parse_metrics("finnhub", &key(), &json!({ "error": "x" }), 60).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse { .. }));
    }

    #[test]
    fn debug_redacts_api_key() {
        let f = FinnhubFetcher::new("finnhub", "secret-token", 60).unwrap();
        assert!(!format!("{f:?}").contains("secret-token"));
    }
}
