// =============================================================================
// Sources Module
// =============================================================================
//
// Everything between the pipeline and the outside data providers:
// - `Fetcher` plugin trait + the immutable `SourceRecord` it yields
// - Token-bucket quota per source (`rate_limit`)
// - The rate-limited, health-tracking client wrapping any fetcher (`client`)
// - Concrete providers: Finnhub fundamentals, Perplexity news / SEC filings
// - Deterministic offline fixtures for test runs

pub mod client;
pub mod finnhub;
pub mod fixture;
pub mod perplexity;
pub mod rate_limit;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::WorkKey;

pub use client::{FetchClient, SourceHealth};
pub use rate_limit::RateLimitRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// No quota token became available in time. Recoverable.
    #[error("{source_name}: rate limited after waiting {waited_ms} ms")]
    RateLimited { source_name: String, waited_ms: u64 },

    /// Provider unreachable or returned a server error. Recoverable.
    #[error("{source_name}: source unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// Provider answered with something we cannot use. Permanent.
    #[error("{source_name}: malformed response: {reason}")]
    MalformedResponse { source_name: String, reason: String },
}

impl FetchError {
    /// Transient errors are retried with backoff; the rest are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::SourceUnavailable { .. })
    }

    pub fn source_name(&self) -> &str {
        match self {
            Self::RateLimited { source_name, .. }
            | Self::SourceUnavailable { source_name, .. }
            | Self::MalformedResponse { source_name, .. } => source_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::MalformedResponse { .. } => "malformed_response",
        }
    }

    pub fn unavailable(source_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(source_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_reqwest(source_name: &str, err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::malformed(source_name, err)
        } else {
            Self::unavailable(source_name, err)
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(source_name: &str, status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited {
                source_name: source_name.to_string(),
                waited_ms: 0,
            }
        } else if status.is_server_error() {
            Self::unavailable(source_name, format!("HTTP {status}"))
        } else {
            Self::malformed(source_name, format!("HTTP {status}"))
        }
    }
}

// ---------------------------------------------------------------------------
// SourceRecord
// ---------------------------------------------------------------------------

/// A piece of free text a source returned (headline + snippet, filing excerpt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Raw payload from one fetcher for one work unit.
///
/// Built once by the fetcher and read-only afterwards: fields are private and
/// only exposed through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    source: String,
    key: WorkKey,
    fetched_at: DateTime<Utc>,
    /// When the underlying data was published, if the provider says.
    published_at: Option<DateTime<Utc>>,
    freshness_secs: u64,
    fields: BTreeMap<String, serde_json::Value>,
    passages: Vec<Passage>,
}

impl SourceRecord {
    pub fn new(source: impl Into<String>, key: WorkKey, freshness_secs: u64) -> Self {
        Self {
            source: source.into(),
            key,
            fetched_at: Utc::now(),
            published_at: None,
            freshness_secs,
            fields: BTreeMap::new(),
            passages: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_passage(mut self, passage: Passage) -> Self {
        self.passages.push(passage);
        self
    }

    pub fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn key(&self) -> &WorkKey {
        &self.key
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn fields(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.fields
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.passages.is_empty()
    }

    /// Whether the data is still inside its freshness window.
    ///
    /// Age is measured at the close of the unit's date, or at `now` if that
    /// close is still ahead, so backfilled dates are judged as of their own day.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let anchor = self
            .key
            .as_of
            .and_hms_opt(23, 59, 59)
            .map_or(now, |close| close.and_utc().min(now));
        let reference = self.published_at.unwrap_or(self.fetched_at);
        anchor.signed_duration_since(reference) <= Duration::seconds(self.freshness_secs as i64)
    }
}

// ---------------------------------------------------------------------------
// Fetcher plugin interface
// ---------------------------------------------------------------------------

/// One external data provider. Implementations own their auth and wire
/// formats; the pipeline only sees `SourceRecord`s and `FetchError`s.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Name the source is configured under (quota, precedence, audit).
    fn name(&self) -> &str;

    async fn fetch(&self, key: &WorkKey) -> Result<SourceRecord, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn key() -> WorkKey {
        WorkKey::new("AAPL", NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
    }

    #[test]
    fn transient_classification() {
        assert!(FetchError::RateLimited { source_name: "a".into(), waited_ms: 5 }.is_transient());
        assert!(FetchError::unavailable("a", "503").is_transient());
        assert!(!FetchError::malformed("a", "bad json").is_transient());
    }

    #[test]
    fn status_classification() {
        let e = FetchError::from_status("news", reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert!(matches!(e, FetchError::RateLimited { .. }));
        let e = FetchError::from_status("news", reqwest::StatusCode::BAD_GATEWAY);
        assert!(matches!(e, FetchError::SourceUnavailable { .. }));
        let e = FetchError::from_status("news", reqwest::StatusCode::UNAUTHORIZED);
        assert!(matches!(e, FetchError::MalformedResponse { .. }));
        assert_eq!(e.source_name(), "news");
    }

    #[test]
    fn freshness_uses_publication_time_when_known() {
        let now = Utc::now();
        let today = WorkKey::new("AAPL", now.date_naive());
        let record = SourceRecord::new("news", today.clone(), 3600)
            .published_at(now - Duration::hours(2));
        assert!(!record.is_fresh(now));

        let record = SourceRecord::new("news", today.clone(), 3600).published_at(now - Duration::minutes(30));
        assert!(record.is_fresh(now));

        // No publication time: judged by when it was fetched.
        assert!(SourceRecord::new("news", today, 3600).is_fresh(now));
    }

    #[test]
    fn backfilled_dates_judge_freshness_at_their_own_close() {
        let now = Utc::now();
        let close = key().as_of.and_hms_opt(23, 59, 59).unwrap().and_utc();
        assert!(close < now);

        let record = SourceRecord::new("news", key(), 86_400).published_at(close - Duration::hours(12));
        assert!(record.is_fresh(now));

        let record = SourceRecord::new("news", key(), 86_400).published_at(close - Duration::days(3));
        assert!(!record.is_fresh(now));
    }

    #[test]
    fn empty_record() {
        let record = SourceRecord::new("finnhub", key(), 60);
        assert!(record.is_empty());
        let record = record.with_field("pe_ratio", 28.5);
        assert!(!record.is_empty());
        assert_eq!(record.fields()["pe_ratio"], serde_json::json!(28.5));
    }
}
