// =============================================================================
// Fetch Client: uniform, quota-enforcing front door to every data source
// =============================================================================
//
// `fetch(source, key)` takes a token from the source's bucket (suspending if
// necessary), calls the provider and keeps per-source request statistics for
// the end-of-run health report.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::rate_limit::{QuotaSnapshot, RateLimitRegistry};
use super::{FetchError, Fetcher, SourceRecord};
use crate::types::WorkKey;

#[derive(Debug, Default, Clone)]
struct Counters {
    requests: u64,
    successes: u64,
    rate_limited: u64,
    unavailable: u64,
    malformed: u64,
    total_latency_ms: u64,
}

/// Per-source request statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub requests: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub unavailable: u64,
    pub malformed: u64,
    pub avg_latency_ms: f64,
}

/// Rate-limited client over a set of named fetchers.
pub struct FetchClient {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
    limits: RateLimitRegistry,
    health: RwLock<HashMap<String, Counters>>,
}

impl FetchClient {
    pub fn new(limits: RateLimitRegistry) -> Self {
        Self {
            fetchers: HashMap::new(),
            limits,
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Register a fetcher under its own name.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(fetcher.name().to_string(), fetcher);
        self
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.fetchers.contains_key(source)
    }

    /// Fetch one record for `key` from `source`.
    pub async fn fetch(&self, source: &str, key: &WorkKey) -> Result<SourceRecord, FetchError> {
        let fetcher = self
            .fetchers
            .get(source)
            .ok_or_else(|| FetchError::unavailable(source, "no fetcher registered"))?;

        if let Err(e) = self.limits.acquire(source).await {
            self.record(source, Err(&e), 0);
            return Err(e);
        }

        let started = Instant::now();
        let result = fetcher.fetch(key).await.and_then(|record| {
            if record.key() != key || record.source() != source {
                Err(FetchError::malformed(
                    source,
                    format!("record for {}@{} returned for {key}", record.source(), record.key()),
                ))
            } else {
                Ok(record)
            }
        });
        let latency_ms = started.elapsed().as_millis() as u64;

        self.record(source, result.as_ref().map(|_| ()), latency_ms);
        match &result {
            Ok(record) => debug!(
                source,
                key = %key,
                fields = record.fields().len(),
                passages = record.passages().len(),
                latency_ms,
                "source fetched"
            ),
            Err(e) => debug!(source, key = %key, error = %e, latency_ms, "source fetch failed"),
        }
        result
    }

    fn record(&self, source: &str, outcome: Result<(), &FetchError>, latency_ms: u64) {
        let mut health = self.health.write();
        let c = health.entry(source.to_string()).or_default();
        c.requests += 1;
        c.total_latency_ms += latency_ms;
        match outcome {
            Ok(()) => c.successes += 1,
            Err(FetchError::RateLimited { .. }) => c.rate_limited += 1,
            Err(FetchError::SourceUnavailable { .. }) => c.unavailable += 1,
            Err(FetchError::MalformedResponse { .. }) => c.malformed += 1,
        }
    }

    pub fn health(&self) -> Vec<SourceHealth> {
        let health = self.health.read();
        let mut out: Vec<SourceHealth> = health
            .iter()
            .map(|(source, c)| SourceHealth {
                source: source.clone(),
                requests: c.requests,
                successes: c.successes,
                rate_limited: c.rate_limited,
                unavailable: c.unavailable,
                malformed: c.malformed,
                avg_latency_ms: if c.requests > 0 {
                    c.total_latency_ms as f64 / c.requests as f64
                } else {
                    0.0
                },
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }

    pub fn quotas(&self) -> Vec<QuotaSnapshot> {
        self.limits.snapshot()
    }

    pub fn log_health(&self) {
        for h in self.health() {
            info!(
                source = %h.source,
                requests = h.requests,
                successes = h.successes,
                rate_limited = h.rate_limited,
                unavailable = h.unavailable,
                malformed = h.malformed,
                avg_latency_ms = h.avg_latency_ms,
                "source health"
            );
        }
        for q in self.quotas() {
            info!(source = %q.source, capacity = q.capacity, available = q.available, "quota remaining");
        }
    }
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("sources", &self.fetchers.keys().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .finish()
    }
}
