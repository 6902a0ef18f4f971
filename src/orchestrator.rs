// =============================================================================
// Fetch Orchestrator: fan out to every source, enforce quorum, merge
// =============================================================================
//
// All configured sources are queried in parallel.  Each source gets its own
// retry budget for transient failures; a source that still fails (or answers
// with a malformed or stale record) is written off for this unit only.
//
// Quorum:
//   succeeded ≥ 1
//   succeeded / configured ≥ quorum_fraction
//   every required source succeeded
//
// Every source failure is audited, including ones the unit survives.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, instrument, warn};

use crate::audit::{AuditCode, AuditLog};
use crate::context::{MergedContext, SourceFailure};
use crate::error::UnitFailure;
use crate::runtime_config::{PipelineConfig, SourceConfig};
use crate::sources::{FetchClient, SourceRecord};
use crate::types::{Stage, WorkKey};

pub struct FetchOrchestrator {
    client: Arc<FetchClient>,
    sources: Vec<SourceConfig>,
    required_sources: Vec<String>,
    quorum_fraction: f64,
    precedence: Vec<String>,
    audit: Arc<AuditLog>,
}

impl FetchOrchestrator {
    pub fn new(client: Arc<FetchClient>, config: &PipelineConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            client,
            sources: config.sources.clone(),
            required_sources: config.required_sources.clone(),
            quorum_fraction: config.quorum_fraction,
            precedence: config.source_precedence.clone(),
            audit,
        }
    }

    /// Fetch from one source, retrying transient errors per its policy.
    async fn fetch_source(&self, source: &SourceConfig, key: &WorkKey) -> Result<SourceRecord, SourceFailure> {
        let mut attempt = 1;
        loop {
            match self.client.fetch(&source.name, key).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && source.retry.should_retry(attempt) => {
                    let backoff = source.retry.backoff(attempt);
                    debug!(
                        source = %source.name,
                        key = %key,
                        kind = e.kind(),
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient source failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(SourceFailure::from_error(&e, attempt)),
            }
        }
    }

    /// Build the merged context for `key`, or fail the unit for lack of coverage.
    #[instrument(skip(self), fields(key = %key), name = "orchestrator::gather")]
    pub async fn gather(&self, key: &WorkKey) -> Result<MergedContext, UnitFailure> {
        let results = join_all(self.sources.iter().map(|s| self.fetch_source(s, key))).await;

        let now = Utc::now();
        let mut records = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(record) if record.is_fresh(now) => records.push(record),
                Ok(record) => failures.push(SourceFailure::stale(&record)),
                Err(failure) => failures.push(failure),
            }
        }

        for failure in &failures {
            warn!(
                key = %key,
                source = %failure.source,
                attempts = failure.attempts,
                reason = %failure.reason,
                "source failed for unit"
            );
            self.audit.record(
                key,
                Stage::Fetch,
                AuditCode::SourceFailed,
                format!("{} after {} attempt(s): {}", failure.source, failure.attempts, failure.reason),
            );
        }

        let configured = self.sources.len();
        let succeeded = records.len();
        let missing_required: Vec<String> = self
            .required_sources
            .iter()
            .filter(|r| !records.iter().any(|rec| rec.source() == r.as_str()))
            .cloned()
            .collect();

        let fraction = if configured == 0 {
            0.0
        } else {
            succeeded as f64 / configured as f64
        };
        if succeeded == 0 || fraction < self.quorum_fraction || !missing_required.is_empty() {
            return Err(UnitFailure::InsufficientCoverage {
                succeeded,
                configured,
                missing_required,
            });
        }

        let context = MergedContext::merge(key.clone(), records, &self.precedence, failures);
        debug_assert!(context.provenance_complete(), "merged field without a contributing source");
        debug!(
            key = %key,
            succeeded,
            configured,
            failed = context.failed_sources().len(),
            fields = context.fields().len(),
            evidence = context.evidence().len(),
            "context merged"
        );
        Ok(context)
    }
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("sources", &self.sources.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("required_sources", &self.required_sources)
            .field("quorum_fraction", &self.quorum_fraction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::runtime_config::SourceKind;
    use crate::sources::{FetchError, Fetcher, RateLimitRegistry};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        Down,
        Garbage,
        Stale,
    }

    struct Fake {
        name: String,
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    impl Fake {
        fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behaviour,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for Fake {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, key: &WorkKey) -> Result<SourceRecord, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let record = SourceRecord::new(self.name.as_str(), key.clone(), 3_600)
                .with_field(format!("{}_value", self.name), 1.0);
            match self.behaviour {
                Behaviour::Ok => Ok(record),
                Behaviour::Down => Err(FetchError::unavailable(&self.name, "request timed out")),
                Behaviour::Garbage => Err(FetchError::malformed(&self.name, "expected JSON")),
                Behaviour::Stale => {
                    let published = key.as_of.and_hms_opt(0, 0, 0).unwrap().and_utc() - ChronoDuration::days(2);
                    Ok(record.published_at(published))
                }
            }
        }
    }

    fn key() -> WorkKey {
        WorkKey::new("AAPL", NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
    }

    fn source(name: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            kind: SourceKind::News,
            capacity: 100,
            refill_per_sec: 100.0,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 100,
                max_backoff_ms: 1_000,
            },
            ..SourceConfig::default()
        }
    }

    fn setup(fakes: &[Arc<Fake>], required: &[&str], quorum: f64) -> (FetchOrchestrator, Arc<AuditLog>) {
        let config = PipelineConfig {
            sources: fakes.iter().map(|f| source(&f.name)).collect(),
            required_sources: required.iter().map(|s| s.to_string()).collect(),
            quorum_fraction: quorum,
            source_precedence: fakes.iter().map(|f| f.name.clone()).collect(),
            ..PipelineConfig::default()
        };
        let mut client = FetchClient::new(RateLimitRegistry::from_sources(&config.sources));
        for f in fakes {
            client = client.with_fetcher(f.clone());
        }
        let audit = Arc::new(AuditLog::new(100));
        (FetchOrchestrator::new(Arc::new(client), &config, audit.clone()), audit)
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_survives_one_repeatedly_failing_source() {
        let a = Fake::new("a", Behaviour::Ok);
        let b = Fake::new("b", Behaviour::Ok);
        let c = Fake::new("c", Behaviour::Down);
        let (orch, audit) = setup(&[a, b, c.clone()], &[], 0.66);

        let ctx = orch.gather(&key()).await.unwrap();
        assert_eq!(ctx.sources(), &["a".to_string(), "b".to_string()]);
        assert_eq!(ctx.failed_sources().len(), 1);
        assert_eq!(ctx.failed_sources()[0].attempts, 3);
        assert!(ctx.provenance_complete());

        // C was retried to exhaustion, and its failure audited.
        assert_eq!(c.calls.load(Ordering::SeqCst), 3);
        assert_eq!(audit.count(AuditCode::SourceFailed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn below_quorum_fails_the_unit() {
        let a = Fake::new("a", Behaviour::Ok);
        let b = Fake::new("b", Behaviour::Down);
        let c = Fake::new("c", Behaviour::Down);
        let (orch, audit) = setup(&[a, b, c], &[], 0.66);

        match orch.gather(&key()).await {
            Err(UnitFailure::InsufficientCoverage { succeeded, configured, .. }) => {
                assert_eq!((succeeded, configured), (1, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(audit.count(AuditCode::SourceFailed), 2);
    }

    #[tokio::test]
    async fn missing_required_source_fails_even_with_quorum() {
        let a = Fake::new("a", Behaviour::Garbage);
        let b = Fake::new("b", Behaviour::Ok);
        let c = Fake::new("c", Behaviour::Ok);
        let (orch, _) = setup(&[a.clone(), b, c], &["a"], 0.5);

        match orch.gather(&key()).await {
            Err(UnitFailure::InsufficientCoverage { missing_required, .. }) => {
                assert_eq!(missing_required, ["a"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Malformed answers are not retried.
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_records_do_not_count() {
        let a = Fake::new("a", Behaviour::Ok);
        let b = Fake::new("b", Behaviour::Stale);
        let (orch, audit) = setup(&[a, b], &[], 1.0);

        assert!(orch.gather(&key()).await.is_err());
        let records = audit.snapshot().records;
        assert_eq!(records.len(), 1);
        assert!(records[0].message.contains("freshness"));
    }
}
