// =============================================================================
// Rate Limits: token bucket per source, shared process-wide
// =============================================================================
//
// Each provider publishes a request quota (Finnhub free tier: 60/min, the
// search API a handful of requests per second).  Every source gets its own
// token bucket: `capacity` tokens of burst, refilled continuously at
// `refill_per_sec`.
//
// The registry is created once at start-up and handed to the fetch client;
// there is no global state.  Each bucket sits behind its own mutex so callers
// for different sources never contend.
//
// Bucket arithmetic takes the current instant as a parameter so that it can
// be driven by a synthetic clock in tests.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::FetchError;
use crate::runtime_config::SourceConfig;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Classic token bucket. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // A clock that goes backwards must not mint tokens.
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token at `now`, or return how long until one is available.
    /// A wait too long to represent saturates at `Duration::MAX`.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(Duration::MAX))
        }
    }

    /// Whole tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Quota {
    bucket: Mutex<TokenBucket>,
    acquire_timeout: Duration,
}

/// Serialisable view of one source's quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub source: String,
    pub capacity: u32,
    pub available: u32,
}

/// Process-wide quota state, one bucket per configured source.
#[derive(Clone, Default)]
pub struct RateLimitRegistry {
    quotas: Arc<HashMap<String, Quota>>,
}

impl RateLimitRegistry {
    pub fn from_sources(sources: &[SourceConfig]) -> Self {
        let now = tokio::time::Instant::now().into_std();
        let quotas = sources
            .iter()
            .map(|s| {
                debug!(
                    source = %s.name,
                    capacity = s.capacity,
                    refill_per_sec = s.refill_per_sec,
                    "quota registered"
                );
                (
                    s.name.clone(),
                    Quota {
                        bucket: Mutex::new(TokenBucket::new(s.capacity, s.refill_per_sec, now)),
                        acquire_timeout: Duration::from_millis(s.acquire_timeout_ms),
                    },
                )
            })
            .collect();
        Self {
            quotas: Arc::new(quotas),
        }
    }

    /// Wait for a token for `source`.
    ///
    /// Suspends the caller while the bucket is empty; gives up with
    /// `RateLimited` once the source's acquire timeout would be exceeded.
    /// Sources without a registered quota are not limited.
    pub async fn acquire(&self, source: &str) -> Result<(), FetchError> {
        let Some(quota) = self.quotas.get(source) else {
            return Ok(());
        };

        let started = tokio::time::Instant::now();
        loop {
            let now = tokio::time::Instant::now();
            let wait = match quota.bucket.lock().try_take(now.into_std()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let waited = now.duration_since(started);
            if waited.saturating_add(wait) > quota.acquire_timeout {
                warn!(
                    source,
                    waited_ms = waited.as_millis() as u64,
                    "quota exhausted, giving up"
                );
                return Err(FetchError::RateLimited {
                    source_name: source.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            debug!(source, wait_ms = wait.as_millis() as u64, "waiting for quota token");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn snapshot(&self) -> Vec<QuotaSnapshot> {
        let now = tokio::time::Instant::now().into_std();
        let mut out: Vec<QuotaSnapshot> = self
            .quotas
            .iter()
            .map(|(name, quota)| {
                let mut bucket = quota.bucket.lock();
                QuotaSnapshot {
                    source: name.clone(),
                    capacity: bucket.capacity(),
                    available: bucket.available(now),
                }
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }
}

impl std::fmt::Debug for RateLimitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitRegistry")
            .field("sources", &self.quotas.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, capacity: u32, refill_per_sec: f64, timeout_ms: u64) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            capacity,
            refill_per_sec,
            acquire_timeout_ms: timeout_ms,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn burst_is_capped_at_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(5, 1.0, t0);
        for _ in 0..5 {
            assert!(bucket.try_take(t0).is_ok());
        }
        let wait = bucket.try_take(t0).unwrap_err();
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn refill_does_not_exceed_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(3, 10.0, t0);
        assert_eq!(bucket.available(t0 + Duration::from_secs(3600)), 3);
    }

    #[test]
    fn clock_going_backwards_mints_nothing() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::new(1, 1.0, t0);
        assert!(bucket.try_take(t0).is_ok());
        assert!(bucket.try_take(t0 - Duration::from_secs(5)).is_err());
    }

    /// With a synthetic clock stepping through a long schedule of greedy
    /// callers, no window of length `w` ever sees more than
    /// `capacity + floor(w * rate)` grants, and no instant more than `capacity`.
    #[test]
    fn grants_within_any_window_are_bounded() {
        let capacity = 4u32;
        let rate = 2.0;
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(capacity, rate, t0);

        // Irregular step pattern: bursts, gaps, sub-token steps.
        let steps_ms = [0u64, 1, 7, 130, 499, 500, 501, 900, 2_000, 2_001, 2_250, 5_000];
        let mut grants: Vec<u64> = Vec::new();
        let mut now_ms = 0u64;
        for round in 0..200u64 {
            now_ms += steps_ms[(round as usize) % steps_ms.len()] % 700;
            let now = t0 + Duration::from_millis(now_ms);
            // Every round, ten callers race for tokens at the same instant.
            for _ in 0..10 {
                if bucket.try_take(now).is_ok() {
                    grants.push(now_ms);
                }
            }
        }

        assert!(!grants.is_empty());
        for (i, &start) in grants.iter().enumerate() {
            for window_ms in [0u64, 250, 500, 1_000, 2_000, 10_000] {
                let issued = grants[i..]
                    .iter()
                    .take_while(|&&t| t <= start + window_ms)
                    .count() as u64;
                let bound = u64::from(capacity) + ((window_ms as f64 / 1000.0) * rate).floor() as u64;
                assert!(
                    issued <= bound,
                    "window [{start}, {}] issued {issued} > {bound}",
                    start + window_ms
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let registry = RateLimitRegistry::from_sources(&[source("finnhub", 1, 1.0, 5_000)]);
        registry.acquire("finnhub").await.unwrap();

        let before = tokio::time::Instant::now();
        registry.acquire("finnhub").await.unwrap();
        let waited = tokio::time::Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(999), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_with_rate_limited() {
        let registry = RateLimitRegistry::from_sources(&[source("news", 1, 0.1, 1_000)]);
        registry.acquire("news").await.unwrap();

        let err = registry.acquire("news").await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { ref source_name, .. } if source_name == "news"));
        assert!(err.is_transient());
    }

    #[test]
    fn vanishing_refill_rate_saturates_the_wait() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1, 1e-20, t0);
        assert!(bucket.try_take(t0).is_ok());
        assert_eq!(bucket.try_take(t0 + Duration::from_secs(1)), Err(Duration::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn vanishing_refill_rate_gives_up_instead_of_panicking() {
        let registry = RateLimitRegistry::from_sources(&[source("slow", 1, 1e-20, 200)]);
        registry.acquire("slow").await.unwrap();

        let before = tokio::time::Instant::now();
        let err = registry.acquire("slow").await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
        assert_eq!(tokio::time::Instant::now(), before);
    }

    #[tokio::test]
    async fn unknown_source_is_unlimited() {
        let registry = RateLimitRegistry::from_sources(&[]);
        for _ in 0..100 {
            registry.acquire("anything").await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_bucket() {
        let registry = RateLimitRegistry::from_sources(&[source("sec", 3, 0.001, 10)]);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = registry.clone();
            handles.push(tokio::spawn(async move { r.acquire("sec").await.is_ok() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(registry.snapshot()[0].available, 0);
    }
}
