// =============================================================================
// Inference Stage: bounded-concurrency submission to the scoring model
// =============================================================================
//
// The model is opaque: it takes a merged context and returns a score plus the
// claims it relied on.  A semaphore caps in-flight requests at the model's
// sustainable throughput; extra callers wait for a permit instead of piling
// onto the backend.  Timeouts and overloads are retried once with a fresh
// request, per the configured retry policy.
// =============================================================================

pub mod composite;
pub mod ollama;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::context::MergedContext;
use crate::error::UnitFailure;
use crate::retry::RetryPolicy;
use crate::types::{Claim, WorkKey};

pub use composite::CompositeBackend;
pub use ollama::OllamaBackend;

// ---------------------------------------------------------------------------
// Backend interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub score: f64,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("model timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("model overloaded: {0}")]
    Overload(String),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Overload(_))
    }
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn infer(&self, context: &MergedContext) -> Result<ModelOutput, ModelError>;
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Model output for one work unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    pub key: WorkKey,
    pub score: f64,
    pub claims: Vec<Claim>,
    pub model: String,
    pub attempts: u32,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

pub struct InferenceStage {
    backend: Arc<dyn InferenceBackend>,
    permits: Arc<Semaphore>,
    capacity: usize,
    timeout: Duration,
    retry: RetryPolicy,
    score_min: f64,
    score_max: f64,
}

impl InferenceStage {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        concurrency: usize,
        timeout: Duration,
        retry: RetryPolicy,
        score_range: (f64, f64),
    ) -> Self {
        let capacity = concurrency.max(1);
        Self {
            backend,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
            retry,
            score_min: score_range.0,
            score_max: score_range.1,
        }
    }

    /// Requests currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    async fn attempt(&self, context: &MergedContext) -> Result<ModelOutput, ModelError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ModelError::Overload("inference stage shut down".to_string()))?;

        match tokio::time::timeout(self.timeout, self.backend.infer(context)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn check_output(&self, output: &ModelOutput) -> Result<(), ModelError> {
        if !output.score.is_finite() || output.score < self.score_min || output.score > self.score_max {
            return Err(ModelError::InvalidOutput(format!(
                "score {} outside [{}, {}]",
                output.score, self.score_min, self.score_max
            )));
        }
        Ok(())
    }

    /// Score one merged context.
    pub async fn infer(&self, context: &MergedContext) -> Result<InferenceResult, UnitFailure> {
        let key = context.key();
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let outcome = self
                .attempt(context)
                .await
                .and_then(|out| self.check_output(&out).map(|_| out));

            match outcome {
                Ok(output) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    debug!(
                        key = %key,
                        score = output.score,
                        claims = output.claims.len(),
                        attempt,
                        latency_ms,
                        "inference complete"
                    );
                    return Ok(InferenceResult {
                        key: key.clone(),
                        score: output.score,
                        claims: output.claims,
                        model: self.backend.name().to_string(),
                        attempts: attempt,
                        latency_ms,
                    });
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    warn!(key = %key, error = %e, attempt, "inference failed, retrying");
                    let backoff = self.retry.backoff(attempt);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, attempt, "inference failed permanently");
                    return Err(match e {
                        ModelError::Timeout { .. } => UnitFailure::ModelTimeout { attempts: attempt },
                        ModelError::Overload(reason) => UnitFailure::ModelOverload {
                            attempts: attempt,
                            reason,
                        },
                        ModelError::InvalidOutput(reason) => UnitFailure::InvalidOutput { reason },
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for InferenceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceStage")
            .field("backend", &self.backend.name())
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .field("timeout", &self.timeout)
            .finish()
    }
}
