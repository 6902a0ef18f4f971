// =============================================================================
// Signal Assembler: turn a settled date into one validated, ranked batch
// =============================================================================
//
// 1. Wait until every unit of the date is terminal, or the batch deadline
//    passes.  On deadline, whatever is still in flight is cancelled and its
//    late results are discarded by the queue.
// 2. Collect `Complete` units, validate each entry, rank by score.
// 3. Refuse to emit a batch covering less than `min_batch_fraction` of the
//    date's entities.  A partial batch is never silently submitted.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::{AuditCode, AuditLog};
use crate::error::BatchError;
use crate::queue::{DateProgress, EntityWorkQueue, UnitOutcome};
use crate::runtime_config::PipelineConfig;
use crate::types::{Stage, WorkState};

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    pub entity_id: String,
    pub score: f64,
}

/// The validated signal set for one submission date. Read-only once built.
#[derive(Debug, Clone, Serialize)]
pub struct SignalBatch {
    id: String,
    as_of: NaiveDate,
    entries: Vec<SignalEntry>,
    /// Hex SHA-256 over the ranked entries.
    digest: String,
    emitted_at: DateTime<Utc>,
}

fn digest_entries(as_of: NaiveDate, entries: &[SignalEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(as_of.to_string().as_bytes());
    for e in entries {
        hasher.update(format!("\n{},{:.6}", e.entity_id, e.score).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename batch file to {}", path.display()))?;
    Ok(())
}

impl SignalBatch {
    fn new(as_of: NaiveDate, entries: Vec<SignalEntry>) -> Self {
        let digest = digest_entries(as_of, &entries);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            as_of,
            entries,
            digest,
            emitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Entries ranked by score, highest first.
    pub fn entries(&self) -> &[SignalEntry] {
        &self.entries
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranked `[{entity_id, score}]` as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(&self.entries).context("failed to serialise signal batch")?;
        write_atomic(path.as_ref(), &content)
    }

    /// Upload format: `ticker,signal` with one row per entry.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["ticker", "signal"])?;
        for e in &self.entries {
            let score = format!("{:.6}", e.score);
            writer.write_record([e.entity_id.as_str(), score.as_str()])?;
        }
        let content = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context("failed to flush CSV buffer")?;
        write_atomic(path.as_ref(), &content)
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

fn stage_of(state: WorkState) -> Stage {
    match state {
        WorkState::Pending | WorkState::Fetching => Stage::Fetch,
        WorkState::Inferring => Stage::Infer,
        _ => Stage::Verify,
    }
}

pub struct SignalAssembler {
    queue: Arc<EntityWorkQueue>,
    audit: Arc<AuditLog>,
    entity_pattern: Regex,
    score_min: f64,
    score_max: f64,
    confidence_threshold: f64,
    min_batch_fraction: f64,
}

impl SignalAssembler {
    pub fn new(queue: Arc<EntityWorkQueue>, audit: Arc<AuditLog>, config: &PipelineConfig) -> Result<Self> {
        let entity_pattern =
            Regex::new(&config.entity_id_pattern).context("entity_id_pattern is not a valid regex")?;
        Ok(Self {
            queue,
            audit,
            entity_pattern,
            score_min: config.score_min,
            score_max: config.score_max,
            confidence_threshold: config.confidence_threshold,
            min_batch_fraction: config.min_batch_fraction,
        })
    }

    /// Wait for every unit of `as_of` to settle. At `deadline`, cancel the
    /// stragglers and audit each one.
    pub async fn await_settled(&self, as_of: NaiveDate, deadline: Instant) -> DateProgress {
        loop {
            let notified = self.queue.changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let progress = self.queue.progress(as_of);
            if progress.settled() {
                return progress;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let cancelled = self.queue.cancel_date(as_of);
                    warn!(as_of = %as_of, cancelled = cancelled.len(), "batch deadline reached");
                    for (key, state) in &cancelled {
                        self.audit.record(
                            key,
                            stage_of(*state),
                            AuditCode::DeadlineExceeded,
                            format!("cancelled at batch deadline while {state}"),
                        );
                    }
                    return self.queue.progress(as_of);
                }
            }
        }
    }

    /// Build the batch for `as_of` from the queue's terminal outcomes.
    pub fn assemble(&self, as_of: NaiveDate) -> Result<SignalBatch, BatchError> {
        let outcomes = self.queue.outcomes(as_of);
        let total = self.queue.progress(as_of).total;
        if total == 0 {
            return Err(BatchError::Empty { as_of });
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (_, outcome) in outcomes {
            let UnitOutcome::Complete(signal) = outcome else {
                continue;
            };
            if signal.confidence < self.confidence_threshold {
                continue;
            }
            let entity_id = signal.key.entity_id;
            if !self.entity_pattern.is_match(&entity_id) {
                return Err(BatchError::InvalidEntry {
                    entity_id,
                    reason: format!("does not match {}", self.entity_pattern.as_str()),
                });
            }
            if !signal.score.is_finite() || signal.score < self.score_min || signal.score > self.score_max {
                return Err(BatchError::InvalidEntry {
                    entity_id,
                    reason: format!(
                        "score {} outside [{}, {}]",
                        signal.score, self.score_min, self.score_max
                    ),
                });
            }
            if !seen.insert(entity_id.clone()) {
                return Err(BatchError::InvalidEntry {
                    entity_id,
                    reason: "duplicate entity".to_string(),
                });
            }
            entries.push(SignalEntry {
                entity_id,
                score: signal.score,
            });
        }

        let valid = entries.len();
        let fraction = valid as f64 / total as f64;
        if fraction < self.min_batch_fraction {
            return Err(BatchError::IncompleteBatch {
                as_of,
                valid,
                total,
                fraction,
                required: self.min_batch_fraction,
            });
        }

        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let batch = SignalBatch::new(as_of, entries);
        info!(
            as_of = %as_of,
            batch_id = %batch.id(),
            entries = valid,
            total,
            digest = %batch.digest(),
            "signal batch assembled"
        );
        Ok(batch)
    }
}

impl std::fmt::Debug for SignalAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalAssembler")
            .field("score_range", &(self.score_min, self.score_max))
            .field("confidence_threshold", &self.confidence_threshold)
            .field("min_batch_fraction", &self.min_batch_fraction)
            .finish()
    }
}
