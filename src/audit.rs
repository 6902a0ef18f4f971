// =============================================================================
// Audit Log: every permanent failure and soft rejection, with a reason code
// =============================================================================
//
// Nothing the pipeline drops is dropped silently: per-source failures, unit
// failures and low-confidence exclusions all land here.  The log is a bounded
// ring; once `capacity` is reached the oldest records are evicted, and every
// eviction is counted and reported in the snapshot.
// =============================================================================

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Stage, WorkKey};

/// Machine-readable reason attached to every audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCode {
    /// One source failed for a unit; the unit may still have proceeded.
    SourceFailed,
    InsufficientCoverage,
    ModelTimeout,
    ModelOverload,
    InvalidOutput,
    LowConfidence,
    DeadlineExceeded,
}

impl std::fmt::Display for AuditCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SourceFailed => "source_failed",
            Self::InsufficientCoverage => "insufficient_coverage",
            Self::ModelTimeout => "model_timeout",
            Self::ModelOverload => "model_overload",
            Self::InvalidOutput => "invalid_output",
            Self::LowConfidence => "low_confidence",
            Self::DeadlineExceeded => "deadline_exceeded",
        };
        f.write_str(s)
    }
}

/// A single audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub entity_id: String,
    pub as_of: NaiveDate,
    pub stage: Stage,
    pub code: AuditCode,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// What `write_json` persists: the retained records plus how many were evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub dropped: u64,
    pub records: Vec<AuditRecord>,
}

struct Ring {
    records: VecDeque<AuditRecord>,
    dropped: u64,
}

/// Bounded, thread-safe audit trail shared by all stages.
pub struct AuditLog {
    ring: RwLock<Ring>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring {
                records: VecDeque::with_capacity(capacity.min(1024)),
                dropped: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record an event and mirror it to the log at `warn`.
    pub fn record(&self, key: &WorkKey, stage: Stage, code: AuditCode, message: impl Into<String>) {
        let message = message.into();
        warn!(
            entity = %key.entity_id,
            as_of = %key.as_of,
            stage = %stage,
            code = %code,
            message = %message,
            "audit"
        );

        let record = AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: key.entity_id.clone(),
            as_of: key.as_of,
            stage,
            code,
            message,
            at: Utc::now().to_rfc3339(),
        };

        let mut ring = self.ring.write();
        ring.records.push_back(record);
        while ring.records.len() > self.capacity {
            ring.records.pop_front();
            if ring.dropped == 0 {
                warn!(capacity = self.capacity, "audit log full, evicting oldest records");
            }
            ring.dropped += 1;
        }
    }

    pub fn snapshot(&self) -> AuditSnapshot {
        let ring = self.ring.read();
        AuditSnapshot {
            dropped: ring.dropped,
            records: ring.records.iter().cloned().collect(),
        }
    }

    /// Records evicted so far.
    pub fn dropped(&self) -> u64 {
        self.ring.read().dropped
    }

    pub fn count(&self, code: AuditCode) -> usize {
        self.ring.read().records.iter().filter(|r| r.code == code).count()
    }

    pub fn len(&self) -> usize {
        self.ring.read().records.len()
    }

    /// Write the snapshot as pretty JSON (atomic tmp + rename).
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.snapshot())
            .context("failed to serialise audit log")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename audit log to {}", path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.len())
            .field("dropped", &self.dropped())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(entity: &str) -> WorkKey {
        WorkKey::new(entity, NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
    }

    #[test]
    fn ring_evicts_oldest() {
        let log = AuditLog::new(2);
        log.record(&key("AAPL"), Stage::Fetch, AuditCode::SourceFailed, "news down");
        log.record(&key("MSFT"), Stage::Infer, AuditCode::ModelTimeout, "timed out");
        log.record(&key("NVDA"), Stage::Verify, AuditCode::LowConfidence, "0.40");

        let snap = log.snapshot();
        assert_eq!(snap.records.len(), 2);
        assert_eq!(snap.records[0].entity_id, "MSFT");
        assert_eq!(snap.records[1].code, AuditCode::LowConfidence);
        assert_eq!(snap.dropped, 1);
    }

    #[test]
    fn evictions_are_counted_in_the_written_snapshot() {
        let log = AuditLog::new(500);
        for i in 0..600 {
            log.record(&key(&format!("T{i:04}")), Stage::Fetch, AuditCode::SourceFailed, "news down");
        }
        assert_eq!(log.len(), 500);
        assert_eq!(log.dropped(), 100);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        log.write_json(&path).unwrap();
        let parsed: AuditSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.dropped, 100);
        assert_eq!(parsed.records.len(), 500);
        assert_eq!(parsed.records[0].entity_id, "T0100");
        assert_eq!(parsed.dropped as usize + parsed.records.len(), 600);
    }

    #[test]
    fn nothing_dropped_below_capacity() {
        let log = AuditLog::new(10);
        log.record(&key("AAPL"), Stage::Fetch, AuditCode::SourceFailed, "a");
        assert_eq!(log.snapshot().dropped, 0);
    }

    #[test]
    fn counts_by_code() {
        let log = AuditLog::new(10);
        log.record(&key("AAPL"), Stage::Fetch, AuditCode::SourceFailed, "a");
        log.record(&key("AAPL"), Stage::Fetch, AuditCode::SourceFailed, "b");
        log.record(&key("MSFT"), Stage::Fetch, AuditCode::InsufficientCoverage, "c");

        assert_eq!(log.count(AuditCode::SourceFailed), 2);
        assert_eq!(log.count(AuditCode::InsufficientCoverage), 1);
    }

    #[test]
    fn codes_serialise_snake_case() {
        let json = serde_json::to_string(&AuditCode::InsufficientCoverage).unwrap();
        assert_eq!(json, "\"insufficient_coverage\"");
        assert_eq!(AuditCode::LowConfidence.to_string(), "low_confidence");
    }

    #[test]
    fn writes_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        let log = AuditLog::new(10);
        log.record(&key("V"), Stage::Verify, AuditCode::LowConfidence, "0.65");
        log.write_json(&path).unwrap();

        let parsed: AuditSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.dropped, 0);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].entity_id, "V");
    }
}
