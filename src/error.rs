// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
//   FetchError   (sources)     per source; transient ones are retried.
//   ModelError   (inference)   retried once, then final for the unit.
//   UnitFailure                a work unit is permanently `failed`.
//   BatchError                 the only errors escalated to the operator.
//
// A low-confidence verdict is not an error: the unit ends `complete-excluded`.
// =============================================================================

use chrono::NaiveDate;
use serde::Serialize;

use crate::audit::AuditCode;
use crate::types::WorkState;

/// Why a work unit ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum UnitFailure {
    #[error("insufficient coverage: {succeeded}/{configured} sources succeeded, missing required {missing_required:?}")]
    InsufficientCoverage {
        succeeded: usize,
        configured: usize,
        missing_required: Vec<String>,
    },

    #[error("model timed out on {attempts} attempts")]
    ModelTimeout { attempts: u32 },

    #[error("model overloaded on {attempts} attempts: {reason}")]
    ModelOverload { attempts: u32, reason: String },

    #[error("model returned invalid output: {reason}")]
    InvalidOutput { reason: String },

    #[error("batch deadline passed while unit was {state}")]
    DeadlineExceeded { state: WorkState },
}

impl UnitFailure {
    pub fn audit_code(&self) -> AuditCode {
        match self {
            Self::InsufficientCoverage { .. } => AuditCode::InsufficientCoverage,
            Self::ModelTimeout { .. } => AuditCode::ModelTimeout,
            Self::ModelOverload { .. } => AuditCode::ModelOverload,
            Self::InvalidOutput { .. } => AuditCode::InvalidOutput,
            Self::DeadlineExceeded { .. } => AuditCode::DeadlineExceeded,
        }
    }
}

/// Batch-level failures. These are surfaced, never silently degraded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    #[error(
        "incomplete batch for {as_of}: {valid}/{total} entities produced a valid signal \
         ({fraction:.3} < required {required:.3})"
    )]
    IncompleteBatch {
        as_of: NaiveDate,
        valid: usize,
        total: usize,
        fraction: f64,
        required: f64,
    },

    #[error("invalid batch entry '{entity_id}': {reason}")]
    InvalidEntry { entity_id: String, reason: String },

    #[error("no work units scheduled for {as_of}")]
    Empty { as_of: NaiveDate },
}
