// =============================================================================
// Shared types used across the signal pipeline
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identifies one signal-generation task: a single entity on a single
/// submission date.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WorkKey {
    pub entity_id: String,
    pub as_of: NaiveDate,
}

impl WorkKey {
    pub fn new(entity_id: impl Into<String>, as_of: NaiveDate) -> Self {
        Self {
            entity_id: entity_id.into(),
            as_of,
        }
    }
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.as_of)
    }
}

/// Lifecycle of a work unit.
///
/// `Pending → Fetching → Inferring → Verifying → Complete | Excluded | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkState {
    Pending,
    Fetching,
    Inferring,
    Verifying,
    Complete,
    /// Verified below the confidence threshold: finished, but not submitted.
    Excluded,
    Failed,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Excluded | Self::Failed)
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fetching => write!(f, "fetching"),
            Self::Inferring => write!(f, "inferring"),
            Self::Verifying => write!(f, "verifying"),
            Self::Complete => write!(f, "complete"),
            Self::Excluded => write!(f, "complete-excluded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Pipeline stage a worker pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Fetch,
    Infer,
    Verify,
}

impl Stage {
    /// State a unit must be parked in before this stage may pick it up.
    pub fn ready_state(self) -> WorkState {
        match self {
            Self::Fetch => WorkState::Pending,
            Self::Infer => WorkState::Inferring,
            Self::Verify => WorkState::Verifying,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Infer => write!(f, "infer"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

/// How much a claim matters to the final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Materiality {
    /// Claim the score directly depends on.
    Core,
    Peripheral,
}

impl Default for Materiality {
    fn default() -> Self {
        Self::Peripheral
    }
}

/// A single statement produced by the model in support of its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    /// Merged-context field the claim refers to, if any.
    #[serde(default)]
    pub field: Option<String>,
    /// Numeric value asserted for `field`.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub materiality: Materiality,
}

impl Claim {
    pub fn text(text: impl Into<String>, materiality: Materiality) -> Self {
        Self {
            text: text.into(),
            field: None,
            value: None,
            materiality,
        }
    }

    pub fn numeric(
        text: impl Into<String>,
        field: impl Into<String>,
        value: f64,
        materiality: Materiality,
    ) -> Self {
        Self {
            text: text.into(),
            field: Some(field.into()),
            value: Some(value),
            materiality,
        }
    }
}

/// Run mode, mirroring the operator switch of the original tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Live providers and the local model.
    Production,
    /// Offline fixtures and the deterministic composite scorer.
    Test,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Test
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}
