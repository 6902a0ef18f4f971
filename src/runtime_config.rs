// =============================================================================
// Pipeline Configuration: operator-tunable settings with atomic save
// =============================================================================
//
// Every quota, threshold and deadline the pipeline honours lives here so that
// operators can tune a run without touching code.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::retry::RetryPolicy;

/// Slowest refill a source may be configured with (one token per ~11.6 days).
pub const MIN_REFILL_PER_SEC: f64 = 1e-6;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_entities() -> Vec<String> {
    [
        "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA", "META", "BRK.B", "JNJ", "V",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            name: "finnhub".to_string(),
            kind: SourceKind::Fundamentals,
            // Free tier: 60 requests per minute.
            capacity: 60,
            refill_per_sec: 1.0,
            ..SourceConfig::default()
        },
        SourceConfig {
            name: "sec_filings".to_string(),
            kind: SourceKind::Filings,
            capacity: 5,
            refill_per_sec: 0.5,
            freshness_secs: 120 * 86_400,
            ..SourceConfig::default()
        },
        SourceConfig {
            name: "news".to_string(),
            kind: SourceKind::News,
            capacity: 5,
            refill_per_sec: 0.5,
            freshness_secs: 3 * 86_400,
            ..SourceConfig::default()
        },
    ]
}

fn default_required_sources() -> Vec<String> {
    vec!["finnhub".to_string()]
}

fn default_source_precedence() -> Vec<String> {
    vec![
        "finnhub".to_string(),
        "sec_filings".to_string(),
        "news".to_string(),
    ]
}

fn default_quorum_fraction() -> f64 {
    0.66
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_core_claim_weight() -> f64 {
    2.0
}

fn default_peripheral_claim_weight() -> f64 {
    1.0
}

fn default_numeric_tolerance() -> f64 {
    0.05
}

fn default_min_token_overlap() -> f64 {
    0.5
}

fn default_inference_concurrency() -> usize {
    2
}

fn default_model_timeout_ms() -> u64 {
    60_000
}

fn default_model_retry() -> RetryPolicy {
    RetryPolicy::once()
}

fn default_fetch_workers() -> usize {
    4
}

fn default_inference_workers() -> usize {
    2
}

fn default_verify_workers() -> usize {
    2
}

fn default_batch_deadline_secs() -> u64 {
    30 * 60
}

fn default_urgency_window_secs() -> u64 {
    5 * 60
}

fn default_min_batch_fraction() -> f64 {
    0.95
}

fn default_score_min() -> f64 {
    0.0
}

fn default_score_max() -> f64 {
    1.0
}

fn default_entity_id_pattern() -> String {
    r"^[A-Z0-9][A-Z0-9./\-]{0,15}$".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/signals")
}

fn default_audit_capacity() -> usize {
    20_000
}

fn default_capacity() -> u32 {
    10
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_freshness_secs() -> u64 {
    7 * 86_400
}

// =============================================================================
// SourceConfig
// =============================================================================

/// What kind of data a source contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Fundamentals,
    Filings,
    News,
}

impl Default for SourceKind {
    fn default() -> Self {
        Self::News
    }
}

/// Quota, retry and freshness settings for one external data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default)]
    pub kind: SourceKind,

    /// Token-bucket capacity (burst size). Match the provider's published limit.
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Tokens added back per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,

    /// How long a caller may wait for a token before failing with `RateLimited`.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Retry policy for transient failures of this source.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Records older than this do not count toward coverage.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: SourceKind::default(),
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            retry: RetryPolicy::default(),
            freshness_secs: default_freshness_secs(),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for a signal run.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Universe -----------------------------------------------------------

    /// Entities (tickers) to produce signals for.
    #[serde(default = "default_entities")]
    pub entities: Vec<String>,

    // --- Sources ------------------------------------------------------------

    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Sources that must succeed regardless of the quorum fraction.
    #[serde(default = "default_required_sources")]
    pub required_sources: Vec<String>,

    /// Minimum fraction of configured sources that must succeed per unit.
    #[serde(default = "default_quorum_fraction")]
    pub quorum_fraction: f64,

    /// Conflict precedence for merged fields, highest first. Sources not
    /// listed rank below every listed one.
    #[serde(default = "default_source_precedence")]
    pub source_precedence: Vec<String>,

    // --- Verification -------------------------------------------------------

    /// Units verified below this confidence are excluded from the batch.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_core_claim_weight")]
    pub core_claim_weight: f64,

    #[serde(default = "default_peripheral_claim_weight")]
    pub peripheral_claim_weight: f64,

    /// Relative tolerance for numeric claims (0.05 = within 5 %).
    #[serde(default = "default_numeric_tolerance")]
    pub numeric_tolerance: f64,

    /// Fraction of a claim's content tokens that must appear in evidence.
    #[serde(default = "default_min_token_overlap")]
    pub min_token_overlap: f64,

    // --- Inference ----------------------------------------------------------

    /// Maximum in-flight model requests.
    #[serde(default = "default_inference_concurrency")]
    pub inference_concurrency: usize,

    #[serde(default = "default_model_timeout_ms")]
    pub model_timeout_ms: u64,

    #[serde(default = "default_model_retry")]
    pub model_retry: RetryPolicy,

    // --- Worker pools -------------------------------------------------------

    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    #[serde(default = "default_inference_workers")]
    pub inference_workers: usize,

    #[serde(default = "default_verify_workers")]
    pub verify_workers: usize,

    // --- Batch --------------------------------------------------------------

    /// Hard cutoff for a submission date, measured from the start of the run.
    #[serde(default = "default_batch_deadline_secs")]
    pub batch_deadline_secs: u64,

    /// Units whose deadline is closer than this jump the FIFO order.
    #[serde(default = "default_urgency_window_secs")]
    pub urgency_window_secs: u64,

    /// Minimum fraction of entities that must produce a valid signal.
    #[serde(default = "default_min_batch_fraction")]
    pub min_batch_fraction: f64,

    #[serde(default = "default_score_min")]
    pub score_min: f64,

    #[serde(default = "default_score_max")]
    pub score_max: f64,

    #[serde(default = "default_entity_id_pattern")]
    pub entity_id_pattern: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Maximum audit records kept in memory.
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entities: default_entities(),
            sources: default_sources(),
            required_sources: default_required_sources(),
            quorum_fraction: default_quorum_fraction(),
            source_precedence: default_source_precedence(),
            confidence_threshold: default_confidence_threshold(),
            core_claim_weight: default_core_claim_weight(),
            peripheral_claim_weight: default_peripheral_claim_weight(),
            numeric_tolerance: default_numeric_tolerance(),
            min_token_overlap: default_min_token_overlap(),
            inference_concurrency: default_inference_concurrency(),
            model_timeout_ms: default_model_timeout_ms(),
            model_retry: default_model_retry(),
            fetch_workers: default_fetch_workers(),
            inference_workers: default_inference_workers(),
            verify_workers: default_verify_workers(),
            batch_deadline_secs: default_batch_deadline_secs(),
            urgency_window_secs: default_urgency_window_secs(),
            min_batch_fraction: default_min_batch_fraction(),
            score_min: default_score_min(),
            score_max: default_score_max(),
            entity_id_pattern: default_entity_id_pattern(),
            output_dir: default_output_dir(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid pipeline config in {}", path.display()))?;

        info!(
            path = %path.display(),
            entities = config.entities.len(),
            sources = config.sources.len(),
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Reject settings that would make the pipeline's invariants meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("at least one source must be configured");
        }
        for required in &self.required_sources {
            if !self.sources.iter().any(|s| &s.name == required) {
                bail!("required source '{required}' is not configured");
            }
        }
        for source in &self.sources {
            if source.capacity == 0 {
                bail!("source '{}' must have a positive capacity", source.name);
            }
            if !source.refill_per_sec.is_finite() || source.refill_per_sec < MIN_REFILL_PER_SEC {
                bail!(
                    "source '{}' refill_per_sec must be at least {MIN_REFILL_PER_SEC}",
                    source.name
                );
            }
        }
        if !(0.0..=1.0).contains(&self.quorum_fraction) {
            bail!("quorum_fraction must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!("confidence_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.min_batch_fraction) {
            bail!("min_batch_fraction must be within [0, 1]");
        }
        if self.score_min >= self.score_max {
            bail!("score_min must be below score_max");
        }
        if self.inference_concurrency == 0 {
            bail!("inference_concurrency must be at least 1");
        }
        regex::Regex::new(&self.entity_id_pattern).context("entity_id_pattern is not a valid regex")?;
        Ok(())
    }
}
