// =============================================================================
// Verification Stage: check every model claim against source evidence
// =============================================================================
//
// Each claim is judged `Supported`, `Contradicted` or `Unverifiable` by a
// pluggable `FactChecker`.  The aggregate confidence is the materiality-
// weighted fraction of supported claims:
//
//   confidence = Σ w(supported) / Σ w(all),   w = core | peripheral weight
//
// A unit below the threshold is excluded from the batch.  That is a business
// rule, not an error: the unit is not retried.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::MergedContext;
use crate::inference::InferenceResult;
use crate::types::{Claim, Materiality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimVerdict {
    Supported,
    Contradicted,
    Unverifiable,
}

/// Answer of a fact-check backend for one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCheck {
    pub verdict: ClaimVerdict,
    /// Checker's own confidence in the verdict, in [0, 1].
    pub confidence: f64,
    /// Source the deciding evidence came from.
    #[serde(default)]
    pub evidence_source: Option<String>,
}

impl FactCheck {
    fn unverifiable() -> Self {
        Self {
            verdict: ClaimVerdict::Unverifiable,
            confidence: 0.0,
            evidence_source: None,
        }
    }
}

#[async_trait]
pub trait FactChecker: Send + Sync {
    async fn check(&self, claim: &Claim, context: &MergedContext) -> FactCheck;
}

// ---------------------------------------------------------------------------
// Built-in consistency checker
// ---------------------------------------------------------------------------

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "over", "that", "the", "to", "was", "were", "with", "year",
];

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '.' || c == '%'))
        .map(|t| t.trim_matches(|c: char| c == '.' || c == '%'))
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Numeric-range and token-overlap checks against the merged context.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    /// Relative tolerance for numeric claims.
    pub numeric_tolerance: f64,
    /// Fraction of claim tokens that must appear in one passage.
    pub min_token_overlap: f64,
}

impl ConsistencyChecker {
    pub fn new(numeric_tolerance: f64, min_token_overlap: f64) -> Self {
        Self {
            numeric_tolerance,
            min_token_overlap,
        }
    }

    fn check_numeric(&self, claimed: f64, field: &str, context: &MergedContext) -> Option<FactCheck> {
        let merged = context.field(field)?;
        let actual = merged.value.as_f64()?;

        let scale = actual.abs().max(1.0);
        let deviation = (claimed - actual).abs() / scale;
        let source = Some(merged.provenance.source.clone());

        Some(if deviation <= self.numeric_tolerance {
            FactCheck {
                verdict: ClaimVerdict::Supported,
                confidence: 1.0 - deviation / self.numeric_tolerance.max(f64::EPSILON) * 0.5,
                evidence_source: source,
            }
        } else {
            FactCheck {
                verdict: ClaimVerdict::Contradicted,
                confidence: (deviation / (deviation + self.numeric_tolerance)).min(1.0),
                evidence_source: source,
            }
        })
    }

    fn check_overlap(&self, claim: &Claim, context: &MergedContext) -> FactCheck {
        let wanted = tokens(&claim.text);
        if wanted.is_empty() {
            return FactCheck::unverifiable();
        }

        let best = context
            .evidence()
            .iter()
            .map(|ev| {
                let have = tokens(&format!("{} {}", ev.passage.title, ev.passage.text));
                let hit = wanted.iter().filter(|t| have.contains(*t)).count();
                (hit as f64 / wanted.len() as f64, &ev.source)
            })
            .max_by(|a, b| a.0.total_cmp(&b.0));

        match best {
            Some((overlap, source)) if overlap >= self.min_token_overlap => FactCheck {
                verdict: ClaimVerdict::Supported,
                confidence: overlap,
                evidence_source: Some(source.clone()),
            },
            _ => FactCheck::unverifiable(),
        }
    }
}

#[async_trait]
impl FactChecker for ConsistencyChecker {
    async fn check(&self, claim: &Claim, context: &MergedContext) -> FactCheck {
        if let (Some(field), Some(value)) = (claim.field.as_deref(), claim.value) {
            if let Some(check) = self.check_numeric(value, field, context) {
                return check;
            }
        }
        self.check_overlap(claim, context)
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimJudgement {
    pub claim: Claim,
    pub check: FactCheck,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationVerdict {
    pub judgements: Vec<ClaimJudgement>,
    /// Weighted fraction of supported claims.
    pub confidence: f64,
    pub threshold: f64,
}

impl VerificationVerdict {
    pub fn passed(&self) -> bool {
        self.confidence >= self.threshold
    }

    pub fn count(&self, verdict: ClaimVerdict) -> usize {
        self.judgements.iter().filter(|j| j.check.verdict == verdict).count()
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

pub struct VerificationStage {
    checker: Arc<dyn FactChecker>,
    threshold: f64,
    core_weight: f64,
    peripheral_weight: f64,
}

impl VerificationStage {
    pub fn new(checker: Arc<dyn FactChecker>, threshold: f64, core_weight: f64, peripheral_weight: f64) -> Self {
        Self {
            checker,
            threshold,
            core_weight,
            peripheral_weight,
        }
    }

    fn weight(&self, materiality: Materiality) -> f64 {
        match materiality {
            Materiality::Core => self.core_weight,
            Materiality::Peripheral => self.peripheral_weight,
        }
    }

    /// Judge every claim of `result`. A result without claims has confidence 0.
    pub async fn verify(&self, result: &InferenceResult, context: &MergedContext) -> VerificationVerdict {
        let mut judgements = Vec::with_capacity(result.claims.len());
        for claim in &result.claims {
            let check = self.checker.check(claim, context).await;
            judgements.push(ClaimJudgement {
                claim: claim.clone(),
                check,
                weight: self.weight(claim.materiality),
            });
        }

        let total: f64 = judgements.iter().map(|j| j.weight).sum();
        let supported: f64 = judgements
            .iter()
            .filter(|j| j.check.verdict == ClaimVerdict::Supported)
            .map(|j| j.weight)
            .sum();
        let confidence = if total > 0.0 { supported / total } else { 0.0 };

        let verdict = VerificationVerdict {
            judgements,
            confidence,
            threshold: self.threshold,
        };
        debug!(
            key = %result.key,
            confidence,
            supported = verdict.count(ClaimVerdict::Supported),
            contradicted = verdict.count(ClaimVerdict::Contradicted),
            unverifiable = verdict.count(ClaimVerdict::Unverifiable),
            "verification complete"
        );
        verdict
    }
}

impl std::fmt::Debug for VerificationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationStage")
            .field("threshold", &self.threshold)
            .field("core_weight", &self.core_weight)
            .field("peripheral_weight", &self.peripheral_weight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Passage, SourceRecord};
    use crate::types::WorkKey;
    use chrono::NaiveDate;

    fn key() -> WorkKey {
        WorkKey::new("NVDA", NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
    }

    fn context() -> MergedContext {
        let f = SourceRecord::new("finnhub", key(), 60)
            .with_field("pe_ratio", 50.0)
            .with_field("revenue_growth_yoy", 0.0);
        let n = SourceRecord::new("news", key(), 60).with_passage(Passage {
            title: "Nvidia data center revenue surges".into(),
            text: "Demand for Blackwell GPUs remains strong across hyperscalers.".into(),
            url: None,
        });
        MergedContext::merge(key(), vec![f, n], &["finnhub".into(), "news".into()], vec![])
    }

    fn checker() -> ConsistencyChecker {
        ConsistencyChecker::new(0.05, 0.5)
    }

    fn result(claims: Vec<Claim>) -> InferenceResult {
        InferenceResult {
            key: key(),
            score: 0.6,
            claims,
            model: "test".into(),
            attempts: 1,
            latency_ms: 1,
        }
    }

    #[tokio::test]
    async fn numeric_claims_within_tolerance_are_supported() {
        let c = Claim::numeric("P/E near 51", "pe_ratio", 51.0, Materiality::Core);
        let check = checker().check(&c, &context()).await;
        assert_eq!(check.verdict, ClaimVerdict::Supported);
        assert_eq!(check.evidence_source.as_deref(), Some("finnhub"));
    }

    #[tokio::test]
    async fn numeric_claims_outside_tolerance_are_contradicted() {
        let c = Claim::numeric("P/E of 30", "pe_ratio", 30.0, Materiality::Core);
        assert_eq!(checker().check(&c, &context()).await.verdict, ClaimVerdict::Contradicted);
    }

    #[tokio::test]
    async fn zero_valued_fields_use_absolute_tolerance() {
        let c = Claim::numeric("flat revenue", "revenue_growth_yoy", 0.03, Materiality::Core);
        assert_eq!(checker().check(&c, &context()).await.verdict, ClaimVerdict::Supported);
    }

    #[tokio::test]
    async fn text_claims_match_passages() {
        let c = Claim::text("Data center revenue surges for Nvidia", Materiality::Peripheral);
        assert_eq!(checker().check(&c, &context()).await.verdict, ClaimVerdict::Supported);

        let c = Claim::text("CEO resigns amid accounting scandal", Materiality::Peripheral);
        assert_eq!(checker().check(&c, &context()).await.verdict, ClaimVerdict::Unverifiable);
    }

    #[tokio::test]
    async fn numeric_claim_on_unknown_field_falls_back_to_text() {
        let c = Claim::numeric("Blackwell GPUs demand strong", "backlog", 12.0, Materiality::Core);
        assert_eq!(checker().check(&c, &context()).await.verdict, ClaimVerdict::Supported);
    }

    #[tokio::test]
    async fn confidence_is_weighted_by_materiality() {
        let stage = VerificationStage::new(Arc::new(checker()), 0.7, 2.0, 1.0);
        let verdict = stage
            .verify(
                &result(vec![
                    Claim::numeric("P/E 50", "pe_ratio", 50.0, Materiality::Core),
                    Claim::numeric("P/E 20", "pe_ratio", 20.0, Materiality::Core),
                    Claim::text("Nvidia data center revenue surges", Materiality::Peripheral),
                ]),
                &context(),
            )
            .await;
        // supported: 2 (core) + 1 (peripheral) of 5
        assert!((verdict.confidence - 0.6).abs() < 1e-12);
        assert!(!verdict.passed());
        assert_eq!(verdict.count(ClaimVerdict::Contradicted), 1);
    }

    #[tokio::test]
    async fn no_claims_means_zero_confidence() {
        let stage = VerificationStage::new(Arc::new(checker()), 0.0, 2.0, 1.0);
        let verdict = stage.verify(&result(vec![]), &context()).await;
        assert_eq!(verdict.confidence, 0.0);
        // Threshold of zero still passes an empty verdict.
        assert!(verdict.passed());
    }
}
