// =============================================================================
// Composite Backend: deterministic offline scorer
// =============================================================================
//
// Weighted composite of four normalised factors:
//
//   news sentiment   30 %   lexicon score in [-1, 1] mapped to [0, 1]
//   valuation (P/E)  30 %   logistic, lower is better, centred on 20
//   revenue growth   30 %   logistic, centred on 0 %
//   data quality     10 %   fraction of attempted sources that answered
//
// The result is clipped to [0, 1].  Claims cite exactly the fields and the
// headline the score was computed from.
// =============================================================================

use async_trait::async_trait;

use super::{InferenceBackend, ModelError, ModelOutput};
use crate::context::MergedContext;
use crate::types::{Claim, Materiality};

const W_SENTIMENT: f64 = 0.30;
const W_VALUATION: f64 = 0.30;
const W_GROWTH: f64 = 0.30;
const W_QUALITY: f64 = 0.10;

const DEFAULT_PE: f64 = 20.0;
const DEFAULT_GROWTH: f64 = 0.0;

const POSITIVE: &[&str] = &[
    "beat", "beats", "strong", "growth", "grew", "record", "surge", "surged", "rally", "rallies",
    "upgrade", "upgraded", "accelerates", "outperform", "gain", "gains", "rose", "raised",
];
const NEGATIVE: &[&str] = &[
    "miss", "misses", "weak", "decline", "declined", "fell", "drop", "dropped", "downgrade",
    "downgraded", "lawsuit", "probe", "loss", "losses", "cut", "slump", "warning",
];

#[derive(Debug, Clone, Default)]
pub struct CompositeBackend;

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Lexicon sentiment over all evidence text, in [-1, 1]. Neutral without evidence.
pub fn sentiment(context: &MergedContext) -> f64 {
    let (mut pos, mut neg) = (0u32, 0u32);
    for ev in context.evidence() {
        let text = format!("{} {}", ev.passage.title, ev.passage.text).to_lowercase();
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if POSITIVE.contains(&word) {
                pos += 1;
            } else if NEGATIVE.contains(&word) {
                neg += 1;
            }
        }
    }
    let total = pos + neg;
    if total == 0 {
        0.0
    } else {
        (f64::from(pos) - f64::from(neg)) / f64::from(total)
    }
}

pub fn composite_score(sentiment: f64, pe_ratio: f64, revenue_growth: f64, data_quality: f64) -> f64 {
    let sentiment_score = (sentiment + 1.0) / 2.0;
    let pe_score = logistic(-(pe_ratio - 20.0) / 10.0);
    let growth_score = logistic(revenue_growth / 10.0);

    let composite = W_SENTIMENT * sentiment_score
        + W_VALUATION * pe_score
        + W_GROWTH * growth_score
        + W_QUALITY * data_quality;
    composite.clamp(0.0, 1.0)
}

#[async_trait]
impl InferenceBackend for CompositeBackend {
    fn name(&self) -> &str {
        "composite"
    }

    async fn infer(&self, context: &MergedContext) -> Result<ModelOutput, ModelError> {
        let entity = &context.key().entity_id;
        let pe = context.field_f64("pe_ratio");
        let growth = context.field_f64("revenue_growth_yoy");
        let sentiment = sentiment(context);

        let score = composite_score(
            sentiment,
            pe.unwrap_or(DEFAULT_PE),
            growth.unwrap_or(DEFAULT_GROWTH),
            context.coverage(),
        );

        let mut claims = Vec::new();
        if let Some(pe) = pe {
            claims.push(Claim::numeric(
                format!("{entity} trades at a P/E ratio of {pe:.1}"),
                "pe_ratio",
                pe,
                Materiality::Core,
            ));
        }
        if let Some(growth) = growth {
            claims.push(Claim::numeric(
                format!("{entity} revenue growth is {growth:.1}% year over year"),
                "revenue_growth_yoy",
                growth,
                Materiality::Core,
            ));
        }
        if let Some(ev) = context.evidence().first() {
            claims.push(Claim::text(ev.passage.title.clone(), Materiality::Peripheral));
        }

        Ok(ModelOutput { score, claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Passage, SourceRecord};
    use crate::types::WorkKey;
    use chrono::NaiveDate;

    fn key() -> WorkKey {
        WorkKey::new("AAPL", NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
    }

    #[test]
    fn neutral_inputs_score_near_middle() {
        // sentiment 0 → 0.5, pe 20 → 0.5, growth 0 → 0.5, quality 0.5
        let s = composite_score(0.0, 20.0, 0.0, 0.5);
        assert!((s - 0.5).abs() < 1e-12);
    }

    #[test]
    fn cheap_growing_names_score_higher() {
        let cheap = composite_score(0.2, 12.0, 15.0, 1.0);
        let rich = composite_score(0.2, 60.0, -5.0, 1.0);
        assert!(cheap > rich);
        assert!((0.0..=1.0).contains(&cheap));
        assert!((0.0..=1.0).contains(&rich));
    }

    #[test]
    fn sentiment_counts_lexicon_hits() {
        let news = SourceRecord::new("news", key(), 60).with_passage(Passage {
            title: "Apple beats estimates".into(),
            text: "Strong iPhone demand, but a probe in the EU".into(),
            url: None,
        });
        let ctx = MergedContext::merge(key(), vec![news], &[], vec![]);
        let s = sentiment(&ctx);
        assert!((s - (1.0 / 3.0)).abs() < 1e-12, "sentiment {s}");
    }

    #[tokio::test]
    async fn claims_cite_used_fields() {
        let f = SourceRecord::new("finnhub", key(), 60)
            .with_field("pe_ratio", 28.5)
            .with_field("revenue_growth_yoy", 12.5);
        let ctx = MergedContext::merge(key(), vec![f], &[], vec![]);
        let out = CompositeBackend.infer(&ctx).await.unwrap();
        assert_eq!(out.claims.len(), 2);
        assert_eq!(out.claims[0].field.as_deref(), Some("pe_ratio"));
        assert_eq!(out.claims[0].value, Some(28.5));
        assert!(out.claims.iter().all(|c| c.materiality == Materiality::Core));
    }
}
