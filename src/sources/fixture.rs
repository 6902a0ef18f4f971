// =============================================================================
// Fixture Fetcher: deterministic offline data for `test` runs
// =============================================================================
//
// Values are derived from a hash of the entity id so that repeated runs over
// the same universe produce identical batches without touching the network.
// =============================================================================

use async_trait::async_trait;

use super::{FetchError, Fetcher, Passage, SourceRecord};
use crate::runtime_config::SourceKind;
use crate::types::WorkKey;

#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    name: String,
    kind: SourceKind,
    freshness_secs: u64,
}

impl FixtureFetcher {
    pub fn new(name: impl Into<String>, kind: SourceKind, freshness_secs: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            freshness_secs,
        }
    }
}

/// Stable pseudo-random fundamentals for an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixtureFundamentals {
    pub pe_ratio: f64,
    pub revenue_growth_yoy: f64,
    pub eps: f64,
}

fn seed(entity_id: &str) -> u64 {
    // FNV-1a
    entity_id.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn unit(seed: u64, salt: u64) -> f64 {
    let mixed = (seed ^ salt).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (mixed >> 11) as f64 / (1u64 << 53) as f64
}

pub fn fundamentals_for(entity_id: &str) -> FixtureFundamentals {
    let s = seed(entity_id);
    let round1 = |v: f64| (v * 10.0).round() / 10.0;
    FixtureFundamentals {
        pe_ratio: round1(8.0 + unit(s, 1) * 37.0),
        revenue_growth_yoy: round1(-10.0 + unit(s, 2) * 40.0),
        eps: ((0.5 + unit(s, 3) * 9.5) * 100.0).round() / 100.0,
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, key: &WorkKey) -> Result<SourceRecord, FetchError> {
        let f = fundamentals_for(&key.entity_id);
        let ticker = &key.entity_id;
        let record = SourceRecord::new(self.name.as_str(), key.clone(), self.freshness_secs);

        let record = match self.kind {
            SourceKind::Fundamentals => record
                .with_field("pe_ratio", f.pe_ratio)
                .with_field("revenue_growth_yoy", f.revenue_growth_yoy)
                .with_field("eps", f.eps),
            SourceKind::Filings => record
                .with_field("filing_type", "10-Q")
                .with_field("eps", f.eps)
                .with_passage(Passage {
                    title: format!("{ticker} quarterly report (10-Q)"),
                    text: format!(
                        "{ticker} reported earnings per share of {:.2} and revenue growth of {:.1}% year over year.",
                        f.eps, f.revenue_growth_yoy
                    ),
                    url: None,
                }),
            SourceKind::News => record
                .with_field("news_count", 1u64)
                .with_passage(Passage {
                    title: format!("{ticker} market analysis"),
                    text: format!(
                        "{ticker} trades at a price to earnings ratio of {:.1}; revenue growth {:.1}% year over year.",
                        f.pe_ratio, f.revenue_growth_yoy
                    ),
                    url: None,
                }),
        };
        Ok(record)
    }
}
