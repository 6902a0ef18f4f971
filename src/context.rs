// =============================================================================
// Merged Context: one entity's view of every source that answered
// =============================================================================
//
// Records are folded in precedence order (highest first).  The first source
// to report a field owns its value; later sources either corroborate it (same
// value) or are recorded as overridden.  Every field therefore carries at
// least one provenance entry, and that entry always names a source whose
// record was actually merged.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sources::{FetchError, Passage, SourceRecord};
use crate::types::WorkKey;

/// Where a value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl Provenance {
    fn of(record: &SourceRecord) -> Self {
        Self {
            source: record.source().to_string(),
            fetched_at: record.fetched_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedField {
    pub value: serde_json::Value,
    /// Source whose value won.
    pub provenance: Provenance,
    /// Lower-precedence sources reporting the same value.
    pub corroborated_by: Vec<Provenance>,
    /// Lower-precedence sources reporting a different value.
    pub overridden: Vec<(Provenance, serde_json::Value)>,
}

/// A passage tagged with the source it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub source: String,
    pub passage: Passage,
}

/// A source that did not contribute to the context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub attempts: u32,
    pub reason: String,
    /// Last error was transient (the retry budget ran out).
    pub transient: bool,
}

impl SourceFailure {
    pub fn from_error(error: &FetchError, attempts: u32) -> Self {
        Self {
            source: error.source_name().to_string(),
            attempts,
            reason: error.to_string(),
            transient: error.is_transient(),
        }
    }

    pub fn stale(record: &SourceRecord) -> Self {
        Self {
            source: record.source().to_string(),
            attempts: 1,
            reason: format!(
                "record fetched {} is outside its freshness window",
                record.fetched_at().to_rfc3339()
            ),
            transient: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedContext {
    key: WorkKey,
    fields: BTreeMap<String, MergedField>,
    evidence: Vec<Evidence>,
    /// Sources that contributed, in precedence order.
    sources: Vec<String>,
    failed_sources: Vec<SourceFailure>,
}

fn rank(precedence: &[String], source: &str) -> usize {
    precedence
        .iter()
        .position(|s| s == source)
        .unwrap_or(precedence.len())
}

impl MergedContext {
    /// Merge `records` for `key`, resolving conflicts by `precedence`
    /// (highest first; unlisted sources rank last, ties keep input order).
    pub fn merge(
        key: WorkKey,
        mut records: Vec<SourceRecord>,
        precedence: &[String],
        failed_sources: Vec<SourceFailure>,
    ) -> Self {
        records.sort_by_key(|r| rank(precedence, r.source()));

        let mut fields: BTreeMap<String, MergedField> = BTreeMap::new();
        let mut evidence = Vec::new();
        let mut sources = Vec::with_capacity(records.len());

        for record in &records {
            let prov = Provenance::of(record);
            for (name, value) in record.fields() {
                match fields.get_mut(name) {
                    None => {
                        fields.insert(
                            name.clone(),
                            MergedField {
                                value: value.clone(),
                                provenance: prov.clone(),
                                corroborated_by: Vec::new(),
                                overridden: Vec::new(),
                            },
                        );
                    }
                    Some(existing) if &existing.value == value => {
                        existing.corroborated_by.push(prov.clone());
                    }
                    Some(existing) => {
                        existing.overridden.push((prov.clone(), value.clone()));
                    }
                }
            }
            for passage in record.passages() {
                evidence.push(Evidence {
                    source: record.source().to_string(),
                    passage: passage.clone(),
                });
            }
            sources.push(record.source().to_string());
        }

        Self {
            key,
            fields,
            evidence,
            sources,
            failed_sources,
        }
    }

    pub fn key(&self) -> &WorkKey {
        &self.key
    }

    pub fn fields(&self) -> &BTreeMap<String, MergedField> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&MergedField> {
        self.fields.get(name)
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|f| f.value.as_f64())
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn failed_sources(&self) -> &[SourceFailure] {
        &self.failed_sources
    }

    /// Fraction of attempted sources that contributed.
    pub fn coverage(&self) -> f64 {
        let attempted = self.sources.len() + self.failed_sources.len();
        if attempted == 0 {
            0.0
        } else {
            self.sources.len() as f64 / attempted as f64
        }
    }

    /// Every field traces back to a merged source.
    pub fn provenance_complete(&self) -> bool {
        self.fields
            .values()
            .all(|f| self.sources.iter().any(|s| s == &f.provenance.source))
    }
}
