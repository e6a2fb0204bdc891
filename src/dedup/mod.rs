//! Duplicate resolution for DT records.
//!
//! DT records that agree on trace number, amount, transaction date and
//! merchant account are the same transaction delivered more than once. The
//! earliest-ingested record is canonical; later copies are counted as
//! increments up to a per-group limit and skipped beyond it.

mod ledger;

pub use ledger::{AppliedDelta, DuplicateLedger};

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::record::{Amount, ClassifiedRecord, RecordType};

/// Identity of a transaction for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateKey {
    pub trace_number: String,
    pub amount: Amount,
    pub transaction_date: NaiveDate,
    pub merchant_account: String,
}

impl DuplicateKey {
    /// Key of a DT record; `None` for other types or when a component is
    /// missing.
    pub fn from_record(record: &ClassifiedRecord) -> Option<Self> {
        if record.record_type != RecordType::DT {
            return None;
        }
        Some(Self {
            trace_number: record.trace_number.clone()?,
            amount: record.transaction_amount?,
            transaction_date: record.transaction_date?,
            merchant_account: record.merchant_account_number.clone()?,
        })
    }
}

/// A DT record taking part in duplicate resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DtCandidate {
    pub record_id: String,
    pub key: DuplicateKey,
    /// Ingestion order of the record's file.
    pub file_sequence: u64,
    pub line_number: u64,
}

impl DtCandidate {
    pub fn from_record(record: &ClassifiedRecord, file_sequence: u64) -> Option<Self> {
        Some(Self {
            record_id: record.record_id.clone(),
            key: DuplicateKey::from_record(record)?,
            file_sequence,
            line_number: record.line_number,
        })
    }

    fn order(&self) -> (u64, u64, &str) {
        (self.file_sequence, self.line_number, &self.record_id)
    }
}

/// What happens to a non-canonical group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Increment,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDecision {
    pub record_id: String,
    pub strategy: ResolutionStrategy,
}

/// Two or more DT records sharing a [`DuplicateKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub key: DuplicateKey,
    pub canonical_record_id: String,
    /// All members in resolution order, canonical first.
    pub candidate_record_ids: Vec<String>,
    /// `skip` once any member exceeded the increment limit.
    pub resolution_strategy: ResolutionStrategy,
    pub increments_applied: usize,
    pub skipped_count: usize,
    /// Decisions for every member after the canonical one.
    pub decisions: Vec<MemberDecision>,
}

/// Result of resolving one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Batch records that stand on their own or are canonical.
    pub kept: Vec<String>,
    /// Groups touched by the batch.
    pub duplicates: Vec<DuplicateGroup>,
}

impl DedupOutcome {
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.iter().map(|g| g.decisions.len()).sum()
    }
}

/// Groups DT candidates and decides the fate of every duplicate.
#[derive(Debug, Clone)]
pub struct DedupEngine {
    max_duplicates_per_group: usize,
}

impl DedupEngine {
    pub fn new(max_duplicates_per_group: usize) -> Self {
        Self {
            max_duplicates_per_group,
        }
    }

    /// Resolve `batch` against candidates already known from earlier files.
    ///
    /// Deterministic: the same candidate set always yields the same groups,
    /// whatever order the candidates arrive in.
    pub fn resolve(&self, batch: &[DtCandidate], known: &[DtCandidate]) -> DedupOutcome {
        let in_batch: HashSet<&str> = batch.iter().map(|c| c.record_id.as_str()).collect();

        let mut by_key: BTreeMap<&DuplicateKey, Vec<&DtCandidate>> = BTreeMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for candidate in batch.iter().chain(known) {
            if seen.insert(candidate.record_id.as_str()) {
                by_key.entry(&candidate.key).or_default().push(candidate);
            }
        }

        let mut outcome = DedupOutcome::default();
        for (key, mut members) in by_key {
            if !members.iter().any(|c| in_batch.contains(c.record_id.as_str())) {
                continue;
            }
            members.sort_by(|a, b| a.order().cmp(&b.order()));

            let canonical = members[0];
            if in_batch.contains(canonical.record_id.as_str()) {
                outcome.kept.push(canonical.record_id.clone());
            }
            if members.len() == 1 {
                continue;
            }

            outcome.duplicates.push(self.group(key, &members));
        }

        outcome.kept.sort();
        outcome
    }

    fn group(&self, key: &DuplicateKey, members: &[&DtCandidate]) -> DuplicateGroup {
        let decisions: Vec<MemberDecision> = members[1..]
            .iter()
            .enumerate()
            .map(|(i, c)| MemberDecision {
                record_id: c.record_id.clone(),
                strategy: if i < self.max_duplicates_per_group {
                    ResolutionStrategy::Increment
                } else {
                    ResolutionStrategy::Skip
                },
            })
            .collect();

        let increments_applied = decisions
            .iter()
            .filter(|d| d.strategy == ResolutionStrategy::Increment)
            .count();
        let skipped_count = decisions.len() - increments_applied;

        DuplicateGroup {
            key: key.clone(),
            canonical_record_id: members[0].record_id.clone(),
            candidate_record_ids: members.iter().map(|c| c.record_id.clone()).collect(),
            resolution_strategy: if skipped_count > 0 {
                ResolutionStrategy::Skip
            } else {
                ResolutionStrategy::Increment
            },
            increments_applied,
            skipped_count,
            decisions,
        }
    }
}
