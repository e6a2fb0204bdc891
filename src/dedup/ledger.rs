//! Persistent record of resolved duplicate groups.
//!
//! The ledger remembers every keyed DT candidate and every decision already
//! applied, so committing the same file twice never counts a duplicate twice.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::{DtCandidate, DuplicateGroup, DuplicateKey, ResolutionStrategy};

/// Decisions newly applied by one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedDelta {
    pub increments: usize,
    pub skips: usize,
}

impl AppliedDelta {
    pub fn is_empty(&self) -> bool {
        self.increments == 0 && self.skips == 0
    }
}

#[derive(Debug, Default)]
struct Entry {
    candidates: BTreeMap<String, DtCandidate>,
    incremented: HashSet<String>,
    skipped: HashSet<String>,
    group: Option<DuplicateGroup>,
}

#[derive(Debug, Default)]
pub struct DuplicateLedger {
    entries: HashMap<DuplicateKey, Entry>,
    increments_total: usize,
    skips_total: usize,
}

impl DuplicateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember candidates so later files can be resolved against them.
    pub fn register(&mut self, candidates: &[DtCandidate]) {
        for candidate in candidates {
            self.entries
                .entry(candidate.key.clone())
                .or_default()
                .candidates
                .insert(candidate.record_id.clone(), candidate.clone());
        }
    }

    /// Every known candidate sharing a key with `batch`.
    pub fn known_for(&self, batch: &[DtCandidate]) -> Vec<DtCandidate> {
        let keys: HashSet<&DuplicateKey> = batch.iter().map(|c| &c.key).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.get(key))
            .flat_map(|entry| entry.candidates.values().cloned())
            .collect()
    }

    /// Apply a group's decisions, counting only members not applied before.
    ///
    /// The running totals track current decisions: a member that moves from
    /// increment to skip (or becomes canonical) leaves its old total.
    pub fn apply(&mut self, group: &DuplicateGroup) -> AppliedDelta {
        let entry = self.entries.entry(group.key.clone()).or_default();
        let mut delta = AppliedDelta::default();
        let before = (entry.incremented.len(), entry.skipped.len());

        // An earlier file arriving late can take over as canonical.
        entry.incremented.remove(&group.canonical_record_id);
        entry.skipped.remove(&group.canonical_record_id);

        for decision in &group.decisions {
            let id = &decision.record_id;
            match decision.strategy {
                ResolutionStrategy::Increment => {
                    if entry.incremented.insert(id.clone()) {
                        entry.skipped.remove(id);
                        delta.increments += 1;
                    }
                }
                ResolutionStrategy::Skip => {
                    if entry.skipped.insert(id.clone()) {
                        entry.incremented.remove(id);
                        delta.skips += 1;
                    }
                }
            }
        }
        entry.group = Some(group.clone());

        self.increments_total = self.increments_total + entry.incremented.len() - before.0;
        self.skips_total = self.skips_total + entry.skipped.len() - before.1;
        delta
    }

    pub fn group(&self, key: &DuplicateKey) -> Option<&DuplicateGroup> {
        self.entries.get(key).and_then(|e| e.group.as_ref())
    }

    pub fn group_count(&self) -> usize {
        self.entries.values().filter(|e| e.group.is_some()).count()
    }

    pub fn increments_total(&self) -> usize {
        self.increments_total
    }

    pub fn skips_total(&self) -> usize {
        self.skips_total
    }
}
