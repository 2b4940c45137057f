//! Additive merge of per-run counters.
//!
//! Counters are summed position by position before anything is classified as
//! covered, so the result does not depend on the order or grouping in which
//! runs arrive. Classification happens once, in [`CoverageMerger::finish`].
use crate::record::{FileCounts, RawRunRecord};
use crate::report::{FileCoverage, Ratio, Report};
use crate::structure::StructureIndex;
use std::collections::{BTreeMap, BTreeSet};

/// Summed counters for one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAccumulator {
    statement: Vec<u64>,
    branch: Vec<[u64; 2]>,
    condition: Vec<Vec<u64>>,
    subroutine: Vec<u64>,
}

impl FileAccumulator {
    pub fn add_counts(&mut self, counts: &FileCounts) {
        add_flat(&mut self.statement, &counts.statement);
        if self.branch.len() < counts.branch.len() {
            self.branch.resize(counts.branch.len(), [0, 0]);
        }
        for (slot, arms) in self.branch.iter_mut().zip(&counts.branch) {
            slot[0] = slot[0].saturating_add(arms[0]);
            slot[1] = slot[1].saturating_add(arms[1]);
        }
        add_nested(&mut self.condition, &counts.condition);
        add_flat(&mut self.subroutine, &counts.subroutine);
    }

    pub fn absorb(&mut self, other: &FileAccumulator) {
        self.add_counts(&FileCounts {
            statement: other.statement.clone(),
            branch: other.branch.clone(),
            condition: other.condition.clone(),
            subroutine: other.subroutine.clone(),
        });
    }

    pub fn finalize(&self, path: &str, structure: &StructureIndex) -> FileCoverage {
        let mut uncovered = BTreeSet::new();
        let mut statements = Ratio::default();
        for (position, hits) in self.statement.iter().enumerate() {
            statements.total += 1;
            if *hits > 0 {
                statements.covered += 1;
            } else {
                uncovered.insert(structure.line_for(path, position));
            }
        }

        let mut branches = Ratio::default();
        for arms in &self.branch {
            branches.total += 2;
            branches.covered += arms.iter().filter(|hits| **hits > 0).count() as u64;
        }

        let mut conditions = Ratio::default();
        for slots in &self.condition {
            conditions.total += slots.len() as u64;
            conditions.covered += slots.iter().filter(|hits| **hits > 0).count() as u64;
        }

        let subroutines = Ratio::new(
            self.subroutine.iter().filter(|hits| **hits > 0).count() as u64,
            self.subroutine.len() as u64,
        );

        FileCoverage {
            path: path.to_string(),
            statements,
            branches,
            conditions,
            subroutines,
            combined: None,
            uncovered_lines: uncovered.into_iter().collect(),
        }
    }
}

fn add_flat(target: &mut Vec<u64>, incoming: &[u64]) {
    if target.len() < incoming.len() {
        target.resize(incoming.len(), 0);
    }
    for (slot, hits) in target.iter_mut().zip(incoming) {
        *slot = slot.saturating_add(*hits);
    }
}

// Condition vectors are merged positionally; a source file that changed
// between runs is not reconciled.
fn add_nested(target: &mut Vec<Vec<u64>>, incoming: &[Vec<u64>]) {
    if target.len() < incoming.len() {
        target.resize_with(incoming.len(), Vec::new);
    }
    for (slot, slots) in target.iter_mut().zip(incoming) {
        add_flat(slot, slots);
    }
}

/// Per-file accumulators for any number of runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageMerger {
    files: BTreeMap<String, FileAccumulator>,
    runs: usize,
}

impl CoverageMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, record: &RawRunRecord) {
        for (path, counts) in &record.files {
            self.files.entry(path.clone()).or_default().add_counts(counts);
        }
        self.runs += 1;
    }

    /// Fold another merger into this one (partial merges of disjoint run sets).
    pub fn merge(&mut self, other: CoverageMerger) {
        for (path, accumulator) in other.files {
            match self.files.get_mut(&path) {
                Some(existing) => existing.absorb(&accumulator),
                None => {
                    self.files.insert(path, accumulator);
                }
            }
        }
        self.runs += other.runs;
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn finish(&self, structure: &StructureIndex) -> Report {
        let files = self
            .files
            .iter()
            .map(|(path, accumulator)| (path.clone(), accumulator.finalize(path, structure)))
            .collect();
        Report::from_files(files)
    }
}

impl<'a> FromIterator<&'a RawRunRecord> for CoverageMerger {
    fn from_iter<I: IntoIterator<Item = &'a RawRunRecord>>(iter: I) -> Self {
        let mut merger = CoverageMerger::new();
        for record in iter {
            merger.add_record(record);
        }
        merger
    }
}
