use std::path::PathBuf;

use crate::extractor::StagedBatch;

/// Batches staged since the last flush.
///
/// Pure bookkeeping: every entry points at an artifact that is already on
/// disk, so losing the accumulator loses nothing. A flush trusts the
/// staging directory listing and uses this only to cross-check it.
#[derive(Debug, Default)]
pub struct Accumulator {
    pending: Vec<StagedBatch>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, batch: StagedBatch) {
        self.pending.push(batch);
    }

    /// Take every pending batch, leaving the accumulator empty.
    pub fn drain_all(&mut self) -> Vec<StagedBatch> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records referenced by pending batches.
    pub fn pending_records(&self) -> usize {
        self.pending.iter().map(|b| b.record_count).sum()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &PathBuf> {
        self.pending.iter().map(|b| &b.artifact)
    }
}
