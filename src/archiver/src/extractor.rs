//! Batch extraction: query the next page of aged records, stage it, then
//! move the checkpoint.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::config::Ordering as OrderingPolicy;
use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, CursorPosition, sort_fields};
use crate::metrics::ArchiveMetrics;
use crate::record::{Record, RecordId};
use crate::source::{Filter, SourceStore};
use crate::staging::{BatchFile, StagingArea, artifact_name};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// `<database>.<collection>` recorded in every artifact
    pub source_identity: String,
    pub age_field: String,
    pub ordering: OrderingPolicy,
    pub record_limit: usize,
}

/// A batch that has been durably staged. Holds only a reference to the
/// artifact, never the records themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    pub artifact: PathBuf,
    pub record_count: usize,
    pub first: RecordId,
    pub last: CursorPosition,
}

pub struct BatchExtractor {
    source: Arc<dyn SourceStore>,
    staging: StagingArea,
    config: ExtractorConfig,
    metrics: ArchiveMetrics,
}

impl BatchExtractor {
    pub fn new(
        source: Arc<dyn SourceStore>,
        staging: StagingArea,
        config: ExtractorConfig,
        metrics: ArchiveMetrics,
    ) -> Self {
        Self {
            source,
            staging,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract the next batch of records older than `epoch_cutoff` that lie
    /// after the checkpoint.
    ///
    /// On success the batch is staged and the checkpoint advanced to its
    /// last record, in that order. An empty result, or any error, leaves
    /// the checkpoint and the staging directory untouched.
    pub async fn extract(
        &self,
        epoch_cutoff: DateTime<Utc>,
        checkpoint: &mut Checkpoint,
    ) -> Result<Option<StagedBatch>> {
        let age_field = &self.config.age_field;
        let policy = self.config.ordering;

        let mut conditions = vec![Filter::field_before(age_field, epoch_cutoff)];
        if let Some(resume) = checkpoint.resume_filter(policy, age_field) {
            tracing::debug!(
                last_seen = ?checkpoint.last_seen_key(),
                last_seen_age = ?checkpoint.last_seen_age(),
                "Resuming extraction after checkpoint"
            );
            conditions.push(resume);
        }
        let filter = Filter::All(conditions);

        let records = self
            .source
            .find(&filter, &sort_fields(policy, age_field), self.config.record_limit)
            .await
            .context("Failed to query source for aged records")?;

        let returned = records.len();
        let (records, last) = match self.resume_position(records) {
            Some(found) => found,
            None if returned > 0 => {
                // the cursor cannot move past these rows, so the next query
                // would return the same page
                anyhow::bail!(
                    "source returned {returned} records after the checkpoint, none with a readable `{age_field}`"
                );
            }
            None => {
                tracing::debug!(epoch_cutoff = %epoch_cutoff, "No records to archive");
                return Ok(None);
            }
        };
        let first = records[0].id.clone();

        let name = artifact_name(epoch_cutoff, &first, &last.id);
        let batch = BatchFile {
            source: self.config.source_identity.clone(),
            epoch_cutoff,
            staged_at: Utc::now(),
            records: records.into_iter().map(|r| r.document).collect(),
        };
        let record_count = batch.records.len();

        let artifact = self
            .staging
            .write_batch(&name, &batch)
            .await
            .context("Failed to stage extracted batch")?;

        checkpoint.advance(last.clone());
        self.metrics.record_batch_extracted(record_count);

        tracing::info!(
            artifact = %artifact.display(),
            records = record_count,
            first = %first,
            last = %last.id,
            "Staged batch for archiving"
        );

        Ok(Some(StagedBatch {
            artifact,
            record_count,
            first,
            last,
        }))
    }

    /// Drop records whose age cannot be read (ordering by age needs it) and
    /// return the cursor position of the last remaining record.
    fn resume_position(&self, records: Vec<Record>) -> Option<(Vec<Record>, CursorPosition)> {
        let mut kept = Vec::with_capacity(records.len());
        let mut last = None;

        for record in records {
            let age = match self.config.ordering {
                OrderingPolicy::Identifier => None,
                OrderingPolicy::AgeThenIdentifier => match record.age(&self.config.age_field) {
                    Ok(age) => Some(age),
                    Err(e) => {
                        tracing::warn!(id = %record.id, error = %e, "Skipping record with unreadable age");
                        continue;
                    }
                },
            };
            last = Some(CursorPosition {
                id: record.id.clone(),
                age,
            });
            kept.push(record);
        }

        last.map(|position| (kept, position))
    }
}
