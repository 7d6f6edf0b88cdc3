//! Post-upload reconciliation: delete archived records from the source,
//! verify they are gone, then clean up local files.
//!
//! Only artifacts included in an uploaded bundle reach this module. Every
//! step is best-effort: individual failures are captured in the
//! [`ReconcileReport`] and logged, never propagated.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::metrics::ArchiveMetrics;
use crate::packager::Bundle;
use crate::record::{Record, RecordId};
use crate::source::SourceStore;
use crate::staging::StagingArea;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub id_field: String,
    /// Upper bound on in-flight deletions
    pub delete_concurrency: usize,
    /// Verify only the first N identifiers; `None` verifies all of them
    pub verify_sample: Option<usize>,
    /// JSON-lines file every deletion attempt is appended to
    pub deletion_log: PathBuf,
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Identifiers a deletion was attempted for
    pub attempted: usize,
    pub deleted: u64,
    /// Deletions that matched nothing (already gone)
    pub missing: usize,
    /// Identifiers whose deletion errored, with the error message
    pub failed: Vec<(RecordId, String)>,
    /// Identifiers still present after deletion
    pub anomalies: Vec<RecordId>,
    /// Archived documents whose identifier could not be decoded
    pub malformed: usize,
    pub artifacts_removed: usize,
}

#[derive(Debug, Serialize)]
struct DeletionLogEntry<'a> {
    id: &'a RecordId,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    at: DateTime<Utc>,
}

pub struct Reconciler {
    source: Arc<dyn SourceStore>,
    staging: StagingArea,
    config: ReconcilerConfig,
    metrics: ArchiveMetrics,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceStore>,
        staging: StagingArea,
        config: ReconcilerConfig,
        metrics: ArchiveMetrics,
    ) -> Self {
        Self {
            source,
            staging,
            config,
            metrics,
        }
    }

    /// Reconcile an uploaded bundle. Must only be called after the upload
    /// of `bundle` returned success.
    pub async fn reconcile(&self, bundle: &Bundle) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let ids = self.archived_ids(bundle, &mut report);
        report.attempted = ids.len();

        self.delete_all(&ids, &mut report).await;
        self.verify(&ids, &mut report).await;
        self.clean_up(bundle, &mut report).await;

        self.metrics.record_deletions(
            report.deleted,
            report.missing as u64,
            report.failed.len() as u64,
        );
        self.metrics
            .record_verification_anomalies(report.anomalies.len() as u64);
        self.metrics.record_artifacts_cleaned(report.artifacts_removed);

        tracing::info!(
            bundle = %bundle.name,
            attempted = report.attempted,
            deleted = report.deleted,
            missing = report.missing,
            failed = report.failed.len(),
            anomalies = report.anomalies.len(),
            malformed = report.malformed,
            artifacts_removed = report.artifacts_removed,
            "Reconciliation complete"
        );
        report
    }

    fn archived_ids(&self, bundle: &Bundle, report: &mut ReconcileReport) -> Vec<RecordId> {
        let mut ids = Vec::new();
        for artifact in &bundle.included {
            for document in &artifact.batch.records {
                match Record::from_document(document.clone(), &self.config.id_field) {
                    Ok(record) => ids.push(record.id),
                    Err(e) => {
                        tracing::warn!(
                            artifact = %artifact.path.display(),
                            error = %e,
                            "Skipping archived document with malformed identifier"
                        );
                        report.malformed += 1;
                    }
                }
            }
        }
        ids
    }

    async fn delete_all(&self, ids: &[RecordId], report: &mut ReconcileReport) {
        let concurrency = self.config.delete_concurrency.max(1);
        let outcomes: Vec<(RecordId, Result<u64, String>)> = stream::iter(ids.iter().cloned())
            .map(|id| {
                let source = Arc::clone(&self.source);
                async move {
                    let outcome = source.delete_by_id(&id).await.map_err(|e| e.to_string());
                    (id, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let at = Utc::now();
        let mut log_lines = Vec::with_capacity(outcomes.len());
        for (id, outcome) in outcomes {
            let entry = match &outcome {
                Ok(count) => DeletionLogEntry {
                    id: &id,
                    deleted: Some(*count),
                    error: None,
                    at,
                },
                Err(e) => DeletionLogEntry {
                    id: &id,
                    deleted: None,
                    error: Some(e.clone()),
                    at,
                },
            };
            match serde_json::to_string(&entry) {
                Ok(line) => log_lines.push(line),
                Err(e) => tracing::warn!(id = %id, error = %e, "Failed to encode deletion log entry"),
            }

            match outcome {
                Ok(0) => {
                    tracing::warn!(id = %id, "Deletion matched no record; already deleted?");
                    report.missing += 1;
                }
                Ok(count) => report.deleted += count,
                Err(e) => {
                    tracing::error!(id = %id, error = %e, "Failed to delete archived record");
                    report.failed.push((id, e));
                }
            }
        }

        if let Err(e) = self.append_deletion_log(&log_lines).await {
            tracing::warn!(
                path = %self.config.deletion_log.display(),
                error = %e,
                "Failed to append to deletion log"
            );
        }
    }

    async fn append_deletion_log(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let path = &self.config.deletion_log;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buffer = lines.join("\n");
        buffer.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open deletion log {path:?}"))?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn verify(&self, ids: &[RecordId], report: &mut ReconcileReport) {
        let sample = match self.config.verify_sample {
            Some(n) => &ids[..n.min(ids.len())],
            None => ids,
        };

        for id in sample {
            match self.source.count_by_id(id).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::warn!(id = %id, count, "Archived record still present after deletion");
                    report.anomalies.push(id.clone());
                }
                Err(e) => tracing::warn!(id = %id, error = %e, "Failed to verify deletion"),
            }
        }
    }

    async fn clean_up(&self, bundle: &Bundle, report: &mut ReconcileReport) {
        for artifact in &bundle.included {
            match self.staging.remove(&artifact.path).await {
                Ok(()) => report.artifacts_removed += 1,
                Err(e) => tracing::warn!(
                    artifact = %artifact.path.display(),
                    error = %e,
                    "Failed to remove archived artifact"
                ),
            }
        }

        if let Err(e) = self.staging.remove(&bundle.path).await {
            tracing::warn!(bundle = %bundle.path.display(), error = %e, "Failed to remove bundle");
        }
    }
}
