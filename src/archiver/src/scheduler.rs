//! Dual-cadence scheduler.
//!
//! Two timers drive the pipeline: a short extract tick that stages one
//! batch, and a longer flush tick that packages, uploads and reconciles
//! everything staged so far. Both ticks take the same lock, so they never
//! interleave.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use common::config::Configuration;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::accumulator::Accumulator;
use crate::checkpoint::Checkpoint;
use crate::extractor::{BatchExtractor, ExtractorConfig, StagedBatch};
use crate::metrics::ArchiveMetrics;
use crate::packager::{Packager, next_bundle_time};
use crate::publisher::{ColdStorage, ObjectStoreTarget, RemotePublisher};
use crate::reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
use crate::source::{self, SourceStore};
use crate::staging::StagingArea;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// A batch of this many records was staged
    Staged(usize),
    /// No aged records left in this epoch
    Empty,
    /// Skipped because too many records are already pending
    Throttled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was staged
    Idle,
    /// Staged artifacts exist but none could be bundled
    PackagingFailed,
    /// Upload failed; everything stays staged for the next flush
    UploadFailed,
    Reconciled(ReconcileReport),
}

#[derive(Debug, Default)]
struct PipelineState {
    checkpoint: Checkpoint,
    accumulator: Accumulator,
    last_bundle_at: Option<DateTime<Utc>>,
}

pub struct Archiver {
    state: Mutex<PipelineState>,
    extractor: BatchExtractor,
    packager: Packager,
    publisher: RemotePublisher,
    reconciler: Reconciler,
    staging: StagingArea,
    metrics: ArchiveMetrics,
    extract_interval: Duration,
    flush_interval: Duration,
    age_threshold: TimeDelta,
    max_pending_records: usize,
}

impl Archiver {
    /// Wire the pipeline from configuration and explicit collaborators.
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn ColdStorage>,
        staging: StagingArea,
        config: &Configuration,
    ) -> Result<Self> {
        let archive = &config.archive;
        let identity = config.source.identity();
        let metrics = ArchiveMetrics::new();

        let age_threshold = TimeDelta::from_std(archive.age_threshold)
            .context("age_threshold is out of range")?;

        let extractor = BatchExtractor::new(
            Arc::clone(&source),
            staging.clone(),
            ExtractorConfig {
                source_identity: identity.clone(),
                age_field: config.source.age_field.clone(),
                ordering: archive.ordering,
                record_limit: archive.record_limit,
            },
            metrics.clone(),
        );
        let packager = Packager::new(staging.clone(), identity.clone(), metrics.clone());
        let publisher = RemotePublisher::new(
            target,
            identity,
            config.storage.prefix.clone(),
            metrics.clone(),
        );
        let reconciler = Reconciler::new(
            source,
            staging.clone(),
            ReconcilerConfig {
                id_field: config.source.id_field.clone(),
                delete_concurrency: archive.delete_concurrency,
                verify_sample: archive.verify_sample,
                deletion_log: archive.deletion_log.clone(),
            },
            metrics.clone(),
        );

        Ok(Self {
            state: Mutex::new(PipelineState::default()),
            extractor,
            packager,
            publisher,
            reconciler,
            staging,
            metrics,
            extract_interval: archive.extract_interval,
            flush_interval: archive.flush_interval,
            age_threshold,
            max_pending_records: archive.max_pending_records,
        })
    }

    /// Connect to the configured source and cold storage and open the
    /// staging directory.
    pub async fn from_config(config: &Configuration) -> Result<Self> {
        let source = source::connect(&config.source)
            .await
            .context("Failed to connect to source store")?;
        let store = common::storage::create_object_store(&config.storage)
            .context("Failed to create cold storage client")?;
        let staging = StagingArea::open(&config.archive.staging_dir).await?;

        tracing::info!(
            source = %config.source.identity(),
            storage = %common::storage::redacted_dsn(&config.storage.dsn),
            staging_dir = %staging.dir().display(),
            "Archiver initialized"
        );

        Self::new(source, Arc::new(ObjectStoreTarget::new(store)), staging, config)
    }

    pub fn metrics(&self) -> &ArchiveMetrics {
        &self.metrics
    }

    pub async fn checkpoint(&self) -> Checkpoint {
        self.state.lock().await.checkpoint.clone()
    }

    /// Records staged since the last flush in this process.
    pub async fn pending_records(&self) -> usize {
        self.state.lock().await.accumulator.pending_records()
    }

    /// Report artifacts left behind by a previous run. They need no special
    /// handling: the next flush finds them in the staging directory.
    pub async fn recover(&self) -> Result<Vec<PathBuf>> {
        let orphans = self.staging.pending_artifacts().await?;
        if orphans.is_empty() {
            tracing::debug!("No staged artifacts left from a previous run");
        } else {
            tracing::info!(
                artifacts = orphans.len(),
                "Found staged artifacts from a previous run; they will be archived on the next flush"
            );
        }
        Ok(orphans)
    }

    pub async fn extract_tick(&self) -> ExtractOutcome {
        let mut state = self.state.lock().await;
        let PipelineState {
            checkpoint,
            accumulator,
            ..
        } = &mut *state;

        let pending = accumulator.pending_records();
        if pending >= self.max_pending_records {
            tracing::warn!(
                pending,
                max_pending_records = self.max_pending_records,
                "Skipping extraction until the next flush drains pending records"
            );
            return ExtractOutcome::Throttled;
        }

        let candidate = Utc::now()
            .checked_sub_signed(self.age_threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let cutoff = checkpoint.begin_epoch(candidate);
        match self.extractor.extract(cutoff, checkpoint).await {
            Ok(Some(batch)) => {
                let count = batch.record_count;
                accumulator.append(batch);
                ExtractOutcome::Staged(count)
            }
            Ok(None) => ExtractOutcome::Empty,
            Err(e) => {
                self.metrics.record_extraction_failure();
                tracing::error!(error = ?e, "Extraction failed; retrying on the next tick");
                ExtractOutcome::Failed
            }
        }
    }

    pub async fn flush_tick(&self) -> FlushOutcome {
        let outcome = self.flush_cycle().await;
        self.metrics.summary().log();
        outcome
    }

    async fn flush_cycle(&self) -> FlushOutcome {
        let mut state = self.state.lock().await;
        let drained = state.accumulator.drain_all();

        self.packager.sweep_stale_bundles().await;

        let pending = match self.staging.pending_artifacts().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = ?e, "Failed to scan staging directory");
                restore(&mut state.accumulator, drained);
                return FlushOutcome::PackagingFailed;
            }
        };

        if pending.is_empty() {
            if !drained.is_empty() {
                tracing::warn!(
                    batches = drained.len(),
                    "Staged artifacts disappeared before flush"
                );
            }
            tracing::debug!("Nothing staged; starting a new epoch");
            state.checkpoint.reset();
            return FlushOutcome::Idle;
        }
        cross_check(&drained, &pending);

        let created_at = next_bundle_time(Utc::now(), state.last_bundle_at);
        state.last_bundle_at = Some(created_at);

        let bundle = match self.packager.package(pending, created_at).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                tracing::error!("No staged artifact could be bundled");
                restore(&mut state.accumulator, drained);
                return FlushOutcome::PackagingFailed;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to package staged artifacts");
                restore(&mut state.accumulator, drained);
                return FlushOutcome::PackagingFailed;
            }
        };

        if let Err(e) = self.publisher.publish(&bundle).await {
            tracing::error!(error = ?e, "Upload failed; artifacts stay staged for the next flush");
            if let Err(e) = self.staging.remove(&bundle.path).await {
                tracing::warn!(bundle = %bundle.path.display(), error = %e, "Failed to remove bundle");
            }
            restore(&mut state.accumulator, drained);
            return FlushOutcome::UploadFailed;
        }

        let report = self.reconciler.reconcile(&bundle).await;
        state.checkpoint.reset();

        FlushOutcome::Reconciled(report)
    }

    /// Run both cadences until `shutdown` resolves. One extraction runs
    /// immediately; the timers then fire one period after start. A cycle
    /// already in progress always completes first.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.recover().await {
            tracing::warn!(error = ?e, "Failed to scan staging directory at startup");
        }

        let start = Instant::now();
        self.extract_tick().await;

        let mut extract = interval_at(start + self.extract_interval, self.extract_interval);
        let mut flush = interval_at(start + self.flush_interval, self.flush_interval);
        extract.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            extract_interval = ?self.extract_interval,
            flush_interval = ?self.flush_interval,
            "Archiver running"
        );

        tokio::pin!(shutdown);
        loop {
            // flush before extract when both are due
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Archiver stopping");
                    break;
                }
                _ = flush.tick() => {
                    self.flush_tick().await;
                }
                _ = extract.tick() => {
                    self.extract_tick().await;
                }
            }
        }

        self.metrics.summary().log();
    }
}

/// Put batches back after an aborted flush so back-pressure still counts
/// them.
fn restore(accumulator: &mut Accumulator, drained: Vec<StagedBatch>) {
    for batch in drained {
        accumulator.append(batch);
    }
}

fn cross_check(drained: &[StagedBatch], pending: &[PathBuf]) {
    let on_disk: HashSet<&PathBuf> = pending.iter().collect();
    for batch in drained {
        if !on_disk.contains(&batch.artifact) {
            tracing::warn!(artifact = %batch.artifact.display(), "Staged artifact missing from staging directory");
        }
    }

    let tracked: HashSet<&PathBuf> = drained.iter().map(|b| &b.artifact).collect();
    let orphans = pending.iter().filter(|p| !tracked.contains(p)).count();
    if orphans > 0 {
        tracing::info!(artifacts = orphans, "Including artifacts staged by an earlier run");
    }
}
