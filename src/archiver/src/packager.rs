//! Packaging of staged artifacts into one gzip-compressed tar bundle.
//!
//! An artifact that cannot be read or decoded is left out of the bundle
//! and reported as skipped. Only artifacts listed in
//! [`Bundle::included`] may be reconciled after upload.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::metrics::ArchiveMetrics;
use crate::staging::{BUNDLE_SUFFIX, BatchFile, StagingArea};

/// An artifact that made it into a bundle, with its decoded contents.
#[derive(Debug, Clone)]
pub struct PackagedArtifact {
    pub path: PathBuf,
    pub batch: BatchFile,
}

#[derive(Debug)]
pub struct Bundle {
    /// Local path of the bundle file
    pub path: PathBuf,
    /// File name, also the suffix of the remote key
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub included: Vec<PackagedArtifact>,
    /// Artifacts left out of the bundle; they stay staged
    pub skipped: Vec<PathBuf>,
}

impl Bundle {
    pub fn record_count(&self) -> usize {
        self.included.iter().map(|a| a.batch.records.len()).sum()
    }
}

/// `archive_<YYYYMMDD_HHMMSS_mmm>.tar.gz`
pub fn bundle_name(at: DateTime<Utc>) -> String {
    format!("archive_{}{}", at.format("%Y%m%d_%H%M%S_%3f"), BUNDLE_SUFFIX)
}

/// Timestamp for the next bundle: `now` at millisecond precision, moved
/// past `previous` if needed. Names derived from it never repeat within a
/// process, so an upload can never overwrite an earlier bundle.
pub fn next_bundle_time(now: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let millis = match previous.map(|p| p.timestamp_millis()) {
        Some(last) if last >= now.timestamp_millis() => last + 1,
        _ => now.timestamp_millis(),
    };
    DateTime::from_timestamp_millis(millis).unwrap_or(now)
}

pub struct Packager {
    staging: StagingArea,
    source_identity: String,
    metrics: ArchiveMetrics,
}

impl Packager {
    pub fn new(staging: StagingArea, source_identity: String, metrics: ArchiveMetrics) -> Self {
        Self {
            staging,
            source_identity,
            metrics,
        }
    }

    /// Remove bundles a previous flush created but never cleaned up.
    pub async fn sweep_stale_bundles(&self) -> usize {
        let stale = match self.staging.stale_bundles().await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list stale bundles");
                return 0;
            }
        };

        let mut removed = 0;
        for path in stale {
            match self.staging.remove(&path).await {
                Ok(()) => {
                    tracing::info!(bundle = %path.display(), "Removed stale bundle");
                    removed += 1;
                }
                Err(e) => tracing::warn!(bundle = %path.display(), error = %e, "Failed to remove stale bundle"),
            }
        }
        removed
    }

    /// Bundle `artifacts` into one archive named after `created_at`.
    ///
    /// Returns `None` when no artifact could be included; the partial
    /// bundle file is removed in that case.
    pub async fn package(
        &self,
        artifacts: Vec<PathBuf>,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Bundle>> {
        let name = bundle_name(created_at);
        let path = self.staging.dir().join(&name);

        let bundle_path = path.clone();
        let source_identity = self.source_identity.clone();
        let (included, skipped) = tokio::task::spawn_blocking(move || {
            write_bundle(&bundle_path, &artifacts, &source_identity)
        })
        .await
        .context("Bundle writer task panicked")??;

        if !skipped.is_empty() {
            self.metrics.record_artifacts_skipped(skipped.len());
            tracing::warn!(
                skipped = skipped.len(),
                included = included.len(),
                "Some staged artifacts were left out of the bundle and stay staged"
            );
        }

        if included.is_empty() {
            if let Err(e) = self.staging.remove(&path).await {
                tracing::warn!(bundle = %path.display(), error = %e, "Failed to remove empty bundle");
            }
            return Ok(None);
        }

        let bundle = Bundle {
            path,
            name,
            created_at,
            included,
            skipped,
        };
        tracing::info!(
            bundle = %bundle.path.display(),
            artifacts = bundle.included.len(),
            records = bundle.record_count(),
            "Packaged bundle"
        );
        Ok(Some(bundle))
    }
}

fn write_bundle(
    bundle_path: &Path,
    artifacts: &[PathBuf],
    source_identity: &str,
) -> Result<(Vec<PackagedArtifact>, Vec<PathBuf>)> {
    let file = File::create(bundle_path)
        .with_context(|| format!("Failed to create bundle {bundle_path:?}"))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut included = Vec::new();
    let mut skipped = Vec::new();

    for path in artifacts {
        let Some(entry_name) = path.file_name() else {
            skipped.push(path.clone());
            continue;
        };

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(artifact = %path.display(), error = %e, "Failed to read staged artifact");
                skipped.push(path.clone());
                continue;
            }
        };
        let batch = match BatchFile::from_slice(&bytes) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(artifact = %path.display(), error = %e, "Staged artifact is corrupt");
                skipped.push(path.clone());
                continue;
            }
        };
        if batch.source != source_identity {
            tracing::warn!(
                artifact = %path.display(),
                source = %batch.source,
                expected = %source_identity,
                "Staged artifact belongs to another source"
            );
            skipped.push(path.clone());
            continue;
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(batch.staged_at.timestamp().max(0) as u64);
        builder
            .append_data(&mut header, entry_name, bytes.as_slice())
            .with_context(|| format!("Failed to add {path:?} to bundle"))?;

        included.push(PackagedArtifact {
            path: path.clone(),
            batch,
        });
    }

    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    let file = encoder.finish().context("Failed to finish gzip stream")?;
    file.sync_all().context("Failed to sync bundle")?;

    Ok((included, skipped))
}
