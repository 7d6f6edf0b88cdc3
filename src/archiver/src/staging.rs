//! Local staging directory: the durable queue between extraction and
//! upload.
//!
//! Every extracted batch is written here as one JSON artifact before the
//! checkpoint moves. The directory listing, not any in-memory state, is
//! what a flush treats as pending, so artifacts orphaned by a crash are
//! picked up by the next flush.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::record::RecordId;

/// Extension of staged batch artifacts.
pub const ARTIFACT_EXTENSION: &str = "json";

/// Suffix of packaged bundles.
pub const BUNDLE_SUFFIX: &str = ".tar.gz";

const TEMP_SUFFIX: &str = ".tmp";

/// On-disk form of one extracted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    /// `<database>.<collection>` the records came from
    pub source: String,
    /// Age cutoff of the epoch the batch was extracted in
    pub epoch_cutoff: DateTime<Utc>,
    pub staged_at: DateTime<Utc>,
    /// Source documents, in extraction order
    pub records: Vec<Value>,
}

impl BatchFile {
    /// Decode a staged artifact from its bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to decode staged batch")
    }
}

/// Deterministic artifact name for a batch, so restaging the same batch
/// after a crash overwrites the earlier file instead of duplicating it.
pub fn artifact_name(epoch_cutoff: DateTime<Utc>, first: &RecordId, last: &RecordId) -> String {
    let key = format!("{}|{}|{}", epoch_cutoff.timestamp_millis(), first, last);
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
    format!(
        "batch_{:013}_{}.{}",
        epoch_cutoff.timestamp_millis(),
        digest.simple(),
        ARTIFACT_EXTENSION
    )
}

fn is_artifact(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(ARTIFACT_EXTENSION)
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(suffix))
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Open (creating if needed) the staging directory and drop any
    /// half-written artifacts from an interrupted write.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let staging = Self { dir: dir.into() };
        fs::create_dir_all(&staging.dir)
            .await
            .with_context(|| format!("Failed to create staging directory {:?}", staging.dir))?;

        for temp in staging.list(|path| has_suffix(path, TEMP_SUFFIX)).await? {
            if let Err(e) = fs::remove_file(&temp).await {
                tracing::warn!(path = %temp.display(), error = %e, "Failed to remove partial artifact");
            }
        }
        Ok(staging)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably write a batch: temp file, fsync, rename into place.
    pub async fn write_batch(&self, name: &str, batch: &BatchFile) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let temp = self.dir.join(format!(".{name}{TEMP_SUFFIX}"));
        let bytes = serde_json::to_vec(batch).context("Failed to encode batch")?;

        let mut file = fs::File::create(&temp)
            .await
            .with_context(|| format!("Failed to create {temp:?}"))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("Failed to move artifact into place at {path:?}"));
        }
        Ok(path)
    }

    /// Staged artifacts awaiting upload, sorted by name. Files with any other
    /// extension are ignored.
    pub async fn pending_artifacts(&self) -> Result<Vec<PathBuf>> {
        self.list(|path| is_artifact(path) && !has_suffix(path, TEMP_SUFFIX))
            .await
    }

    /// Bundles left behind by a flush that did not finish.
    pub async fn stale_bundles(&self) -> Result<Vec<PathBuf>> {
        self.list(|path| has_suffix(path, BUNDLE_SUFFIX)).await
    }

    pub async fn read_batch(&self, path: &Path) -> Result<BatchFile> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read artifact {path:?}"))?;
        BatchFile::from_slice(&bytes)
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to remove {path:?}"))
    }

    async fn list(&self, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list staging directory {:?}", self.dir))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && keep(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn batch(ids: &[i64]) -> BatchFile {
        BatchFile {
            source: "app.events".to_string(),
            epoch_cutoff: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            staged_at: Utc::now(),
            records: ids.iter().map(|id| json!({"_id": id})).collect(),
        }
    }

    #[test]
    fn test_artifact_name_is_deterministic() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = artifact_name(cutoff, &RecordId::Int(1), &RecordId::Int(5));
        let b = artifact_name(cutoff, &RecordId::Int(1), &RecordId::Int(5));
        let c = artifact_name(cutoff, &RecordId::Int(6), &RecordId::Int(10));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("batch_"));
        assert!(a.ends_with(".json"));
    }

    #[tokio::test]
    async fn test_write_read_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path()).await.unwrap();

        let path = staging.write_batch("batch_a.json", &batch(&[1, 2])).await.unwrap();
        staging.write_batch("batch_b.json", &batch(&[3])).await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"unrelated").unwrap();
        std::fs::write(temp_dir.path().join("archive_x.tar.gz"), b"old").unwrap();

        let pending = staging.pending_artifacts().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], path);

        let stale = staging.stale_bundles().await.unwrap();
        assert_eq!(stale.len(), 1);

        let read = staging.read_batch(&path).await.unwrap();
        assert_eq!(read.records.len(), 2);

        staging.remove(&path).await.unwrap();
        assert_eq!(staging.pending_artifacts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_drops_partial_writes() {
        let temp_dir = TempDir::new().unwrap();
        let partial = temp_dir.path().join(".batch_a.json.tmp");
        std::fs::write(&partial, b"{\"source\":").unwrap();

        let staging = StagingArea::open(temp_dir.path()).await.unwrap();
        assert!(!partial.exists());
        assert!(staging.pending_artifacts().await.unwrap().is_empty());
    }
}
