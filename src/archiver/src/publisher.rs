use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use std::sync::Arc;

use crate::metrics::ArchiveMetrics;
use crate::packager::Bundle;

/// Destination for uploaded bundles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Store `payload` under `key`. Returns only once the write is durable.
    async fn put(&self, key: &str, payload: Bytes) -> Result<()>;
}

/// [`ColdStorage`] backed by any `object_store` implementation.
pub struct ObjectStoreTarget {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreTarget {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ColdStorage for ObjectStoreTarget {
    async fn put(&self, key: &str, payload: Bytes) -> Result<()> {
        let path = ObjectPath::from(key);
        self.store
            .put(&path, payload.into())
            .await
            .with_context(|| format!("Failed to put object {path}"))?;
        Ok(())
    }
}

pub struct RemotePublisher {
    target: Arc<dyn ColdStorage>,
    source_identity: String,
    prefix: String,
    metrics: ArchiveMetrics,
}

impl RemotePublisher {
    pub fn new(
        target: Arc<dyn ColdStorage>,
        source_identity: String,
        prefix: String,
        metrics: ArchiveMetrics,
    ) -> Self {
        Self {
            target,
            source_identity,
            prefix: prefix.trim_matches('/').to_string(),
            metrics,
        }
    }

    /// `<prefix>/<database>.<collection>_<bundle name>`, e.g.
    /// `archive/app.events_archive_20250225_130405.tar.gz`.
    pub fn remote_key(&self, bundle_name: &str) -> String {
        let object = format!("{}_{}", self.source_identity, bundle_name);
        if self.prefix.is_empty() {
            object
        } else {
            format!("{}/{}", self.prefix, object)
        }
    }

    /// Upload the bundle and return its remote key.
    pub async fn publish(&self, bundle: &Bundle) -> Result<String> {
        let key = self.remote_key(&bundle.name);

        let result = async {
            let payload = tokio::fs::read(&bundle.path)
                .await
                .with_context(|| format!("Failed to read bundle {:?}", bundle.path))?;
            let size = payload.len() as u64;
            self.target.put(&key, Bytes::from(payload)).await?;
            Ok::<_, anyhow::Error>(size)
        }
        .await;

        match result {
            Ok(size) => {
                self.metrics.record_bundle_uploaded(size);
                tracing::info!(key = %key, bytes = size, records = bundle.record_count(), "Uploaded bundle");
                Ok(key)
            }
            Err(e) => {
                self.metrics.record_upload_failure();
                Err(e.context(format!("Failed to upload bundle to {key}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packager::PackagedArtifact;
    use chrono::Utc;
    use object_store::memory::InMemory;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn bundle_at(path: PathBuf) -> Bundle {
        Bundle {
            name: "archive_20250225_130405.tar.gz".to_string(),
            path,
            created_at: Utc::now(),
            included: Vec::<PackagedArtifact>::new(),
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_remote_key_layout() {
        let target = Arc::new(MockColdStorage::new());
        let publisher = RemotePublisher::new(
            target.clone(),
            "app.events".to_string(),
            "/archive/".to_string(),
            ArchiveMetrics::new(),
        );
        assert_eq!(
            publisher.remote_key("archive_20250225_130405.tar.gz"),
            "archive/app.events_archive_20250225_130405.tar.gz"
        );

        let bare = RemotePublisher::new(target, "events".to_string(), String::new(), ArchiveMetrics::new());
        assert_eq!(bare.remote_key("b.tar.gz"), "events_b.tar.gz");
    }

    #[tokio::test]
    async fn test_publish_to_object_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive_20250225_130405.tar.gz");
        std::fs::write(&path, b"bundle-bytes").unwrap();

        let store = Arc::new(InMemory::new());
        let metrics = ArchiveMetrics::new();
        let publisher = RemotePublisher::new(
            Arc::new(ObjectStoreTarget::new(store.clone())),
            "app.events".to_string(),
            "archive".to_string(),
            metrics.clone(),
        );

        let key = publisher.publish(&bundle_at(path)).await.unwrap();

        let stored = store
            .get(&ObjectPath::from(key.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"bundle-bytes");
        assert_eq!(metrics.summary().bundles_uploaded, 1);
        assert_eq!(metrics.summary().bytes_uploaded, 12);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive_20250225_130405.tar.gz");
        std::fs::write(&path, b"bundle-bytes").unwrap();

        let mut target = MockColdStorage::new();
        target
            .expect_put()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("503 Slow Down")));

        let metrics = ArchiveMetrics::new();
        let publisher = RemotePublisher::new(
            Arc::new(target),
            "app.events".to_string(),
            "archive".to_string(),
            metrics.clone(),
        );

        assert!(publisher.publish(&bundle_at(path)).await.is_err());
        assert_eq!(metrics.summary().upload_failures, 1);
        assert_eq!(metrics.summary().bundles_uploaded, 0);
    }
}
