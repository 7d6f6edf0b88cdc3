use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{Field, Filter, SourceError, SourceStore, compare_records};
use crate::record::{Record, RecordId, RecordShapeError};

/// In-process document collection keyed by identifier.
#[derive(Debug)]
pub struct MemorySource {
    id_field: String,
    documents: RwLock<BTreeMap<RecordId, Value>>,
}

impl MemorySource {
    pub fn new(id_field: &str) -> Self {
        Self {
            id_field: id_field.to_string(),
            documents: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace a document, returning its identifier.
    pub async fn insert(&self, document: Value) -> Result<RecordId, RecordShapeError> {
        let record = Record::from_document(document, &self.id_field)?;
        let id = record.id.clone();
        self.documents.write().await.insert(record.id, record.document);
        Ok(id)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<RecordId> {
        self.documents.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, id: &RecordId) -> bool {
        self.documents.read().await.contains_key(id)
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn find(
        &self,
        filter: &Filter,
        sort: &[Field],
        limit: usize,
    ) -> Result<Vec<Record>, SourceError> {
        let documents = self.documents.read().await;
        let mut matched: Vec<Record> = documents
            .iter()
            .map(|(id, document)| Record {
                id: id.clone(),
                document: document.clone(),
            })
            .filter(|record| filter.matches(record))
            .collect();

        matched.sort_by(|a, b| compare_records(a, b, sort));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn delete_by_id(&self, id: &RecordId) -> Result<u64, SourceError> {
        let removed = self.documents.write().await.remove(id);
        Ok(u64::from(removed.is_some()))
    }

    async fn count_by_id(&self, id: &RecordId) -> Result<u64, SourceError> {
        Ok(u64::from(self.contains(id).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_find_filters_sorts_and_limits() {
        let source = MemorySource::new("_id");
        source
            .insert(json!({"_id": 3, "createdAt": "2024-01-01T00:00:00Z"}))
            .await
            .unwrap();
        source
            .insert(json!({"_id": 1, "createdAt": "2024-01-03T00:00:00Z"}))
            .await
            .unwrap();
        source
            .insert(json!({"_id": 2, "createdAt": "2024-01-02T00:00:00Z"}))
            .await
            .unwrap();
        source
            .insert(json!({"_id": 4, "createdAt": "2030-01-01T00:00:00Z"}))
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let filter = Filter::field_before("createdAt", cutoff);
        let sort = [Field::Named("createdAt".to_string()), Field::Identifier];

        let found = source.find(&filter, &sort, 2).await.unwrap();
        let ids: Vec<_> = found.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RecordId::Int(3), RecordId::Int(2)]);

        let found = source.find(&filter, &[Field::Identifier], 10).await.unwrap();
        let ids: Vec<_> = found.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RecordId::Int(1), RecordId::Int(2), RecordId::Int(3)]);
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let source = MemorySource::new("_id");
        let id = source.insert(json!({"_id": "a"})).await.unwrap();

        assert_eq!(source.count_by_id(&id).await.unwrap(), 1);
        assert_eq!(source.delete_by_id(&id).await.unwrap(), 1);
        assert_eq!(source.delete_by_id(&id).await.unwrap(), 0);
        assert_eq!(source.count_by_id(&id).await.unwrap(), 0);
        assert!(source.is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_rejects_unsupported_identifier() {
        let source = MemorySource::new("_id");
        assert!(source.insert(json!({"_id": null})).await.is_err());
        assert_eq!(source.len().await, 0);
    }
}
