//! The live document store the archiver drains.
//!
//! The pipeline only needs three primitives from a store: an ordered,
//! filtered, limited `find`; delete by identifier; and count by identifier
//! (used to verify deletions). Filters are a small expression tree so each
//! adapter can translate them natively.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::SourceConfig;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

use crate::record::{Record, RecordId, RecordShapeError, lookup, timestamp_from_json};

pub mod memory;
pub mod sqlite;

pub use memory::MemorySource;
pub use sqlite::SqliteSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source query failed: {0}")]
    Query(String),

    #[error("source delete failed: {0}")]
    Delete(String),

    #[error("unsupported source DSN: {0}")]
    UnsupportedDsn(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Shape(#[from] RecordShapeError),
}

/// A field a filter or sort refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// The record identifier
    Identifier,
    /// A named (possibly dotted) document field
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Gt,
    Gte,
}

impl Comparison {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Gte => ordering != Ordering::Less,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Comparison::Eq => " = ",
            Comparison::Lt => " < ",
            Comparison::Gt => " > ",
            Comparison::Gte => " >= ",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Id(RecordId),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Conjunction; an empty list matches everything
    All(Vec<Filter>),
    /// Disjunction; an empty list matches nothing
    Any(Vec<Filter>),
    Compare {
        field: Field,
        op: Comparison,
        value: FilterValue,
    },
}

impl Filter {
    pub fn compare(field: Field, op: Comparison, value: FilterValue) -> Self {
        Filter::Compare { field, op, value }
    }

    pub fn field_before(field: &str, at: DateTime<Utc>) -> Self {
        Self::compare(
            Field::Named(field.to_string()),
            Comparison::Lt,
            FilterValue::Timestamp(at),
        )
    }

    pub fn id_after(id: RecordId) -> Self {
        Self::compare(Field::Identifier, Comparison::Gt, FilterValue::Id(id))
    }

    /// Evaluate the filter against a record held in memory.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All(parts) => parts.iter().all(|f| f.matches(record)),
            Filter::Any(parts) => parts.iter().any(|f| f.matches(record)),
            Filter::Compare { field, op, value } => {
                compare_field(record, field, value).is_some_and(|ordering| op.holds(ordering))
            }
        }
    }
}

/// Compare a record's field against a filter value. `None` when the field
/// is missing or of a different type, which never matches.
fn compare_field(record: &Record, field: &Field, value: &FilterValue) -> Option<Ordering> {
    match (field, value) {
        (Field::Identifier, FilterValue::Id(id)) => Some(record.id.cmp(id)),
        (Field::Identifier, FilterValue::Timestamp(_)) => None,
        (Field::Named(name), FilterValue::Timestamp(at)) => {
            let actual = timestamp_from_json(lookup(&record.document, name)?)?;
            Some(actual.cmp(at))
        }
        (Field::Named(name), FilterValue::Id(id)) => {
            let actual = RecordId::from_json(lookup(&record.document, name)?).ok()?;
            Some(actual.cmp(id))
        }
    }
}

/// Order two records by the given ascending sort fields. Missing or
/// unparsable timestamps sort first.
pub fn compare_records(a: &Record, b: &Record, sort: &[Field]) -> Ordering {
    sort.iter()
        .map(|field| match field {
            Field::Identifier => a.id.cmp(&b.id),
            Field::Named(name) => {
                let left = lookup(&a.document, name).and_then(timestamp_from_json);
                let right = lookup(&b.document, name).and_then(timestamp_from_json);
                left.cmp(&right)
            }
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Minimal contract the pipeline needs from the live store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Records matching `filter`, ordered ascending by `sort`, at most `limit`.
    async fn find(
        &self,
        filter: &Filter,
        sort: &[Field],
        limit: usize,
    ) -> Result<Vec<Record>, SourceError>;

    /// Delete one record; returns the number of records removed.
    async fn delete_by_id(&self, id: &RecordId) -> Result<u64, SourceError>;

    /// Number of records still stored under `id`.
    async fn count_by_id(&self, id: &RecordId) -> Result<u64, SourceError>;
}

/// Build the source adapter named by `config.dsn`.
pub async fn connect(config: &SourceConfig) -> Result<Arc<dyn SourceStore>, SourceError> {
    let dsn = config.dsn.as_str();
    if dsn.starts_with("memory:") {
        tracing::warn!("Using an in-process memory source; nothing will be archived across restarts");
        return Ok(Arc::new(MemorySource::new(&config.id_field)));
    }
    if dsn.starts_with("sqlite:") {
        let source = SqliteSource::connect(dsn, &config.collection, &config.id_field).await?;
        return Ok(Arc::new(source));
    }
    Err(SourceError::UnsupportedDsn(dsn.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(id: i64, created: &str) -> Record {
        Record::from_document(json!({"_id": id, "createdAt": created}), "_id").unwrap()
    }

    #[test]
    fn test_filter_matches_compound_keyset() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let filter = Filter::All(vec![
            Filter::field_before("createdAt", Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            Filter::Any(vec![
                Filter::compare(
                    Field::Named("createdAt".to_string()),
                    Comparison::Gt,
                    FilterValue::Timestamp(at),
                ),
                Filter::All(vec![
                    Filter::compare(
                        Field::Named("createdAt".to_string()),
                        Comparison::Eq,
                        FilterValue::Timestamp(at),
                    ),
                    Filter::id_after(RecordId::Int(5)),
                ]),
            ]),
        ]);

        assert!(!filter.matches(&record(4, "2024-01-01T00:00:00Z")));
        assert!(!filter.matches(&record(5, "2024-01-01T00:00:00Z")));
        assert!(filter.matches(&record(6, "2024-01-01T00:00:00Z")));
        assert!(filter.matches(&record(1, "2024-02-01T00:00:00Z")));
        assert!(!filter.matches(&record(9, "2024-07-01T00:00:00Z")));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let r = Record::from_document(json!({"_id": 1}), "_id").unwrap();
        let filter = Filter::field_before("createdAt", Utc::now());
        assert!(!filter.matches(&r));
        assert!(Filter::All(vec![]).matches(&r));
        assert!(!Filter::Any(vec![]).matches(&r));
    }

    #[test]
    fn test_compare_records_uses_tiebreak() {
        let a = record(2, "2024-01-01T00:00:00Z");
        let b = record(1, "2024-01-01T00:00:00Z");
        let sort = [Field::Named("createdAt".to_string()), Field::Identifier];
        assert_eq!(compare_records(&a, &b, &sort), Ordering::Greater);
        assert_eq!(compare_records(&a, &b, &sort[..1]), Ordering::Equal);
    }
}
