//! Document collection stored in SQLite.
//!
//! Each collection is a table `(id PRIMARY KEY, body TEXT)` where `body`
//! holds the JSON document. The `id` column has no declared type, so
//! integer and text identifiers keep their own storage class and compare
//! the same way [`RecordId`] does. Named fields are read with
//! `json_extract`; timestamps must be stored as epoch milliseconds for
//! range filters to apply.
//!
//! Rows a keyset cursor cannot move past are never returned: identifiers
//! stored as REAL or BLOB, bodies that are not valid JSON, and (for
//! timestamp comparisons) ages that are not integers.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, query, query_scalar};
use std::str::FromStr;

use super::{Field, Filter, FilterValue, SourceError, SourceStore};
use crate::record::{Record, RecordId, RecordShapeError};

pub struct SqliteSource {
    pool: SqlitePool,
    table: String,
    id_field: String,
}

/// Document text, or NULL when it does not parse, so `json_extract` never
/// raises on a malformed body.
const BODY: &str = "CASE WHEN json_valid(body) THEN body END";

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqliteSource {
    /// Connect to `dsn` and make sure the collection table exists.
    pub async fn connect(dsn: &str, collection: &str, id_field: &str) -> Result<Self, SourceError> {
        let options = SqliteConnectOptions::from_str(dsn)?.create_if_missing(true);

        // Every connection to an in-memory database sees its own database,
        // so the pool must hold exactly one connection for its whole life.
        let in_memory = dsn.contains(":memory:") || dsn.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to SQLite source");
            e
        })?;

        let source = Self::with_pool(pool, collection, id_field);
        source.ensure_table().await?;
        tracing::info!(table = %source.table, "SQLite source ready");
        Ok(source)
    }

    pub fn with_pool(pool: SqlitePool, collection: &str, id_field: &str) -> Self {
        Self {
            pool,
            table: quote_identifier(collection),
            id_field: id_field.to_string(),
        }
    }

    pub async fn ensure_table(&self) -> Result<(), SourceError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (id PRIMARY KEY NOT NULL, body TEXT NOT NULL)",
            self.table
        );
        query(&create).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or replace a document, keyed by its identifier field.
    pub async fn insert(&self, document: &Value) -> Result<RecordId, SourceError> {
        let record = Record::from_document(document.clone(), &self.id_field)?;
        let body = serde_json::to_string(document)
            .map_err(|e| SourceError::Query(format!("failed to encode document: {e}")))?;

        let statement = format!("INSERT OR REPLACE INTO {} (id, body) VALUES (?, ?)", self.table);
        let insert = match &record.id {
            RecordId::Int(i) => query::<Sqlite>(&statement).bind(*i),
            RecordId::Text(s) => query::<Sqlite>(&statement).bind(s.clone()),
        };
        insert.bind(body).execute(&self.pool).await?;
        Ok(record.id)
    }

    fn push_field(builder: &mut QueryBuilder<'_, Sqlite>, field: &Field) {
        match field {
            Field::Identifier => {
                builder.push("id");
            }
            Field::Named(name) => {
                builder.push(format!("json_extract({BODY}, "));
                builder.push_bind(format!("$.{name}"));
                builder.push(")");
            }
        }
    }

    /// Timestamps are epoch milliseconds, so only integer values qualify.
    /// A REAL or boolean age would match numerically but never decode.
    fn push_integer_guard(builder: &mut QueryBuilder<'_, Sqlite>, name: &str) {
        builder.push(format!("json_type({BODY}, "));
        builder.push_bind(format!("$.{name}"));
        builder.push(") = 'integer' AND ");
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
        match filter {
            Filter::All(parts) => Self::push_joined(builder, parts, " AND ", "1"),
            Filter::Any(parts) => Self::push_joined(builder, parts, " OR ", "0"),
            Filter::Compare { field, op, value } => {
                builder.push("(");
                if let (Field::Named(name), FilterValue::Timestamp(_)) = (field, value) {
                    Self::push_integer_guard(builder, name);
                }
                Self::push_field(builder, field);
                builder.push(op.sql());
                match value {
                    FilterValue::Id(RecordId::Int(i)) => builder.push_bind(*i),
                    FilterValue::Id(RecordId::Text(s)) => builder.push_bind(s.clone()),
                    FilterValue::Timestamp(at) => builder.push_bind(at.timestamp_millis()),
                };
                builder.push(")");
            }
        }
    }

    fn push_joined(
        builder: &mut QueryBuilder<'_, Sqlite>,
        parts: &[Filter],
        separator: &str,
        empty: &str,
    ) {
        if parts.is_empty() {
            builder.push(empty);
            return;
        }
        builder.push("(");
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                builder.push(separator);
            }
            Self::push_filter(builder, part);
        }
        builder.push(")");
    }

    fn decode_row(&self, row: &SqliteRow) -> Result<Record, SourceError> {
        let id_type: String = row.try_get("id_type")?;
        let id = match id_type.as_str() {
            "integer" => RecordId::Int(row.try_get("id")?),
            "text" => RecordId::Text(row.try_get("id")?),
            _ => {
                return Err(RecordShapeError::UnsupportedIdentifier { kind: "sqlite blob/real" }.into());
            }
        };

        let body: String = row.try_get("body")?;
        let mut document: Value = serde_json::from_str(&body)
            .map_err(|e| SourceError::Query(format!("document {id} is not valid JSON: {e}")))?;
        match document.as_object_mut() {
            Some(map) => {
                map.insert(self.id_field.clone(), id.to_json());
            }
            None => {
                return Err(SourceError::Query(format!("document {id} is not a JSON object")));
            }
        }

        Ok(Record { id, document })
    }

    fn bind_id<'q>(
        statement: &'q str,
        id: &RecordId,
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match id {
            RecordId::Int(i) => query::<Sqlite>(statement).bind(*i),
            RecordId::Text(s) => query::<Sqlite>(statement).bind(s.clone()),
        }
    }
}

#[async_trait]
impl SourceStore for SqliteSource {
    async fn find(
        &self,
        filter: &Filter,
        sort: &[Field],
        limit: usize,
    ) -> Result<Vec<Record>, SourceError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT id, typeof(id) AS id_type, body FROM {} \
             WHERE typeof(id) IN ('integer', 'text') AND json_valid(body) AND (",
            self.table
        ));
        Self::push_filter(&mut builder, filter);
        builder.push(")");

        if !sort.is_empty() {
            builder.push(" ORDER BY ");
            for (i, field) in sort.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                Self::push_field(&mut builder, field);
            }
        }
        builder.push(" LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.decode_row(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed source row"),
            }
        }
        Ok(records)
    }

    async fn delete_by_id(&self, id: &RecordId) -> Result<u64, SourceError> {
        let statement = format!("DELETE FROM {} WHERE id = ?", self.table);
        let result = Self::bind_id(&statement, id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count_by_id(&self, id: &RecordId) -> Result<u64, SourceError> {
        let statement = format!("SELECT COUNT(*) FROM {} WHERE id = ?", self.table);
        let count: i64 = match id {
            RecordId::Int(i) => query_scalar::<Sqlite, i64>(&statement).bind(*i),
            RecordId::Text(s) => query_scalar::<Sqlite, i64>(&statement).bind(s.clone()),
        }
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Comparison;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn source() -> SqliteSource {
        SqliteSource::connect("sqlite::memory:", "events", "_id")
            .await
            .unwrap()
    }

    fn millis(day: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[tokio::test]
    async fn test_find_with_keyset_filter() {
        let source = source().await;
        for (id, day) in [(1, 3), (2, 1), (3, 1), (4, 2), (5, 20)] {
            source
                .insert(&json!({"_id": id, "createdAt": millis(day), "n": id}))
                .await
                .unwrap();
        }

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let resume_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let age = Field::Named("createdAt".to_string());
        let filter = Filter::All(vec![
            Filter::field_before("createdAt", cutoff),
            Filter::Any(vec![
                Filter::compare(age.clone(), Comparison::Gt, FilterValue::Timestamp(resume_at)),
                Filter::All(vec![
                    Filter::compare(age.clone(), Comparison::Eq, FilterValue::Timestamp(resume_at)),
                    Filter::id_after(RecordId::Int(2)),
                ]),
            ]),
        ]);

        let found = source
            .find(&filter, &[age, Field::Identifier], 10)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![RecordId::Int(3), RecordId::Int(4), RecordId::Int(1)]);
        assert_eq!(found[0].document["n"], json!(3));
        assert_eq!(found[0].document["_id"], json!(3));
    }

    #[tokio::test]
    async fn test_text_identifiers_and_limit() {
        let source = source().await;
        for id in ["c", "a", "b"] {
            source
                .insert(&json!({"_id": id, "createdAt": millis(1)}))
                .await
                .unwrap();
        }

        let filter = Filter::id_after(RecordId::from("a"));
        let found = source.find(&filter, &[Field::Identifier], 1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, RecordId::from("b"));
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let source = source().await;
        let id = source
            .insert(&json!({"_id": 9, "createdAt": millis(1)}))
            .await
            .unwrap();

        assert_eq!(source.count_by_id(&id).await.unwrap(), 1);
        assert_eq!(source.delete_by_id(&id).await.unwrap(), 1);
        assert_eq!(source.delete_by_id(&id).await.unwrap(), 0);
        assert_eq!(source.count_by_id(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rows_without_a_usable_cursor_are_not_returned() {
        let source = source().await;
        source
            .insert(&json!({"_id": 1, "createdAt": millis(1) as f64 + 0.5}))
            .await
            .unwrap();
        source
            .insert(&json!({"_id": 2, "createdAt": true}))
            .await
            .unwrap();
        source
            .insert(&json!({"_id": 3, "createdAt": millis(1)}))
            .await
            .unwrap();
        let raw = format!("INSERT INTO {} (id, body) VALUES (?, ?)", source.table);
        query::<Sqlite>(&raw)
            .bind(4.5_f64)
            .bind(json!({"createdAt": millis(1)}).to_string())
            .execute(&source.pool)
            .await
            .unwrap();
        query::<Sqlite>(&raw)
            .bind(5_i64)
            .bind("{not json")
            .execute(&source.pool)
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let age = Field::Named("createdAt".to_string());
        let found = source
            .find(
                &Filter::field_before("createdAt", cutoff),
                &[age, Field::Identifier],
                2,
            )
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![RecordId::Int(3)]);
        assert!(found.iter().all(|r| r.age("createdAt").is_ok()));
    }
}
