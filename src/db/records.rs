//! `RecordStore` over the `engine_records` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::{RecordFilter, RecordStore, StoredRecord};

#[async_trait]
impl RecordStore for super::Db {
    async fn insert(&self, record: StoredRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO engine_records (id, kind, record_key, payload, recorded_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(record.kind.as_str())
        .bind(&record.key)
        .bind(&record.payload)
        .bind(record.recorded_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> anyhow::Result<Vec<StoredRecord>> {
        let limit = filter.limit.map(|n| n as i64).unwrap_or(i64::MAX);
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT kind, record_key, payload, recorded_at
             FROM engine_records
             WHERE ($1::text IS NULL OR kind = $1)
             AND ($2::text IS NULL OR record_key = $2)
             AND ($3::timestamptz IS NULL OR recorded_at >= $3)
             ORDER BY recorded_at DESC
             LIMIT $4",
        )
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.key.as_deref())
        .bind(filter.since)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| row.try_into_record().map_err(Into::into))
            .collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RecordRow {
    kind: String,
    record_key: String,
    payload: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl RecordRow {
    fn try_into_record(self) -> crate::error::Result<StoredRecord> {
        Ok(StoredRecord {
            kind: self.kind.parse()?,
            key: self.record_key,
            payload: self.payload,
            recorded_at: self.recorded_at,
        })
    }
}
