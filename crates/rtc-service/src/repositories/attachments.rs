//! Attachment metadata and chunk storage in Postgres.
//!
//! Table names come from [`MessageTable`] and are formatted into the
//! statement text; every value is a bound parameter. Each call acquires a
//! pooled connection for its own scope, so an acquisition failure surfaces
//! as the same `Database` error as a failed statement.

use std::time::Instant;

use common::types::{ChunkId, MessageId};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{AttachmentMetadata, AttachmentStore, DeletedChunk, NewChunk};
use crate::actors::messages::MessageTable;
use crate::errors::RtcError;
use crate::observability::metrics;

#[derive(Debug, Clone)]
pub struct AttachmentRepository {
    pool: PgPool,
}

impl AttachmentRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn observe<T>(
    operation: &'static str,
    start: Instant,
    result: Result<T, sqlx::Error>,
) -> Result<T, RtcError> {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_db_query(operation, status, start.elapsed());
    result.map_err(RtcError::from)
}

impl AttachmentStore for AttachmentRepository {
    #[instrument(skip_all, name = "rtc.repo.message_exists", fields(table = table.message_table()))]
    async fn message_exists(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> Result<bool, RtcError> {
        let start = Instant::now();
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            table.message_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query_scalar::<_, bool>(&sql)
                .bind(message_id.0)
                .fetch_one(&mut *conn)
                .await
        }
        .await;
        observe("message_exists", start, result)
    }

    #[instrument(skip_all, name = "rtc.repo.attachment_metadata", fields(table = table.metadata_table()))]
    async fn attachment_metadata(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> Result<Option<AttachmentMetadata>, RtcError> {
        let start = Instant::now();
        let sql = format!(
            "SELECT size::BIGINT AS size, failed, COALESCE(ratio, 0) >= 1 AS complete \
             FROM {} WHERE message_id = $1",
            table.metadata_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            let row = sqlx::query(&sql)
                .bind(message_id.0)
                .fetch_optional(&mut *conn)
                .await?;
            row.map(|row| -> Result<AttachmentMetadata, sqlx::Error> {
                Ok(AttachmentMetadata {
                    size: row.try_get("size")?,
                    failed: row.try_get("failed")?,
                    complete: row.try_get("complete")?,
                })
            })
            .transpose()
        }
        .await;
        observe("attachment_metadata", start, result)
    }

    #[instrument(skip_all, name = "rtc.repo.insert_chunk", fields(table = table.chunk_table()))]
    async fn insert_chunk(&self, table: MessageTable, chunk: NewChunk) -> Result<(), RtcError> {
        let start = Instant::now();
        let sql = format!(
            "INSERT INTO {} (id, message_id, bytes, next_chunk_id) VALUES ($1, $2, $3, $4)",
            table.chunk_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(&sql)
                .bind(chunk.id.0)
                .bind(chunk.message_id.0)
                .bind(chunk.bytes.as_ref())
                .bind(chunk.next.map(|next| next.0))
                .execute(&mut *conn)
                .await
                .map(|_| ())
        }
        .await;
        observe("insert_chunk", start, result)
    }

    #[instrument(skip_all, name = "rtc.repo.delete_chunk", fields(table = table.chunk_table()))]
    async fn delete_chunk(
        &self,
        table: MessageTable,
        chunk_id: ChunkId,
    ) -> Result<Option<DeletedChunk>, RtcError> {
        let start = Instant::now();
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 RETURNING next_chunk_id",
            table.chunk_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            let row = sqlx::query(&sql)
                .bind(chunk_id.0)
                .fetch_optional(&mut *conn)
                .await?;
            row.map(|row| -> Result<DeletedChunk, sqlx::Error> {
                let next: Option<Uuid> = row.try_get("next_chunk_id")?;
                Ok(DeletedChunk {
                    next: next.map(ChunkId),
                })
            })
            .transpose()
        }
        .await;
        observe("delete_chunk", start, result)
    }

    #[instrument(skip_all, name = "rtc.repo.set_ratio", fields(table = table.metadata_table()))]
    async fn set_ratio(
        &self,
        table: MessageTable,
        message_id: MessageId,
        ratio: f64,
    ) -> Result<(), RtcError> {
        let start = Instant::now();
        let sql = format!(
            "UPDATE {} SET ratio = $1 WHERE message_id = $2",
            table.metadata_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(&sql)
                .bind(ratio)
                .bind(message_id.0)
                .execute(&mut *conn)
                .await
                .map(|_| ())
        }
        .await;
        observe("set_ratio", start, result)
    }

    #[instrument(skip_all, name = "rtc.repo.mark_failed", fields(table = table.metadata_table()))]
    async fn mark_failed(&self, table: MessageTable, message_id: MessageId) -> Result<(), RtcError> {
        let start = Instant::now();
        let sql = format!(
            "UPDATE {} SET failed = TRUE WHERE message_id = $1",
            table.metadata_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(&sql)
                .bind(message_id.0)
                .execute(&mut *conn)
                .await
                .map(|_| ())
        }
        .await;
        observe("mark_failed", start, result)
    }

    #[instrument(skip_all, name = "rtc.repo.delete_metadata", fields(table = table.metadata_table()))]
    async fn delete_metadata(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> Result<bool, RtcError> {
        let start = Instant::now();
        let sql = format!(
            "DELETE FROM {} WHERE message_id = $1",
            table.metadata_table()
        );
        let result = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(&sql)
                .bind(message_id.0)
                .execute(&mut *conn)
                .await
                .map(|done| done.rows_affected() > 0)
        }
        .await;
        observe("delete_metadata", start, result)
    }
}
