//! Channel to room lookup.

use std::time::Instant;

use common::types::{ChannelId, RoomId};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use super::ChannelDirectory;
use crate::errors::RtcError;
use crate::observability::metrics;

#[derive(Debug, Clone)]
pub struct ChannelRepository {
    pool: PgPool,
}

impl ChannelRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ChannelDirectory for ChannelRepository {
    #[instrument(skip_all, name = "rtc.repo.room_of", fields(channel_id = %channel_id))]
    async fn room_of(&self, channel_id: ChannelId) -> Result<Option<RoomId>, RtcError> {
        let start = Instant::now();
        let result = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query_scalar::<_, Uuid>("SELECT room_id FROM room_channels WHERE id = $1")
                .bind(channel_id.0)
                .fetch_optional(&mut *conn)
                .await
        }
        .await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_db_query("room_of", status, start.elapsed());
        Ok(result?.map(RoomId))
    }
}
