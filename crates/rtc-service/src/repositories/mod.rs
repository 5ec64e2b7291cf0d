//! Persistence seams.
//!
//! The channel mesh and attachment actors are generic over these traits.
//! Production uses the sqlx repositories; tests and local runs use
//! [`InMemoryStore`].

pub mod attachments;
pub mod channels;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use common::types::{ChannelId, ChunkId, MessageId, RoomId};

use crate::actors::messages::MessageTable;
use crate::errors::RtcError;
use crate::observability::metrics;

pub use attachments::AttachmentRepository;
pub use channels::ChannelRepository;
pub use memory::InMemoryStore;

impl MessageTable {
    /// Every table family, in the order ownership is checked.
    pub const LOOKUP_ORDER: [MessageTable; 2] = [MessageTable::Direct, MessageTable::Room];

    /// Table holding the messages themselves.
    #[must_use]
    pub const fn message_table(self) -> &'static str {
        match self {
            MessageTable::Direct => "direct_messages",
            MessageTable::Room => "room_messages",
        }
    }

    /// Table holding size, failed flag and completion ratio.
    #[must_use]
    pub const fn metadata_table(self) -> &'static str {
        match self {
            MessageTable::Direct => "direct_message_attachment_metadata",
            MessageTable::Room => "room_message_attachment_metadata",
        }
    }

    /// Table holding the linked chunk rows.
    #[must_use]
    pub const fn chunk_table(self) -> &'static str {
        match self {
            MessageTable::Direct => "direct_message_attachment_chunks",
            MessageTable::Room => "room_message_attachment_chunks",
        }
    }
}

/// Declared size and state of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentMetadata {
    pub size: i64,
    pub failed: bool,
    /// Completion ratio reached 1: the terminal chunk was written.
    pub complete: bool,
}

/// Chunk row to insert.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: ChunkId,
    pub message_id: MessageId,
    pub bytes: Bytes,
    /// `None` marks the terminal chunk.
    pub next: Option<ChunkId>,
}

/// Forward pointer of a deleted chunk row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedChunk {
    pub next: Option<ChunkId>,
}

pub trait AttachmentStore: Send + Sync + 'static {
    /// Whether `message_id` exists in the given message table.
    fn message_exists(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> impl Future<Output = Result<bool, RtcError>> + Send;

    fn attachment_metadata(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> impl Future<Output = Result<Option<AttachmentMetadata>, RtcError>> + Send;

    fn insert_chunk(
        &self,
        table: MessageTable,
        chunk: NewChunk,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Delete one chunk row. `None` if the row did not exist.
    fn delete_chunk(
        &self,
        table: MessageTable,
        chunk_id: ChunkId,
    ) -> impl Future<Output = Result<Option<DeletedChunk>, RtcError>> + Send;

    fn set_ratio(
        &self,
        table: MessageTable,
        message_id: MessageId,
        ratio: f64,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn mark_failed(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Delete the metadata row. Returns whether a row was removed.
    fn delete_metadata(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> impl Future<Output = Result<bool, RtcError>> + Send;
}

pub trait ChannelDirectory: Send + Sync + 'static {
    /// Owning room of a channel, `None` if the channel is unknown.
    fn room_of(
        &self,
        channel_id: ChannelId,
    ) -> impl Future<Output = Result<Option<RoomId>, RtcError>> + Send;
}

/// Run a store call under the per-operation deadline.
///
/// An elapsed deadline is recorded as a `timeout` query and surfaces as
/// [`RtcError::DatabaseTimeout`]; the abandoned call is dropped.
pub async fn bounded<T>(
    deadline: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T, RtcError>>,
) -> Result<T, RtcError> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_db_query(operation, "timeout", deadline);
            Err(RtcError::DatabaseTimeout(operation))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_whitelisted() {
        assert_eq!(
            MessageTable::Direct.metadata_table(),
            "direct_message_attachment_metadata"
        );
        assert_eq!(
            MessageTable::Room.chunk_table(),
            "room_message_attachment_chunks"
        );
        assert_eq!(MessageTable::Room.message_table(), "room_messages");
    }

    #[test]
    fn test_direct_messages_are_checked_first() {
        assert_eq!(
            MessageTable::LOOKUP_ORDER,
            [MessageTable::Direct, MessageTable::Room]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_maps_elapsed_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RtcError>(())
        };
        let err = bounded(Duration::from_secs(8), "set_ratio", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::DatabaseTimeout("set_ratio")));

        let fast = async { Ok::<_, RtcError>(7) };
        assert_eq!(bounded(Duration::from_secs(8), "set_ratio", fast).await.unwrap(), 7);
    }
}
