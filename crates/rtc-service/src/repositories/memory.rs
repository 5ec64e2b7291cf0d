//! In-memory store.
//!
//! Implements [`AttachmentStore`] and [`ChannelDirectory`] without a
//! database. Used by unit and integration tests and for local runs without
//! Postgres. Supports failure injection per operation, an artificial
//! latency for timeout tests, and records every mutating call in order.
//!
//! ```rust,ignore
//! let store = InMemoryStore::new()
//!     .with_message(MessageTable::Direct, message_id, 9 * 1024 * 1024)
//!     .with_channel(channel_id, room_id);
//!
//! store.fail_operation("insert_chunk");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use common::types::{ChannelId, ChunkId, MessageId, RoomId};

use super::{AttachmentMetadata, AttachmentStore, ChannelDirectory, DeletedChunk, NewChunk};
use crate::actors::messages::MessageTable;
use crate::errors::RtcError;

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    InsertChunk {
        id: ChunkId,
        next: Option<ChunkId>,
    },
    DeleteChunk(ChunkId),
    SetRatio {
        message_id: MessageId,
        ratio: f64,
    },
    MarkFailed(MessageId),
    DeleteMetadata(MessageId),
}

/// Metadata row as stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredMetadata {
    pub size: i64,
    pub failed: bool,
    pub ratio: f64,
}

/// Chunk row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub message_id: MessageId,
    pub bytes: Bytes,
    pub next: Option<ChunkId>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: HashSet<(MessageTable, MessageId)>,
    metadata: HashMap<(MessageTable, MessageId), StoredMetadata>,
    chunks: HashMap<(MessageTable, ChunkId), StoredChunk>,
    channels: HashMap<ChannelId, RoomId>,
    failing: HashSet<&'static str>,
    latency: Option<Duration>,
    log: Vec<StoreOp>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with an attachment metadata row of `size` bytes.
    #[must_use]
    pub fn with_message(self, table: MessageTable, message_id: MessageId, size: i64) -> Self {
        self.insert_message(table, message_id, size);
        self
    }

    /// Register a channel as belonging to `room_id`.
    #[must_use]
    pub fn with_channel(self, channel_id: ChannelId, room_id: RoomId) -> Self {
        self.lock().channels.insert(channel_id, room_id);
        self
    }

    pub fn insert_message(&self, table: MessageTable, message_id: MessageId, size: i64) {
        let mut inner = self.lock();
        inner.messages.insert((table, message_id));
        inner.metadata.insert(
            (table, message_id),
            StoredMetadata {
                size,
                failed: false,
                ratio: 0.0,
            },
        );
    }

    /// Write a chunk row directly, bypassing the operation log.
    pub fn insert_raw_chunk(&self, table: MessageTable, chunk: NewChunk) {
        self.lock().chunks.insert(
            (table, chunk.id),
            StoredChunk {
                message_id: chunk.message_id,
                bytes: chunk.bytes,
                next: chunk.next,
            },
        );
    }

    /// Make every call of `operation` fail with a database error.
    pub fn fail_operation(&self, operation: &'static str) {
        self.lock().failing.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    #[must_use]
    pub fn metadata(&self, table: MessageTable, message_id: MessageId) -> Option<StoredMetadata> {
        self.lock().metadata.get(&(table, message_id)).copied()
    }

    #[must_use]
    pub fn chunk(&self, table: MessageTable, chunk_id: ChunkId) -> Option<StoredChunk> {
        self.lock().chunks.get(&(table, chunk_id)).cloned()
    }

    /// Number of chunk rows belonging to `message_id`.
    #[must_use]
    pub fn chunk_count(&self, message_id: MessageId) -> usize {
        self.lock()
            .chunks
            .values()
            .filter(|chunk| chunk.message_id == message_id)
            .count()
    }

    /// Mutations in the order they were applied.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.lock().log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply latency and injected failures, then lock.
    async fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner>, RtcError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let inner = self.lock();
        if inner.failing.contains(operation) {
            return Err(RtcError::Database(format!("injected failure in {operation}")));
        }
        Ok(inner)
    }
}

impl AttachmentStore for InMemoryStore {
    async fn message_exists(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> Result<bool, RtcError> {
        let inner = self.enter("message_exists").await?;
        Ok(inner.messages.contains(&(table, message_id)))
    }

    async fn attachment_metadata(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> Result<Option<AttachmentMetadata>, RtcError> {
        let inner = self.enter("attachment_metadata").await?;
        Ok(inner
            .metadata
            .get(&(table, message_id))
            .map(|row| AttachmentMetadata {
                size: row.size,
                failed: row.failed,
                complete: row.ratio >= 1.0,
            }))
    }

    async fn insert_chunk(&self, table: MessageTable, chunk: NewChunk) -> Result<(), RtcError> {
        let mut inner = self.enter("insert_chunk").await?;
        if inner.chunks.contains_key(&(table, chunk.id)) {
            return Err(RtcError::Database(format!(
                "duplicate chunk id {}",
                chunk.id
            )));
        }
        inner.log.push(StoreOp::InsertChunk {
            id: chunk.id,
            next: chunk.next,
        });
        inner.chunks.insert(
            (table, chunk.id),
            StoredChunk {
                message_id: chunk.message_id,
                bytes: chunk.bytes,
                next: chunk.next,
            },
        );
        Ok(())
    }

    async fn delete_chunk(
        &self,
        table: MessageTable,
        chunk_id: ChunkId,
    ) -> Result<Option<DeletedChunk>, RtcError> {
        let mut inner = self.enter("delete_chunk").await?;
        let Some(removed) = inner.chunks.remove(&(table, chunk_id)) else {
            return Ok(None);
        };
        inner.log.push(StoreOp::DeleteChunk(chunk_id));
        Ok(Some(DeletedChunk { next: removed.next }))
    }

    async fn set_ratio(
        &self,
        table: MessageTable,
        message_id: MessageId,
        ratio: f64,
    ) -> Result<(), RtcError> {
        let mut inner = self.enter("set_ratio").await?;
        if let Some(row) = inner.metadata.get_mut(&(table, message_id)) {
            row.ratio = ratio;
        }
        inner.log.push(StoreOp::SetRatio { message_id, ratio });
        Ok(())
    }

    async fn mark_failed(&self, table: MessageTable, message_id: MessageId) -> Result<(), RtcError> {
        let mut inner = self.enter("mark_failed").await?;
        if let Some(row) = inner.metadata.get_mut(&(table, message_id)) {
            row.failed = true;
        }
        inner.log.push(StoreOp::MarkFailed(message_id));
        Ok(())
    }

    async fn delete_metadata(
        &self,
        table: MessageTable,
        message_id: MessageId,
    ) -> Result<bool, RtcError> {
        let mut inner = self.enter("delete_metadata").await?;
        let removed = inner.metadata.remove(&(table, message_id)).is_some();
        if removed {
            inner.log.push(StoreOp::DeleteMetadata(message_id));
        }
        Ok(removed)
    }
}

impl ChannelDirectory for InMemoryStore {
    async fn room_of(&self, channel_id: ChannelId) -> Result<Option<RoomId>, RtcError> {
        let inner = self.enter("room_of").await?;
        Ok(inner.channels.get(&channel_id).copied())
    }
}
