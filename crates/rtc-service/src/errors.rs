//! Error types for the real-time coordination core.
//!
//! Every request that carries a reply channel receives either its result or
//! one of these errors. `client_message()` is what the transport layer may
//! forward to a client; the `Display` text is for logs only.

use common::types::{ChunkId, MessageId, UserId};
use thiserror::Error;

/// Error type shared by the registry, actors and repositories.
#[derive(Debug, Error)]
pub enum RtcError {
    /// Database statement or connection acquisition failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Database call exceeded its bounded timeout.
    #[error("Database operation timed out: {0}")]
    DatabaseTimeout(&'static str),

    /// Message id exists in neither the direct nor the room message table.
    #[error("Message not found in either table: {0}")]
    MessageNotFound(MessageId),

    /// Attachment metadata row has no entry for the message.
    #[error("Attachment metadata not found: {0}")]
    AttachmentNotFound(MessageId),

    /// Attachment metadata is already marked failed.
    #[error("Attachment already failed: {0}")]
    AttachmentFailed(MessageId),

    /// Upload was reaped by the inactivity sweep.
    #[error("Upload timed out: {0}")]
    UploadTimedOut(MessageId),

    /// Chunk payload exceeds the fixed chunk size.
    #[error("Chunk too large: {len} bytes")]
    ChunkTooLarge { len: usize },

    /// A chunk row referenced by a forward pointer does not exist.
    #[error("Chunk chain broken at {chunk_id} (message {message_id})")]
    ChunkChainBroken {
        message_id: MessageId,
        chunk_id: ChunkId,
    },

    /// No pending or active call matched the request.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Request conflicts with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Requester has no live connection; their state was or will be
    /// cleaned up by the disconnect.
    #[error("User is not connected: {0}")]
    NotConnected(UserId),

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Actor state violated an internal invariant; the supervisor restarts it.
    #[error("Actor fault: {0}")]
    ActorFault(String),

    /// Internal error (actor mailbox closed, reply dropped).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RtcError {
    /// Returns a stable numeric code for client responses.
    ///
    /// - 2: bad request
    /// - 4: not found
    /// - 5: conflict
    /// - 6: internal
    /// - 7: requester not connected
    /// - 8: upload failed (client should re-upload)
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RtcError::BadRequest(_) | RtcError::ChunkTooLarge { .. } => 2,
            RtcError::MessageNotFound(_)
            | RtcError::AttachmentNotFound(_)
            | RtcError::CallNotFound(_) => 4,
            RtcError::Conflict(_) => 5,
            RtcError::Database(_)
            | RtcError::DatabaseTimeout(_)
            | RtcError::ChunkChainBroken { .. }
            | RtcError::ActorFault(_)
            | RtcError::Internal(_) => 6,
            RtcError::NotConnected(_) => 7,
            RtcError::AttachmentFailed(_) | RtcError::UploadTimedOut(_) => 8,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RtcError::Database(_)
            | RtcError::DatabaseTimeout(_)
            | RtcError::ChunkChainBroken { .. }
            | RtcError::ActorFault(_)
            | RtcError::Internal(_) => "An internal error occurred".to_string(),
            RtcError::MessageNotFound(_) => "Message not found".to_string(),
            RtcError::AttachmentNotFound(_) => "Attachment not found".to_string(),
            RtcError::AttachmentFailed(_) => "Attachment failed, please re-upload".to_string(),
            RtcError::UploadTimedOut(_) => "Upload timed out, please re-upload".to_string(),
            RtcError::ChunkTooLarge { .. } => "Chunk exceeds the maximum size".to_string(),
            RtcError::CallNotFound(_) => "Call not found".to_string(),
            RtcError::NotConnected(_) => "Not connected".to_string(),
            RtcError::Conflict(msg) | RtcError::BadRequest(msg) => msg.clone(),
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RtcError::Database(_) => "database",
            RtcError::DatabaseTimeout(_) => "database_timeout",
            RtcError::MessageNotFound(_) => "message_not_found",
            RtcError::AttachmentNotFound(_) => "attachment_not_found",
            RtcError::AttachmentFailed(_) => "attachment_failed",
            RtcError::UploadTimedOut(_) => "upload_timed_out",
            RtcError::ChunkTooLarge { .. } => "chunk_too_large",
            RtcError::ChunkChainBroken { .. } => "chunk_chain_broken",
            RtcError::CallNotFound(_) => "call_not_found",
            RtcError::Conflict(_) => "conflict",
            RtcError::NotConnected(_) => "not_connected",
            RtcError::BadRequest(_) => "bad_request",
            RtcError::ActorFault(_) => "actor_fault",
            RtcError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for RtcError {
    fn from(err: sqlx::Error) -> Self {
        RtcError::Database(err.to_string())
    }
}
