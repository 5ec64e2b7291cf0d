//! Payload builders.

use bytes::Bytes;
use common::types::{MessageId, UserId};
use rtc_service::actors::attachments::CHUNK_SIZE;
use rtc_service::actors::{ChunkSubmission, MessageTable};
use rtc_service::events::{MediaOptions, Signal};
use serde_json::json;

/// Camera-on media options with the given stream id.
pub fn camera(stream_id: &str) -> MediaOptions {
    MediaOptions {
        stream_id: stream_id.to_string(),
        user_media_video: true,
        display_media_video: false,
    }
}

/// Session description shaped like a browser offer or answer.
pub fn sdp(kind: &str) -> Signal {
    json!({ "type": kind, "sdp": format!("v=0 {kind}") })
}

/// One chunk of `len` bytes.
pub fn chunk_of(
    uploader: UserId,
    message_id: MessageId,
    table: MessageTable,
    len: usize,
    recipients: &[UserId],
) -> ChunkSubmission {
    ChunkSubmission {
        uploader,
        message_id,
        table,
        bytes: Bytes::from(vec![0u8; len]),
        recipients: recipients.to_vec(),
    }
}

/// A full-size, non-terminal chunk.
pub fn full_chunk(
    uploader: UserId,
    message_id: MessageId,
    table: MessageTable,
    recipients: &[UserId],
) -> ChunkSubmission {
    chunk_of(uploader, message_id, table, CHUNK_SIZE, recipients)
}

/// Declared size for `chunks` full chunks plus `tail` bytes.
pub fn declared_size(chunks: usize, tail: usize) -> i64 {
    i64::try_from(chunks * CHUNK_SIZE + tail).expect("size fits in i64")
}
