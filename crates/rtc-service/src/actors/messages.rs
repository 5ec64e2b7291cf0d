//! Message types for actor communication.
//!
//! Each actor consumes one `mpsc` mailbox of its own message enum.
//! Requests that expect a reply carry a `oneshot` sender; relays are
//! fire-and-forget.

use std::collections::HashSet;

use bytes::Bytes;
use common::types::{ChannelId, MessageId, UserId};
use tokio::sync::oneshot;

use crate::errors::RtcError;
use crate::events::{ChannelPeer, MediaOptions, Signal};

/// Messages sent to the call coordinator.
#[derive(Debug)]
pub enum CallMessage {
    /// `caller` invites `called`, replacing any other pending call of `caller`.
    Initiate {
        caller: UserId,
        called: UserId,
        respond_to: oneshot::Sender<Result<(), RtcError>>,
    },

    /// `called` accepts or rejects the pending call from `caller`.
    Respond {
        caller: UserId,
        called: UserId,
        accept: bool,
        respond_to: oneshot::Sender<Result<(), RtcError>>,
    },

    /// Either participant ends their active call.
    Leave {
        user_id: UserId,
        respond_to: oneshot::Sender<Result<(), RtcError>>,
    },

    /// Caller's WebRTC offer, relayed to the called party.
    Offer {
        caller: UserId,
        signal: Signal,
        media: MediaOptions,
    },

    /// Called party's WebRTC answer, relayed back to the caller.
    Answer {
        called: UserId,
        signal: Signal,
        media: MediaOptions,
    },

    /// Called party asks the caller to restart the handshake.
    RequestReinitialization { called: UserId },

    /// Either participant changed stream id or video flags.
    UpdateMediaOptions { user_id: UserId, media: MediaOptions },

    /// Snapshot of pending and active calls.
    GetState {
        respond_to: oneshot::Sender<CallState>,
    },
}

/// Point-in-time view of the call coordinator, pairs are `(caller, called)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallState {
    pub pending: Vec<(UserId, UserId)>,
    pub active: Vec<(UserId, UserId)>,
}

/// Messages sent to the channel mesh actor.
#[derive(Debug)]
pub enum ChannelMeshMessage {
    /// Join a channel's mesh. Replies with the existing peers.
    Join {
        channel_id: ChannelId,
        user_id: UserId,
        media: MediaOptions,
        respond_to: oneshot::Sender<Result<Vec<ChannelPeer>, RtcError>>,
    },

    /// Leave a channel's mesh. Replies `true` if the user was a member.
    Leave {
        channel_id: ChannelId,
        user_id: UserId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Joiner's offer to one existing member.
    Signal {
        from: UserId,
        to: UserId,
        signal: Signal,
        media: MediaOptions,
    },

    /// Member's answer back to the joiner.
    ReturnSignal {
        from: UserId,
        to: UserId,
        signal: Signal,
        media: MediaOptions,
    },

    /// Current member set (empty for unknown channels).
    GetMembers {
        channel_id: ChannelId,
        respond_to: oneshot::Sender<HashSet<UserId>>,
    },

    /// Member changed stream id or video flags.
    UpdateMediaOptions {
        channel_id: ChannelId,
        user_id: UserId,
        media: MediaOptions,
    },
}

/// Which message table family owns an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTable {
    Direct,
    Room,
}

/// One uploaded chunk.
#[derive(Debug)]
pub struct ChunkSubmission {
    pub uploader: UserId,
    pub message_id: MessageId,
    pub table: MessageTable,
    pub bytes: Bytes,
    /// Users notified of progress.
    pub recipients: Vec<UserId>,
}

/// Outcome of an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkAck {
    /// More chunks expected; `ratio` was persisted and broadcast.
    Progress { ratio: f64 },
    /// Terminal chunk written; upload complete.
    Complete,
}

/// Messages sent to the attachment upload engine.
#[derive(Debug)]
pub enum AttachmentMessage {
    SubmitChunk {
        chunk: ChunkSubmission,
        respond_to: oneshot::Sender<Result<ChunkAck, RtcError>>,
    },

    /// Remove an attachment: metadata row first, then the chunk chain.
    Delete {
        uploader: UserId,
        message_id: MessageId,
        respond_to: oneshot::Sender<Result<(), RtcError>>,
    },

    /// Message ids the uploader currently has in flight.
    InFlight {
        uploader: UserId,
        respond_to: oneshot::Sender<Vec<MessageId>>,
    },
}
