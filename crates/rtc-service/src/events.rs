//! Outbound notifications delivered to clients through the registry.
//!
//! Every event serializes as `{"event_type": "<DISCRIMINATOR>", "data": {...}}`.
//! The discriminator strings are part of the client contract; renaming a
//! variant changes the wire format.

use common::types::{ChannelId, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Opaque WebRTC signal (SDP offer/answer or ICE data), relayed verbatim.
pub type Signal = serde_json::Value;

/// Media announce metadata a participant publishes alongside signals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOptions {
    /// Stream id of the user-media (camera/mic) stream.
    #[serde(rename = "um_stream_id")]
    pub stream_id: String,
    /// User-media video enabled.
    #[serde(rename = "um_vid")]
    pub user_media_video: bool,
    /// Display-media (screen share) video enabled.
    #[serde(rename = "dm_vid")]
    pub display_media_video: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    /// Presence change published on `user:<uid>`.
    Change(PresenceChange),
    CallUserAcknowledge(CallPair),
    CallUserResponse(CallResponse),
    CallLeft(Empty),
    CallWebrtcOfferFromInitiator(RelayedSignal),
    CallWebrtcAnswerFromRecipient(RelayedSignal),
    CallWebrtcRequestedReinitialization(Empty),
    UpdateMediaOptionsOut(MediaUpdate),
    ChannelWebrtcAllUsers(ChannelUsers),
    ChannelWebrtcJoined(ChannelSignal),
    ChannelWebrtcReturnSignalOut(ChannelReturnSignal),
    ChannelWebrtcLeft(PeerLeft),
    RoomChannelWebrtcUserJoined(RoomChannelPresence),
    RoomChannelWebrtcUserLeft(RoomChannelPresence),
    AttachmentProgress(AttachmentProgress),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub uid: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPair {
    pub caller: UserId,
    pub called: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub caller: UserId,
    pub called: UserId,
    pub accept: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedSignal {
    pub signal: Signal,
    #[serde(flatten)]
    pub media: MediaOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUpdate {
    pub uid: UserId,
    #[serde(flatten)]
    pub media: MediaOptions,
}

/// One existing mesh member, as listed to a joiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPeer {
    pub uid: UserId,
    #[serde(flatten)]
    pub media: MediaOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUsers {
    pub users: Vec<ChannelPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSignal {
    pub caller_id: UserId,
    pub signal: Signal,
    #[serde(flatten)]
    pub media: MediaOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReturnSignal {
    pub uid: UserId,
    pub signal: Signal,
    #[serde(flatten)]
    pub media: MediaOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeft {
    pub uid: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomChannelPresence {
    pub channel_id: ChannelId,
    /// `None` when the owning room could not be resolved.
    pub room_id: Option<RoomId>,
    pub uid: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentProgress {
    pub msg_id: MessageId,
    pub ratio: f64,
    pub failed: bool,
}

impl ServerEvent {
    /// Wire discriminator, also used as a bounded metrics label.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Change(_) => "CHANGE",
            ServerEvent::CallUserAcknowledge(_) => "CALL_USER_ACKNOWLEDGE",
            ServerEvent::CallUserResponse(_) => "CALL_USER_RESPONSE",
            ServerEvent::CallLeft(_) => "CALL_LEFT",
            ServerEvent::CallWebrtcOfferFromInitiator(_) => "CALL_WEBRTC_OFFER_FROM_INITIATOR",
            ServerEvent::CallWebrtcAnswerFromRecipient(_) => "CALL_WEBRTC_ANSWER_FROM_RECIPIENT",
            ServerEvent::CallWebrtcRequestedReinitialization(_) => {
                "CALL_WEBRTC_REQUESTED_REINITIALIZATION"
            }
            ServerEvent::UpdateMediaOptionsOut(_) => "UPDATE_MEDIA_OPTIONS_OUT",
            ServerEvent::ChannelWebrtcAllUsers(_) => "CHANNEL_WEBRTC_ALL_USERS",
            ServerEvent::ChannelWebrtcJoined(_) => "CHANNEL_WEBRTC_JOINED",
            ServerEvent::ChannelWebrtcReturnSignalOut(_) => "CHANNEL_WEBRTC_RETURN_SIGNAL_OUT",
            ServerEvent::ChannelWebrtcLeft(_) => "CHANNEL_WEBRTC_LEFT",
            ServerEvent::RoomChannelWebrtcUserJoined(_) => "ROOM_CHANNEL_WEBRTC_USER_JOINED",
            ServerEvent::RoomChannelWebrtcUserLeft(_) => "ROOM_CHANNEL_WEBRTC_USER_LEFT",
            ServerEvent::AttachmentProgress(_) => "ATTACHMENT_PROGRESS",
        }
    }

    /// Encode for the client transport.
    ///
    /// # Errors
    ///
    /// Returns an error only if a relayed signal contains a value that cannot
    /// be represented as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub(crate) fn call_response(caller: UserId, called: UserId, accept: bool) -> Self {
        ServerEvent::CallUserResponse(CallResponse {
            caller,
            called,
            accept,
        })
    }

    pub(crate) fn call_left() -> Self {
        ServerEvent::CallLeft(Empty {})
    }
}
