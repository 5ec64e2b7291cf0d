//! Identifier types shared by the registry, the actors and persistence.
//!
//! Every id is a UUID newtype. They serialize as the bare UUID string so they
//! can be embedded directly in outbound event payloads and bound directly as
//! sqlx arguments via `.0`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Authenticated user.
    UserId
);

define_id!(
    /// One live transport connection. A user has at most one current connection.
    ConnectionId
);

define_id!(
    /// Voice/video channel inside a room.
    ChannelId
);

define_id!(
    /// Room owning one or more channels.
    RoomId
);

define_id!(
    /// Direct or room message that may own an attachment.
    MessageId
);

define_id!(
    /// Stored attachment chunk row.
    ChunkId
);

impl From<MessageId> for ChunkId {
    /// The head chunk of an attachment shares its message's id.
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_bare_uuid() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_string(&UserId(uuid)).unwrap_or_default();
        assert_eq!(json, format!("\"{uuid}\""));
    }

    #[test]
    fn test_display_and_parse_agree() {
        let id = ChannelId::new();
        let parsed: ChannelId = id.to_string().parse().unwrap_or_default();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_head_chunk_id_matches_message_id() {
        let msg = MessageId::new();
        assert_eq!(ChunkId::from(msg).0, msg.0);
    }
}
