//! Registry, actors and supervision.
//!
//! - [`registry`] - `ConnectionRegistry`, shared connection and topic state
//! - [`calls`] - `CallCoordinator`, 1-to-1 call state machine
//! - [`channel_mesh`] - `ChannelMesh`, voice/video channel presence
//! - [`attachments`] - `AttachmentEngine`, chunked uploads
//! - [`supervisor`] - restart policy and supervision loop
//! - [`messages`] - mailbox message types

pub mod attachments;
pub mod calls;
pub mod channel_mesh;
pub mod messages;
pub mod registry;
pub mod supervisor;

pub use attachments::{AttachmentEngine, AttachmentEngineHandle, UploadSettings};
pub use calls::{CallCoordinator, CallCoordinatorHandle, CallSettings};
pub use channel_mesh::{ChannelMesh, ChannelMeshHandle};
pub use messages::*;
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use supervisor::{supervise, RestartPolicy, Supervised, SupervisorExit};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use common::types::{ConnectionId, UserId};
    use tokio::sync::mpsc;

    use super::registry::{ConnectionHandle, ConnectionRegistry};
    use crate::events::ServerEvent;

    /// Register a fresh user with a roomy outbound queue.
    pub(crate) async fn connect(
        registry: &Arc<ConnectionRegistry>,
    ) -> (UserId, ConnectionId, mpsc::Receiver<ServerEvent>) {
        let user_id = UserId::new();
        let (handle, rx) = ConnectionHandle::new(64);
        let connection_id = handle.id();
        registry.register(user_id, handle).await;
        (user_id, connection_id, rx)
    }

    /// Everything queued so far.
    pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
