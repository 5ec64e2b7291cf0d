//! Core test harness.
//!
//! Provides `TestRtcCore`: a registry plus supervised call coordinator,
//! channel mesh and attachment engine, all sharing one `InMemoryStore`.

use std::sync::Arc;

use common::types::{ChannelId, UserId};
use rtc_service::actors::{
    AttachmentEngineHandle, CallCoordinatorHandle, CallSettings, ChannelMeshHandle,
    ConnectionHandle, ConnectionRegistry, RestartPolicy, SupervisorExit, UploadSettings,
};
use rtc_service::repositories::InMemoryStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{TestClient, TEST_QUEUE_CAPACITY};

/// Registry and actors wired the way the binary wires them, over an
/// in-memory store.
///
/// # Example
/// ```rust,ignore
/// let core = TestRtcCore::spawn(InMemoryStore::new());
/// let mut alice = core.connect().await;
/// core.disconnect(&alice).await;
/// core.settle().await;
/// ```
pub struct TestRtcCore {
    pub registry: Arc<ConnectionRegistry>,
    pub calls: CallCoordinatorHandle,
    pub channels: ChannelMeshHandle,
    pub attachments: AttachmentEngineHandle,
    pub store: InMemoryStore,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<SupervisorExit>>,
}

impl TestRtcCore {
    /// Spawn with default settings.
    pub fn spawn(store: InMemoryStore) -> Self {
        Self::spawn_with(store, CallSettings::default(), UploadSettings::default())
    }

    pub fn spawn_with(
        store: InMemoryStore,
        call_settings: CallSettings,
        upload_settings: UploadSettings,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let registry = ConnectionRegistry::new();

        let (calls, calls_task) = CallCoordinatorHandle::spawn(
            Arc::clone(&registry),
            call_settings,
            RestartPolicy::Bounded(10),
            cancel_token.child_token(),
        );
        let (channels, channels_task) = ChannelMeshHandle::spawn(
            Arc::clone(&registry),
            store.clone(),
            upload_settings.db_timeout,
            RestartPolicy::Unbounded,
            cancel_token.child_token(),
        );
        let (attachments, attachments_task) = AttachmentEngineHandle::spawn(
            Arc::clone(&registry),
            store.clone(),
            upload_settings,
            RestartPolicy::Unbounded,
            cancel_token.child_token(),
        );

        Self {
            registry,
            calls,
            channels,
            attachments,
            store,
            cancel_token,
            tasks: vec![calls_task, channels_task, attachments_task],
        }
    }

    /// Register a new user.
    pub async fn connect(&self) -> TestClient {
        self.connect_as(UserId::new()).await
    }

    /// Register a connection for an existing user id.
    pub async fn connect_as(&self, user_id: UserId) -> TestClient {
        let (handle, rx) = ConnectionHandle::new(TEST_QUEUE_CAPACITY);
        let connection_id = handle.id();
        self.registry.register(user_id, handle).await;
        TestClient::new(user_id, connection_id, rx)
    }

    /// Unregister the client's connection, broadcasting the disconnect.
    pub async fn disconnect(&self, client: &TestClient) {
        self.registry.unregister(client.connection_id).await;
    }

    /// Round-trip a request through every actor so earlier broadcasts and
    /// relays have been handled.
    ///
    /// # Panics
    ///
    /// Panics if an actor is no longer running.
    pub async fn settle(&self) {
        self.calls.get_state().await.expect("call coordinator running");
        self.channels
            .members(ChannelId::new())
            .await
            .expect("channel mesh running");
        self.attachments
            .in_flight(UserId::new())
            .await
            .expect("attachment engine running");
    }

    /// Cancel every actor and collect how their supervisors exited.
    ///
    /// # Panics
    ///
    /// Panics if a supervisor task panicked.
    pub async fn shutdown(self) -> Vec<SupervisorExit> {
        self.cancel_token.cancel();
        let mut exits = Vec::new();
        for task in self.tasks {
            exits.push(task.await.expect("supervisor task"));
        }
        exits
    }
}
