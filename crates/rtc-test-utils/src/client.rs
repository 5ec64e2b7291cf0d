//! Test client capturing outbound events.

use std::time::Duration;

use common::types::{ConnectionId, UserId};
use rtc_service::events::ServerEvent;
use tokio::sync::mpsc;

/// Outbound queue depth for test connections.
pub const TEST_QUEUE_CAPACITY: usize = 256;

/// One registered connection and the events delivered to it.
#[derive(Debug)]
pub struct TestClient {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    rx: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    pub(crate) fn new(
        user_id: UserId,
        connection_id: ConnectionId,
        rx: mpsc::Receiver<ServerEvent>,
    ) -> Self {
        Self {
            user_id,
            connection_id,
            rx,
        }
    }

    /// Every event queued so far.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Discriminators of every event queued so far.
    pub fn event_types(&mut self) -> Vec<&'static str> {
        self.drain().iter().map(ServerEvent::event_type).collect()
    }

    /// Wait for the next event.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> ServerEvent {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbound queue closed")
    }

    /// Events of type `event_type` queued so far, in order.
    pub fn take_events_of(&mut self, event_type: &str) -> Vec<ServerEvent> {
        self.drain()
            .into_iter()
            .filter(|event| event.event_type() == event_type)
            .collect()
    }
}
