//! # RTC Test Utilities
//!
//! Shared test utilities for the RTC service.
//!
//! This crate provides:
//! - Core harness (`TestRtcCore`) wiring the registry and all actors over an
//!   in-memory store
//! - Test clients (`TestClient`) that capture outbound events
//! - Payload builders for media options, signals and chunks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let core = TestRtcCore::spawn(InMemoryStore::new());
//!     let mut alice = core.connect().await;
//!     let bob = core.connect().await;
//!
//!     core.calls.initiate(alice.user_id, bob.user_id).await.unwrap();
//!     assert_eq!(alice.event_types(), vec!["CALL_USER_ACKNOWLEDGE"]);
//! }
//! ```

pub mod client;
pub mod fixtures;
pub mod harness;

// Re-export commonly used items
pub use client::*;
pub use fixtures::*;
pub use harness::*;
pub use rtc_service::repositories::InMemoryStore;
