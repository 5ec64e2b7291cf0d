//! Real-time coordination core.
//!
//! Sits between the client transport (excluded) and Postgres, and keeps
//! the live state of a chat server:
//!
//! - which users are connected and which topics they follow;
//! - 1-to-1 calls, from ringing to hang-up, and their WebRTC signalling;
//! - who is in each voice/video channel's full mesh;
//! - chunked attachment uploads stored as linked chunk rows.
//!
//! # Architecture
//!
//! ```text
//! ConnectionRegistry (shared, RwLock)
//! ├── delivers ServerEvents to per-connection outbound queues
//! └── broadcasts disconnects to
//!     ├── CallCoordinator   (actor, bounded restarts)
//!     ├── ChannelMesh       (actor)
//!     └── AttachmentEngine  (actor)
//! ```
//!
//! Each actor owns its state, consumes one mailbox, and runs under
//! [`actors::supervisor::supervise`].
//!
//! # Modules
//!
//! - [`actors`] - registry, actors, supervision and message types
//! - [`config`] - configuration from environment
//! - [`errors`] - error types with client-facing codes
//! - [`events`] - outbound event payloads
//! - [`observability`] - metrics and health endpoints
//! - [`repositories`] - persistence traits and implementations

#![warn(clippy::pedantic)]

pub mod actors;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
pub mod repositories;
