//! Types and helpers shared across the real-time coordination crates.

#![warn(clippy::pedantic)]

/// Identifier newtypes
pub mod types;

/// Secret types that prevent accidental logging
pub mod secret;
