//! Rust client for the antalla market-data websocket stream.
//!
//! The crate is organized by concern:
//! - `config`: environment-keyed endpoint resolution.
//! - `stream`: websocket client, listener dispatch, and wire messages.

/// Environment-keyed stream endpoint configuration.
pub mod config;
/// Realtime stream client, listener registry, and protocol types.
pub mod stream;

pub use config::{process_config, Environment, StreamConfig};
pub use stream::client::{StreamClient, StreamClientError};
