//! Realtime stream modules.
//!
//! - `client`: one-socket client exposing send and listener registration.
//! - `listeners`: passthrough and decoding listener registry.
//! - `proto`: `{action, data}` messages shared with the stream service.
//! - `transport`: socket capability and the `tokio-tungstenite` connector.

/// Websocket client and error type.
pub mod client;
/// Listener registry and event dispatch.
pub mod listeners;
/// Stream protocol messages.
pub mod proto;
/// Socket capability and websocket transport.
pub mod transport;
