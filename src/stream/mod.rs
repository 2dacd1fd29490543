//! Realtime stream modules.
//!
//! - `socket`: reconnecting websocket transport, topic-agnostic.
//! - `proto`: protocol messages shared with the stream service.
//! - `session`: feed registry, reconnect resync, and update fan-out.

/// Stream protocol messages.
pub mod proto;
/// Subscription session built on the socket transport.
pub mod session;
/// Reconnecting websocket transport.
pub mod socket;
