//! Rust SDK for a realtime price feed service.
//!
//! The crate is organized by transport surface:
//! - `feed_api`: HTTP client for one-shot price feed snapshot queries.
//! - `stream`: resilient websocket subscription session and protocol types.
//! - `feed`: feed identifiers and price feed payload parsing.
//! - `retry`: shared retry and timeout utilities.

/// Feed identifiers and price feed payloads.
pub mod feed;
/// Snapshot API client and request/response types.
pub mod feed_api;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime stream session, transport, and protocol types.
pub mod stream;
