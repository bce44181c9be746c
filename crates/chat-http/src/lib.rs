//! HTTP transport for `chat-core`.
//!
//! [`HttpBackend`] speaks the JSON envelope API and [`SsePushSource`] follows
//! the per-room Server-Sent Events stream.

/// Environment-backed transport configuration.
pub mod config;
/// REST client implementing `ChatBackend`.
pub mod client;
/// Server-Sent Events framing and the push source built on it.
pub mod sse;

pub use client::HttpBackend;
pub use config::HttpBackendConfig;
pub use sse::{SseFrame, SseParser, SsePushSource};
