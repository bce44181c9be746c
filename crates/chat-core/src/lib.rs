//! Client-side chat state engine.
//!
//! This crate keeps a consistent local view of chat rooms and their message
//! histories against an eventually consistent backend: paginated loads,
//! optimistic sends, provisional direct rooms that are promoted once the
//! backend confirms them, and room-scoped push updates.

/// Remote operations the engine depends on.
pub mod backend;
/// Engine event fan-out.
pub mod channel;
/// Environment-backed engine configuration.
pub mod config;
/// Cached room list with unread bookkeeping.
pub mod directory;
/// Engine facade.
pub mod engine;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Provisional/durable identifiers and counterpart matching.
pub mod ids;
/// Push-channel contract.
pub mod live;
/// Provisional direct-room promotion state machine.
pub mod promotion;
/// Read/unread boundary for the open room.
pub mod read_marker;
/// Per-room ordered message timelines.
pub mod timeline;
/// Wire and domain types.
pub mod types;
/// Input validation.
pub mod validation;
/// Cancellable bounded polling.
pub mod wait;

#[cfg(test)]
mod mock;

pub use backend::ChatBackend;
pub use channel::{EngineEvent, EngineEvents, EventStream};
pub use config::{ConfigError, EngineConfig};
pub use directory::RoomDirectory;
pub use engine::ChatEngine;
pub use error::{ChatError, ErrorCategory, classify_http_status};
pub use ids::{MatchStrategy, ProvisionalIdGenerator, is_provisional};
pub use live::{IngestOutcome, PushEvent, PushFrame, PushSource, PushStream};
pub use promotion::{PromotionMachine, PromotionState, ProvisionalRoom, Transition};
pub use read_marker::ReadPositionTracker;
pub use timeline::{ReconcileOutcome, Timeline, TimelineStore};
pub use types::{
    ApiResponse, CreateRoomRequest, Member, MemberRole, Message, MessageKind, MessagePage, Room,
    RoomKind, RoomPage, SendMessageRequest,
};
pub use wait::{BoundedWait, WaitOutcome};
