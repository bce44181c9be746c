use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ChatError;

/// Notifications fanned out to UI collaborators after engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineEvent {
    /// The room directory changed (load, refresh, unread, membership).
    RoomsChanged,
    /// A room's timeline changed.
    TimelineChanged { room_id: String },
    /// A provisional room was replaced by its durable counterpart.
    RoomPromoted { from: String, to: String },
    /// An optimistic send was rolled back.
    SendFailed { room_id: String, error: ChatError },
    /// The live subscription for a room stopped on error.
    SubscriptionError { room_id: String, error: ChatError },
    /// A fire-and-forget read acknowledgement failed; the local count stays 0.
    ReadAckFailed { room_id: String, error: ChatError },
}

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<EngineEvent>;

/// Event fan-out owned by the engine.
#[derive(Clone, Debug)]
pub struct EngineEvents {
    event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineEvents {
    pub fn new(buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted engine events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; with no subscribers the event is dropped and
    /// lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}
