//! Push-channel contract and event decoding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{error::ChatError, types::Message};

/// Room-scoped notification delivered by the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushEvent {
    /// The stream is established.
    Connected,
    /// Keep-alive; carries nothing.
    Ping,
    /// A message was posted to the subscribed room.
    Message(Message),
}

impl PushEvent {
    /// Decode one named server-sent event.
    ///
    /// Unknown event names yield `Ok(None)`; a `message` event whose payload
    /// does not parse is a subscription error.
    pub fn from_sse(event: &str, data: &str) -> Result<Option<Self>, ChatError> {
        match event {
            "connected" => Ok(Some(Self::Connected)),
            "ping" => Ok(Some(Self::Ping)),
            "message" => serde_json::from_str::<Message>(data)
                .map(|message| Some(Self::Message(message)))
                .map_err(|err| ChatError::subscription(format!("malformed message event: {err}"))),
            _ => Ok(None),
        }
    }
}

/// One item read from a [`PushStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Event(PushEvent),
    /// The stream failed; no further frames follow.
    Error(ChatError),
}

/// Receiving half of an open push subscription.
///
/// Dropping the stream cancels its stop token, which tells the producer to
/// shut down.
#[derive(Debug)]
pub struct PushStream {
    frames: mpsc::Receiver<PushFrame>,
    stop: CancellationToken,
}

impl PushStream {
    /// Create a connected sender/stream pair. Producers should watch the
    /// returned token and exit once it is cancelled.
    pub fn channel(buffer: usize) -> (mpsc::Sender<PushFrame>, CancellationToken, Self) {
        let (tx, frames) = mpsc::channel(buffer.max(1));
        let stop = CancellationToken::new();
        (
            tx,
            stop.clone(),
            Self { frames, stop },
        )
    }

    /// Next frame in delivery order, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<PushFrame> {
        self.frames.recv().await
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn close(&self) {
        self.stop.cancel();
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Source of room-scoped push events.
#[async_trait]
pub trait PushSource: Send + Sync + 'static {
    /// Open a subscription for `room_id` on behalf of `user_id`.
    async fn open(&self, room_id: &str, user_id: &str) -> Result<PushStream, ChatError>;
}

/// What [`crate::engine::ChatEngine::ingest`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new message entered the timeline.
    Appended,
    /// The message ID was already present.
    Duplicate,
    /// Not a message, or not for the subscribed room.
    Ignored,
}
