use async_trait::async_trait;

use crate::{
    error::ChatError,
    types::{CreateRoomRequest, Message, MessagePage, Room, RoomPage, SendMessageRequest},
};

/// Remote operations the engine depends on.
///
/// Implementations translate the wire envelope with
/// [`crate::types::ApiResponse::into_data`] / [`crate::types::ApiResponse::into_ack`]
/// so every backend reports `success: false` the same way.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// One page of rooms the user participates in.
    async fn list_rooms(
        &self,
        user_id: &str,
        limit: u16,
        cursor: Option<&str>,
    ) -> Result<RoomPage, ChatError>;

    async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, ChatError>;

    /// One page of messages, newest first as delivered.
    async fn list_messages(
        &self,
        room_id: &str,
        user_id: &str,
        limit: u16,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ChatError>;

    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ChatError>;

    async fn mark_read(
        &self,
        room_id: &str,
        user_id: &str,
        message_id: Option<&str>,
    ) -> Result<(), ChatError>;

    async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError>;

    async fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError>;
}
