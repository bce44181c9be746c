use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Room flavour as reported by the backend (`type` on the wire).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// One-to-one conversation.
    Direct,
    /// Named multi-member room.
    Group,
}

/// Membership role inside a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Room administrator (the creator of a direct room).
    Admin,
    /// Regular participant.
    Member,
}

/// One room member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    /// Member user ID.
    pub user_id: String,
    /// Member role.
    pub role: MemberRole,
}

impl Member {
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: MemberRole::Admin,
        }
    }

    pub fn member(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: MemberRole::Member,
        }
    }
}

/// Room metadata kept by the room directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    /// Durable backend ID, or a `temp_` ID for provisional rooms.
    pub id: String,
    /// Display name (direct rooms use the `{owner}_{counterpart}` encoding).
    #[serde(default)]
    pub name: String,
    /// Direct or group room.
    #[serde(rename = "type")]
    pub kind: RoomKind,
    /// Creator user ID.
    #[serde(default)]
    pub owner_id: String,
    /// Members, unique by user ID.
    #[serde(default)]
    pub members: Vec<Member>,
    /// Creation time in epoch seconds.
    pub created_at: i64,
    /// Last update time in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Preview text of the newest message.
    #[serde(default, rename = "last_message", skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    /// Time of the newest message in epoch seconds.
    #[serde(default, rename = "last_message_time", skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,
    /// Unread messages for the local user.
    #[serde(default)]
    pub unread_count: u32,
    /// Set for locally synthesized rooms that the backend has not created yet.
    #[serde(skip)]
    pub is_provisional: bool,
    /// Direct-chat counterpart used to match and promote a provisional room.
    #[serde(skip)]
    pub provisional_target_user_id: Option<String>,
    /// Set when contact resolution gave up waiting for the first room load.
    #[serde(skip)]
    pub connection_timed_out: bool,
}

impl Room {
    /// Timestamp used for recency ordering.
    pub fn recency(&self) -> i64 {
        self.last_message_at.unwrap_or(self.created_at)
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|member| member.user_id == user_id)
    }

    /// Collapse duplicate members, keeping the first occurrence of each user.
    pub fn dedupe_members(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.members
            .retain(|member| seen.insert(member.user_id.clone()));
    }
}

/// Message flavour (`type` on the wire).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User-authored text.
    #[default]
    Text,
    /// Backend-generated notice (joins, leaves, renames).
    System,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Durable backend ID, or a `temp_{millis}` ID while a send is in flight.
    pub id: String,
    /// Owning room ID.
    pub room_id: String,
    /// Sender user ID.
    pub sender_id: String,
    /// Message body.
    pub content: String,
    /// Text or system message.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Creation time in epoch seconds.
    pub created_at: i64,
    /// Last edit time in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Users that have read the message.
    #[serde(default)]
    pub read_by: Vec<String>,
}

/// One page of the room list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomPage {
    pub rooms: Vec<Room>,
    /// Cursor for the next page; `None` when the backend returned an empty one.
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// One page of room history, newest message first as delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Room creation request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub owner_id: String,
    pub members: Vec<Member>,
}

/// Message send request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// Response envelope shared by every backend route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: Option<bool>,
}

impl<T> ApiResponse<T> {
    /// Unwrap `data`, treating `success: false` or a missing payload as a remote failure.
    pub fn into_data(self, operation: &str) -> Result<T, ChatError> {
        if !self.success {
            return Err(rejected(operation, &self.message));
        }
        self.data.ok_or_else(|| {
            ChatError::remote(
                "missing_payload",
                format!("{operation} succeeded without a payload"),
            )
        })
    }

    /// Check `success` for routes that carry no payload.
    pub fn into_ack(self, operation: &str) -> Result<(), ChatError> {
        if self.success {
            Ok(())
        } else {
            Err(rejected(operation, &self.message))
        }
    }
}

impl ApiResponse<Vec<Room>> {
    pub fn into_room_page(self) -> Result<RoomPage, ChatError> {
        let cursor = non_empty(self.cursor.clone());
        let has_more = self.has_more.unwrap_or(false);
        let rooms = self.into_data("list_rooms")?;
        Ok(RoomPage {
            rooms,
            cursor,
            has_more,
        })
    }
}

impl ApiResponse<Vec<Message>> {
    pub fn into_message_page(self) -> Result<MessagePage, ChatError> {
        let next_cursor = non_empty(self.next_cursor.clone());
        let has_more = self.has_more.unwrap_or(false);
        let messages = self.into_data("list_messages")?;
        Ok(MessagePage {
            messages,
            next_cursor,
            has_more,
        })
    }
}

fn rejected(operation: &str, message: &str) -> ChatError {
    let detail = if message.trim().is_empty() {
        "backend reported failure"
    } else {
        message
    };
    ChatError::remote("remote_rejected", format!("{operation}: {detail}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn parses_room_list_envelope() {
        let raw = r#"{
            "success": true,
            "message": "ok",
            "data": [{
                "id": "65f0c0ffee0000000000aaaa",
                "name": "user_alice_user_bob",
                "type": "direct",
                "owner_id": "user_alice",
                "members": [
                    {"user_id": "user_alice", "role": "admin"},
                    {"user_id": "user_bob", "role": "member"}
                ],
                "created_at": 1700000000,
                "last_message": "hi",
                "last_message_time": 1700000100,
                "unread_count": 2
            }],
            "cursor": "",
            "has_more": false
        }"#;

        let envelope: ApiResponse<Vec<Room>> =
            serde_json::from_str(raw).expect("envelope should parse");
        let page = envelope.into_room_page().expect("page should unwrap");

        assert_eq!(page.cursor, None);
        assert!(!page.has_more);
        let room = &page.rooms[0];
        assert_eq!(room.kind, RoomKind::Direct);
        assert_eq!(room.last_message_preview.as_deref(), Some("hi"));
        assert_eq!(room.recency(), 1_700_000_100);
        assert_eq!(room.unread_count, 2);
        assert!(!room.is_provisional);
    }

    #[test]
    fn missing_unread_count_defaults_to_zero() {
        let raw = r#"{"id":"r","type":"group","created_at":5}"#;
        let room: Room = serde_json::from_str(raw).expect("room should parse");
        assert_eq!(room.unread_count, 0);
        assert_eq!(room.recency(), 5);
    }

    #[test]
    fn unsuccessful_envelope_is_remote_failure() {
        let envelope: ApiResponse<Message> = ApiResponse {
            success: false,
            message: "room is archived".into(),
            data: None,
            cursor: None,
            next_cursor: None,
            has_more: None,
        };

        let err = envelope
            .into_data("send_message")
            .expect_err("failure envelope must not unwrap");
        assert_eq!(err.category, ErrorCategory::Remote);
        assert_eq!(err.code, "remote_rejected");
        assert!(err.message.contains("room is archived"));
    }

    #[test]
    fn dedupes_members_keeping_first_role() {
        let mut room = Room {
            id: "r".into(),
            name: String::new(),
            kind: RoomKind::Group,
            owner_id: "a".into(),
            members: vec![Member::admin("a"), Member::member("b"), Member::member("a")],
            created_at: 0,
            updated_at: None,
            last_message_preview: None,
            last_message_at: None,
            unread_count: 0,
            is_provisional: false,
            provisional_target_user_id: None,
            connection_timed_out: false,
        };

        room.dedupe_members();
        assert_eq!(room.members, vec![Member::admin("a"), Member::member("b")]);
    }
}
