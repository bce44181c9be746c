//! Input checks enforced before any network call.

use crate::error::ChatError;

pub const MAX_MESSAGE_CHARS: usize = 10_000;
pub const MAX_ROOM_NAME_CHARS: usize = 100;
pub const MAX_USER_ID_CHARS: usize = 100;
pub const DURABLE_ROOM_ID_LEN: usize = 24;

pub fn validate_message_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::validation("empty_content", "message cannot be empty"));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::validation(
            "content_too_long",
            format!("message exceeds {MAX_MESSAGE_CHARS} characters"),
        ));
    }
    if content.contains('\0') {
        return Err(ChatError::validation(
            "invalid_character",
            "message contains a NUL character",
        ));
    }
    Ok(())
}

pub fn validate_room_name(name: &str) -> Result<(), ChatError> {
    if name.trim().is_empty() {
        return Err(ChatError::validation("empty_room_name", "room name cannot be empty"));
    }
    if name.chars().count() > MAX_ROOM_NAME_CHARS {
        return Err(ChatError::validation(
            "room_name_too_long",
            format!("room name exceeds {MAX_ROOM_NAME_CHARS} characters"),
        ));
    }
    if name.contains('\0') {
        return Err(ChatError::validation(
            "invalid_character",
            "room name contains a NUL character",
        ));
    }
    Ok(())
}

pub fn validate_user_id(user_id: &str) -> Result<(), ChatError> {
    if user_id.trim().is_empty() {
        return Err(ChatError::validation("invalid_user_id", "user id cannot be empty"));
    }
    if user_id.chars().count() > MAX_USER_ID_CHARS {
        return Err(ChatError::validation(
            "invalid_user_id",
            format!("user id exceeds {MAX_USER_ID_CHARS} characters"),
        ));
    }
    if user_id
        .chars()
        .any(|ch| matches!(ch, '\0' | '$' | '{' | '}' | '[' | ']'))
    {
        return Err(ChatError::validation(
            "invalid_user_id",
            format!("user id contains a reserved character: {user_id:?}"),
        ));
    }
    Ok(())
}

/// Durable room IDs are 24 hexadecimal characters.
pub fn validate_room_id(room_id: &str) -> Result<(), ChatError> {
    if room_id.len() == DURABLE_ROOM_ID_LEN && room_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ChatError::validation(
            "invalid_room_id",
            format!("malformed room id: {room_id:?}"),
        ))
    }
}
