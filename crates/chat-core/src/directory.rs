use tracing::debug;

use crate::{
    error::ChatError,
    types::{Member, Message, Room, RoomPage},
};

const PREVIEW_MAX_CHARS: usize = 120;

/// Cached room list for one user with cursor pagination state.
#[derive(Debug, Clone, Default)]
pub struct RoomDirectory {
    owner: Option<String>,
    rooms: Vec<Room>,
    cursor: Option<String>,
    has_more: bool,
    loaded: bool,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once the first fetch for the current user has been applied.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Rooms in insertion order.
    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|room| room.id == room_id)
    }

    /// Cursor to request for the next fetch.
    ///
    /// A different user, or `more == false`, starts over from the first page.
    pub fn next_cursor(&self, user_id: &str, more: bool) -> Option<String> {
        if more && self.owner.as_deref() == Some(user_id) {
            self.cursor.clone()
        } else {
            None
        }
    }

    /// Apply one fetched page.
    ///
    /// A first page is merged with [`RoomDirectory::merge_refresh`]; further
    /// pages are upserted behind the rooms already known.
    pub fn apply_page(&mut self, user_id: &str, page: RoomPage, more: bool) {
        if self.owner.as_deref() != Some(user_id) {
            debug!(user_id, "room directory reset for new user");
            self.clear();
            self.owner = Some(user_id.to_owned());
        }

        if more {
            for room in page.rooms {
                self.upsert(room);
            }
        } else {
            self.merge_refresh(page.rooms);
        }
        self.cursor = page.cursor;
        self.has_more = page.has_more;
        self.loaded = true;
    }

    /// Reconcile a full re-fetch against local state.
    ///
    /// The fresh payload wins field by field, except that a room already read
    /// locally (`unread_count == 0`) stays read: the server value may predate
    /// the read acknowledgement still in flight.
    pub fn merge_refresh(&mut self, fresh: Vec<Room>) {
        let merged: Vec<Room> = fresh
            .into_iter()
            .map(|mut room| {
                room.dedupe_members();
                if room.unread_count > 0
                    && self
                        .get(&room.id)
                        .is_some_and(|local| local.unread_count == 0)
                {
                    debug!(room_id = %room.id, stale = room.unread_count, "keeping locally cleared unread count");
                    room.unread_count = 0;
                }
                room
            })
            .collect();
        self.rooms = merged;
        self.loaded = true;
    }

    /// Insert a room or overwrite the existing one with the same ID.
    pub fn upsert(&mut self, mut room: Room) {
        room.dedupe_members();
        match self.rooms.iter_mut().find(|existing| existing.id == room.id) {
            Some(existing) => *existing = room,
            None => self.rooms.push(room),
        }
    }

    pub fn remove(&mut self, room_id: &str) -> Option<Room> {
        let index = self.rooms.iter().position(|room| room.id == room_id)?;
        Some(self.rooms.remove(index))
    }

    /// Zero the local unread badge. The backend acknowledgement is the caller's job.
    pub fn mark_read(&mut self, room_id: &str) -> Result<(), ChatError> {
        let room = self
            .rooms
            .iter_mut()
            .find(|room| room.id == room_id)
            .ok_or_else(|| ChatError::room_not_found(room_id))?;
        room.unread_count = 0;
        Ok(())
    }

    /// Fold a new message into the room's preview fields.
    ///
    /// Returns `false` when the room is not in the directory.
    pub fn record_message(&mut self, message: &Message, bump_unread: bool) -> bool {
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == message.room_id) else {
            return false;
        };
        if room
            .last_message_at
            .is_none_or(|current| current <= message.created_at)
        {
            room.last_message_preview = Some(preview(&message.content));
            room.last_message_at = Some(message.created_at);
            room.updated_at = Some(message.created_at);
        }
        if bump_unread {
            room.unread_count = room.unread_count.saturating_add(1);
        }
        true
    }

    pub fn set_members(&mut self, room_id: &str, members: Vec<Member>) -> Result<(), ChatError> {
        let room = self
            .rooms
            .iter_mut()
            .find(|room| room.id == room_id)
            .ok_or_else(|| ChatError::room_not_found(room_id))?;
        room.members = members;
        room.dedupe_members();
        Ok(())
    }

    /// Rooms by recency (`last_message_at` or `created_at`), newest first.
    ///
    /// The sort is stable: equal timestamps keep their insertion order.
    pub fn sorted(&self) -> Vec<Room> {
        let mut rooms = self.rooms.clone();
        rooms.sort_by_key(|room| std::cmp::Reverse(room.recency()));
        rooms
    }

    pub fn total_unread(&self) -> u64 {
        self.rooms.iter().map(|room| u64::from(room.unread_count)).sum()
    }

    pub fn unread_room_count(&self) -> usize {
        self.rooms.iter().filter(|room| room.unread_count > 0).count()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_MAX_CHARS).collect()
}
