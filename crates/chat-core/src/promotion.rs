use serde::{Deserialize, Serialize};

use crate::{
    error::ChatError,
    ids::{counterpart_of, direct_room_name},
    types::{CreateRoomRequest, Member, Room, RoomKind},
};

/// Lifecycle of a locally synthesized direct room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PromotionState {
    /// Placeholder only; nothing has been sent to the backend.
    Provisional,
    /// A room-creation call is in flight.
    Creating,
    /// Replaced by the durable room (terminal).
    Promoted { durable_id: String },
    /// Room creation failed; the placeholder is discarded (terminal).
    CreateFailed,
}

impl PromotionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Promoted { .. } | Self::CreateFailed)
    }
}

/// What a completion did to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// This completion promoted the room.
    Promoted { durable_id: String },
    /// This completion failed the creation attempt.
    Failed,
    /// A terminal state was already reached; the completion is dropped.
    Ignored,
}

/// Promotion state machine. The first completion to reach a terminal state
/// wins; later ones are no-ops.
#[derive(Debug, Clone)]
pub struct PromotionMachine {
    state: PromotionState,
}

impl Default for PromotionMachine {
    fn default() -> Self {
        Self {
            state: PromotionState::Provisional,
        }
    }
}

impl PromotionMachine {
    pub fn state(&self) -> &PromotionState {
        &self.state
    }

    /// Durable ID once promoted.
    pub fn durable_id(&self) -> Option<&str> {
        match &self.state {
            PromotionState::Promoted { durable_id } => Some(durable_id),
            _ => None,
        }
    }

    /// First send on the placeholder: `Provisional -> Creating`.
    pub fn begin_create(&mut self) -> Result<(), ChatError> {
        if self.state != PromotionState::Provisional {
            return Err(ChatError::invalid_state(&self.state, "begin_create"));
        }
        self.state = PromotionState::Creating;
        Ok(())
    }

    /// Result of the room-creation call.
    pub fn on_create_result(&mut self, result: Result<&str, &ChatError>) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }

        match result {
            Ok(durable_id) => self.promote(durable_id),
            Err(_) => {
                self.state = PromotionState::CreateFailed;
                Transition::Failed
            }
        }
    }

    /// A directory refresh surfaced the durable counterpart.
    pub fn on_directory_match(&mut self, durable_id: &str) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }
        self.promote(durable_id)
    }

    fn promote(&mut self, durable_id: &str) -> Transition {
        self.state = PromotionState::Promoted {
            durable_id: durable_id.to_owned(),
        };
        Transition::Promoted {
            durable_id: durable_id.to_owned(),
        }
    }
}

/// A placeholder direct room and its promotion machine.
#[derive(Debug, Clone)]
pub struct ProvisionalRoom {
    room: Room,
    machine: PromotionMachine,
}

impl ProvisionalRoom {
    /// Placeholder for a direct chat between `self_user_id` and `contact_id`.
    pub fn for_contact(id: String, self_user_id: &str, contact_id: &str, now_secs: i64) -> Self {
        let room = Room {
            id,
            name: direct_room_name(self_user_id, contact_id),
            kind: RoomKind::Direct,
            owner_id: self_user_id.to_owned(),
            members: vec![Member::admin(self_user_id), Member::member(contact_id)],
            created_at: now_secs,
            updated_at: None,
            last_message_preview: None,
            last_message_at: None,
            unread_count: 0,
            is_provisional: true,
            provisional_target_user_id: Some(contact_id.to_owned()),
            connection_timed_out: false,
        };
        Self {
            room,
            machine: PromotionMachine::default(),
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn room_mut(&mut self) -> &mut Room {
        &mut self.room
    }

    pub fn machine(&self) -> &PromotionMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut PromotionMachine {
        &mut self.machine
    }

    /// Room-creation request built from the placeholder's member set.
    pub fn create_request(&self) -> CreateRoomRequest {
        let name = match counterpart_of(&self.room) {
            Some(contact) => direct_room_name(&self.room.owner_id, contact),
            None => format!("{}_chat", self.room.owner_id),
        };
        CreateRoomRequest {
            name,
            kind: RoomKind::Direct,
            owner_id: self.room.owner_id.clone(),
            members: self.room.members.clone(),
        }
    }

    /// The durable room as it should be stored, falling back to the
    /// placeholder's members when the backend omitted them.
    pub fn adopt(&self, mut durable: Room) -> Room {
        if durable.members.is_empty() {
            durable.members = self.room.members.clone();
        }
        durable.is_provisional = false;
        durable.provisional_target_user_id = None;
        durable.connection_timed_out = false;
        durable
    }
}
