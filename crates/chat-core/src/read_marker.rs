/// Read/unread boundary frozen for one room view session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPositionTracker {
    session: Option<(String, Option<usize>)>,
}

impl ReadPositionTracker {
    /// Freeze the boundary when the room's first page lands.
    ///
    /// The boundary is `total - unread`, clamped at 0; no unread messages
    /// means no marker. Calls for an already-entered room are ignored.
    pub fn enter(&mut self, room_id: &str, total_messages: usize, unread_at_entry: u32) {
        if self
            .session
            .as_ref()
            .is_some_and(|(current, _)| current == room_id)
        {
            return;
        }

        let boundary = (unread_at_entry > 0)
            .then(|| total_messages.saturating_sub(unread_at_entry as usize));
        self.session = Some((room_id.to_owned(), boundary));
    }

    /// Frozen boundary for `room_id`, if that room is being viewed and had unread messages.
    pub fn boundary_for(&self, room_id: &str) -> Option<usize> {
        match &self.session {
            Some((current, boundary)) if current == room_id => *boundary,
            _ => None,
        }
    }

    pub fn current_room(&self) -> Option<&str> {
        self.session.as_ref().map(|(room_id, _)| room_id.as_str())
    }

    /// Reset to "no marker" when the view closes.
    pub fn leave(&mut self) {
        self.session = None;
    }
}
