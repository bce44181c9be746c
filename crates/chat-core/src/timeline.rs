use std::collections::{HashMap, HashSet};

use crate::{ids::is_provisional, types::Message};

/// Result of reconciling an optimistic entry with the backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The durable message was inserted in place of the optimistic one.
    Appended,
    /// The durable message had already arrived (usually via push).
    AlreadyPresent,
}

/// One room's ordered history plus its "older page" cursor.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    cursor: Option<String>,
    has_more: bool,
}

impl Timeline {
    /// Messages ordered by `created_at`, ties in insertion order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    // Lands after every entry with an equal or older timestamp, so in-order
    // delivery is a plain push.
    fn insert_sorted(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }
}

/// Per-room message timelines.
#[derive(Debug, Clone, Default)]
pub struct TimelineStore {
    rooms: HashMap<String, Timeline>,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self, room_id: &str) -> Option<&Timeline> {
        self.rooms.get(room_id)
    }

    /// Current messages for a room (empty when never loaded).
    pub fn messages(&self, room_id: &str) -> &[Message] {
        self.rooms
            .get(room_id)
            .map(Timeline::messages)
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: &str, message_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|timeline| timeline.contains(message_id))
    }

    /// Replace the full timeline; duplicates keep their first occurrence.
    ///
    /// Pending optimistic entries are dropped unless the caller passes them in.
    pub fn replace(&mut self, room_id: &str, messages: Vec<Message>) {
        let mut seen = HashSet::new();
        let mut messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        messages.sort_by_key(|m| m.created_at);
        self.rooms.entry(room_id.to_owned()).or_default().messages = messages;
    }

    /// Insert one message; returns `false` when its ID is already present.
    pub fn append(&mut self, room_id: &str, message: Message) -> bool {
        let timeline = self.rooms.entry(room_id.to_owned()).or_default();
        if timeline.contains(&message.id) {
            return false;
        }
        timeline.insert_sorted(message);
        true
    }

    /// Splice an older page in front of the current head.
    ///
    /// Entries already present are skipped. Returns the number inserted.
    pub fn prepend_older_page(&mut self, room_id: &str, older: Vec<Message>) -> usize {
        let timeline = self.rooms.entry(room_id.to_owned()).or_default();
        let mut seen: HashSet<String> = timeline.messages.iter().map(|m| m.id.clone()).collect();
        let mut merged: Vec<Message> = older
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        let inserted = merged.len();
        if inserted == 0 {
            return 0;
        }

        merged.append(&mut timeline.messages);
        merged.sort_by_key(|m| m.created_at);
        timeline.messages = merged;
        inserted
    }

    /// Swap an optimistic entry for its durable counterpart.
    ///
    /// Returns `None` and changes nothing when the room has no timeline, so a
    /// response for a dropped room cannot bring it back.
    pub fn reconcile_sent(
        &mut self,
        room_id: &str,
        provisional_message_id: &str,
        durable: Message,
    ) -> Option<ReconcileOutcome> {
        let timeline = self.rooms.get_mut(room_id)?;
        timeline.messages.retain(|m| m.id != provisional_message_id);

        if timeline.contains(&durable.id) {
            Some(ReconcileOutcome::AlreadyPresent)
        } else {
            timeline.insert_sorted(durable);
            Some(ReconcileOutcome::Appended)
        }
    }

    /// Roll back an optimistic entry whose send failed. Returns whether it was present.
    pub fn discard_optimistic(&mut self, room_id: &str, provisional_message_id: &str) -> bool {
        let Some(timeline) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let before = timeline.messages.len();
        timeline.messages.retain(|m| m.id != provisional_message_id);
        timeline.messages.len() != before
    }

    /// Optimistic entries still waiting for a send response.
    pub fn pending_optimistic(&self, room_id: &str) -> Vec<Message> {
        self.messages(room_id)
            .iter()
            .filter(|m| is_provisional(&m.id))
            .cloned()
            .collect()
    }

    pub fn cursor(&self, room_id: &str) -> Option<&str> {
        self.rooms.get(room_id).and_then(Timeline::cursor)
    }

    pub fn has_more(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some_and(Timeline::has_more)
    }

    pub fn set_pagination(&mut self, room_id: &str, cursor: Option<String>, has_more: bool) {
        let timeline = self.rooms.entry(room_id.to_owned()).or_default();
        timeline.cursor = cursor;
        timeline.has_more = has_more;
    }

    /// Move a room's history to a new ID, rewriting each message's `room_id`.
    ///
    /// The old key is removed. When the target already has history the moved
    /// messages are merged in without duplicating IDs.
    pub fn relabel_room(&mut self, from: &str, to: &str) {
        let Some(moved) = self.rooms.remove(from) else {
            return;
        };

        match self.rooms.get_mut(to) {
            Some(target) => {
                for mut message in moved.messages {
                    if !target.contains(&message.id) {
                        message.room_id = to.to_owned();
                        target.insert_sorted(message);
                    }
                }
            }
            None => {
                let mut timeline = moved;
                for message in &mut timeline.messages {
                    message.room_id = to.to_owned();
                }
                self.rooms.insert(to.to_owned(), timeline);
            }
        }
    }

    pub fn remove_room(&mut self, room_id: &str) -> Option<Timeline> {
        self.rooms.remove(room_id)
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}

/// Largest page the backend serves.
pub const MAX_PAGE_LIMIT: u16 = 100;

/// Page size actually requested: at least 1, at most [`MAX_PAGE_LIMIT`].
pub fn page_limit(configured: u16) -> u16 {
    configured.clamp(1, MAX_PAGE_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, created_at: i64) -> Message {
        Message {
            id: id.to_owned(),
            room_id: "room".to_owned(),
            sender_id: "user_alice".to_owned(),
            content: format!("body of {id}"),
            kind: Default::default(),
            created_at,
            updated_at: None,
            read_by: Vec::new(),
        }
    }

    fn ids(store: &TimelineStore) -> Vec<&str> {
        store.messages("room").iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_sorted(store: &TimelineStore) {
        let times: Vec<i64> = store.messages("room").iter().map(|m| m.created_at).collect();
        assert!(
            times.windows(2).all(|w| w[0] <= w[1]),
            "timeline out of order: {times:?}"
        );
    }

    #[test]
    fn append_is_idempotent_by_id() {
        let mut store = TimelineStore::new();
        assert!(store.append("room", msg("m1", 10)));
        assert!(!store.append("room", msg("m1", 10)));
        assert_eq!(store.messages("room").len(), 1);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut store = TimelineStore::new();
        store.append("room", msg("a", 10));
        store.append("room", msg("b", 10));
        store.append("room", msg("c", 10));
        assert_eq!(ids(&store), ["a", "b", "c"]);
    }

    #[test]
    fn mixed_operations_keep_timeline_sorted() {
        let mut store = TimelineStore::new();
        store.replace("room", vec![msg("m5", 50), msg("m3", 30), msg("m4", 40)]);
        store.append("room", msg("m7", 70));
        store.append("room", msg("m6", 60));
        store.prepend_older_page("room", vec![msg("m1", 10), msg("m2", 20)]);
        store.append("room", msg("late", 35));
        store.prepend_older_page("room", vec![msg("m0", 0), msg("m4", 40)]);

        assert_sorted(&store);
        assert_eq!(
            ids(&store),
            ["m0", "m1", "m2", "m3", "late", "m4", "m5", "m6", "m7"]
        );
    }

    #[test]
    fn replace_drops_duplicate_ids() {
        let mut store = TimelineStore::new();
        store.replace("room", vec![msg("a", 1), msg("a", 2), msg("b", 3)]);
        assert_eq!(ids(&store), ["a", "b"]);
        assert_eq!(store.messages("room")[0].created_at, 1);
    }

    #[test]
    fn prepend_reports_inserted_count_and_skips_known_ids() {
        let mut store = TimelineStore::new();
        store.replace("room", vec![msg("m3", 30)]);
        let inserted = store.prepend_older_page("room", vec![msg("m1", 10), msg("m3", 30)]);
        assert_eq!(inserted, 1);
        assert_eq!(ids(&store), ["m1", "m3"]);
        assert_eq!(store.prepend_older_page("room", vec![msg("m1", 10)]), 0);
    }

    #[test]
    fn reconcile_replaces_optimistic_entry() {
        let mut store = TimelineStore::new();
        store.append("room", msg("temp_1", 100));

        let outcome = store
            .reconcile_sent("room", "temp_1", msg("m_99", 100))
            .expect("room has a timeline");

        assert_eq!(outcome, ReconcileOutcome::Appended);
        assert_eq!(ids(&store), ["m_99"]);
    }

    #[test]
    fn reconcile_keeps_push_delivered_copy() {
        let mut store = TimelineStore::new();
        store.append("room", msg("temp_1", 100));
        let mut pushed = msg("m_99", 100);
        pushed.content = "from push".into();
        store.append("room", pushed);

        let outcome = store
            .reconcile_sent("room", "temp_1", msg("m_99", 100))
            .expect("room has a timeline");

        assert_eq!(outcome, ReconcileOutcome::AlreadyPresent);
        assert_eq!(ids(&store), ["m_99"]);
        assert_eq!(store.messages("room")[0].content, "from push");
    }

    #[test]
    fn discarding_a_failed_send_removes_only_that_entry() {
        let mut store = TimelineStore::new();
        store.append("room", msg("m1", 10));
        store.append("room", msg("temp_2", 20));

        assert!(store.discard_optimistic("room", "temp_2"));
        assert_eq!(ids(&store), ["m1"]);
        assert!(!store.discard_optimistic("room", "temp_2"));
        assert!(!store.discard_optimistic("elsewhere", "temp_2"));
    }

    #[test]
    fn reconcile_for_unknown_room_does_not_create_it() {
        let mut store = TimelineStore::new();
        assert_eq!(store.reconcile_sent("gone", "temp_1", msg("m_99", 100)), None);
        assert!(store.timeline("gone").is_none());
    }

    #[test]
    fn lists_pending_optimistic_entries() {
        let mut store = TimelineStore::new();
        store.append("room", msg("m1", 10));
        store.append("room", msg("temp_2", 20));
        let pending = store.pending_optimistic("room");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "temp_2");
    }

    #[test]
    fn relabel_moves_history_and_rewrites_room_ids() {
        let mut store = TimelineStore::new();
        store.append("temp_user_bob", msg("temp_1", 10));
        store.append("temp_user_bob", msg("temp_2", 11));

        store.relabel_room("temp_user_bob", "durable");

        assert!(store.timeline("temp_user_bob").is_none());
        let moved = store.messages("durable");
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[0].id, "temp_1");
        assert!(moved.iter().all(|m| m.room_id == "durable"));
    }

    #[test]
    fn relabel_merges_into_existing_history() {
        let mut store = TimelineStore::new();
        store.append("durable", msg("m1", 5));
        store.append("temp_user_bob", msg("temp_1", 10));

        store.relabel_room("temp_user_bob", "durable");

        let merged: Vec<&str> = store.messages("durable").iter().map(|m| m.id.as_str()).collect();
        assert_eq!(merged, ["m1", "temp_1"]);
    }

    #[test]
    fn page_limit_stays_within_backend_range() {
        assert_eq!(page_limit(0), 1);
        assert_eq!(page_limit(30), 30);
        assert_eq!(page_limit(u16::MAX), MAX_PAGE_LIMIT);
    }
}
