//! Provisional/durable identifier classification and counterpart matching.
//!
//! Locally synthesized rooms and messages carry the `temp_` prefix until the
//! backend acknowledges them. The backend gives no causal link between a
//! locally initiated room creation and the row it produces, so a provisional
//! direct room is paired with its durable counterpart by content.

use crate::types::{Room, RoomKind};

/// Reserved prefix for client-generated identifiers.
pub const PROVISIONAL_PREFIX: &str = "temp_";

/// `true` when `id` was generated locally and has not been acknowledged.
pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Provisional room ID for a direct chat with `contact_id`.
pub fn provisional_room_id(contact_id: &str) -> String {
    format!("{PROVISIONAL_PREFIX}{contact_id}")
}

/// Contact a provisional room ID was synthesized for.
pub fn contact_from_provisional_room_id(room_id: &str) -> Option<&str> {
    room_id
        .strip_prefix(PROVISIONAL_PREFIX)
        .filter(|contact| !contact.is_empty())
}

/// Direct-room name encoding of both participants.
pub fn direct_room_name(self_user_id: &str, other_user_id: &str) -> String {
    format!("{self_user_id}_{other_user_id}")
}

/// Counterpart user a provisional room was opened for.
pub fn counterpart_of(provisional: &Room) -> Option<&str> {
    provisional
        .provisional_target_user_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .or_else(|| contact_from_provisional_room_id(&provisional.id))
}

/// Which strategy paired a provisional room with a durable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Candidate members contain both participants.
    MemberSet,
    /// Candidate has no member data; its name encodes both participants.
    NameEncoding,
}

/// Decide whether `candidate` is the durable counterpart of `provisional`.
///
/// Member data wins whenever the candidate carries any. The name strategy
/// only runs for member-less candidates and matches whole `_`-delimited
/// segments, so `user_al` is never found inside `user_alice_user_bob`.
pub fn matches_counterpart(
    provisional: &Room,
    candidate: &Room,
    self_user_id: &str,
) -> Option<MatchStrategy> {
    if candidate.kind != RoomKind::Direct || is_provisional(&candidate.id) {
        return None;
    }
    let counterpart = counterpart_of(provisional)?;

    if !candidate.members.is_empty() {
        return (candidate.has_member(counterpart) && candidate.has_member(self_user_id))
            .then_some(MatchStrategy::MemberSet);
    }

    (contains_segment(&candidate.name, counterpart) && contains_segment(&candidate.name, self_user_id))
        .then_some(MatchStrategy::NameEncoding)
}

/// First candidate, in the given order, that matches `provisional`.
pub fn find_counterpart<'a, I>(provisional: &Room, candidates: I, self_user_id: &str) -> Option<&'a Room>
where
    I: IntoIterator<Item = &'a Room>,
{
    candidates
        .into_iter()
        .find(|candidate| matches_counterpart(provisional, candidate, self_user_id).is_some())
}

fn contains_segment(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let starts_on_boundary = start == 0 || haystack[..start].ends_with('_');
        let ends_on_boundary = end == haystack.len() || haystack[end..].starts_with('_');
        starts_on_boundary && ends_on_boundary
    })
}

/// Title for `room` as seen by `self_user_id`.
///
/// Group rooms use their name. Direct rooms show the other member, falling
/// back to the `{a}_{b}` name encoding when member data is missing.
pub fn display_name_for(room: &Room, self_user_id: &str) -> String {
    if room.kind == RoomKind::Direct {
        if let Some(other) = room.members.iter().find(|m| m.user_id != self_user_id) {
            return other.user_id.clone();
        }
        if let Some(other) = room
            .name
            .strip_prefix(self_user_id)
            .and_then(|rest| rest.strip_prefix('_'))
            .or_else(|| {
                room.name
                    .strip_suffix(self_user_id)
                    .and_then(|rest| rest.strip_suffix('_'))
            })
            .filter(|other| !other.is_empty())
        {
            return other.to_owned();
        }
    }

    if room.name.trim().is_empty() {
        "Unknown room".to_owned()
    } else {
        room.name.clone()
    }
}

/// Issues strictly increasing `temp_{millis}` message IDs.
#[derive(Debug, Default, Clone)]
pub struct ProvisionalIdGenerator {
    last_issued: u64,
}

impl ProvisionalIdGenerator {
    /// Next provisional message ID; bumps past `now_ms` if the clock stalls.
    pub fn next_message_id(&mut self, now_ms: u64) -> String {
        let next = now_ms.max(self.last_issued.saturating_add(1));
        self.last_issued = next;
        format!("{PROVISIONAL_PREFIX}{next}")
    }
}
