//! Injectable state container tying the directory, timelines, promotion and
//! live ingestion together.
//!
//! All state sits behind one `std::sync::Mutex`. The guard is never held
//! across an `.await`, so every mutation is atomic and the only suspension
//! points are backend and push calls. Results of those calls are applied
//! under the lock once they complete.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::ChatBackend,
    channel::{EngineEvent, EngineEvents, EventStream},
    config::EngineConfig,
    directory::RoomDirectory,
    error::{ChatError, ErrorCategory},
    ids::{self, ProvisionalIdGenerator, find_counterpart, is_provisional, provisional_room_id},
    live::{IngestOutcome, PushEvent, PushFrame, PushSource},
    promotion::{PromotionState, ProvisionalRoom, Transition},
    read_marker::ReadPositionTracker,
    timeline::{TimelineStore, page_limit},
    types::{CreateRoomRequest, Member, Message, MessageKind, Room, RoomKind, SendMessageRequest},
    validation::{validate_message_content, validate_room_id, validate_room_name, validate_user_id},
    wait::WaitOutcome,
};

#[derive(Debug)]
struct LiveSubscription {
    generation: u64,
    room_id: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct EngineState {
    directory: RoomDirectory,
    timelines: TimelineStore,
    provisional: HashMap<String, ProvisionalRoom>,
    active: Option<String>,
    view_epoch: u64,
    read_marker: ReadPositionTracker,
    live: Option<LiveSubscription>,
    live_wanted: Option<String>,
    live_generation: u64,
    ids: ProvisionalIdGenerator,
    /// Bumped by `clear()`; backend results from an older session are dropped.
    session: u64,
}

impl EngineState {
    /// Follow a retired provisional ID to the durable room that replaced it.
    fn resolve(&self, room_id: &str) -> String {
        self.provisional
            .get(room_id)
            .and_then(|room| room.machine().durable_id())
            .unwrap_or(room_id)
            .to_owned()
    }

    fn is_active(&self, room_id: &str) -> bool {
        self.active.as_deref() == Some(room_id)
    }

    fn stop_live(&mut self) -> Option<LiveSubscription> {
        let live = self.live.take()?;
        live.stop.cancel();
        Some(live)
    }

    /// Retire tombstones whose durable room is gone so the contact gets a
    /// fresh placeholder next time.
    fn retire_promoted_into(&mut self, durable_id: &str) {
        self.provisional
            .retain(|_, room| room.machine().durable_id() != Some(durable_id));
    }
}

struct Inner<B, P> {
    backend: B,
    push: P,
    config: EngineConfig,
    self_user_id: String,
    state: Mutex<EngineState>,
    events: EngineEvents,
}

impl<B, P> Drop for Inner<B, P> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut()
            && let Some(live) = state.live.take()
        {
            live.stop.cancel();
        }
    }
}

/// Client-side room and message reconciliation engine.
///
/// Cheap to clone; clones share state.
pub struct ChatEngine<B, P> {
    inner: Arc<Inner<B, P>>,
}

impl<B, P> Clone for ChatEngine<B, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B, P> ChatEngine<B, P>
where
    B: ChatBackend,
    P: PushSource,
{
    pub fn new(
        backend: B,
        push: P,
        config: EngineConfig,
        self_user_id: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let self_user_id = self_user_id.into();
        validate_user_id(&self_user_id)?;
        let events = EngineEvents::new(config.event_buffer);
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                push,
                config,
                self_user_id,
                state: Mutex::new(EngineState::default()),
                events,
            }),
        })
    }

    pub fn self_user_id(&self) -> &str {
        &self.inner.self_user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to engine notifications.
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    fn state(&self) -> Result<MutexGuard<'_, EngineState>, ChatError> {
        self.inner.state.lock().map_err(|_| ChatError::poisoned())
    }

    fn emit(&self, event: EngineEvent) {
        self.inner.events.emit(event);
    }

    /// Fetch a page of rooms and merge it into the directory.
    ///
    /// `more == false` refetches from the first page; `more == true`
    /// continues from the stored cursor. Provisional rooms whose durable
    /// counterpart shows up are promoted. Returns the sorted view.
    pub async fn load_rooms(&self, more: bool) -> Result<Vec<Room>, ChatError> {
        let user_id = self.self_user_id();
        let (cursor, session) = {
            let state = self.state()?;
            if more && state.directory.is_loaded() && !state.directory.has_more() {
                return Ok(state.directory.sorted());
            }
            (state.directory.next_cursor(user_id, more), state.session)
        };

        let limit = page_limit(self.inner.config.room_page_limit);
        let page = self
            .inner
            .backend
            .list_rooms(user_id, limit, cursor.as_deref())
            .await
            .inspect_err(|err| warn!(code = %err.code, more, "room list load failed"))?;
        let fetched = page.rooms.len();

        let (sorted, resubscribe) = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            if state.session != session {
                debug!(fetched, "dropping room page from before clear");
                return Ok(state.directory.sorted());
            }
            state.directory.apply_page(user_id, page, more);
            let resubscribe = self.promote_directory_matches(state);
            (state.directory.sorted(), resubscribe)
        };
        info!(fetched, total = sorted.len(), more, "room directory loaded");
        self.emit(EngineEvent::RoomsChanged);
        self.follow_promotions(resubscribe).await;
        Ok(sorted)
    }

    /// Re-fetch the first page, keeping locally cleared unread counts at 0.
    pub async fn refresh_rooms(&self) -> Result<Vec<Room>, ChatError> {
        self.load_rooms(false).await
    }

    /// Directory rooms by recency, newest first.
    pub fn rooms(&self) -> Result<Vec<Room>, ChatError> {
        Ok(self.state()?.directory.sorted())
    }

    /// Look up a room by ID. Retired provisional IDs resolve to the durable room.
    pub fn room(&self, room_id: &str) -> Result<Option<Room>, ChatError> {
        let state = self.state()?;
        let room_id = state.resolve(room_id);
        if let Some(room) = state.directory.get(&room_id) {
            return Ok(Some(room.clone()));
        }
        Ok(state
            .provisional
            .get(&room_id)
            .filter(|room| !room.machine().state().is_terminal())
            .map(|room| room.room().clone()))
    }

    pub fn is_loaded(&self) -> Result<bool, ChatError> {
        Ok(self.state()?.directory.is_loaded())
    }

    pub fn has_more_rooms(&self) -> Result<bool, ChatError> {
        Ok(self.state()?.directory.has_more())
    }

    pub fn total_unread(&self) -> Result<u64, ChatError> {
        Ok(self.state()?.directory.total_unread())
    }

    pub fn unread_room_count(&self) -> Result<usize, ChatError> {
        Ok(self.state()?.directory.unread_room_count())
    }

    /// Title for `room` from the local user's perspective.
    pub fn display_name_for(&self, room: &Room) -> String {
        ids::display_name_for(room, self.self_user_id())
    }

    /// Zero the room's unread count and acknowledge it in the background.
    ///
    /// The acknowledgement is not awaited and a failure does not restore the
    /// count; it is reported as [`EngineEvent::ReadAckFailed`]. Provisional
    /// rooms are local only.
    pub fn mark_read(&self, room_id: &str) -> Result<(), ChatError> {
        let room_id = {
            let mut state = self.state()?;
            let room_id = state.resolve(room_id);
            if is_provisional(&room_id) {
                return Ok(());
            }
            state.directory.mark_read(&room_id)?;
            room_id
        };
        self.emit(EngineEvent::RoomsChanged);

        if let Err(err) = validate_room_id(&room_id) {
            debug!(room_id = %room_id, code = %err.code, "skipping read acknowledgement");
            return Ok(());
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(room_id = %room_id, "no runtime available for read acknowledgement");
            return Ok(());
        };

        let engine = self.clone();
        runtime.spawn(async move {
            let result = engine
                .inner
                .backend
                .mark_read(&room_id, engine.self_user_id(), None)
                .await;
            if let Err(error) = result {
                warn!(room_id = %room_id, code = %error.code, "read acknowledgement failed");
                engine.emit(EngineEvent::ReadAckFailed { room_id, error });
            }
        });
        Ok(())
    }

    /// Make `room_id` the active room and load its newest page.
    ///
    /// A provisional room shows its buffered messages without a fetch. The
    /// read boundary is frozen from the unread count captured at entry. If
    /// another room is opened before the page arrives, the page is dropped.
    pub async fn open_room(&self, room_id: &str) -> Result<(), ChatError> {
        let (room_id, epoch, session, unread_at_entry) = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let room_id = state.resolve(room_id);

            if is_provisional(&room_id) {
                if !state.provisional.contains_key(&room_id) {
                    return Err(ChatError::room_not_found(&room_id));
                }
                if state.read_marker.current_room() != Some(room_id.as_str()) {
                    state.read_marker.leave();
                }
                state.view_epoch += 1;
                state.active = Some(room_id.clone());
                let buffered = state.timelines.messages(&room_id).len();
                state.read_marker.enter(&room_id, buffered, 0);
                debug!(room_id = %room_id, buffered, "opened provisional room");
                return Ok(());
            }

            validate_room_id(&room_id)?;
            if state.read_marker.current_room() != Some(room_id.as_str()) {
                state.read_marker.leave();
            }
            state.view_epoch += 1;
            state.active = Some(room_id.clone());
            let unread = state
                .directory
                .get(&room_id)
                .map(|room| room.unread_count)
                .unwrap_or(0);
            (room_id, state.view_epoch, state.session, unread)
        };

        let limit = page_limit(self.inner.config.message_page_limit);
        let page = self
            .inner
            .backend
            .list_messages(&room_id, self.self_user_id(), limit, None)
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, code = %err.code, "message page load failed")
            })?;

        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            if state.session != session || state.view_epoch != epoch || !state.is_active(&room_id)
            {
                warn!(room_id = %room_id, "dropping stale message page");
                return Ok(());
            }

            let pending = state.timelines.pending_optimistic(&room_id);
            let mut messages = page.messages;
            messages.reverse();
            state.timelines.replace(&room_id, messages);
            let loaded = state.timelines.messages(&room_id).len();
            for message in pending {
                state.timelines.append(&room_id, message);
            }
            state
                .timelines
                .set_pagination(&room_id, page.next_cursor, page.has_more);
            state.read_marker.enter(&room_id, loaded, unread_at_entry);
            info!(room_id = %room_id, loaded, unread_at_entry, "room opened");
        }
        self.emit(EngineEvent::TimelineChanged { room_id });
        Ok(())
    }

    /// Load the next older page for the active room. Returns how many
    /// messages were inserted.
    pub async fn load_older(&self, room_id: &str) -> Result<usize, ChatError> {
        let (room_id, cursor, session) = {
            let state = self.state()?;
            let room_id = state.resolve(room_id);
            if is_provisional(&room_id) || !state.timelines.has_more(&room_id) {
                return Ok(0);
            }
            let cursor = state.timelines.cursor(&room_id).map(str::to_owned);
            (room_id, cursor, state.session)
        };
        validate_room_id(&room_id)?;

        let limit = page_limit(self.inner.config.message_page_limit);
        let page = self
            .inner
            .backend
            .list_messages(&room_id, self.self_user_id(), limit, cursor.as_deref())
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, code = %err.code, "older page load failed")
            })?;

        let inserted = {
            let mut state = self.state()?;
            if state.session != session || !state.is_active(&room_id) {
                warn!(room_id = %room_id, "dropping stale older page");
                return Ok(0);
            }
            let mut older = page.messages;
            older.reverse();
            let inserted = state.timelines.prepend_older_page(&room_id, older);
            state
                .timelines
                .set_pagination(&room_id, page.next_cursor, page.has_more);
            inserted
        };
        debug!(room_id = %room_id, inserted, "older page merged");
        if inserted > 0 {
            self.emit(EngineEvent::TimelineChanged { room_id });
        }
        Ok(inserted)
    }

    /// Close the active room view and reset the read boundary.
    pub fn leave_room(&self) -> Result<(), ChatError> {
        let mut state = self.state()?;
        state.view_epoch += 1;
        state.active = None;
        state.read_marker.leave();
        Ok(())
    }

    pub fn active_room(&self) -> Result<Option<String>, ChatError> {
        Ok(self.state()?.active.clone())
    }

    /// Timeline for a room, oldest first.
    pub fn messages(&self, room_id: &str) -> Result<Vec<Message>, ChatError> {
        let state = self.state()?;
        let room_id = state.resolve(room_id);
        Ok(state.timelines.messages(&room_id).to_vec())
    }

    /// Index of the first unread message in the active room, if any.
    pub fn read_boundary(&self) -> Result<Option<usize>, ChatError> {
        let state = self.state()?;
        Ok(state
            .active
            .as_deref()
            .and_then(|room_id| state.read_marker.boundary_for(room_id)))
    }

    /// Room to use for a direct chat with `contact_id`.
    ///
    /// Returns the durable direct room when the directory already has one,
    /// otherwise a provisional placeholder that is only created remotely on
    /// the first send.
    pub fn open_direct(&self, contact_id: &str) -> Result<Room, ChatError> {
        validate_user_id(contact_id)?;
        if contact_id == self.self_user_id() {
            return Err(ChatError::validation(
                "invalid_user_id",
                "cannot open a direct room with yourself",
            ));
        }

        let mut guard = self.state()?;
        let state = &mut *guard;
        let provisional_id = provisional_room_id(contact_id);

        if let Some(existing) = state.provisional.get(&provisional_id) {
            match existing.machine().state() {
                PromotionState::Promoted { durable_id } => {
                    if let Some(room) = state.directory.get(durable_id) {
                        return Ok(room.clone());
                    }
                    debug!(room_id = %durable_id, "promoted room left the directory");
                    state.provisional.remove(&provisional_id);
                }
                PromotionState::CreateFailed => {
                    state.provisional.remove(&provisional_id);
                }
                PromotionState::Provisional | PromotionState::Creating => {
                    return Ok(existing.room().clone());
                }
            }
        }

        let placeholder = ProvisionalRoom::for_contact(
            provisional_id.clone(),
            self.self_user_id(),
            contact_id,
            now_secs(),
        );
        if let Some(durable) =
            find_counterpart(placeholder.room(), state.directory.rooms(), self.self_user_id())
        {
            return Ok(durable.clone());
        }

        debug!(room_id = %provisional_id, contact_id, "created provisional direct room");
        let room = placeholder.room().clone();
        state.provisional.insert(provisional_id, placeholder);
        Ok(room)
    }

    /// [`ChatEngine::open_direct`], waiting a bounded time for the first
    /// directory load so an existing room can be found.
    ///
    /// If the load does not land in time the placeholder is returned with
    /// `connection_timed_out` set.
    pub async fn resolve_contact(
        &self,
        contact_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Room, ChatError> {
        validate_user_id(contact_id)?;
        let outcome = self
            .inner
            .config
            .contact_wait()
            .wait_until(cancel, || {
                self.inner
                    .state
                    .lock()
                    .map(|state| state.directory.is_loaded())
                    .unwrap_or(true)
            })
            .await;

        match outcome {
            WaitOutcome::Ready => self.open_direct(contact_id),
            WaitOutcome::Cancelled => Err(ChatError::new(
                ErrorCategory::Timeout,
                "wait_cancelled",
                format!("resolving contact {contact_id} was cancelled"),
            )),
            WaitOutcome::TimedOut => {
                let mut room = self.open_direct(contact_id)?;
                if room.is_provisional {
                    warn!(contact_id, "room directory did not load in time");
                    let mut state = self.state()?;
                    if let Some(placeholder) = state.provisional.get_mut(&room.id) {
                        placeholder.room_mut().connection_timed_out = true;
                    }
                    room.connection_timed_out = true;
                }
                Ok(room)
            }
        }
    }

    /// Send `content` to a room, showing it optimistically until the backend
    /// confirms it.
    ///
    /// Validation runs before anything else and never touches the network.
    /// Sending to a provisional room creates the durable room first; the
    /// message is then delivered under the durable ID.
    pub async fn send_message(&self, room_id: &str, content: &str) -> Result<Message, ChatError> {
        validate_message_content(content)?;
        let (room_id, session) = {
            let state = self.state()?;
            (state.resolve(room_id), state.session)
        };

        if is_provisional(&room_id) {
            let (room_id, optimistic) = self.promote_by_create(&room_id, content, session).await?;
            self.deliver(&room_id, optimistic, session).await
        } else {
            validate_room_id(&room_id)?;
            let optimistic = {
                let mut state = self.state()?;
                let optimistic = self.optimistic_message(&mut state, &room_id, content);
                state.timelines.append(&room_id, optimistic.clone());
                optimistic
            };
            self.emit(EngineEvent::TimelineChanged {
                room_id: room_id.clone(),
            });
            self.deliver(&room_id, optimistic, session).await
        }
    }

    fn optimistic_message(&self, state: &mut EngineState, room_id: &str, content: &str) -> Message {
        Message {
            id: state.ids.next_message_id(now_millis()),
            room_id: room_id.to_owned(),
            sender_id: self.self_user_id().to_owned(),
            content: content.to_owned(),
            kind: MessageKind::Text,
            created_at: now_secs(),
            updated_at: None,
            read_by: vec![self.self_user_id().to_owned()],
        }
    }

    /// Send an optimistic entry already in `room_id`'s timeline and reconcile it.
    async fn deliver(
        &self,
        room_id: &str,
        optimistic: Message,
        session: u64,
    ) -> Result<Message, ChatError> {
        let request = SendMessageRequest {
            room_id: room_id.to_owned(),
            sender_id: optimistic.sender_id.clone(),
            content: optimistic.content.clone(),
            kind: optimistic.kind,
        };
        let result = self.inner.backend.send_message(request).await;

        let outcome = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            if state.session != session {
                debug!(room_id, "send finished after clear, result not applied");
                return result;
            }
            let room_id = state.resolve(room_id);
            match result {
                Ok(durable) => {
                    let outcome =
                        state
                            .timelines
                            .reconcile_sent(&room_id, &optimistic.id, durable.clone());
                    state.directory.record_message(&durable, false);
                    debug!(
                        room_id = %room_id,
                        message_id = %durable.id,
                        ?outcome,
                        "message delivered"
                    );
                    Ok(durable)
                }
                Err(error) => {
                    state.timelines.discard_optimistic(&room_id, &optimistic.id);
                    warn!(
                        room_id = %room_id,
                        code = %error.code,
                        "send failed, optimistic entry removed"
                    );
                    Err((room_id, error))
                }
            }
        };

        match outcome {
            Ok(durable) => {
                self.emit(EngineEvent::TimelineChanged {
                    room_id: durable.room_id.clone(),
                });
                self.emit(EngineEvent::RoomsChanged);
                Ok(durable)
            }
            Err((room_id, error)) => {
                self.emit(EngineEvent::TimelineChanged {
                    room_id: room_id.clone(),
                });
                self.emit(EngineEvent::SendFailed {
                    room_id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// First send on a placeholder: buffer the message, create the durable
    /// room and promote. Returns the durable room ID and the buffered entry.
    async fn promote_by_create(
        &self,
        provisional_id: &str,
        content: &str,
        session: u64,
    ) -> Result<(String, Message), ChatError> {
        let (request, optimistic) = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let placeholder = state
                .provisional
                .get_mut(provisional_id)
                .ok_or_else(|| ChatError::room_not_found(provisional_id))?;
            placeholder.machine_mut().begin_create()?;
            let request = placeholder.create_request();
            let optimistic = self.optimistic_message(state, provisional_id, content);
            state.timelines.append(provisional_id, optimistic.clone());
            (request, optimistic)
        };
        self.emit(EngineEvent::TimelineChanged {
            room_id: provisional_id.to_owned(),
        });
        info!(room_id = %provisional_id, "creating room for first message");

        let created = self.inner.backend.create_room(request).await;

        let (durable_id, resubscribe) = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            if state.session != session {
                drop(guard);
                warn!(room_id = %provisional_id, "room creation finished after clear");
                return Err(ChatError::session_reset("create_room"));
            }
            let placeholder = state
                .provisional
                .get_mut(provisional_id)
                .ok_or_else(|| ChatError::room_not_found(provisional_id))?;

            let transition = match &created {
                Ok(room) => placeholder.machine_mut().on_create_result(Ok(&room.id)),
                Err(err) => placeholder.machine_mut().on_create_result(Err(err)),
            };
            let mut resubscribe = Vec::new();

            match (transition, created) {
                (Transition::Promoted { durable_id }, Ok(room)) => {
                    self.promote_locked(state, provisional_id, room, &mut resubscribe);
                    (durable_id, resubscribe)
                }
                (Transition::Ignored, created) => {
                    let durable_id = placeholder
                        .machine()
                        .durable_id()
                        .map(str::to_owned)
                        .ok_or_else(|| {
                            ChatError::invalid_state(placeholder.machine().state(), "send")
                        })?;
                    if let Ok(room) = created {
                        warn!(
                            kept = %durable_id,
                            discarded = %room.id,
                            "room already promoted from directory"
                        );
                    }
                    (durable_id, resubscribe)
                }
                (_, Err(error)) => {
                    state.provisional.remove(provisional_id);
                    state.timelines.remove_room(provisional_id);
                    if state.is_active(provisional_id) {
                        state.active = None;
                        state.read_marker.leave();
                    }
                    if state.live_wanted.as_deref() == Some(provisional_id) {
                        state.live_wanted = None;
                    }
                    drop(guard);
                    warn!(
                        room_id = %provisional_id,
                        code = %error.code,
                        "room creation failed, placeholder discarded"
                    );
                    self.emit(EngineEvent::SendFailed {
                        room_id: provisional_id.to_owned(),
                        error: error.clone(),
                    });
                    return Err(error);
                }
                (transition, Ok(_)) => {
                    return Err(ChatError::new(
                        ErrorCategory::Internal,
                        "invalid_state_transition",
                        format!("unexpected promotion transition {transition:?}"),
                    ));
                }
            }
        };

        self.follow_promotions(resubscribe).await;
        let mut optimistic = optimistic;
        optimistic.room_id = durable_id.clone();
        Ok((durable_id, optimistic))
    }

    /// Promote every pending placeholder whose counterpart is in the directory.
    fn promote_directory_matches(&self, state: &mut EngineState) -> Vec<String> {
        let mut resubscribe = Vec::new();
        let pending: Vec<String> = state
            .provisional
            .iter()
            .filter(|(_, room)| !room.machine().state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        for provisional_id in pending {
            let Some(placeholder) = state.provisional.get(&provisional_id) else {
                continue;
            };
            let Some(durable) =
                find_counterpart(placeholder.room(), state.directory.rooms(), self.self_user_id())
                    .cloned()
            else {
                continue;
            };
            let transition = match state.provisional.get_mut(&provisional_id) {
                Some(placeholder) => placeholder.machine_mut().on_directory_match(&durable.id),
                None => continue,
            };
            if let Transition::Promoted { .. } = transition {
                self.promote_locked(state, &provisional_id, durable, &mut resubscribe);
            }
        }
        resubscribe
    }

    /// Replace a placeholder with its durable room everywhere it is referenced.
    ///
    /// The machine must already be in `Promoted`. The placeholder entry stays
    /// in the registry so its ID keeps resolving to the durable room.
    fn promote_locked(
        &self,
        state: &mut EngineState,
        provisional_id: &str,
        durable: Room,
        resubscribe: &mut Vec<String>,
    ) {
        let Some(placeholder) = state.provisional.get(provisional_id) else {
            return;
        };
        let adopted = placeholder.adopt(durable);
        let durable_id = adopted.id.clone();
        state.directory.upsert(adopted);
        state.timelines.relabel_room(provisional_id, &durable_id);

        if state.is_active(provisional_id) {
            state.active = Some(durable_id.clone());
        }
        if state.read_marker.current_room() == Some(provisional_id) {
            state.read_marker.leave();
            let total = state.timelines.messages(&durable_id).len();
            state.read_marker.enter(&durable_id, total, 0);
        }
        if state.live_wanted.as_deref() == Some(provisional_id) {
            state.live_wanted = Some(durable_id.clone());
            resubscribe.push(durable_id.clone());
        }

        self.emit(EngineEvent::RoomPromoted {
            from: provisional_id.to_owned(),
            to: durable_id.clone(),
        });
        info!(from = %provisional_id, to = %durable_id, "provisional room promoted");
    }

    async fn follow_promotions(&self, resubscribe: Vec<String>) {
        for room_id in resubscribe {
            if let Err(err) = self.subscribe(&room_id).await {
                warn!(
                    room_id = %room_id,
                    code = %err.code,
                    "could not move live subscription to promoted room"
                );
            }
        }
    }

    /// Create a group room owned by the local user.
    pub async fn create_group_room(
        &self,
        name: &str,
        member_ids: &[String],
    ) -> Result<Room, ChatError> {
        validate_room_name(name)?;
        let mut members = vec![Member::admin(self.self_user_id())];
        for member_id in member_ids {
            validate_user_id(member_id)?;
            if !members.iter().any(|m| &m.user_id == member_id) {
                members.push(Member::member(member_id.as_str()));
            }
        }

        let request = CreateRoomRequest {
            name: name.trim().to_owned(),
            kind: RoomKind::Group,
            owner_id: self.self_user_id().to_owned(),
            members: members.clone(),
        };
        let session = self.state()?.session;
        let mut room = self
            .inner
            .backend
            .create_room(request)
            .await
            .inspect_err(|err| warn!(code = %err.code, "group room creation failed"))?;
        if room.members.is_empty() {
            room.members = members;
        }

        {
            let mut state = self.state()?;
            if state.session != session {
                debug!(room_id = %room.id, "group room created after clear, not recorded");
                return Ok(room);
            }
            state.directory.upsert(room.clone());
        }
        info!(room_id = %room.id, members = room.members.len(), "group room created");
        self.emit(EngineEvent::RoomsChanged);
        Ok(room)
    }

    pub async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError> {
        validate_room_id(room_id)?;
        validate_user_id(user_id)?;
        let session = {
            let state = self.state()?;
            if state.directory.get(room_id).is_none() {
                return Err(ChatError::room_not_found(room_id));
            }
            state.session
        };

        self.inner.backend.add_member(room_id, user_id).await?;

        {
            let mut state = self.state()?;
            if state.session == session
                && let Some(room) = state.directory.get(room_id)
            {
                let mut members = room.members.clone();
                members.push(Member::member(user_id));
                state.directory.set_members(room_id, members)?;
            }
        }
        debug!(room_id, user_id, "member added");
        self.emit(EngineEvent::RoomsChanged);
        Ok(())
    }

    /// Remove a member. Removing the local user leaves the room entirely.
    pub async fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), ChatError> {
        validate_room_id(room_id)?;
        validate_user_id(user_id)?;
        let session = self.state()?.session;

        self.inner.backend.remove_member(room_id, user_id).await?;

        let stopped = {
            let mut state = self.state()?;
            if state.session != session {
                debug!(room_id, "membership change finished after clear");
                return Ok(());
            }
            if user_id == self.self_user_id() {
                state.directory.remove(room_id);
                state.timelines.remove_room(room_id);
                state.retire_promoted_into(room_id);
                if state.is_active(room_id) {
                    state.active = None;
                    state.read_marker.leave();
                }
                if state.live_wanted.as_deref() == Some(room_id) {
                    state.live_wanted = None;
                    state.stop_live()
                } else {
                    None
                }
            } else {
                if let Some(room) = state.directory.get(room_id) {
                    let members = room
                        .members
                        .iter()
                        .filter(|m| m.user_id != user_id)
                        .cloned()
                        .collect();
                    state.directory.set_members(room_id, members)?;
                }
                None
            }
        };
        if stopped.is_some() {
            debug!(room_id, "live subscription stopped after leaving room");
        }
        info!(room_id, user_id, "member removed");
        self.emit(EngineEvent::RoomsChanged);
        Ok(())
    }

    /// Follow push events for `room_id`, replacing any running subscription.
    ///
    /// Provisional rooms cannot be subscribed to; the request is remembered
    /// and carried over to the durable room on promotion. A stream error is
    /// reported as [`EngineEvent::SubscriptionError`] and not retried.
    pub async fn subscribe(&self, room_id: &str) -> Result<(), ChatError> {
        let (room_id, previous) = {
            let mut state = self.state()?;
            let room_id = state.resolve(room_id);
            let previous = state.stop_live();
            state.live_wanted = Some(room_id.clone());
            (room_id, previous)
        };
        if let Some(previous) = previous {
            debug!(room_id = %previous.room_id, "replacing live subscription");
        }

        if is_provisional(&room_id) {
            debug!(room_id = %room_id, "deferring live subscription until promotion");
            return Ok(());
        }
        validate_room_id(&room_id)?;

        let mut stream = match self.inner.push.open(&room_id, self.self_user_id()).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(room_id = %room_id, code = %error.code, "live subscription failed to open");
                self.emit(EngineEvent::SubscriptionError {
                    room_id,
                    error: error.clone(),
                });
                return Err(error);
            }
        };

        let mut guard = self.state()?;
        let state = &mut *guard;
        if state.live_wanted.as_deref() != Some(room_id.as_str()) {
            debug!(room_id = %room_id, "live subscription superseded before it opened");
            stream.close();
            return Ok(());
        }
        if let Some(previous) = state.stop_live() {
            debug!(room_id = %previous.room_id, "replacing live subscription");
        }

        state.live_generation += 1;
        let generation = state.live_generation;
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let weak: Weak<Inner<B, P>> = Arc::downgrade(&self.inner);
        let task_room_id = room_id.clone();
        let task = tokio::spawn(async move {
            let room_id = task_room_id;
            loop {
                let frame = tokio::select! {
                    _ = stop_child.cancelled() => break,
                    frame = stream.next() => frame,
                };
                // The task must not keep a dropped engine alive.
                let Some(inner) = weak.upgrade() else {
                    debug!(room_id = %room_id, "engine dropped, push stream closing");
                    break;
                };
                let engine = ChatEngine { inner };
                match frame {
                    Some(PushFrame::Event(event)) => {
                        if let Err(err) = engine.ingest(&room_id, event) {
                            warn!(room_id = %room_id, code = %err.code, "push event dropped");
                        }
                    }
                    Some(PushFrame::Error(error)) => {
                        warn!(
                            room_id = %room_id,
                            code = %error.code,
                            "live subscription stopped on error"
                        );
                        engine.emit(EngineEvent::SubscriptionError {
                            room_id: room_id.clone(),
                            error,
                        });
                        break;
                    }
                    None => {
                        debug!(room_id = %room_id, "push stream ended");
                        break;
                    }
                }
            }
            stream.close();

            if let Some(inner) = weak.upgrade()
                && let Ok(mut state) = inner.state.lock()
                && state
                    .live
                    .as_ref()
                    .is_some_and(|live| live.generation == generation)
            {
                state.live = None;
            }
        });

        state.live = Some(LiveSubscription {
            generation,
            room_id: room_id.clone(),
            stop,
            task,
        });
        info!(room_id = %room_id, "live subscription started");
        Ok(())
    }

    /// Stop the running subscription, waiting for its task to finish.
    pub async fn unsubscribe(&self) -> Result<(), ChatError> {
        let running = {
            let mut state = self.state()?;
            state.live_wanted = None;
            state.stop_live()
        };
        if let Some(running) = running {
            let _ = running.task.await;
            debug!(room_id = %running.room_id, "live subscription stopped");
        }
        Ok(())
    }

    /// Room the live subscription is currently attached to.
    pub fn live_room(&self) -> Result<Option<String>, ChatError> {
        Ok(self.state()?.live.as_ref().map(|live| live.room_id.clone()))
    }

    /// Apply one push event delivered for `room_id`.
    ///
    /// Messages for other rooms and non-message events are ignored. A new
    /// message from someone else in the active durable room marks it read.
    pub fn ingest(&self, room_id: &str, event: PushEvent) -> Result<IngestOutcome, ChatError> {
        let PushEvent::Message(message) = event else {
            return Ok(IngestOutcome::Ignored);
        };
        if message.room_id != room_id {
            debug!(room_id, other = %message.room_id, "ignoring message for another room");
            return Ok(IngestOutcome::Ignored);
        }

        let from_other = message.sender_id != self.self_user_id();
        let auto_read = {
            let mut state = self.state()?;
            if !state.timelines.append(room_id, message.clone()) {
                return Ok(IngestOutcome::Duplicate);
            }
            let active = state.is_active(room_id);
            state
                .directory
                .record_message(&message, from_other && !active);
            from_other && active && !is_provisional(room_id)
        };
        self.emit(EngineEvent::TimelineChanged {
            room_id: room_id.to_owned(),
        });
        self.emit(EngineEvent::RoomsChanged);

        if auto_read && let Err(err) = self.mark_read(room_id) {
            debug!(room_id, code = %err.code, "auto-read skipped");
        }
        Ok(IngestOutcome::Appended)
    }

    /// Drop all local state, as on logout.
    pub fn clear(&self) -> Result<(), ChatError> {
        {
            let mut state = self.state()?;
            state.stop_live();
            let session = state.session + 1;
            *state = EngineState {
                session,
                ..EngineState::default()
            };
        }
        info!("engine state cleared");
        self.emit(EngineEvent::RoomsChanged);
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
