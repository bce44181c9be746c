//! Scripted backend and push source for engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::{
    backend::ChatBackend,
    error::ChatError,
    live::{PushFrame, PushSource, PushStream},
    types::{CreateRoomRequest, Message, MessagePage, Room, RoomPage, SendMessageRequest},
};

#[derive(Default)]
struct Script {
    room_pages: VecDeque<Result<RoomPage, ChatError>>,
    message_pages: VecDeque<Result<MessagePage, ChatError>>,
    creates: VecDeque<Result<Room, ChatError>>,
    sends: VecDeque<Result<Message, ChatError>>,
    acks: VecDeque<Result<(), ChatError>>,
    membership: VecDeque<Result<(), ChatError>>,
    rooms_gate: Option<Arc<Notify>>,
    create_gate: Option<Arc<Notify>>,
    send_gate: Option<Arc<Notify>>,
    message_gates: HashMap<String, Arc<Notify>>,
    created: Vec<CreateRoomRequest>,
    sent: Vec<SendMessageRequest>,
    message_requests: Vec<(String, Option<String>)>,
}

#[derive(Default)]
struct Calls {
    list_rooms: AtomicUsize,
    create_room: AtomicUsize,
    list_messages: AtomicUsize,
    send_message: AtomicUsize,
    mark_read: AtomicUsize,
    membership: AtomicUsize,
}

/// Backend whose responses are queued by the test. Empty queues fall back to
/// benign defaults: empty pages, echoed rooms and messages, successful acks.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    script: Arc<Mutex<Script>>,
    calls: Arc<Calls>,
}

impl MockBackend {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("mock script lock")
    }

    pub(crate) fn push_room_page(&self, page: Result<RoomPage, ChatError>) {
        self.script().room_pages.push_back(page);
    }

    pub(crate) fn push_message_page(&self, page: Result<MessagePage, ChatError>) {
        self.script().message_pages.push_back(page);
    }

    pub(crate) fn push_create(&self, room: Result<Room, ChatError>) {
        self.script().creates.push_back(room);
    }

    pub(crate) fn push_send(&self, message: Result<Message, ChatError>) {
        self.script().sends.push_back(message);
    }

    pub(crate) fn push_ack(&self, ack: Result<(), ChatError>) {
        self.script().acks.push_back(ack);
    }

    pub(crate) fn push_membership(&self, ack: Result<(), ChatError>) {
        self.script().membership.push_back(ack);
    }

    /// Hold every `list_rooms` call until the returned gate is notified.
    pub(crate) fn gate_rooms(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script().rooms_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Hold every `create_room` call until the returned gate is notified.
    pub(crate) fn gate_create(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script().create_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Hold every `send_message` call until the returned gate is notified.
    pub(crate) fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script().send_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Hold `list_messages` for `room_id` until the returned gate is notified.
    pub(crate) fn gate_messages(&self, room_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script()
            .message_gates
            .insert(room_id.to_owned(), Arc::clone(&gate));
        gate
    }

    pub(crate) fn created(&self) -> Vec<CreateRoomRequest> {
        self.script().created.clone()
    }

    pub(crate) fn sent(&self) -> Vec<SendMessageRequest> {
        self.script().sent.clone()
    }

    pub(crate) fn message_requests(&self) -> Vec<(String, Option<String>)> {
        self.script().message_requests.clone()
    }

    pub(crate) fn list_rooms_calls(&self) -> usize {
        self.calls.list_rooms.load(Ordering::SeqCst)
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.calls.create_room.load(Ordering::SeqCst)
    }

    pub(crate) fn list_messages_calls(&self) -> usize {
        self.calls.list_messages.load(Ordering::SeqCst)
    }

    pub(crate) fn send_calls(&self) -> usize {
        self.calls.send_message.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_read_calls(&self) -> usize {
        self.calls.mark_read.load(Ordering::SeqCst)
    }

    pub(crate) fn membership_calls(&self) -> usize {
        self.calls.membership.load(Ordering::SeqCst)
    }

    /// Calls of any kind that reached the transport.
    pub(crate) fn total_calls(&self) -> usize {
        self.list_rooms_calls()
            + self.create_calls()
            + self.list_messages_calls()
            + self.send_calls()
            + self.mark_read_calls()
            + self.membership_calls()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn list_rooms(
        &self,
        _user_id: &str,
        _limit: u16,
        _cursor: Option<&str>,
    ) -> Result<RoomPage, ChatError> {
        self.calls.list_rooms.fetch_add(1, Ordering::SeqCst);
        let gate = self.script().rooms_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.script()
            .room_pages
            .pop_front()
            .unwrap_or_else(|| Ok(RoomPage::default()))
    }

    async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, ChatError> {
        let n = self.calls.create_room.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = {
            let mut script = self.script();
            script.created.push(request.clone());
            script.create_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.script().creates.pop_front().unwrap_or_else(|| {
            Ok(Room {
                id: format!("{n:024x}"),
                name: request.name,
                kind: request.kind,
                owner_id: request.owner_id,
                members: request.members,
                created_at: now_secs(),
                updated_at: None,
                last_message_preview: None,
                last_message_at: None,
                unread_count: 0,
                is_provisional: false,
                provisional_target_user_id: None,
                connection_timed_out: false,
            })
        })
    }

    async fn list_messages(
        &self,
        room_id: &str,
        _user_id: &str,
        _limit: u16,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ChatError> {
        self.calls.list_messages.fetch_add(1, Ordering::SeqCst);
        let gate = {
            let mut script = self.script();
            script
                .message_requests
                .push((room_id.to_owned(), cursor.map(str::to_owned)));
            script.message_gates.get(room_id).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.script()
            .message_pages
            .pop_front()
            .unwrap_or_else(|| Ok(MessagePage::default()))
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ChatError> {
        let n = self.calls.send_message.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.script().send_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut script = self.script();
        script.sent.push(request.clone());
        script.sends.pop_front().unwrap_or_else(|| {
            Ok(Message {
                id: format!("m_{n}"),
                room_id: request.room_id,
                sender_id: request.sender_id.clone(),
                content: request.content,
                kind: request.kind,
                created_at: now_secs(),
                updated_at: None,
                read_by: vec![request.sender_id],
            })
        })
    }

    async fn mark_read(
        &self,
        _room_id: &str,
        _user_id: &str,
        _message_id: Option<&str>,
    ) -> Result<(), ChatError> {
        self.calls.mark_read.fetch_add(1, Ordering::SeqCst);
        self.script().acks.pop_front().unwrap_or(Ok(()))
    }

    async fn add_member(&self, _room_id: &str, _user_id: &str) -> Result<(), ChatError> {
        self.calls.membership.fetch_add(1, Ordering::SeqCst);
        self.script().membership.pop_front().unwrap_or(Ok(()))
    }

    async fn remove_member(&self, _room_id: &str, _user_id: &str) -> Result<(), ChatError> {
        self.calls.membership.fetch_add(1, Ordering::SeqCst);
        self.script().membership.pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct PushState {
    opened: Vec<String>,
    senders: HashMap<String, mpsc::Sender<PushFrame>>,
    fail_next: Option<ChatError>,
}

/// Push source handing out in-memory streams the test can feed.
#[derive(Clone, Default)]
pub(crate) struct MockPush {
    state: Arc<Mutex<PushState>>,
}

impl MockPush {
    fn state(&self) -> std::sync::MutexGuard<'_, PushState> {
        self.state.lock().expect("mock push lock")
    }

    /// Rooms `open` was called for, in order.
    pub(crate) fn opened(&self) -> Vec<String> {
        self.state().opened.clone()
    }

    /// Whether the engine still holds the stream last opened for `room_id`.
    pub(crate) fn is_open(&self, room_id: &str) -> bool {
        self.state()
            .senders
            .get(room_id)
            .is_some_and(|sender| !sender.is_closed())
    }

    pub(crate) fn fail_next_open(&self, error: ChatError) {
        self.state().fail_next = Some(error);
    }

    /// Deliver a frame on the most recent stream opened for `room_id`.
    pub(crate) async fn deliver(&self, room_id: &str, frame: PushFrame) {
        let sender = self
            .state()
            .senders
            .get(room_id)
            .cloned()
            .expect("a stream should be open for the room");
        sender.send(frame).await.expect("stream should be listening");
    }
}

#[async_trait]
impl PushSource for MockPush {
    async fn open(&self, room_id: &str, _user_id: &str) -> Result<PushStream, ChatError> {
        let mut state = self.state();
        state.opened.push(room_id.to_owned());
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        let (tx, _stop, stream) = PushStream::channel(16);
        state.senders.insert(room_id.to_owned(), tx);
        Ok(stream)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
