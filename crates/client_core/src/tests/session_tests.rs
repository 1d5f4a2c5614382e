use super::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex as StdMutex,
};

use async_trait::async_trait;
use server_api::ApiContext;
use shared::protocol::{ConversationSummary, ServerEvent};
use storage::Storage;
use tokio::sync::watch;

use crate::transport::{BusHub, MessageBus, PushChannel};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

/// Ledger client calling the server operations in-process.
struct LocalLedger {
    api: ApiContext,
    user_id: UserId,
    stall_after_persist: AtomicBool,
    fail_seen: AtomicBool,
}

fn rejected(err: ApiError) -> ClientError {
    ClientError::Rejected(err)
}

#[async_trait]
impl LedgerClient for LocalLedger {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        receiver_id: UserId,
        message: &OutgoingMessage,
    ) -> Result<MessagePayload, ClientError> {
        let sent = server_api::send_message(
            &self.api,
            self.user_id,
            conversation_id,
            receiver_id,
            message,
        )
        .await
        .map_err(rejected)?;
        if self.stall_after_persist.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(sent)
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        server_api::list_messages(&self.api, self.user_id, conversation_id, Some(limit), before)
            .await
            .map_err(rejected)
    }

    async fn mark_delivered(
        &self,
        message_id: MessageId,
    ) -> Result<StatusChangePayload, ClientError> {
        server_api::mark_delivered(&self.api, self.user_id, message_id)
            .await
            .map(|update| update.change)
            .map_err(rejected)
    }

    async fn mark_seen(&self, message_id: MessageId) -> Result<StatusChangePayload, ClientError> {
        if self.fail_seen.load(Ordering::SeqCst) {
            return Err(ClientError::TransportUnavailable("offline".to_string()));
        }
        server_api::mark_seen(&self.api, self.user_id, message_id)
            .await
            .map(|update| update.change)
            .map_err(rejected)
    }

    async fn hide_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        server_api::hide_message(&self.api, self.user_id, message_id)
            .await
            .map(|_| ())
            .map_err(rejected)
    }

    async fn retract_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        server_api::retract_message(&self.api, self.user_id, message_id)
            .await
            .map(|_| ())
            .map_err(rejected)
    }

    async fn unread_count(&self, conversation_id: ConversationId) -> Result<u32, ClientError> {
        server_api::unread_count(&self.api, self.user_id, conversation_id)
            .await
            .map(|response| response.unread_count)
            .map_err(rejected)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        server_api::list_conversations(&self.api, self.user_id)
            .await
            .map_err(rejected)
    }
}

/// Push channel whose inbound side the test drives through `hub`.
struct FakePush {
    hub: BusHub,
    joined: StdMutex<Vec<ConversationId>>,
    typing: StdMutex<Vec<(ConversationId, UserId, bool)>>,
}

impl MessageBus for FakePush {
    fn tag(&self) -> TransportTag {
        self.hub.tag()
    }

    fn on_message(&self) -> broadcast::Receiver<MessagePayload> {
        self.hub.on_message()
    }

    fn on_status_change(&self) -> broadcast::Receiver<StatusChangePayload> {
        self.hub.on_status_change()
    }

    fn on_typing(&self) -> broadcast::Receiver<TypingSignal> {
        self.hub.on_typing()
    }

    fn on_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.hub.on_lifecycle()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.hub.connectivity()
    }
}

#[async_trait]
impl PushChannel for FakePush {
    async fn join(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.joined.lock().expect("joined").push(conversation_id);
        Ok(())
    }

    async fn leave(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.joined
            .lock()
            .expect("joined")
            .retain(|joined| *joined != conversation_id);
        Ok(())
    }

    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        receiver_id: UserId,
        is_typing: bool,
    ) -> Result<(), ClientError> {
        if !self.hub.is_connected() {
            return Err(ClientError::TransportUnavailable("offline".to_string()));
        }
        self.typing
            .lock()
            .expect("typing")
            .push((conversation_id, receiver_id, is_typing));
        Ok(())
    }
}

struct Peer {
    session: Arc<ChatSession>,
    ledger: Arc<LocalLedger>,
    push: Arc<FakePush>,
    feed: Arc<BusHub>,
    events: broadcast::Receiver<ClientEvent>,
}

impl Peer {
    /// Relays a server event on both channels, like the server would.
    fn relay(&self, event: ServerEvent) {
        self.push.hub.dispatch(event.clone());
        self.feed.dispatch(event);
    }

    fn relay_feed(&self, event: ServerEvent) {
        self.feed.dispatch(event);
    }
}

fn test_options() -> SessionOptions {
    SessionOptions {
        request_timeout: Duration::from_millis(200),
        typing_expiry: Duration::from_millis(50),
        tick_interval: Duration::from_secs(3600),
        ..SessionOptions::default()
    }
}

async fn ledger_with_conversation() -> (ApiContext, ConversationId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conversation = storage
        .create_conversation(ALICE, BOB)
        .await
        .expect("conversation");
    (ApiContext { storage }, conversation)
}

async fn peer(api: &ApiContext, user_id: UserId) -> Peer {
    let ledger = Arc::new(LocalLedger {
        api: api.clone(),
        user_id,
        stall_after_persist: AtomicBool::new(false),
        fail_seen: AtomicBool::new(false),
    });
    let push = Arc::new(FakePush {
        hub: BusHub::new(TransportTag::Push, 64),
        joined: StdMutex::new(Vec::new()),
        typing: StdMutex::new(Vec::new()),
    });
    let feed = Arc::new(BusHub::new(TransportTag::Feed, 64));
    push.hub.set_connected(true);
    feed.set_connected(true);
    let session = ChatSession::new(
        user_id,
        ledger.clone(),
        DualChannel {
            push: push.clone(),
            feed: feed.clone(),
        },
        test_options(),
    );
    let events = session.subscribe();
    session.start().await;
    Peer {
        session,
        ledger,
        push,
        feed,
        events,
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    })
    .await
    .expect("expected session event")
}

/// Like [`wait_for`], returning every event seen on the way.
async fn collect_until(
    events: &mut broadcast::Receiver<ClientEvent>,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = predicate(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    })
    .await
    .expect("expected session event")
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn text(content: &str) -> OutgoingMessage {
    OutgoingMessage {
        content: content.to_string(),
        ..OutgoingMessage::default()
    }
}

async fn current(api: &ApiContext, message_id: MessageId) -> MessagePayload {
    let stored = api
        .storage
        .load_message(message_id)
        .await
        .expect("load")
        .expect("message");
    server_api::message_payload(stored)
}

fn received_event(message: MessagePayload) -> ServerEvent {
    server_api::message_received(message)
}

fn status_event(message: &MessagePayload) -> ServerEvent {
    ServerEvent::MessageStatusChanged {
        change: StatusChangePayload::from_message(message),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_receive_deliver_and_seen() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut alice = peer(&api, ALICE).await;
    let mut bob = peer(&api, BOB).await;
    alice.session.open_conversation(conversation).await.expect("open");
    bob.session.open_conversation(conversation).await.expect("open");
    drain(&mut alice.events);
    drain(&mut bob.events);

    let sent = alice
        .session
        .send_message(conversation, text("hi bob"))
        .await
        .expect("sent");
    let events = drain(&mut alice.events);
    assert!(matches!(events[0], ClientEvent::ProvisionalInserted { .. }));
    assert!(events.iter().any(|event| matches!(
        event,
        ClientEvent::MessageReplaced { message_id, .. } if *message_id == sent.message_id
    )));
    let view = alice.session.view(conversation).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].status(), MessageStatus::Sent);

    // Server fan-out reaches Bob on both channels.
    alice.relay(received_event(sent.clone()));
    bob.relay(received_event(sent.clone()));
    let mut bob_seen = collect_until(&mut bob.events, |event| {
        matches!(
            event,
            ClientEvent::StatusChanged { status: MessageStatus::Delivered, message_id, .. }
                if *message_id == sent.message_id
        )
    })
    .await;
    assert_eq!(bob.session.view(conversation).await.len(), 1);
    assert_eq!(bob.session.unread(conversation).await, 1);

    let delivered = current(&api, sent.message_id).await;
    assert!(delivered.delivered_at.is_some());
    alice.relay(status_event(&delivered));
    wait_for(&mut alice.events, |event| {
        matches!(event, ClientEvent::StatusChanged { status: MessageStatus::Delivered, .. })
    })
    .await;

    assert!(bob.session.on_visible(sent.message_id, 1.0).await.expect("seen"));
    assert!(!bob.session.on_visible(sent.message_id, 1.0).await.expect("noop"));
    assert_eq!(bob.session.unread(conversation).await, 0);

    let seen = current(&api, sent.message_id).await;
    alice.relay(status_event(&seen));
    wait_for(&mut alice.events, |event| {
        matches!(event, ClientEvent::StatusChanged { status: MessageStatus::Seen, .. })
    })
    .await;
    let view = alice.session.view(conversation).await;
    assert_eq!(view[0].status().label(), "Seen");

    bob_seen.extend(drain(&mut bob.events));
    let inserted = bob_seen
        .iter()
        .filter(|event| matches!(event, ClientEvent::MessageInserted { .. }))
        .count();
    assert_eq!(inserted, 1);
    assert_eq!(bob.session.view(conversation).await.len(), 1);
}

#[tokio::test]
async fn offline_receiver_goes_straight_to_seen() {
    let (api, conversation) = ledger_with_conversation().await;
    let alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");
    let sent = alice
        .session
        .send_message(conversation, text("are you there?"))
        .await
        .expect("sent");

    // Bob comes online later and only sees the message through history.
    let bob = peer(&api, BOB).await;
    let view = bob.session.open_conversation(conversation).await.expect("open");
    assert_eq!(view.len(), 1);
    assert_eq!(bob.session.unread(conversation).await, 1);
    assert!(current(&api, sent.message_id).await.delivered_at.is_none());

    assert!(bob.session.on_visible(sent.message_id, 0.8).await.expect("seen"));
    let stored = current(&api, sent.message_id).await;
    assert!(stored.seen_at.is_some());
    assert_eq!(stored.delivered_at, stored.seen_at);
    assert_eq!(bob.session.unread(conversation).await, 0);
}

#[tokio::test]
async fn timed_out_send_is_rolled_back_then_superseded_by_broadcast() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");
    drain(&mut alice.events);

    alice.ledger.stall_after_persist.store(true, Ordering::SeqCst);
    let err = alice
        .session
        .send_message(conversation, text("slow network"))
        .await
        .expect_err("timed out");
    assert_eq!(err.source, ClientError::Timeout);
    assert_eq!(err.draft.content, "slow network");
    let local_id = err.local_id.expect("provisional existed");
    assert!(alice.session.view(conversation).await.is_empty());
    assert!(drain(&mut alice.events).iter().any(|event| matches!(
        event,
        ClientEvent::ProvisionalRolledBack { draft, .. } if draft.content == "slow network"
    )));

    let persisted = server_api::list_messages(&api, ALICE, conversation, None, None)
        .await
        .expect("history");
    assert_eq!(persisted.len(), 1);
    alice.relay(received_event(persisted[0].clone()));
    let superseded = wait_for(&mut alice.events, |event| {
        matches!(event, ClientEvent::DraftSuperseded { .. })
    })
    .await;
    assert!(matches!(
        superseded,
        ClientEvent::DraftSuperseded { local_id: id, .. } if id == local_id
    ));

    alice.relay_feed(received_event(persisted[0].clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.session.view(conversation).await.len(), 1);
}

#[tokio::test]
async fn hide_for_self_leaves_the_peer_untouched() {
    let (api, conversation) = ledger_with_conversation().await;
    let alice = peer(&api, ALICE).await;
    let mut bob = peer(&api, BOB).await;
    alice.session.open_conversation(conversation).await.expect("open");
    bob.session.open_conversation(conversation).await.expect("open");

    let sent = alice
        .session
        .send_message(conversation, text("oops"))
        .await
        .expect("sent");
    bob.relay(received_event(sent.clone()));
    wait_for(&mut bob.events, |event| {
        matches!(event, ClientEvent::MessageInserted { .. })
    })
    .await;

    bob.session.hide_message(sent.message_id).await.expect("hidden");
    assert!(bob.session.view(conversation).await.is_empty());
    wait_for(&mut bob.events, |event| {
        matches!(event, ClientEvent::MessageHidden { .. })
    })
    .await;

    assert_eq!(alice.session.view(conversation).await.len(), 1);
    let history = server_api::list_messages(&api, ALICE, conversation, None, None)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    let bob_history = server_api::list_messages(&api, BOB, conversation, None, None)
        .await
        .expect("history");
    assert!(bob_history.is_empty());
}

#[tokio::test]
async fn second_retract_is_rejected_and_not_retried() {
    let (api, conversation) = ledger_with_conversation().await;
    let alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");
    let sent = alice
        .session
        .send_message(conversation, text("unsend me"))
        .await
        .expect("sent");

    alice.session.retract_message(sent.message_id).await.expect("retracted");
    let view = alice.session.view(conversation).await;
    assert!(view[0].is_retracted());

    let err = alice
        .session
        .retract_message(sent.message_id)
        .await
        .expect_err("second retract");
    assert_eq!(err.code(), ErrorCode::AlreadyRetracted);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn arrivals_are_displayed_in_creation_order() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut bob = peer(&api, BOB).await;
    bob.session.open_conversation(conversation).await.expect("open");

    let mut sent = Vec::new();
    for content in ["one", "two", "three"] {
        sent.push(
            server_api::send_message(&api, ALICE, conversation, BOB, &text(content))
                .await
                .expect("sent"),
        );
    }
    for message in sent.iter().rev() {
        bob.relay_feed(received_event(message.clone()));
    }
    for _ in 0..3 {
        wait_for(&mut bob.events, |event| {
            matches!(event, ClientEvent::MessageInserted { .. })
        })
        .await;
    }
    let contents: Vec<String> = bob
        .session
        .view(conversation)
        .await
        .iter()
        .map(|entry| entry.content().to_string())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn invalid_draft_never_creates_a_provisional_entry() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");
    drain(&mut alice.events);

    let err = alice
        .session
        .send_message(conversation, text("   "))
        .await
        .expect_err("invalid");
    assert_eq!(err.source.code(), ErrorCode::Validation);
    assert!(err.local_id.is_none());
    assert_eq!(err.draft.content, "   ");
    assert!(alice.session.view(conversation).await.is_empty());
    assert!(drain(&mut alice.events).is_empty());
}

#[tokio::test]
async fn failed_seen_is_retried_on_the_next_report() {
    let (api, conversation) = ledger_with_conversation().await;
    let alice = peer(&api, ALICE).await;
    let bob = peer(&api, BOB).await;
    alice.session.open_conversation(conversation).await.expect("open");
    let sent = alice
        .session
        .send_message(conversation, text("look"))
        .await
        .expect("sent");
    bob.session.open_conversation(conversation).await.expect("open");

    bob.ledger.fail_seen.store(true, Ordering::SeqCst);
    let err = bob
        .session
        .on_visible(sent.message_id, 1.0)
        .await
        .expect_err("offline");
    assert!(err.is_retryable());

    bob.ledger.fail_seen.store(false, Ordering::SeqCst);
    assert!(bob.session.on_visible(sent.message_id, 1.0).await.expect("seen"));
    assert!(current(&api, sent.message_id).await.seen_at.is_some());
}

#[tokio::test]
async fn typing_starts_once_stops_on_send_and_expires_remotely() {
    let (api, conversation) = ledger_with_conversation().await;
    let alice = peer(&api, ALICE).await;
    let mut bob = peer(&api, BOB).await;
    alice.session.open_conversation(conversation).await.expect("open");
    bob.session.open_conversation(conversation).await.expect("open");

    alice.session.typing_keystroke(conversation).await;
    alice.session.typing_keystroke(conversation).await;
    alice
        .session
        .send_message(conversation, text("done typing"))
        .await
        .expect("sent");
    assert_eq!(
        *alice.push.typing.lock().expect("typing"),
        vec![(conversation, BOB, true), (conversation, BOB, false)]
    );

    bob.push.hub.dispatch(ServerEvent::Typing {
        conversation_id: conversation,
        user_id: ALICE,
        is_typing: true,
    });
    wait_for(&mut bob.events, |event| {
        matches!(event, ClientEvent::TypingChanged { is_typing: true, .. })
    })
    .await;
    assert!(bob.session.is_peer_typing(conversation).await);

    // The stop signal is lost; the indicator expires locally.
    tokio::time::sleep(Duration::from_millis(80)).await;
    bob.session.tick().await;
    wait_for(&mut bob.events, |event| {
        matches!(event, ClientEvent::TypingChanged { is_typing: false, .. })
    })
    .await;
    assert!(!bob.session.is_peer_typing(conversation).await);
}

#[tokio::test]
async fn restored_transport_resyncs_missed_messages() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut bob = peer(&api, BOB).await;
    bob.session.open_conversation(conversation).await.expect("open");
    assert_eq!(bob.push.joined.lock().expect("joined").as_slice(), &[conversation]);

    bob.push.hub.set_connected(false);
    bob.feed.set_connected(false);
    wait_for(&mut bob.events, |event| {
        matches!(event, ClientEvent::TransportDegraded { via: TransportTag::Feed })
    })
    .await;

    let missed = server_api::send_message(&api, ALICE, conversation, BOB, &text("while away"))
        .await
        .expect("sent");

    bob.feed.set_connected(true);
    wait_for(&mut bob.events, |event| {
        matches!(
            event,
            ClientEvent::MessageInserted { via: TransportTag::Resync, message_id, .. }
                if *message_id == missed.message_id
        )
    })
    .await;
    // History never counts as delivery.
    assert!(current(&api, missed.message_id).await.delivered_at.is_none());
    wait_for(&mut bob.events, |event| {
        matches!(event, ClientEvent::UnreadChanged { unread_count: 1, .. })
    })
    .await;
}

#[tokio::test]
async fn deactivated_conversation_rejects_sends() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");

    alice.relay_feed(ServerEvent::ConversationDeactivated {
        conversation_id: conversation,
    });
    wait_for(&mut alice.events, |event| {
        matches!(event, ClientEvent::ConversationDeactivated { .. })
    })
    .await;
    assert!(!alice.session.is_active(conversation).await);

    let err = alice
        .session
        .send_message(conversation, text("hello?"))
        .await
        .expect_err("inactive");
    assert_eq!(err.source.code(), ErrorCode::Validation);
    assert!(err.local_id.is_none());
    assert!(alice.session.view(conversation).await.is_empty());
}

#[tokio::test]
async fn conversation_list_feeds_index_and_unread() {
    let (api, conversation) = ledger_with_conversation().await;
    server_api::send_message(&api, ALICE, conversation, BOB, &text("ping"))
        .await
        .expect("sent");
    let bob = peer(&api, BOB).await;

    let listed = bob.session.refresh_conversations().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].peer_id, ALICE);
    assert_eq!(bob.session.unread(conversation).await, 1);
    assert_eq!(bob.session.total_unread().await, 1);
}

async fn wait_for_status(
    session: &ChatSession,
    conversation: ConversationId,
    expected: MessageStatus,
) -> Vec<ViewEntry> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = session.view(conversation).await;
            if view.first().map(|entry| entry.status()) == Some(expected) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expected status in view")
}

#[tokio::test]
async fn status_that_overtakes_its_message_still_lands() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");
    drain(&mut alice.events);

    // Sent from another of Alice's devices, so this view never saw it.
    let sent = server_api::send_message(&api, ALICE, conversation, BOB, &text("from my phone"))
        .await
        .expect("sent");
    server_api::mark_delivered(&api, BOB, sent.message_id)
        .await
        .expect("delivered");
    let delivered = current(&api, sent.message_id).await;

    alice.push.hub.dispatch(status_event(&delivered));
    alice.relay(received_event(sent.clone()));
    alice.relay_feed(status_event(&delivered));

    let view = wait_for_status(&alice.session, conversation, MessageStatus::Delivered).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].message_id(), Some(sent.message_id));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let view = alice.session.view(conversation).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].status(), MessageStatus::Delivered);
}

#[tokio::test]
async fn later_copy_of_a_message_carries_its_newer_status() {
    let (api, conversation) = ledger_with_conversation().await;
    let mut alice = peer(&api, ALICE).await;
    alice.session.open_conversation(conversation).await.expect("open");

    let sent = server_api::send_message(&api, ALICE, conversation, BOB, &text("sync me"))
        .await
        .expect("sent");
    alice.push.hub.dispatch(received_event(sent.clone()));
    wait_for(&mut alice.events, |event| {
        matches!(event, ClientEvent::MessageInserted { .. })
    })
    .await;
    assert_eq!(alice.session.view(conversation).await[0].status(), MessageStatus::Sent);

    server_api::mark_delivered(&api, BOB, sent.message_id)
        .await
        .expect("delivered");
    alice.relay_feed(received_event(current(&api, sent.message_id).await));
    wait_for(&mut alice.events, |event| {
        matches!(
            event,
            ClientEvent::StatusChanged { status: MessageStatus::Delivered, message_id, .. }
                if *message_id == sent.message_id
        )
    })
    .await;
    let view = alice.session.view(conversation).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].status(), MessageStatus::Delivered);
}
