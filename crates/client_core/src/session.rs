//! The per-user messaging engine.
//!
//! A [`ChatSession`] owns the optimistic conversation views, the shared
//! dedup cache, visibility and typing state, unread counters and the
//! conversation index. One pump task per transport feeds it; every inbound
//! event is checked against the dedup cache before any state changes, and
//! every ledger write goes through the injected [`LedgerClient`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, TransportTag, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        MessagePayload, OutgoingMessage, StatusChangePayload, MAX_ATTACHMENTS, MAX_CONTENT_CHARS,
    },
    status::MessageStatus,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    conversation::{ConversationView, LocalId, ProvisionalMessage, Reconciled, ViewEntry},
    dedup::{DedupCache, DedupKey, DEFAULT_DEDUP_CAPACITY},
    error::{ClientError, SendError},
    http::DEFAULT_REQUEST_TIMEOUT,
    inbox::{ConversationIndex, IndexEntry},
    transport::{BusSubscriptions, DualChannel, LedgerClient, LifecycleEvent, TypingSignal},
    typing::{
        TypingEmitter, TypingIndicator, DEFAULT_TYPING_EXPIRY, DEFAULT_TYPING_IDLE,
        DEFAULT_TYPING_REFRESH,
    },
    unread::UnreadCounter,
    visibility::{VisibilityTracker, DEFAULT_VISIBILITY_THRESHOLD},
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub dedup_capacity: usize,
    pub visibility_threshold: f32,
    pub typing_idle: Duration,
    pub typing_expiry: Duration,
    pub typing_refresh: Duration,
    /// Bound on a direct send before it is rolled back.
    pub request_timeout: Duration,
    pub history_page: u32,
    pub event_buffer: usize,
    pub tick_interval: Duration,
    pub unread_reconcile_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            visibility_threshold: DEFAULT_VISIBILITY_THRESHOLD,
            typing_idle: DEFAULT_TYPING_IDLE,
            typing_expiry: DEFAULT_TYPING_EXPIRY,
            typing_refresh: DEFAULT_TYPING_REFRESH,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            history_page: 50,
            event_buffer: 256,
            tick_interval: Duration::from_millis(500),
            unread_reconcile_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ProvisionalInserted {
        conversation_id: ConversationId,
        local_id: LocalId,
    },
    MessageInserted {
        conversation_id: ConversationId,
        message_id: MessageId,
        via: TransportTag,
    },
    MessageReplaced {
        conversation_id: ConversationId,
        local_id: LocalId,
        message_id: MessageId,
    },
    /// The send failed; `draft` goes back into the compose field.
    ProvisionalRolledBack {
        conversation_id: ConversationId,
        local_id: LocalId,
        draft: OutgoingMessage,
        error: ClientError,
    },
    /// A rolled-back send turned out to be persisted after all.
    DraftSuperseded {
        conversation_id: ConversationId,
        local_id: LocalId,
        message_id: MessageId,
    },
    StatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
    },
    MessageRetracted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageHidden {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread_count: u32,
    },
    ConversationActivity {
        conversation_id: ConversationId,
    },
    ConversationDeactivated {
        conversation_id: ConversationId,
    },
    TransportDegraded {
        via: TransportTag,
    },
    TransportRestored {
        via: TransportTag,
    },
    Error(String),
}

struct SessionState {
    dedup: DedupCache,
    views: HashMap<ConversationId, ConversationView>,
    visibility: VisibilityTracker,
    emitters: HashMap<ConversationId, TypingEmitter>,
    indicator: TypingIndicator,
    unread: UnreadCounter,
    index: ConversationIndex,
    deactivated: HashSet<ConversationId>,
    links: HashMap<TransportTag, bool>,
}

impl SessionState {
    fn new(options: &SessionOptions) -> Self {
        Self {
            dedup: DedupCache::new(options.dedup_capacity),
            views: HashMap::new(),
            visibility: VisibilityTracker::new(options.visibility_threshold),
            emitters: HashMap::new(),
            indicator: TypingIndicator::new(options.typing_expiry),
            unread: UnreadCounter::default(),
            index: ConversationIndex::default(),
            deactivated: HashSet::new(),
            links: HashMap::new(),
        }
    }

    fn view_containing(&mut self, message_id: MessageId) -> Option<&mut ConversationView> {
        self.views
            .values_mut()
            .find(|view| view.contains(message_id))
    }
}

enum Inbound {
    Message(MessagePayload),
    Status(StatusChangePayload),
    Typing(TypingSignal),
    Lifecycle(LifecycleEvent),
    Connectivity(bool),
    Lagged(u64),
    Closed,
}

fn received<T>(result: Result<T, RecvError>, wrap: fn(T) -> Inbound) -> Inbound {
    match result {
        Ok(value) => wrap(value),
        Err(RecvError::Lagged(skipped)) => Inbound::Lagged(skipped),
        Err(RecvError::Closed) => Inbound::Closed,
    }
}

fn is_realtime(via: TransportTag) -> bool {
    matches!(via, TransportTag::Push | TransportTag::Feed)
}

fn validate_draft(draft: &OutgoingMessage) -> Result<(), ClientError> {
    if draft.content.trim().is_empty() && draft.attachments.is_empty() {
        return Err(ClientError::validation(
            "message needs content or at least one attachment",
        ));
    }
    if draft.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ClientError::validation(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    if draft.attachments.len() > MAX_ATTACHMENTS {
        return Err(ClientError::validation(format!(
            "at most {MAX_ATTACHMENTS} attachments per message"
        )));
    }
    if draft
        .attachments
        .iter()
        .any(|attachment| attachment.storage_ref.trim().is_empty())
    {
        return Err(ClientError::validation("attachment without storage reference"));
    }
    Ok(())
}

pub struct ChatSession {
    user_id: UserId,
    options: SessionOptions,
    ledger: Arc<dyn LedgerClient>,
    channels: DualChannel,
    state: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        user_id: UserId,
        ledger: Arc<dyn LedgerClient>,
        channels: DualChannel,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_buffer.max(16));
        Arc::new(Self {
            user_id,
            state: Mutex::new(SessionState::new(&options)),
            options,
            ledger,
            channels,
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Subscribes to both channels and spawns the pump and ticker tasks.
    /// Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let push = BusSubscriptions::of(self.channels.push.as_ref());
        let feed = BusSubscriptions::of(self.channels.feed.as_ref());
        {
            let mut state = self.state.lock().await;
            state.links.insert(push.tag, *push.connectivity.borrow());
            state.links.insert(feed.tag, *feed.connectivity.borrow());
        }
        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(pump(weak.clone(), push)));
        tasks.push(tokio::spawn(pump(weak.clone(), feed)));
        tasks.push(tokio::spawn(ticker(
            weak,
            self.options.tick_interval,
            self.options.unread_reconcile_interval,
        )));
        info!(user_id = self.user_id.0, "chat session started");
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    /// Loads the conversation list, reconciling unread counts and activity.
    pub async fn refresh_conversations(&self) -> Result<Vec<IndexEntry>, ClientError> {
        let summaries = self.ledger.list_conversations().await?;
        let mut state = self.state.lock().await;
        for summary in &summaries {
            state.index.upsert(IndexEntry::from(summary));
            if state
                .unread
                .reconcile(summary.conversation_id, summary.unread_count)
            {
                self.emit(ClientEvent::UnreadChanged {
                    conversation_id: summary.conversation_id,
                    unread_count: summary.unread_count,
                });
            }
            if !summary.is_active && state.deactivated.insert(summary.conversation_id) {
                self.emit(ClientEvent::ConversationDeactivated {
                    conversation_id: summary.conversation_id,
                });
            }
        }
        Ok(state.index.entries().to_vec())
    }

    /// Joins the conversation on the push channel and loads its latest page.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<Vec<ViewEntry>, ClientError> {
        self.peer_of(conversation_id).await?;
        self.state
            .lock()
            .await
            .views
            .entry(conversation_id)
            .or_insert_with(|| ConversationView::new(conversation_id));
        if let Err(err) = self.channels.push.join(conversation_id).await {
            warn!(
                conversation_id = conversation_id.0,
                %err,
                "push join failed, relying on change-feed"
            );
        }
        self.resync(conversation_id).await?;
        self.reconcile_unread(conversation_id).await?;
        Ok(self.view(conversation_id).await)
    }

    pub async fn close_conversation(&self, conversation_id: ConversationId) {
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if let Some(view) = state.views.remove(&conversation_id) {
                for message_id in view.confirmed_ids() {
                    state.visibility.deregister(message_id);
                }
            }
            state.emitters.remove(&conversation_id);
            state.indicator.clear_conversation(conversation_id);
        }
        if let Err(err) = self.channels.push.leave(conversation_id).await {
            debug!(conversation_id = conversation_id.0, %err, "push leave failed");
        }
    }

    /// Optimistic send. On failure the provisional entry is removed and the
    /// draft handed back in the error.
    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        draft: OutgoingMessage,
    ) -> Result<MessagePayload, SendError> {
        if let Err(source) = validate_draft(&draft) {
            return Err(SendError {
                draft,
                local_id: None,
                source,
            });
        }
        let receiver_id = match self.peer_of(conversation_id).await {
            Ok(peer) => peer,
            Err(source) => {
                return Err(SendError {
                    draft,
                    local_id: None,
                    source,
                })
            }
        };

        let local_id = LocalId::new();
        let mut outgoing = draft.clone();
        outgoing.client_ref = Some(local_id.to_string());

        let stop_typing = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.deactivated.contains(&conversation_id) {
                return Err(SendError {
                    draft,
                    local_id: None,
                    source: ClientError::validation("conversation is no longer active"),
                });
            }
            state
                .views
                .entry(conversation_id)
                .or_insert_with(|| ConversationView::new(conversation_id))
                .insert_provisional(ProvisionalMessage {
                    local_id,
                    conversation_id,
                    sender_id: self.user_id,
                    receiver_id,
                    draft: draft.clone(),
                    composed_at: Utc::now(),
                });
            self.emit(ClientEvent::ProvisionalInserted {
                conversation_id,
                local_id,
            });
            state
                .emitters
                .get_mut(&conversation_id)
                .and_then(TypingEmitter::sent)
                .is_some()
        };
        if stop_typing {
            self.send_typing_signal(conversation_id, receiver_id, false)
                .await;
        }

        let result = match tokio::time::timeout(
            self.options.request_timeout,
            self.ledger
                .send_message(conversation_id, receiver_id, &outgoing),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match result {
            Ok(message) => {
                state
                    .dedup
                    .admit(DedupKey::Content(message.message_id), TransportTag::Direct);
                let outcome = state
                    .views
                    .entry(conversation_id)
                    .or_insert_with(|| ConversationView::new(conversation_id))
                    .confirm(local_id, message.clone());
                self.emit_reconciled(
                    conversation_id,
                    message.message_id,
                    outcome,
                    TransportTag::Direct,
                );
                if state.index.touch(conversation_id, message.created_at) {
                    self.emit(ClientEvent::ConversationActivity { conversation_id });
                }
                Ok(message)
            }
            Err(source) => {
                if let Some(view) = state.views.get_mut(&conversation_id) {
                    if view.rollback(local_id).is_none() {
                        // A broadcast already replaced the provisional entry.
                        if let Some(message) = view.find_by_client_ref(&local_id.to_string()) {
                            return Ok(message.clone());
                        }
                    }
                }
                warn!(
                    conversation_id = conversation_id.0,
                    %local_id,
                    error = %source,
                    "send failed, draft restored"
                );
                self.emit(ClientEvent::ProvisionalRolledBack {
                    conversation_id,
                    local_id,
                    draft: draft.clone(),
                    error: source.clone(),
                });
                Err(SendError {
                    draft,
                    local_id: Some(local_id),
                    source,
                })
            }
        }
    }

    /// Reports how much of a message is on screen. Returns `true` when this
    /// report promoted the message to seen.
    pub async fn on_visible(
        &self,
        message_id: MessageId,
        visible_fraction: f32,
    ) -> Result<bool, ClientError> {
        if !self
            .state
            .lock()
            .await
            .visibility
            .report(message_id, visible_fraction)
        {
            return Ok(false);
        }
        match self.ledger.mark_seen(message_id).await {
            Ok(change) => {
                let mut guard = self.state.lock().await;
                guard.visibility.complete(message_id);
                self.apply_status(&mut guard, &change, TransportTag::Direct);
                Ok(true)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                if err.is_retryable() {
                    state.visibility.release(message_id);
                    warn!(message_id = message_id.0, %err, "mark seen failed, will retry");
                } else {
                    state.visibility.deregister(message_id);
                    warn!(message_id = message_id.0, %err, "mark seen rejected");
                }
                Err(err)
            }
        }
    }

    pub async fn hide_message(self: &Arc<Self>, message_id: MessageId) -> Result<(), ClientError> {
        self.ledger.hide_message(message_id).await?;
        let hidden_in = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state
                .dedup
                .admit(DedupKey::Hidden(message_id), TransportTag::Direct);
            state.visibility.deregister(message_id);
            let hidden_in = state.view_containing(message_id).and_then(|view| {
                view.remove(message_id).then(|| view.conversation_id())
            });
            if let Some(conversation_id) = hidden_in {
                self.emit(ClientEvent::MessageHidden {
                    conversation_id,
                    message_id,
                });
            }
            hidden_in
        };
        if let Some(conversation_id) = hidden_in {
            self.spawn_unread_reconcile(conversation_id);
        }
        Ok(())
    }

    pub async fn retract_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.ledger.retract_message(message_id).await?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state
            .dedup
            .admit(DedupKey::Retracted(message_id), TransportTag::Direct);
        let retracted_in = state.view_containing(message_id).and_then(|view| {
            view.retract(message_id).then(|| view.conversation_id())
        });
        if let Some(conversation_id) = retracted_in {
            self.emit(ClientEvent::MessageRetracted {
                conversation_id,
                message_id,
            });
        }
        Ok(())
    }

    /// Call on every compose-field keystroke.
    pub async fn typing_keystroke(&self, conversation_id: ConversationId) {
        let signal = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(peer) = state.index.get(conversation_id).map(|entry| entry.peer_id) else {
                return;
            };
            let (idle, refresh) = (self.options.typing_idle, self.options.typing_refresh);
            state
                .emitters
                .entry(conversation_id)
                .or_insert_with(|| TypingEmitter::new(idle, refresh))
                .keystroke(Instant::now())
                .map(|action| (peer, action.is_typing()))
        };
        if let Some((peer, is_typing)) = signal {
            self.send_typing_signal(conversation_id, peer, is_typing).await;
        }
    }

    /// Stops idle outbound typing and expires stale inbound indicators.
    pub async fn tick(&self) {
        let now = Instant::now();
        let stops = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut stops = Vec::new();
            for (conversation_id, emitter) in state.emitters.iter_mut() {
                if let Some(action) = emitter.tick(now) {
                    if let Some(entry) = state.index.get(*conversation_id) {
                        stops.push((*conversation_id, entry.peer_id, action.is_typing()));
                    }
                }
            }
            for (conversation_id, user_id) in state.indicator.expire(now) {
                self.emit(ClientEvent::TypingChanged {
                    conversation_id,
                    user_id,
                    is_typing: false,
                });
            }
            stops
        };
        for (conversation_id, peer, is_typing) in stops {
            self.send_typing_signal(conversation_id, peer, is_typing).await;
        }
    }

    /// Re-reads the latest page of a conversation. Arrivals are tagged
    /// [`TransportTag::Resync`] and never count as delivery.
    pub async fn resync(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<usize, ClientError> {
        let messages = self
            .ledger
            .list_messages(conversation_id, self.options.history_page, None)
            .await?;
        let fetched = messages.len();
        for message in messages {
            self.handle_message(message, TransportTag::Resync).await;
        }
        debug!(conversation_id = conversation_id.0, fetched, "conversation resynced");
        Ok(fetched)
    }

    pub async fn resync_open(self: &Arc<Self>) {
        let open: Vec<ConversationId> = self.state.lock().await.views.keys().copied().collect();
        for conversation_id in open {
            if let Err(err) = self.resync(conversation_id).await {
                warn!(conversation_id = conversation_id.0, %err, "resync failed");
            }
        }
        if let Err(err) = self.refresh_conversations().await {
            warn!(%err, "conversation refresh failed");
        }
    }

    pub async fn reconcile_unread(&self, conversation_id: ConversationId) -> Result<u32, ClientError> {
        let count = self.ledger.unread_count(conversation_id).await?;
        if self.state.lock().await.unread.reconcile(conversation_id, count) {
            self.emit(ClientEvent::UnreadChanged {
                conversation_id,
                unread_count: count,
            });
        }
        Ok(count)
    }

    pub async fn view(&self, conversation_id: ConversationId) -> Vec<ViewEntry> {
        self.state
            .lock()
            .await
            .views
            .get(&conversation_id)
            .map(|view| view.entries().to_vec())
            .unwrap_or_default()
    }

    pub async fn unread(&self, conversation_id: ConversationId) -> u32 {
        self.state.lock().await.unread.get(conversation_id)
    }

    pub async fn total_unread(&self) -> u32 {
        self.state.lock().await.unread.total()
    }

    pub async fn conversations(&self) -> Vec<IndexEntry> {
        self.state.lock().await.index.entries().to_vec()
    }

    pub async fn is_peer_typing(&self, conversation_id: ConversationId) -> bool {
        let state = self.state.lock().await;
        state
            .index
            .get(conversation_id)
            .is_some_and(|entry| state.indicator.is_typing(conversation_id, entry.peer_id))
    }

    pub async fn is_active(&self, conversation_id: ConversationId) -> bool {
        !self.state.lock().await.deactivated.contains(&conversation_id)
    }

    async fn peer_of(&self, conversation_id: ConversationId) -> Result<UserId, ClientError> {
        if let Some(entry) = self.state.lock().await.index.get(conversation_id) {
            return Ok(entry.peer_id);
        }
        self.refresh_conversations().await?;
        self.state
            .lock()
            .await
            .index
            .get(conversation_id)
            .map(|entry| entry.peer_id)
            .ok_or_else(|| {
                ClientError::Rejected(ApiError::new(ErrorCode::NotFound, "unknown conversation"))
            })
    }

    async fn handle(self: &Arc<Self>, via: TransportTag, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.handle_message(message, via).await,
            Inbound::Status(change) => {
                let mut guard = self.state.lock().await;
                self.apply_status(&mut guard, &change, via);
            }
            Inbound::Typing(signal) => self.handle_typing(signal).await,
            Inbound::Lifecycle(event) => self.handle_lifecycle(event, via).await,
            Inbound::Connectivity(up) => self.handle_connectivity(via, up).await,
            Inbound::Lagged(skipped) => {
                warn!(transport = via.as_str(), skipped, "subscription lagged, resyncing");
                self.resync_open().await;
            }
            Inbound::Closed => {}
        }
    }

    async fn handle_message(self: &Arc<Self>, message: MessagePayload, via: TransportTag) {
        let message_id = message.message_id;
        let conversation_id = message.conversation_id;
        let deliver = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let fresh = state.dedup.admit(DedupKey::Content(message_id), via);
            let unseen =
                message.receiver_id == self.user_id && message.seen_at.is_none() && !message.retracted;
            let undelivered = message.delivered_at.is_none();
            let created_at = message.created_at;

            if !fresh && via != TransportTag::Resync {
                // A repeat copy may still carry newer stamps; it never brings
                // back a message this user removed.
                if let Some(view) = state
                    .views
                    .get_mut(&conversation_id)
                    .filter(|view| view.contains(message_id))
                {
                    let outcome = view.apply_remote(message);
                    self.emit_reconciled(conversation_id, message_id, outcome, via);
                }
                return;
            }

            if let Some(view) = state.views.get_mut(&conversation_id) {
                let outcome = view.apply_remote(message);
                self.emit_reconciled(conversation_id, message_id, outcome, via);
                if unseen {
                    state.visibility.register(message_id);
                }
            }
            if fresh && state.index.touch(conversation_id, created_at) {
                self.emit(ClientEvent::ConversationActivity { conversation_id });
            }
            let realtime = fresh && unseen && is_realtime(via);
            if realtime {
                let unread_count = state.unread.increment(conversation_id);
                self.emit(ClientEvent::UnreadChanged {
                    conversation_id,
                    unread_count,
                });
            }
            realtime && undelivered
        };
        if deliver {
            self.spawn_mark_delivered(message_id);
        }
    }

    /// Applies a status snapshot once per (message, status), whichever path
    /// delivered it.
    fn apply_status(&self, state: &mut SessionState, change: &StatusChangePayload, via: TransportTag) {
        let status = change.status();
        if status == MessageStatus::Sent {
            return;
        }
        if !state
            .dedup
            .admit(DedupKey::Status(change.message_id, status), via)
        {
            return;
        }
        if let Some(view) = state.views.get_mut(&change.conversation_id) {
            if let Some(status) = view.apply_status(change) {
                self.emit(ClientEvent::StatusChanged {
                    conversation_id: change.conversation_id,
                    message_id: change.message_id,
                    status,
                });
            }
        }
        if change.receiver_id == self.user_id && status == MessageStatus::Seen {
            state.visibility.complete(change.message_id);
            let unread_count = state.unread.decrement(change.conversation_id);
            self.emit(ClientEvent::UnreadChanged {
                conversation_id: change.conversation_id,
                unread_count,
            });
        }
    }

    async fn handle_typing(&self, signal: TypingSignal) {
        if signal.user_id == self.user_id {
            return;
        }
        let changed = self.state.lock().await.indicator.apply(
            signal.conversation_id,
            signal.user_id,
            signal.is_typing,
            Instant::now(),
        );
        if changed {
            self.emit(ClientEvent::TypingChanged {
                conversation_id: signal.conversation_id,
                user_id: signal.user_id,
                is_typing: signal.is_typing,
            });
        }
    }

    async fn handle_lifecycle(self: &Arc<Self>, event: LifecycleEvent, via: TransportTag) {
        let reconcile = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match event {
                LifecycleEvent::Retracted {
                    conversation_id,
                    message_id,
                } => {
                    if !state.dedup.admit(DedupKey::Retracted(message_id), via) {
                        return;
                    }
                    state.visibility.deregister(message_id);
                    let changed = state
                        .views
                        .get_mut(&conversation_id)
                        .is_some_and(|view| view.retract(message_id));
                    if changed {
                        self.emit(ClientEvent::MessageRetracted {
                            conversation_id,
                            message_id,
                        });
                    }
                    Some(conversation_id)
                }
                LifecycleEvent::Hidden {
                    conversation_id,
                    message_id,
                } => {
                    if !state.dedup.admit(DedupKey::Hidden(message_id), via) {
                        return;
                    }
                    state.visibility.deregister(message_id);
                    let changed = state
                        .views
                        .get_mut(&conversation_id)
                        .is_some_and(|view| view.remove(message_id));
                    if changed {
                        self.emit(ClientEvent::MessageHidden {
                            conversation_id,
                            message_id,
                        });
                    }
                    Some(conversation_id)
                }
                LifecycleEvent::Deactivated { conversation_id } => {
                    state.index.deactivate(conversation_id);
                    if state.deactivated.insert(conversation_id) {
                        state.emitters.remove(&conversation_id);
                        state.indicator.clear_conversation(conversation_id);
                        info!(conversation_id = conversation_id.0, "conversation deactivated");
                        self.emit(ClientEvent::ConversationDeactivated { conversation_id });
                    }
                    None
                }
            }
        };
        if let Some(conversation_id) = reconcile {
            self.spawn_unread_reconcile(conversation_id);
        }
    }

    async fn handle_connectivity(self: &Arc<Self>, via: TransportTag, up: bool) {
        {
            let mut state = self.state.lock().await;
            let previous = state.links.insert(via, up).unwrap_or(false);
            if previous == up {
                return;
            }
            if !up {
                if state.links.values().all(|linked| !linked) {
                    warn!("all real-time transports down, state may be stale");
                } else {
                    debug!(transport = via.as_str(), "transport down, other channel covers");
                }
                self.emit(ClientEvent::TransportDegraded { via });
                return;
            }
            info!(transport = via.as_str(), "transport restored");
            self.emit(ClientEvent::TransportRestored { via });
        }
        self.resync_open().await;
    }

    fn spawn_mark_delivered(self: &Arc<Self>, message_id: MessageId) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            match session.ledger.mark_delivered(message_id).await {
                Ok(change) => {
                    let mut guard = session.state.lock().await;
                    session.apply_status(&mut guard, &change, TransportTag::Direct);
                }
                Err(err) => {
                    warn!(message_id = message_id.0, %err, "mark delivered failed");
                }
            }
        });
    }

    fn spawn_unread_reconcile(self: &Arc<Self>, conversation_id: ConversationId) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = session.reconcile_unread(conversation_id).await {
                debug!(conversation_id = conversation_id.0, %err, "unread reconcile failed");
            }
        });
    }

    async fn send_typing_signal(&self, conversation_id: ConversationId, peer: UserId, is_typing: bool) {
        if let Err(err) = self
            .channels
            .push
            .send_typing(conversation_id, peer, is_typing)
            .await
        {
            debug!(conversation_id = conversation_id.0, %err, "typing signal dropped");
        }
    }

    fn emit_reconciled(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        outcome: Reconciled,
        via: TransportTag,
    ) {
        match outcome {
            Reconciled::Inserted => self.emit(ClientEvent::MessageInserted {
                conversation_id,
                message_id,
                via,
            }),
            Reconciled::Replaced(local_id) => self.emit(ClientEvent::MessageReplaced {
                conversation_id,
                local_id,
                message_id,
            }),
            Reconciled::Superseded(local_id) => self.emit(ClientEvent::DraftSuperseded {
                conversation_id,
                local_id,
                message_id,
            }),
            Reconciled::Updated { status, retracted } => {
                if let Some(status) = status {
                    self.emit(ClientEvent::StatusChanged {
                        conversation_id,
                        message_id,
                        status,
                    });
                }
                if retracted {
                    self.emit(ClientEvent::MessageRetracted {
                        conversation_id,
                        message_id,
                    });
                }
            }
            Reconciled::Ignored => {}
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn pump(session: Weak<ChatSession>, mut subs: BusSubscriptions) {
    let via = subs.tag;
    loop {
        let inbound = tokio::select! {
            r = subs.messages.recv() => received(r, Inbound::Message),
            r = subs.statuses.recv() => received(r, Inbound::Status),
            r = subs.typing.recv() => received(r, Inbound::Typing),
            r = subs.lifecycle.recv() => received(r, Inbound::Lifecycle),
            r = subs.connectivity.changed() => match r {
                Ok(()) => Inbound::Connectivity(*subs.connectivity.borrow_and_update()),
                Err(_) => Inbound::Closed,
            },
        };
        if matches!(inbound, Inbound::Closed) {
            debug!(transport = via.as_str(), "bus closed, pump exiting");
            break;
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle(via, inbound).await;
    }
}

async fn ticker(session: Weak<ChatSession>, tick: Duration, reconcile_every: Duration) {
    let mut tick_timer = tokio::time::interval(tick);
    let mut reconcile_timer = tokio::time::interval(reconcile_every);
    reconcile_timer.tick().await;
    loop {
        tokio::select! {
            _ = tick_timer.tick() => {
                let Some(session) = session.upgrade() else { break };
                session.tick().await;
            }
            _ = reconcile_timer.tick() => {
                let Some(session) = session.upgrade() else { break };
                if let Err(err) = session.refresh_conversations().await {
                    debug!(%err, "periodic unread reconcile failed");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
