//! Seams between the session engine and the network.
//!
//! The session never talks to a socket directly. It receives events through
//! [`MessageBus`] subscriptions (one bus per channel), expresses interest and
//! typing through [`PushChannel`], and performs ledger calls through
//! [`LedgerClient`]. Concrete implementations live in `http` and `ws`.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MessageId, TransportTag, UserId},
    protocol::{
        ConversationSummary, MessagePayload, OutgoingMessage, ServerEvent, StatusChangePayload,
    },
};
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Retracted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Hidden {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Deactivated {
        conversation_id: ConversationId,
    },
}

/// Typed inbound capabilities of one channel.
pub trait MessageBus: Send + Sync {
    fn tag(&self) -> TransportTag;
    fn on_message(&self) -> broadcast::Receiver<MessagePayload>;
    fn on_status_change(&self) -> broadcast::Receiver<StatusChangePayload>;
    fn on_typing(&self) -> broadcast::Receiver<TypingSignal>;
    fn on_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent>;
    /// `true` while the channel has a live connection.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

/// The session-scoped channel, which also carries client requests.
#[async_trait]
pub trait PushChannel: MessageBus {
    async fn join(&self, conversation_id: ConversationId) -> Result<(), ClientError>;
    async fn leave(&self, conversation_id: ConversationId) -> Result<(), ClientError>;
    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        receiver_id: UserId,
        is_typing: bool,
    ) -> Result<(), ClientError>;
}

/// Both channels a session listens to.
#[derive(Clone)]
pub struct DualChannel {
    pub push: Arc<dyn PushChannel>,
    pub feed: Arc<dyn MessageBus>,
}

/// Ledger calls made on behalf of the signed-in user.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        receiver_id: UserId,
        message: &OutgoingMessage,
    ) -> Result<MessagePayload, ClientError>;
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>, ClientError>;
    async fn mark_delivered(&self, message_id: MessageId)
        -> Result<StatusChangePayload, ClientError>;
    async fn mark_seen(&self, message_id: MessageId) -> Result<StatusChangePayload, ClientError>;
    async fn hide_message(&self, message_id: MessageId) -> Result<(), ClientError>;
    async fn retract_message(&self, message_id: MessageId) -> Result<(), ClientError>;
    async fn unread_count(&self, conversation_id: ConversationId) -> Result<u32, ClientError>;
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError>;
}

/// Fan-out half of a bus. Transports decode frames into [`ServerEvent`]s and
/// hand them to [`BusHub::dispatch`].
pub struct BusHub {
    tag: TransportTag,
    messages: broadcast::Sender<MessagePayload>,
    statuses: broadcast::Sender<StatusChangePayload>,
    typing: broadcast::Sender<TypingSignal>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    connected: watch::Sender<bool>,
}

impl BusHub {
    pub fn new(tag: TransportTag, capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (statuses, _) = broadcast::channel(capacity);
        let (typing, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity);
        let (connected, _) = watch::channel(false);
        Self {
            tag,
            messages,
            statuses,
            typing,
            lifecycle,
            connected,
        }
    }

    pub fn dispatch(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message, .. } => {
                let _ = self.messages.send(message);
            }
            ServerEvent::MessageStatusChanged { change } => {
                let _ = self.statuses.send(change);
            }
            ServerEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => {
                let _ = self.typing.send(TypingSignal {
                    conversation_id,
                    user_id,
                    is_typing,
                });
            }
            ServerEvent::MessageRetracted {
                conversation_id,
                message_id,
            } => {
                let _ = self.lifecycle.send(LifecycleEvent::Retracted {
                    conversation_id,
                    message_id,
                });
            }
            ServerEvent::MessageHidden {
                conversation_id,
                message_id,
                ..
            } => {
                let _ = self.lifecycle.send(LifecycleEvent::Hidden {
                    conversation_id,
                    message_id,
                });
            }
            ServerEvent::ConversationDeactivated { conversation_id } => {
                let _ = self
                    .lifecycle
                    .send(LifecycleEvent::Deactivated { conversation_id });
            }
            ServerEvent::Error(err) => {
                warn!(
                    transport = self.tag.as_str(),
                    code = ?err.code,
                    message = %err.message,
                    "server reported an error"
                );
            }
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

impl MessageBus for BusHub {
    fn tag(&self) -> TransportTag {
        self.tag
    }

    fn on_message(&self) -> broadcast::Receiver<MessagePayload> {
        self.messages.subscribe()
    }

    fn on_status_change(&self) -> broadcast::Receiver<StatusChangePayload> {
        self.statuses.subscribe()
    }

    fn on_typing(&self) -> broadcast::Receiver<TypingSignal> {
        self.typing.subscribe()
    }

    fn on_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

/// Receivers taken from one bus at a single point in time.
pub(crate) struct BusSubscriptions {
    pub(crate) tag: TransportTag,
    pub(crate) messages: broadcast::Receiver<MessagePayload>,
    pub(crate) statuses: broadcast::Receiver<StatusChangePayload>,
    pub(crate) typing: broadcast::Receiver<TypingSignal>,
    pub(crate) lifecycle: broadcast::Receiver<LifecycleEvent>,
    pub(crate) connectivity: watch::Receiver<bool>,
}

impl BusSubscriptions {
    pub(crate) fn of<B: MessageBus + ?Sized>(bus: &B) -> Self {
        Self {
            tag: bus.tag(),
            messages: bus.on_message(),
            statuses: bus.on_status_change(),
            typing: bus.on_typing(),
            lifecycle: bus.on_lifecycle(),
            connectivity: bus.connectivity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn dispatch_routes_events_to_typed_subscriptions() {
        let hub = BusHub::new(TransportTag::Feed, 8);
        let mut statuses = hub.on_status_change();
        let mut lifecycle = hub.on_lifecycle();

        hub.dispatch(ServerEvent::MessageStatusChanged {
            change: StatusChangePayload {
                message_id: MessageId(1),
                conversation_id: ConversationId(2),
                sender_id: UserId(3),
                receiver_id: UserId(4),
                delivered_at: Some(Utc::now()),
                seen_at: None,
            },
        });
        hub.dispatch(ServerEvent::ConversationDeactivated {
            conversation_id: ConversationId(2),
        });

        assert_eq!(
            statuses.recv().await.expect("status").message_id,
            MessageId(1)
        );
        assert_eq!(
            lifecycle.recv().await.expect("lifecycle"),
            LifecycleEvent::Deactivated {
                conversation_id: ConversationId(2)
            }
        );
    }

    #[test]
    fn connectivity_only_notifies_on_change() {
        let hub = BusHub::new(TransportTag::Push, 8);
        let mut watcher = hub.connectivity();
        hub.set_connected(false);
        assert!(!watcher.has_changed().expect("open"));
        hub.set_connected(true);
        assert!(watcher.has_changed().expect("open"));
        assert!(*watcher.borrow_and_update());
        assert!(hub.is_connected());
    }
}
