//! Session-scoped push fan-out.
//!
//! A socket registers once, then joins the conversations it currently has
//! open. Pushes only reach sessions that joined the conversation, so a user
//! with the app closed gets nothing here and relies on the change-feed.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub(crate) type SessionId = u64;

struct Session {
    user_id: UserId,
    tx: mpsc::UnboundedSender<String>,
    joined: HashSet<ConversationId>,
}

#[derive(Default)]
pub(crate) struct Gateway {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Session>>,
    rooms: RwLock<HashMap<ConversationId, HashSet<SessionId>>>,
}

impl Gateway {
    pub(crate) async fn register(
        &self,
        user_id: UserId,
        tx: mpsc::UnboundedSender<String>,
    ) -> SessionId {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.write().await.insert(
            session_id,
            Session {
                user_id,
                tx,
                joined: HashSet::new(),
            },
        );
        debug!(session_id, user_id = user_id.0, "push session registered");
        session_id
    }

    pub(crate) async fn unregister(&self, session_id: SessionId) {
        let Some(session) = self.sessions.write().await.remove(&session_id) else {
            return;
        };
        let mut rooms = self.rooms.write().await;
        for conversation_id in &session.joined {
            if let Some(members) = rooms.get_mut(conversation_id) {
                members.remove(&session_id);
                if members.is_empty() {
                    rooms.remove(conversation_id);
                }
            }
        }
        debug!(session_id, "push session closed");
    }

    pub(crate) async fn join(&self, session_id: SessionId, conversation_id: ConversationId) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.joined.insert(conversation_id);
        } else {
            return;
        }
        self.rooms
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(session_id);
    }

    pub(crate) async fn leave(&self, session_id: SessionId, conversation_id: ConversationId) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.joined.remove(&conversation_id);
        }
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
    }

    /// Every session that joined the conversation.
    pub(crate) async fn publish(&self, conversation_id: ConversationId, event: &ServerEvent) {
        self.fan_out(conversation_id, None, event).await;
    }

    /// Sessions of one participant that joined the conversation.
    pub(crate) async fn publish_to_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        event: &ServerEvent,
    ) {
        self.fan_out(conversation_id, Some(user_id), event).await;
    }

    pub(crate) async fn send_to(&self, session_id: SessionId, event: &ServerEvent) {
        let Ok(msg) = serde_json::to_string(event) else {
            return;
        };
        if let Some(session) = self.sessions.read().await.get(&session_id) {
            let _ = session.tx.send(msg);
        }
    }

    async fn fan_out(
        &self,
        conversation_id: ConversationId,
        only_user: Option<UserId>,
        event: &ServerEvent,
    ) {
        let Ok(msg) = serde_json::to_string(event) else {
            return;
        };
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(&conversation_id) else {
            return;
        };
        let sessions = self.sessions.read().await;
        for session_id in members {
            let Some(session) = sessions.get(session_id) else {
                continue;
            };
            if only_user.is_some_and(|user_id| user_id != session.user_id) {
                continue;
            }
            let _ = session.tx.send(msg.clone());
        }
    }

    #[cfg(test)]
    pub(crate) async fn joined_sessions(&self, conversation_id: ConversationId) -> usize {
        self.rooms
            .read()
            .await
            .get(&conversation_id)
            .map(HashSet::len)
            .unwrap_or_default()
    }
}
