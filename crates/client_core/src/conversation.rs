//! Local, optimistic copy of one open conversation.
//!
//! Confirmed messages are kept in ledger order `(created_at, message_id)`.
//! Provisional entries (sent but not yet acknowledged) form a tail after the
//! confirmed ones in compose order. Every canonical message, whichever path
//! delivered it, goes through the same replace-or-ignore step keyed by
//! message id and `client_ref`, so a send produces exactly one entry.
//! A status snapshot that overtakes its message is held until the message
//! shows up.

use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{MessagePayload, OutgoingMessage, StatusChangePayload},
    status::{MessageStatus, StatusStamps},
};
use uuid::Uuid;

const ROLLED_BACK_CAP: usize = 32;
const PENDING_STATUS_CAP: usize = 128;

/// Temporary id of a message that has not been persisted yet. It travels to
/// the ledger as the message's `client_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalMessage {
    pub local_id: LocalId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub draft: OutgoingMessage,
    pub composed_at: DateTime<Utc>,
}

impl ProvisionalMessage {
    pub fn status(&self) -> MessageStatus {
        MessageStatus::Sent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEntry {
    Provisional(ProvisionalMessage),
    Confirmed(MessagePayload),
}

impl ViewEntry {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            ViewEntry::Provisional(_) => None,
            ViewEntry::Confirmed(message) => Some(message.message_id),
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            ViewEntry::Provisional(p) => Some(p.local_id),
            ViewEntry::Confirmed(_) => None,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            ViewEntry::Provisional(p) => p.sender_id,
            ViewEntry::Confirmed(message) => message.sender_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ViewEntry::Provisional(p) => &p.draft.content,
            ViewEntry::Confirmed(message) => &message.content,
        }
    }

    pub fn status(&self) -> MessageStatus {
        match self {
            ViewEntry::Provisional(p) => p.status(),
            ViewEntry::Confirmed(message) => message.status(),
        }
    }

    pub fn is_retracted(&self) -> bool {
        matches!(self, ViewEntry::Confirmed(message) if message.retracted)
    }
}

/// What a reconciliation step did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A message this view had never seen was inserted in order.
    Inserted,
    /// The provisional entry for this local id became the canonical message.
    Replaced(LocalId),
    /// The canonical form of a send that had already been rolled back.
    Superseded(LocalId),
    /// Already present; the stored copy moved forward.
    Updated {
        status: Option<MessageStatus>,
        retracted: bool,
    },
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ConversationView {
    conversation_id: ConversationId,
    entries: Vec<ViewEntry>,
    rolled_back: VecDeque<LocalId>,
    pending_status: VecDeque<(MessageId, StatusStamps)>,
}

impl ConversationView {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            rolled_back: VecDeque::new(),
            pending_status: VecDeque::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn message(&self, message_id: MessageId) -> Option<&MessagePayload> {
        self.entries.iter().find_map(|entry| match entry {
            ViewEntry::Confirmed(message) if message.message_id == message_id => Some(message),
            _ => None,
        })
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.message(message_id).is_some()
    }

    pub fn find_by_client_ref(&self, client_ref: &str) -> Option<&MessagePayload> {
        self.entries.iter().find_map(|entry| match entry {
            ViewEntry::Confirmed(message) if message.client_ref.as_deref() == Some(client_ref) => {
                Some(message)
            }
            _ => None,
        })
    }

    pub fn confirmed_ids(&self) -> Vec<MessageId> {
        self.entries.iter().filter_map(ViewEntry::message_id).collect()
    }

    pub fn insert_provisional(&mut self, provisional: ProvisionalMessage) {
        self.entries.push(ViewEntry::Provisional(provisional));
    }

    /// Direct acknowledgement of the send identified by `local_id`.
    pub fn confirm(&mut self, local_id: LocalId, message: MessagePayload) -> Reconciled {
        if self.contains(message.message_id) {
            self.remove_provisional(local_id);
            return self.merge_existing(&message);
        }
        if self.remove_provisional(local_id).is_some() {
            self.insert_confirmed(message);
            return Reconciled::Replaced(local_id);
        }
        self.reconcile_unmatched(message)
    }

    /// A canonical message that arrived by broadcast or history fetch.
    pub fn apply_remote(&mut self, message: MessagePayload) -> Reconciled {
        if self.contains(message.message_id) {
            return self.merge_existing(&message);
        }
        let matched = message
            .client_ref
            .as_deref()
            .and_then(|client_ref| self.provisional_by_client_ref(client_ref));
        if let Some(local_id) = matched {
            self.remove_provisional(local_id);
            self.insert_confirmed(message);
            return Reconciled::Replaced(local_id);
        }
        self.reconcile_unmatched(message)
    }

    /// Drops a provisional entry after its send failed. The `client_ref` is
    /// remembered so a late canonical copy can be reported as superseding
    /// the restored draft.
    pub fn rollback(&mut self, local_id: LocalId) -> Option<ProvisionalMessage> {
        let provisional = self.remove_provisional(local_id)?;
        self.rolled_back.push_back(local_id);
        if self.rolled_back.len() > ROLLED_BACK_CAP {
            self.rolled_back.pop_front();
        }
        Some(provisional)
    }

    /// Folds a status snapshot in. Returns the new status when it advanced.
    /// A snapshot for a message not in the view yet is held and merged on
    /// insertion.
    pub fn apply_status(&mut self, change: &StatusChangePayload) -> Option<MessageStatus> {
        if !self.contains(change.message_id) {
            self.hold_status(change.message_id, change.stamps());
            return None;
        }
        let message = self.message_mut(change.message_id)?;
        let mut stamps = message.stamps();
        if !stamps.merge(&change.stamps()) {
            return None;
        }
        message.delivered_at = stamps.delivered_at;
        message.seen_at = stamps.seen_at;
        Some(stamps.status())
    }

    /// Turns a message into its tombstone. Returns `false` when it was
    /// unknown or already retracted.
    pub fn retract(&mut self, message_id: MessageId) -> bool {
        let Some(message) = self.message_mut(message_id) else {
            return false;
        };
        if message.retracted {
            return false;
        }
        tombstone(message);
        true
    }

    /// Removes a message from this user's view.
    pub fn remove(&mut self, message_id: MessageId) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.message_id() != Some(message_id));
        self.entries.len() != before
    }

    fn reconcile_unmatched(&mut self, message: MessagePayload) -> Reconciled {
        let superseded = message
            .client_ref
            .as_deref()
            .and_then(|client_ref| self.take_rolled_back(client_ref));
        self.insert_confirmed(message);
        match superseded {
            Some(local_id) => Reconciled::Superseded(local_id),
            None => Reconciled::Inserted,
        }
    }

    fn merge_existing(&mut self, incoming: &MessagePayload) -> Reconciled {
        let Some(message) = self.message_mut(incoming.message_id) else {
            return Reconciled::Ignored;
        };
        let mut stamps = message.stamps();
        let status = stamps.merge(&incoming.stamps()).then(|| stamps.status());
        message.delivered_at = stamps.delivered_at;
        message.seen_at = stamps.seen_at;
        let retracted = incoming.retracted && !message.retracted;
        if retracted {
            tombstone(message);
        }
        if status.is_none() && !retracted {
            return Reconciled::Ignored;
        }
        Reconciled::Updated { status, retracted }
    }

    fn insert_confirmed(&mut self, mut message: MessagePayload) {
        if let Some(held) = self.take_held_status(message.message_id) {
            let mut stamps = message.stamps();
            stamps.merge(&held);
            message.delivered_at = stamps.delivered_at;
            message.seen_at = stamps.seen_at;
        }
        let key = (message.created_at, message.message_id);
        let position = self
            .entries
            .iter()
            .position(|entry| match entry {
                ViewEntry::Confirmed(existing) => (existing.created_at, existing.message_id) > key,
                ViewEntry::Provisional(_) => true,
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(position, ViewEntry::Confirmed(message));
    }

    fn hold_status(&mut self, message_id: MessageId, stamps: StatusStamps) {
        if let Some((_, held)) = self
            .pending_status
            .iter_mut()
            .find(|(id, _)| *id == message_id)
        {
            held.merge(&stamps);
            return;
        }
        self.pending_status.push_back((message_id, stamps));
        if self.pending_status.len() > PENDING_STATUS_CAP {
            self.pending_status.pop_front();
        }
    }

    fn take_held_status(&mut self, message_id: MessageId) -> Option<StatusStamps> {
        let index = self
            .pending_status
            .iter()
            .position(|(id, _)| *id == message_id)?;
        self.pending_status.remove(index).map(|(_, stamps)| stamps)
    }

    fn take_rolled_back(&mut self, client_ref: &str) -> Option<LocalId> {
        let index = self
            .rolled_back
            .iter()
            .position(|local_id| local_id.to_string() == client_ref)?;
        self.rolled_back.remove(index)
    }

    fn provisional_by_client_ref(&self, client_ref: &str) -> Option<LocalId> {
        self.entries.iter().find_map(|entry| match entry {
            ViewEntry::Provisional(p) if p.local_id.to_string() == client_ref => Some(p.local_id),
            _ => None,
        })
    }

    fn remove_provisional(&mut self, local_id: LocalId) -> Option<ProvisionalMessage> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.local_id() == Some(local_id))?;
        match self.entries.remove(index) {
            ViewEntry::Provisional(p) => Some(p),
            ViewEntry::Confirmed(_) => None,
        }
    }

    fn message_mut(&mut self, message_id: MessageId) -> Option<&mut MessagePayload> {
        self.entries.iter_mut().find_map(|entry| match entry {
            ViewEntry::Confirmed(message) if message.message_id == message_id => Some(message),
            _ => None,
        })
    }
}

fn tombstone(message: &mut MessagePayload) {
    message.retracted = true;
    message.content.clear();
    message.attachments.clear();
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
