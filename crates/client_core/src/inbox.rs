use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::ConversationSummary,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
}

impl From<&ConversationSummary> for IndexEntry {
    fn from(summary: &ConversationSummary) -> Self {
        Self {
            conversation_id: summary.conversation_id,
            peer_id: summary.peer_id,
            is_active: summary.is_active,
            last_activity: summary.last_activity,
        }
    }
}

/// Conversation list ordered by last activity (newest first), ties broken
/// by conversation id. Re-sorted after every update.
#[derive(Debug, Default)]
pub struct ConversationIndex {
    entries: Vec<IndexEntry>,
}

impl ConversationIndex {
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|entry| entry.conversation_id == conversation_id)
    }

    pub fn upsert(&mut self, entry: IndexEntry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.conversation_id == entry.conversation_id)
        {
            Some(existing) => {
                // Never resurrect a conversation deactivated locally.
                let is_active = existing.is_active && entry.is_active;
                let last_activity = existing.last_activity.max(entry.last_activity);
                *existing = IndexEntry {
                    is_active,
                    last_activity,
                    ..entry
                };
            }
            None => self.entries.push(entry),
        }
        self.sort();
    }

    /// Moves a conversation's last activity forward. Returns `false` for
    /// unknown conversations and stale timestamps.
    pub fn touch(&mut self, conversation_id: ConversationId, at: DateTime<Utc>) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.conversation_id == conversation_id)
        else {
            return false;
        };
        if at <= entry.last_activity {
            return false;
        }
        entry.last_activity = at;
        self.sort();
        true
    }

    pub fn deactivate(&mut self, conversation_id: ConversationId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.conversation_id == conversation_id)
        {
            Some(entry) if entry.is_active => {
                entry.is_active = false;
                true
            }
            _ => false,
        }
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then(a.conversation_id.cmp(&b.conversation_id))
        });
    }
}
