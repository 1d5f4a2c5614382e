use std::collections::HashMap;

use shared::domain::ConversationId;

/// Per-conversation unread count, kept locally and corrected by server reads.
#[derive(Debug, Default)]
pub struct UnreadCounter {
    counts: HashMap<ConversationId, u32>,
}

impl UnreadCounter {
    pub fn get(&self, conversation_id: ConversationId) -> u32 {
        self.counts.get(&conversation_id).copied().unwrap_or_default()
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn increment(&mut self, conversation_id: ConversationId) -> u32 {
        let count = self.counts.entry(conversation_id).or_default();
        *count = count.saturating_add(1);
        *count
    }

    pub fn decrement(&mut self, conversation_id: ConversationId) -> u32 {
        let count = self.counts.entry(conversation_id).or_default();
        *count = count.saturating_sub(1);
        *count
    }

    /// Overwrites drift with the server's count. Returns `true` on change.
    pub fn reconcile(&mut self, conversation_id: ConversationId, server_count: u32) -> bool {
        let previous = self.get(conversation_id);
        self.counts.insert(conversation_id, server_count);
        previous != server_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_move_with_arrivals_and_seen_transitions() {
        let mut unread = UnreadCounter::default();
        let conversation = ConversationId(1);
        assert_eq!(unread.increment(conversation), 1);
        assert_eq!(unread.increment(conversation), 2);
        assert_eq!(unread.decrement(conversation), 1);
        assert_eq!(unread.decrement(conversation), 0);
        assert_eq!(unread.decrement(conversation), 0);
    }

    #[test]
    fn reconcile_overwrites_drift() {
        let mut unread = UnreadCounter::default();
        let conversation = ConversationId(1);
        unread.increment(conversation);
        assert!(unread.reconcile(conversation, 3));
        assert!(!unread.reconcile(conversation, 3));
        assert_eq!(unread.get(conversation), 3);
        unread.increment(ConversationId(2));
        assert_eq!(unread.total(), 4);
    }
}
