//! Bounded recency set shared by both transports.

use std::collections::{HashMap, VecDeque};

use shared::{
    domain::{MessageId, TransportTag},
    status::MessageStatus,
};
use tracing::trace;

pub const DEFAULT_DEDUP_CAPACITY: usize = 512;

/// What an inbound event would apply. A delivered and a seen event for the
/// same message are distinct keys; the same event seen twice is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Content(MessageId),
    Status(MessageId, MessageStatus),
    Retracted(MessageId),
    Hidden(MessageId),
}

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<DedupKey>,
    seen: HashMap<DedupKey, TransportTag>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashMap::with_capacity(capacity),
        }
    }

    /// Returns `true` the first time `key` is offered. The oldest key is
    /// evicted once the cache is full.
    pub fn admit(&mut self, key: DedupKey, via: TransportTag) -> bool {
        if let Some(first) = self.seen.get(&key) {
            trace!(?key, first = first.as_str(), via = via.as_str(), "duplicate dropped");
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key, via);
        true
    }

    /// The transport that first delivered `key`, while it is still cached.
    pub fn first_seen_via(&self, key: &DedupKey) -> Option<TransportTag> {
        self.seen.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_copy_from_the_other_channel_is_dropped() {
        let mut cache = DedupCache::default();
        let key = DedupKey::Content(MessageId(1));
        assert!(cache.admit(key, TransportTag::Feed));
        assert!(!cache.admit(key, TransportTag::Push));
        assert_eq!(cache.first_seen_via(&key), Some(TransportTag::Feed));
    }

    #[test]
    fn status_keys_are_distinct_per_target_status() {
        let mut cache = DedupCache::default();
        let id = MessageId(4);
        assert!(cache.admit(DedupKey::Status(id, MessageStatus::Delivered), TransportTag::Push));
        assert!(cache.admit(DedupKey::Status(id, MessageStatus::Seen), TransportTag::Push));
        assert!(!cache.admit(DedupKey::Status(id, MessageStatus::Seen), TransportTag::Feed));
        assert!(cache.admit(DedupKey::Content(id), TransportTag::Push));
    }

    #[test]
    fn oldest_entry_is_evicted_past_capacity() {
        let mut cache = DedupCache::new(2);
        assert!(cache.admit(DedupKey::Content(MessageId(1)), TransportTag::Push));
        assert!(cache.admit(DedupKey::Content(MessageId(2)), TransportTag::Push));
        assert!(cache.admit(DedupKey::Content(MessageId(3)), TransportTag::Push));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.first_seen_via(&DedupKey::Content(MessageId(1))), None);
        assert!(cache.admit(DedupKey::Content(MessageId(1)), TransportTag::Feed));
        assert!(!cache.admit(DedupKey::Content(MessageId(3)), TransportTag::Feed));
    }
}
