use std::collections::HashSet;

use shared::domain::MessageId;

pub const DEFAULT_VISIBILITY_THRESHOLD: f32 = 0.6;

/// Decides when an unseen inbound message should be promoted to seen.
///
/// `report` answers `true` at most once per registered message until the
/// caller either `complete`s it (seen was written) or `release`s it (the
/// write failed and the next report may retry).
#[derive(Debug)]
pub struct VisibilityTracker {
    threshold: f32,
    registered: HashSet<MessageId>,
    in_flight: HashSet<MessageId>,
}

impl VisibilityTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(f32::MIN_POSITIVE, 1.0),
            registered: HashSet::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn register(&mut self, message_id: MessageId) -> bool {
        self.registered.insert(message_id)
    }

    pub fn report(&mut self, message_id: MessageId, visible_fraction: f32) -> bool {
        if visible_fraction < self.threshold || !self.registered.contains(&message_id) {
            return false;
        }
        self.in_flight.insert(message_id)
    }

    pub fn complete(&mut self, message_id: MessageId) {
        self.in_flight.remove(&message_id);
        self.registered.remove(&message_id);
    }

    pub fn release(&mut self, message_id: MessageId) {
        self.in_flight.remove(&message_id);
    }

    /// The message scrolled away for good or left the view.
    pub fn deregister(&mut self, message_id: MessageId) {
        self.complete(message_id);
    }

    pub fn is_registered(&self, message_id: MessageId) -> bool {
        self.registered.contains(&message_id)
    }

    pub fn is_in_flight(&self, message_id: MessageId) -> bool {
        self.in_flight.contains(&message_id)
    }
}

impl Default for VisibilityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_when_threshold_is_crossed() {
        let mut tracker = VisibilityTracker::default();
        let id = MessageId(1);
        assert!(tracker.register(id));
        assert!(!tracker.report(id, 0.3));
        assert!(tracker.report(id, 0.6));
        assert!(!tracker.report(id, 1.0));
        assert!(tracker.is_in_flight(id));

        tracker.complete(id);
        assert!(!tracker.is_registered(id));
        assert!(!tracker.report(id, 1.0));
    }

    #[test]
    fn released_messages_fire_again() {
        let mut tracker = VisibilityTracker::default();
        let id = MessageId(2);
        tracker.register(id);
        assert!(tracker.report(id, 0.9));
        tracker.release(id);
        assert!(tracker.is_registered(id));
        assert!(tracker.report(id, 0.9));
    }

    #[test]
    fn unregistered_messages_never_fire() {
        let mut tracker = VisibilityTracker::new(0.5);
        assert!(!tracker.report(MessageId(3), 1.0));
        tracker.register(MessageId(3));
        tracker.deregister(MessageId(3));
        assert!(!tracker.report(MessageId(3), 1.0));
    }
}
