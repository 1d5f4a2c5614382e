//! Ephemeral typing signal, both directions.
//!
//! Nothing here is persisted or retried. Both halves are driven by explicit
//! `Instant`s so the session's ticker (and tests) control time.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use shared::domain::{ConversationId, UserId};

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);
pub const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_secs(5);
/// Must stay below the receiver's expiry or a long burst flickers off.
pub const DEFAULT_TYPING_REFRESH: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    Start,
    Stop,
}

impl TypingAction {
    pub fn is_typing(&self) -> bool {
        matches!(self, TypingAction::Start)
    }
}

/// Outbound side for one conversation.
#[derive(Debug)]
pub struct TypingEmitter {
    idle: Duration,
    refresh: Duration,
    last_keystroke: Option<Instant>,
    last_start: Option<Instant>,
}

impl TypingEmitter {
    pub fn new(idle: Duration, refresh: Duration) -> Self {
        Self {
            idle,
            refresh,
            last_keystroke: None,
            last_start: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.last_keystroke.is_some()
    }

    /// `Start` on the first keystroke after idle, and again every `refresh`
    /// while the burst goes on.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingAction> {
        self.last_keystroke = Some(now);
        let due = match self.last_start {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) >= self.refresh,
        };
        if !due {
            return None;
        }
        self.last_start = Some(now);
        Some(TypingAction::Start)
    }

    /// `Stop` once no keystroke happened for the idle interval.
    pub fn tick(&mut self, now: Instant) -> Option<TypingAction> {
        let last = self.last_keystroke?;
        if now.saturating_duration_since(last) < self.idle {
            return None;
        }
        self.last_keystroke = None;
        self.last_start = None;
        Some(TypingAction::Stop)
    }

    pub fn sent(&mut self) -> Option<TypingAction> {
        self.last_start = None;
        self.last_keystroke.take().map(|_| TypingAction::Stop)
    }
}

/// Inbound side: who is typing where, with local auto-expiry.
#[derive(Debug)]
pub struct TypingIndicator {
    expiry: Duration,
    active: HashMap<(ConversationId, UserId), Instant>,
}

impl TypingIndicator {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            active: HashMap::new(),
        }
    }

    /// Returns `true` when the visible state changed.
    pub fn apply(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let key = (conversation_id, user_id);
        if is_typing {
            self.active.insert(key, now).is_none()
        } else {
            self.active.remove(&key).is_some()
        }
    }

    /// Drops every signal older than the expiry and returns what it dropped.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConversationId, UserId)> {
        let expiry = self.expiry;
        let mut expired = Vec::new();
        self.active.retain(|key, since| {
            let alive = now.saturating_duration_since(*since) < expiry;
            if !alive {
                expired.push(*key);
            }
            alive
        });
        expired.sort();
        expired
    }

    pub fn is_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.active.contains_key(&(conversation_id, user_id))
    }

    pub fn clear_conversation(&mut self, conversation_id: ConversationId) {
        self.active.retain(|(c, _), _| *c != conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitter_starts_once_and_stops_after_idle() {
        let t0 = Instant::now();
        let mut emitter = TypingEmitter::new(Duration::from_secs(3), Duration::from_secs(60));
        assert_eq!(emitter.keystroke(t0), Some(TypingAction::Start));
        assert_eq!(emitter.keystroke(t0 + Duration::from_secs(1)), None);
        assert_eq!(emitter.tick(t0 + Duration::from_secs(3)), None);
        assert_eq!(
            emitter.tick(t0 + Duration::from_secs(4)),
            Some(TypingAction::Stop)
        );
        assert_eq!(emitter.tick(t0 + Duration::from_secs(9)), None);
        assert_eq!(
            emitter.keystroke(t0 + Duration::from_secs(10)),
            Some(TypingAction::Start)
        );
    }

    #[test]
    fn long_bursts_keep_the_remote_indicator_alive() {
        let t0 = Instant::now();
        let mut emitter = TypingEmitter::new(DEFAULT_TYPING_IDLE, DEFAULT_TYPING_REFRESH);
        let mut indicator = TypingIndicator::new(DEFAULT_TYPING_EXPIRY);
        let conversation = ConversationId(1);
        let mut starts = 0;
        for second in 0..12 {
            let now = t0 + Duration::from_secs(second);
            if let Some(action) = emitter.keystroke(now) {
                assert!(action.is_typing());
                starts += 1;
                indicator.apply(conversation, UserId(2), true, now);
            }
            assert!(indicator.expire(now).is_empty(), "expired at {second}s");
        }
        assert_eq!(starts, 4);
    }

    #[test]
    fn sending_stops_typing() {
        let mut emitter = TypingEmitter::new(DEFAULT_TYPING_IDLE, DEFAULT_TYPING_REFRESH);
        assert_eq!(emitter.sent(), None);
        emitter.keystroke(Instant::now());
        assert_eq!(emitter.sent(), Some(TypingAction::Stop));
        assert!(!emitter.is_typing());
    }

    #[test]
    fn lost_stop_signal_expires_locally() {
        let t0 = Instant::now();
        let mut indicator = TypingIndicator::new(Duration::from_secs(5));
        let conversation = ConversationId(1);
        assert!(indicator.apply(conversation, UserId(2), true, t0));
        assert!(!indicator.apply(conversation, UserId(2), true, t0));

        assert!(indicator.expire(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(
            indicator.expire(t0 + Duration::from_secs(5)),
            vec![(conversation, UserId(2))]
        );
        assert!(!indicator.is_typing(conversation, UserId(2)));
        assert!(!indicator.apply(conversation, UserId(2), false, t0));
    }
}
