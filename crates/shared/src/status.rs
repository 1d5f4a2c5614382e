//! Delivery/seen lifecycle of a message.
//!
//! Status is never stored. It is derived from the two write-once timestamps
//! kept by the ledger, and every transition is planned against the current
//! timestamps so that late or duplicated events collapse into no-ops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Seen,
}

impl MessageStatus {
    pub fn from_stamps(stamps: &StatusStamps) -> Self {
        if stamps.seen_at.is_some() {
            MessageStatus::Seen
        } else if stamps.delivered_at.is_some() {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }

    /// Text shown under an outgoing bubble.
    pub fn label(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "Sent",
            MessageStatus::Delivered => "Delivered",
            MessageStatus::Seen => "Seen",
        }
    }
}

/// A receiver-side observation that may advance a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    Delivered,
    Seen,
}

/// The write a ledger must perform to honour a [`StatusEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTransition {
    Delivered,
    Seen,
    /// Offline receiver went straight to seen: both stamps in one write.
    DeliveredAndSeen,
}

impl StatusTransition {
    pub fn target(&self) -> MessageStatus {
        match self {
            StatusTransition::Delivered => MessageStatus::Delivered,
            StatusTransition::Seen | StatusTransition::DeliveredAndSeen => MessageStatus::Seen,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusTransition::Delivered => "delivered",
            StatusTransition::Seen => "seen",
            StatusTransition::DeliveredAndSeen => "delivered_and_seen",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusStamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
}

impl StatusStamps {
    pub fn new(delivered_at: Option<DateTime<Utc>>, seen_at: Option<DateTime<Utc>>) -> Self {
        Self {
            delivered_at,
            seen_at,
        }
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_stamps(self)
    }

    /// Applies a planned transition. Stamps already present are kept.
    pub fn apply(&mut self, transition: StatusTransition, at: DateTime<Utc>) {
        match transition {
            StatusTransition::Delivered => {
                self.delivered_at.get_or_insert(at);
            }
            StatusTransition::Seen | StatusTransition::DeliveredAndSeen => {
                self.delivered_at.get_or_insert(at);
                self.seen_at.get_or_insert(at);
            }
        }
    }

    /// Folds a snapshot received from any transport into the local copy.
    ///
    /// Returns `true` when the derived status moved forward.
    pub fn merge(&mut self, other: &StatusStamps) -> bool {
        let before = self.status();
        if self.delivered_at.is_none() {
            self.delivered_at = other.delivered_at.or(other.seen_at);
        }
        if self.seen_at.is_none() {
            self.seen_at = other.seen_at;
        }
        if self.seen_at.is_some() && self.delivered_at.is_none() {
            self.delivered_at = self.seen_at;
        }
        self.status() > before
    }
}

/// Decides which write (if any) an event requires given the current stamps.
///
/// `None` means the event is stale or a duplicate and must not be written.
pub fn plan_transition(current: &StatusStamps, event: StatusEvent) -> Option<StatusTransition> {
    match (event, current.delivered_at, current.seen_at) {
        (_, _, Some(_)) => None,
        (StatusEvent::Delivered, Some(_), None) => None,
        (StatusEvent::Delivered, None, None) => Some(StatusTransition::Delivered),
        (StatusEvent::Seen, Some(_), None) => Some(StatusTransition::Seen),
        (StatusEvent::Seen, None, None) => Some(StatusTransition::DeliveredAndSeen),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_secs: i64) -> DateTime<Utc> {
        "2024-05-01T12:00:00Z"
            .parse::<DateTime<Utc>>()
            .expect("timestamp")
            + Duration::seconds(offset_secs)
    }

    #[test]
    fn fresh_message_is_sent() {
        assert_eq!(StatusStamps::default().status(), MessageStatus::Sent);
    }

    #[test]
    fn seen_on_undelivered_message_writes_both_stamps() {
        let stamps = StatusStamps::default();
        assert_eq!(
            plan_transition(&stamps, StatusEvent::Seen),
            Some(StatusTransition::DeliveredAndSeen)
        );
    }

    #[test]
    fn stale_delivered_after_seen_is_ignored() {
        let stamps = StatusStamps::new(Some(at(0)), Some(at(5)));
        assert_eq!(plan_transition(&stamps, StatusEvent::Delivered), None);
        assert_eq!(plan_transition(&stamps, StatusEvent::Seen), None);
    }

    #[test]
    fn repeated_delivered_is_a_noop() {
        let mut stamps = StatusStamps::default();
        let first = plan_transition(&stamps, StatusEvent::Delivered).expect("first write");
        stamps.apply(first, at(1));
        assert_eq!(plan_transition(&stamps, StatusEvent::Delivered), None);
        assert_eq!(stamps.delivered_at, Some(at(1)));
    }

    #[test]
    fn apply_never_overwrites_existing_stamps() {
        let mut stamps = StatusStamps::new(Some(at(1)), None);
        stamps.apply(StatusTransition::DeliveredAndSeen, at(9));
        assert_eq!(stamps.delivered_at, Some(at(1)));
        assert_eq!(stamps.seen_at, Some(at(9)));
    }

    #[test]
    fn merge_is_monotonic_and_backfills_delivered() {
        let mut local = StatusStamps::default();
        assert!(local.merge(&StatusStamps::new(None, Some(at(3)))));
        assert_eq!(local.delivered_at, Some(at(3)));
        assert_eq!(local.status(), MessageStatus::Seen);

        let stale = StatusStamps::new(Some(at(1)), None);
        assert!(!local.merge(&stale));
        assert_eq!(local.delivered_at, Some(at(3)));
        assert_eq!(local.status(), MessageStatus::Seen);
    }

    #[test]
    fn labels_match_status_text() {
        assert_eq!(MessageStatus::Sent.label(), "Sent");
        assert_eq!(MessageStatus::Delivered.label(), "Delivered");
        assert_eq!(MessageStatus::Seen.label(), "Seen");
    }
}
