use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{MessageStatus, PendingMessage};

/// A parked message and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message: PendingMessage,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while a sync is writing this entry; never persisted.
    #[serde(skip)]
    pub in_flight: bool,
}

impl QueueEntry {
    pub fn new(message: PendingMessage) -> Self {
        Self {
            message,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            in_flight: false,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.message.status == MessageStatus::Failed
    }

    /// Eligible for a replay attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.in_flight
            && !self.is_dead_lettered()
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn state_label(&self) -> &'static str {
        if self.in_flight {
            "in_flight"
        } else if self.is_dead_lettered() {
            "dead_letter"
        } else if self.attempts > 0 {
            "retrying"
        } else {
            "queued"
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_support::draft;

    fn entry() -> QueueEntry {
        QueueEntry::new(PendingMessage::new(draft("c1", "u1", "hello")))
    }

    #[test]
    fn fresh_entry_is_due_immediately() {
        let entry = entry();

        assert!(entry.is_due(Utc::now()));
        assert_eq!(entry.state_label(), "queued");
    }

    #[test]
    fn backoff_delays_eligibility() {
        let now = Utc::now();
        let mut entry = entry();
        entry.attempts = 1;
        entry.next_attempt_at = Some(now + Duration::seconds(5));

        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + Duration::seconds(5)));
        assert_eq!(entry.state_label(), "retrying");
    }

    #[test]
    fn dead_letter_is_never_due() {
        let mut entry = entry();
        entry.message.status = MessageStatus::Failed;

        assert!(!entry.is_due(Utc::now()));
        assert_eq!(entry.state_label(), "dead_letter");
    }

    #[test]
    fn in_flight_flag_is_not_persisted() {
        let mut entry = entry();
        entry.in_flight = true;

        let json = serde_json::to_string(&entry).expect("serialize");
        let restored: QueueEntry = serde_json::from_str(&json).expect("deserialize");

        assert!(!restored.in_flight);
        assert_eq!(restored.message, entry.message);
    }
}
