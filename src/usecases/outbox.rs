//! In-memory message queue with retry bookkeeping.
//!
//! Entries keep client send order. A failed replay pushes the entry's next
//! attempt out by an exponential backoff; once the attempt budget is spent
//! the entry is dead-lettered and stays parked until the user resends or
//! cancels it.

use chrono::{DateTime, Duration, Utc};

use crate::{
    domain::{
        ids::{ConversationId, TempId},
        message::{MessageStatus, PendingMessage},
        outbox::QueueEntry,
    },
    infra::config::OutboxConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: millis(config.base_backoff_ms),
            max_backoff: millis(config.max_backoff_ms),
        }
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let factor = 1i32 << exponent;
        let delay = self
            .base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff);
        delay.min(self.max_backoff)
    }
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000_000))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Removed,
    /// A sync is writing the message right now; it may still land.
    InFlight,
    NotFound,
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: Vec<QueueEntry>,
}

impl MessageQueue {
    /// Rebuilds a queue from persisted entries, oldest first.
    pub fn from_entries(mut entries: Vec<QueueEntry>) -> Self {
        for entry in &mut entries {
            entry.in_flight = false;
        }
        entries.sort_by_key(|entry| entry.message.created_at);
        Self { entries }
    }

    pub fn push(&mut self, message: PendingMessage) {
        self.entries.push(QueueEntry::new(message));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, temp_id: &TempId) -> Option<&QueueEntry> {
        self.entries
            .iter()
            .find(|entry| &entry.message.temp_id == temp_id)
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.clone()
    }

    /// Marks every entry due at `now` as in flight and returns them in send order.
    pub fn checkout_due(&mut self, now: DateTime<Utc>) -> Vec<PendingMessage> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.is_due(now))
            .map(|entry| {
                entry.in_flight = true;
                entry.message.clone()
            })
            .collect()
    }

    /// Entries neither due nor dead-lettered at `now`.
    pub fn deferred_count(&self, now: DateTime<Utc>) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.in_flight && !entry.is_dead_lettered() && !entry.is_due(now))
            .count()
    }

    /// Drops an entry whose write was acknowledged.
    pub fn complete(&mut self, temp_id: &TempId) -> Option<QueueEntry> {
        let index = self.position(temp_id)?;
        Some(self.entries.remove(index))
    }

    pub fn record_failure(
        &mut self,
        temp_id: &TempId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Option<FailureOutcome> {
        let entry = self.failed_entry(temp_id, error)?;

        if entry.attempts >= policy.max_attempts {
            return Some(park(entry));
        }

        let next_attempt_at = now + policy.backoff_for(entry.attempts);
        entry.next_attempt_at = Some(next_attempt_at);
        Some(FailureOutcome::Retrying {
            attempts: entry.attempts,
            next_attempt_at,
        })
    }

    /// Parks an entry right away, whatever is left of its attempt budget.
    pub fn dead_letter(&mut self, temp_id: &TempId, error: &str) -> Option<FailureOutcome> {
        self.failed_entry(temp_id, error).map(park)
    }

    pub fn cancel(&mut self, temp_id: &TempId) -> CancelOutcome {
        match self.position(temp_id) {
            None => CancelOutcome::NotFound,
            Some(index) if self.entries[index].in_flight => CancelOutcome::InFlight,
            Some(index) => {
                self.entries.remove(index);
                CancelOutcome::Removed
            }
        }
    }

    /// Puts a dead-lettered entry back in line with a fresh attempt budget.
    pub fn revive(&mut self, temp_id: &TempId) -> bool {
        let Some(index) = self.position(temp_id) else {
            return false;
        };
        let entry = &mut self.entries[index];
        if !entry.is_dead_lettered() {
            return false;
        }
        entry.message.status = MessageStatus::Sending;
        entry.attempts = 0;
        entry.next_attempt_at = None;
        entry.last_error = None;
        true
    }

    /// Queued messages of one conversation, dead letters included.
    pub fn pending_for(&self, conversation_id: &ConversationId) -> Vec<PendingMessage> {
        self.entries
            .iter()
            .filter(|entry| &entry.message.draft.conversation_id == conversation_id)
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<PendingMessage> {
        self.entries
            .iter()
            .filter(|entry| entry.is_dead_lettered())
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn failed_entry(&mut self, temp_id: &TempId, error: &str) -> Option<&mut QueueEntry> {
        let index = self.position(temp_id)?;
        let entry = &mut self.entries[index];
        entry.in_flight = false;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = Some(error.to_owned());
        Some(entry)
    }

    fn position(&self, temp_id: &TempId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.message.temp_id == temp_id)
    }
}

fn park(entry: &mut QueueEntry) -> FailureOutcome {
    entry.message.status = MessageStatus::Failed;
    entry.next_attempt_at = None;
    FailureOutcome::DeadLettered {
        attempts: entry.attempts,
    }
}
