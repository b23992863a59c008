use crate::{
    domain::{ids::UserId, outbox::QueueEntry},
    infra::{contracts::OutboxStore, error::AppError},
};

#[cfg(test)]
use std::{collections::HashMap, sync::Mutex};

/// Outbox store for sessions configured without queue persistence.
#[derive(Debug, Clone, Default)]
pub struct NoopOutboxStore;

impl OutboxStore for NoopOutboxStore {
    fn load(&self, _user_id: &UserId) -> Result<Vec<QueueEntry>, AppError> {
        Ok(Vec::new())
    }

    fn save(&self, _user_id: &UserId, _entries: &[QueueEntry]) -> Result<(), AppError> {
        Ok(())
    }

    fn discard(&self, _user_id: &UserId) -> Result<bool, AppError> {
        Ok(false)
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryOutboxStore {
    saved: Mutex<HashMap<UserId, Vec<QueueEntry>>>,
}

#[cfg(test)]
impl MemoryOutboxStore {
    pub fn saved(&self, user_id: &UserId) -> Vec<QueueEntry> {
        self.saved
            .lock()
            .expect("outbox lock")
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl OutboxStore for MemoryOutboxStore {
    fn load(&self, user_id: &UserId) -> Result<Vec<QueueEntry>, AppError> {
        Ok(self.saved(user_id))
    }

    fn save(&self, user_id: &UserId, entries: &[QueueEntry]) -> Result<(), AppError> {
        self.saved
            .lock()
            .expect("outbox lock")
            .insert(user_id.clone(), entries.to_vec());
        Ok(())
    }

    fn discard(&self, user_id: &UserId) -> Result<bool, AppError> {
        Ok(self
            .saved
            .lock()
            .expect("outbox lock")
            .remove(user_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_store_never_returns_entries() {
        let store = NoopOutboxStore;
        let user = UserId::new("u1");

        store.save(&user, &[]).expect("save");

        assert!(store.load(&user).expect("load").is_empty());
        assert!(!store.discard(&user).expect("discard"));
    }
}
