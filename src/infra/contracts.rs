use crate::{
    domain::{ids::UserId, outbox::QueueEntry},
    infra::error::AppError,
};

/// Durable home of a user's message queue across restarts.
pub trait OutboxStore: Send + Sync {
    /// Entries saved for `user_id`; empty when nothing was saved.
    fn load(&self, user_id: &UserId) -> Result<Vec<QueueEntry>, AppError>;

    /// Replaces the saved entries for `user_id`.
    fn save(&self, user_id: &UserId, entries: &[QueueEntry]) -> Result<(), AppError>;

    /// Removes everything saved for `user_id`; returns whether anything existed.
    fn discard(&self, user_id: &UserId) -> Result<bool, AppError>;
}
