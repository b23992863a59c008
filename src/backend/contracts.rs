//! Narrow contracts of the backend-as-a-service collaborators.
//!
//! The sync core never talks to a concrete provider; it is handed trait
//! objects implementing these contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    conversation::{
        Conversation, ConversationDetail, LastMessageSummary, NewConversation, NewParticipant,
        Participant,
    },
    ids::{ConversationId, UserId},
    message::{DurableMessage, MessageDraft},
    presence::{PresenceRecord, PresenceState},
};

use super::changes::{Feed, RowChange};

/// Errors reported by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("backend rejected credentials")]
    Unauthorized,
    #[error("backend unavailable")]
    Unavailable,
    #[error("row not found")]
    NotFound,
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("backend returned invalid data: {0}")]
    InvalidData(String),
}

/// Relational storage for conversations, participants and messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_conversation(&self, row: NewConversation) -> Result<Conversation, StoreError>;

    async fn insert_participant(&self, row: NewParticipant) -> Result<Participant, StoreError>;

    /// Containment search for a private conversation whose participant set is `{a, b}`.
    async fn find_private_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationDetail>, StoreError>;

    /// Conversations containing `user_id`, joined with participant rows,
    /// most recently updated first.
    async fn list_conversations_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationDetail>, StoreError>;

    async fn list_participant_rows_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Participant>, StoreError>;

    async fn list_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Participant>, StoreError>;

    async fn insert_message(&self, draft: &MessageDraft) -> Result<DurableMessage, StoreError>;

    /// Writes the denormalized last-message fields and bumps `updated_at`.
    async fn touch_conversation(
        &self,
        conversation_id: &ConversationId,
        summary: LastMessageSummary,
    ) -> Result<Conversation, StoreError>;

    /// Server-side atomic `unread_count = unread_count + 1`.
    async fn increment_unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), StoreError>;

    /// Sets `unread_count = 0` and `last_read_at = at`, unless the row is
    /// already read (zero unread and a read timestamp), in which case it is
    /// left untouched.
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// At most `limit` messages created strictly before `before`, newest first.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<DurableMessage>, StoreError>;
}

/// Real-time change feeds and the presence channel.
#[async_trait]
pub trait RealtimeSource: Send + Sync {
    /// Changes to conversations containing `user_id`.
    async fn conversation_changes(
        &self,
        user_id: &UserId,
    ) -> Result<Feed<RowChange<Conversation>>, StoreError>;

    /// Changes to the participant rows of `user_id`.
    async fn participant_changes(
        &self,
        user_id: &UserId,
    ) -> Result<Feed<RowChange<Participant>>, StoreError>;

    /// Joins `channel` announcing `me`; every event is the full channel state.
    async fn join_presence(
        &self,
        channel: &str,
        me: PresenceRecord,
    ) -> Result<Feed<PresenceState>, StoreError>;
}

/// Object storage for message attachments.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Uploads `bytes` and returns the public URL.
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String, StoreError>;
}
