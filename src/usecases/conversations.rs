use std::{collections::HashMap, sync::Arc};

use chrono::Utc;

use crate::{
    backend::ChatStore,
    domain::{
        conversation::{
            Conversation, ConversationDetail, ConversationKind, NewConversation, NewParticipant,
            ParticipantRole,
        },
        ids::{ConversationId, UserId},
    },
};

use super::errors::ChatError;

const CONVERSATION_REUSED: &str = "CONVERSATION_REUSED";
const PARTICIPANT_INSERT_FAILED: &str = "PARTICIPANT_INSERT_FAILED";
const CONVERSATION_CREATED: &str = "CONVERSATION_CREATED";
const PARTICIPANT_REPAIR_FAILED: &str = "PARTICIPANT_REPAIR_FAILED";
const PARTICIPANTS_REPAIRED: &str = "PARTICIPANTS_REPAIRED";

/// Conversation lifecycle on behalf of the signed-in user.
pub struct ConversationManager {
    store: Arc<dyn ChatStore>,
    user_id: UserId,
}

/// Participants a repair pass wrote back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepairOutcome {
    pub inserted: Vec<UserId>,
    pub still_missing: Vec<UserId>,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn ChatStore>, user_id: UserId) -> Self {
        Self { store, user_id }
    }

    /// Creates a conversation, reusing an existing private one between the
    /// same two users.
    pub async fn create_conversation(
        &self,
        participant_ids: &[UserId],
        kind: ConversationKind,
    ) -> Result<Conversation, ChatError> {
        let members = normalize_participants(&self.user_id, participant_ids, kind)?;

        if kind == ConversationKind::Private {
            let existing = self
                .store
                .find_private_conversation(&members[0], &members[1])
                .await
                .map_err(ChatError::read("private conversation"))?;
            if let Some(conversation) = existing {
                tracing::debug!(
                    code = CONVERSATION_REUSED,
                    conversation_id = %conversation.id,
                    "reusing existing private conversation"
                );
                return Ok(conversation);
            }
        }

        let conversation = self
            .store
            .insert_conversation(NewConversation {
                kind,
                created_by: self.user_id.clone(),
                participant_ids: members.clone(),
                created_at: Utc::now(),
            })
            .await
            .map_err(ChatError::write("conversation"))?;

        let mut failed = Vec::new();
        for user_id in &members {
            let role = if user_id == &self.user_id {
                ParticipantRole::Admin
            } else {
                ParticipantRole::Member
            };
            let row = NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id: user_id.clone(),
                role,
            };
            if let Err(source) = self.store.insert_participant(row).await {
                tracing::warn!(
                    code = PARTICIPANT_INSERT_FAILED,
                    conversation_id = %conversation.id,
                    user_id = %user_id,
                    error = %source,
                    "participant row was not written"
                );
                failed.push(source);
            }
        }

        if let Some(source) = failed.into_iter().next() {
            return Err(ChatError::StoreWrite {
                operation: "participants",
                source,
            });
        }

        tracing::info!(
            code = CONVERSATION_CREATED,
            conversation_id = %conversation.id,
            kind = kind.as_label(),
            members = members.len(),
            "conversation created"
        );
        Ok(conversation)
    }

    /// Conversations of the user with their participant rows, most
    /// recently active first.
    pub async fn get_user_conversations(&self) -> Result<Vec<ConversationDetail>, ChatError> {
        let mut details = self
            .store
            .list_conversations_for_user(&self.user_id)
            .await
            .map_err(ChatError::read("conversations"))?;
        details.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));
        Ok(details)
    }

    pub async fn get_unread_counts(&self) -> Result<HashMap<ConversationId, u32>, ChatError> {
        let rows = self
            .store
            .list_participant_rows_for_user(&self.user_id)
            .await
            .map_err(ChatError::read("unread counts"))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.conversation_id, row.unread_count))
            .collect())
    }

    /// Writes participant rows missing from a partially created conversation.
    pub async fn repair_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<RepairOutcome, ChatError> {
        let detail = self
            .store
            .get_conversation(conversation_id)
            .await
            .map_err(ChatError::read("conversation"))?
            .ok_or(ChatError::StoreRead {
                operation: "conversation",
                source: crate::backend::StoreError::NotFound,
            })?;

        let mut outcome = RepairOutcome::default();
        for user_id in detail.missing_participants() {
            let role = if user_id == detail.conversation.created_by {
                ParticipantRole::Admin
            } else {
                ParticipantRole::Member
            };
            let row = NewParticipant {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                role,
            };
            match self.store.insert_participant(row).await {
                Ok(_) => outcome.inserted.push(user_id),
                Err(error) => {
                    tracing::warn!(
                        code = PARTICIPANT_REPAIR_FAILED,
                        conversation_id = %conversation_id,
                        user_id = %user_id,
                        error = %error,
                        "participant row is still missing"
                    );
                    outcome.still_missing.push(user_id);
                }
            }
        }

        if !outcome.inserted.is_empty() {
            tracing::info!(
                code = PARTICIPANTS_REPAIRED,
                conversation_id = %conversation_id,
                inserted = outcome.inserted.len(),
                "missing participant rows written"
            );
        }
        Ok(outcome)
    }
}

/// Deduplicates members keeping first occurrence, with the creator first.
fn normalize_participants(
    creator: &UserId,
    participant_ids: &[UserId],
    kind: ConversationKind,
) -> Result<Vec<UserId>, ChatError> {
    let mut members = vec![creator.clone()];
    for user_id in participant_ids {
        if !members.contains(user_id) {
            members.push(user_id.clone());
        }
    }

    match kind {
        ConversationKind::Private if members.len() != 2 => Err(ChatError::InvalidParticipants(
            "a private conversation has exactly two distinct participants",
        )),
        ConversationKind::Group if members.len() < 2 => Err(ChatError::InvalidParticipants(
            "a group needs at least one member besides its creator",
        )),
        _ => Ok(members),
    }
}
