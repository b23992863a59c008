use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    ids::{ConversationId, UserId},
    message::MessageKind,
};

/// Type of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Two participants, deduplicated by participant set.
    #[default]
    Private,
    Group,
}

impl ConversationKind {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Admin,
    Member,
}

/// Denormalized summary of the newest message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    pub sender_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub created_by: UserId,
    /// Ordered participant set as written at creation time.
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message: Option<LastMessageSummary>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participant_ids.contains(user_id)
    }

    /// True when this is a private conversation between exactly `a` and `b`, in any order.
    pub fn is_private_between(&self, a: &UserId, b: &UserId) -> bool {
        self.kind == ConversationKind::Private
            && self.participant_ids.len() == 2
            && self.has_participant(a)
            && self.has_participant(b)
    }
}

/// Join row between a conversation and one of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

/// Row data for a participant insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewParticipant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
}

/// Row data for a conversation insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub created_by: UserId,
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

/// Conversation joined with its participant rows, as listed for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
}

impl ConversationDetail {
    pub fn unread_for(&self, user_id: &UserId) -> u32 {
        self.participants
            .iter()
            .find(|participant| &participant.user_id == user_id)
            .map(|participant| participant.unread_count)
            .unwrap_or_default()
    }

    /// Participant ids listed on the conversation but without a participant row.
    pub fn missing_participants(&self) -> Vec<UserId> {
        self.conversation
            .participant_ids
            .iter()
            .filter(|id| !self.participants.iter().any(|p| &p.user_id == *id))
            .cloned()
            .collect()
    }
}
