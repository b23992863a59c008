use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, TempId, UserId};

/// Type of message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Document,
    Location,
    Contact,
}

impl MessageKind {
    /// Returns a preview label for non-text kinds, or None for text.
    pub fn preview_label(&self) -> Option<&'static str> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image => Some("[Photo]"),
            MessageKind::Audio => Some("[Audio]"),
            MessageKind::Document => Some("[Document]"),
            MessageKind::Location => Some("[Location]"),
            MessageKind::Contact => Some("[Contact]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// What the user asked to send. Content is plain text for `text`
/// and a JSON document for `location` and `contact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageDraft {
    /// Preview text used for the conversation's last-message summary.
    pub fn preview(&self) -> String {
        match (self.kind.preview_label(), self.content.is_empty()) {
            (Some(label), true) => label.to_owned(),
            (Some(label), false) if self.kind.carries_caption() => {
                format!("{} {}", label, self.content)
            }
            (Some(label), false) => label.to_owned(),
            (None, _) => self.content.clone(),
        }
    }
}

impl MessageKind {
    fn carries_caption(&self) -> bool {
        matches!(
            self,
            MessageKind::Image | MessageKind::Audio | MessageKind::Document
        )
    }
}

/// Optimistic message that has no durable identity yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub temp_id: TempId,
    pub draft: MessageDraft,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(draft: MessageDraft) -> Self {
        Self {
            temp_id: TempId::generate(),
            draft,
            status: MessageStatus::Sending,
            created_at: Utc::now(),
        }
    }

    /// Swaps the temp identity for the store's acknowledgement.
    pub fn reconcile(self, durable: DurableMessage) -> Result<Reconciled, ReconcileError> {
        if durable.id.is_reserved() {
            return Err(ReconcileError::ReservedId(durable.id));
        }

        if durable.conversation_id != self.draft.conversation_id {
            return Err(ReconcileError::ConversationMismatch {
                expected: self.draft.conversation_id,
                actual: durable.conversation_id,
            });
        }

        Ok(Reconciled {
            temp_id: self.temp_id,
            message: durable,
        })
    }
}

/// Message acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Pending(PendingMessage),
    Durable(DurableMessage),
}

impl Message {
    /// Stable list key; temp and durable keys live in disjoint namespaces.
    pub fn key(&self) -> &str {
        match self {
            Message::Pending(pending) => pending.temp_id.as_str(),
            Message::Durable(durable) => durable.id.as_str(),
        }
    }

    pub fn status(&self) -> MessageStatus {
        match self {
            Message::Pending(pending) => pending.status,
            Message::Durable(_) => MessageStatus::Sent,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Message::Pending(pending) => &pending.draft.conversation_id,
            Message::Durable(durable) => &durable.conversation_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::Pending(pending) => &pending.draft.content,
            Message::Durable(durable) => &durable.content,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Message::Pending(pending) => pending.created_at,
            Message::Durable(durable) => durable.created_at,
        }
    }
}

/// Result of replacing a temp id with a durable one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub temp_id: TempId,
    pub message: DurableMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("store acknowledged message with reserved id {0}")]
    ReservedId(MessageId),
    #[error("store acknowledged message for {actual}, expected {expected}")]
    ConversationMismatch {
        expected: ConversationId,
        actual: ConversationId,
    },
}
