use std::collections::BTreeSet;

use super::{
    conversation::Conversation,
    ids::{ConversationId, TempId, UserId},
    message::DurableMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectivityStatus {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Everything the sync core pushes to screens, on a single bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConversationInserted(Conversation),
    ConversationUpdated(Conversation),
    ConversationDeleted(ConversationId),
    UnreadChanged {
        conversation_id: ConversationId,
        count: u32,
    },
    PresenceSynced(BTreeSet<UserId>),
    MessageReconciled {
        temp_id: TempId,
        message: DurableMessage,
    },
    MessageDeadLettered {
        temp_id: TempId,
        conversation_id: ConversationId,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConversationInserted(_) => "conversation_inserted",
            Self::ConversationUpdated(_) => "conversation_updated",
            Self::ConversationDeleted(_) => "conversation_deleted",
            Self::UnreadChanged { .. } => "unread_changed",
            Self::PresenceSynced(_) => "presence_synced",
            Self::MessageReconciled { .. } => "message_reconciled",
            Self::MessageDeadLettered { .. } => "message_dead_lettered",
        }
    }
}
