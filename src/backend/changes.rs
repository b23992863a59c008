use async_trait::async_trait;
use tokio::sync::mpsc;

use super::contracts::StoreError;

/// Row-level change pushed by a real-time feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange<T> {
    Insert { new: T },
    Update { old: Option<T>, new: T },
    Delete { old: T },
}

impl<T> RowChange<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "INSERT",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
        }
    }
}

/// The three independent feeds the sync core listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedKind {
    Conversations,
    Unread,
    Presence,
}

impl FeedKind {
    pub const ALL: [FeedKind; 3] = [FeedKind::Conversations, FeedKind::Unread, FeedKind::Presence];

    pub fn as_label(self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::Unread => "unread",
            Self::Presence => "presence",
        }
    }
}

/// Tears down one backend subscription.
#[async_trait]
pub trait FeedCloser: Send {
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// An established subscription: a stream of events plus its teardown handle.
pub struct Feed<T> {
    pub events: mpsc::UnboundedReceiver<T>,
    pub closer: Box<dyn FeedCloser>,
}

impl<T> std::fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed").finish_non_exhaustive()
    }
}
