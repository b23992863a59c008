use crate::{
    backend::StoreError,
    domain::ids::{TempId, UserId},
    infra::error::AppError,
};

/// Failures surfaced by the sync core to the screens above it.
///
/// Queuing a message while offline is not an error: it is reported as a
/// pending message.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat session is not initialized")]
    NotInitialized,
    #[error("chat session is already initialized for {0}")]
    AlreadyInitialized(UserId),
    #[error("invalid participants: {0}")]
    InvalidParticipants(&'static str),
    #[error("failed to read {operation}: {source}")]
    StoreRead {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to write {operation}: {source}")]
    StoreWrite {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("message send was rejected: {0}")]
    Send(#[source] StoreError),
    #[error("queued message {temp_id} failed again on replay: {source}")]
    QueueReplay {
        temp_id: TempId,
        #[source]
        source: StoreError,
    },
    #[error("operation requires connectivity")]
    Offline,
    #[error("attachment upload failed: {0}")]
    Upload(#[source] StoreError),
    #[error("realtime subscriptions are {0}")]
    Subscription(&'static str),
    #[error("no queued message with id {0}")]
    UnknownPendingMessage(TempId),
    #[error("outbox persistence failed: {0}")]
    Outbox(#[source] AppError),
}

impl ChatError {
    pub(crate) fn read(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::StoreRead { operation, source }
    }

    pub(crate) fn write(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::StoreWrite { operation, source }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreRead { source, .. }
            | Self::StoreWrite { source, .. }
            | Self::Send(source)
            | Self::QueueReplay { source, .. }
            | Self::Upload(source) => matches!(source, StoreError::Unavailable),
            Self::Offline => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_backend_is_transient() {
        let err = ChatError::read("messages")(StoreError::Unavailable);

        assert!(err.is_transient());
        assert_eq!(err.to_string(), "failed to read messages: backend unavailable");
    }

    #[test]
    fn rejected_write_is_not_transient() {
        let err = ChatError::write("participants")(StoreError::Rejected("rls".to_owned()));

        assert!(!err.is_transient());
    }

    #[test]
    fn state_errors_are_not_transient() {
        assert!(!ChatError::NotInitialized.is_transient());
        assert!(!ChatError::InvalidParticipants("private needs two").is_transient());
    }
}
