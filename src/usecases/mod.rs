//! Use case layer: the chat session and the workflows it orchestrates.

pub mod bootstrap;
pub mod context;
pub mod conversations;
pub mod dispatcher;
pub mod errors;
pub mod event_bus;
pub mod outbox;
pub mod realtime;
pub mod session;

pub use dispatcher::{MessagesQuery, SyncReport};
pub use errors::ChatError;
pub use realtime::{SyncCallbacks, UnsubscribeReport};
pub use session::{ChatSession, SessionDeps, Subscription};

/// Returns the usecases module name for smoke checks.
pub fn module_name() -> &'static str {
    "usecases"
}
