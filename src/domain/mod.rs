//! Domain layer: chat records, identities and sync events.

pub mod conversation;
pub mod events;
pub mod ids;
pub mod message;
pub mod outbox;
pub mod presence;

/// Returns the domain module name for smoke checks.
pub fn module_name() -> &'static str {
    "domain"
}
