//! Infrastructure layer: config, logging, storage layout and outbox persistence.

pub mod config;
pub mod contracts;
pub mod error;
pub mod logging;
pub mod outbox_file;
pub mod storage_layout;
pub mod stubs;

/// Returns the infra module name for smoke checks.
pub fn module_name() -> &'static str {
    "infra"
}
