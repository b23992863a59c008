//! Backend integration layer: store contracts, change feeds and adapters.

pub mod changes;
pub mod connectivity;
pub mod contracts;
pub mod memory;

pub use changes::{Feed, FeedCloser, FeedKind, RowChange};
pub use contracts::{BlobUploader, ChatStore, RealtimeSource, StoreError};

/// Returns the backend module name for smoke checks.
pub fn module_name() -> &'static str {
    "backend"
}
