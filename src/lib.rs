//! Client-side chat synchronization and delivery core.
//!
//! [`usecases::ChatSession`] is the entry point: it is handed the backend
//! collaborators, bound to a signed-in user and then drives conversations,
//! message delivery with an offline queue, read state and presence.

pub mod backend;
pub mod domain;
pub mod infra;
#[cfg(test)]
mod test_support;
pub mod usecases;
