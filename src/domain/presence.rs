use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::UserId;

/// One presence record published by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub online_at: DateTime<Utc>,
}

/// Presence channel state: connection key -> records published on that connection.
pub type PresenceState = HashMap<String, Vec<PresenceRecord>>;

/// Flattens a full presence state into the set of online users.
///
/// A user connected from several devices shows up under several keys and is
/// reported once.
pub fn online_users(state: &PresenceState) -> BTreeSet<UserId> {
    state
        .values()
        .flatten()
        .map(|record| record.user_id.clone())
        .collect()
}
