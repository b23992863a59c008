use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix reserved for client-generated message ids.
pub const TEMP_ID_PREFIX: &str = "tmp-";

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

opaque_id!(
    /// Authenticated user identity as issued by the backend.
    UserId
);
opaque_id!(ConversationId);
opaque_id!(
    /// Durable message identity assigned by the store.
    MessageId
);
opaque_id!(
    /// Client-assigned placeholder identity of a message that is not durable yet.
    TempId
);

impl TempId {
    /// Generates `tmp-<unix ms>-<random>`.
    pub fn generate() -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0);
        let suffix: u64 = rand::thread_rng().gen();
        Self(format!("{TEMP_ID_PREFIX}{now_ms:013}-{suffix:016x}"))
    }
}

impl MessageId {
    /// Returns true when the id uses the reserved temp-id namespace.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}
