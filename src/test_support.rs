use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::mpsc;

use crate::domain::{
    ids::{ConversationId, UserId},
    message::{MessageDraft, MessageKind},
};

static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().expect("env lock should not be poisoned")
}

pub fn draft(conversation: &str, sender: &str, text: &str) -> MessageDraft {
    MessageDraft {
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        content: text.to_owned(),
        kind: MessageKind::Text,
        attachments: Vec::new(),
    }
}

/// Next value from a callback channel, or `None` after a second of silence.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()
        .flatten()
}
