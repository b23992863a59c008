//! In-process backend implementing every store contract.
//!
//! Used by the `demo` command and by tests. Counter increments and read
//! resets run under the backend lock, mirroring server-side RPCs.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{
    conversation::{
        Conversation, ConversationDetail, LastMessageSummary, NewConversation, NewParticipant,
        Participant,
    },
    ids::{ConversationId, MessageId, UserId, TEMP_ID_PREFIX},
    message::{DurableMessage, MessageDraft},
    presence::{PresenceRecord, PresenceState},
};

use super::{
    changes::{Feed, FeedCloser, FeedKind, RowChange},
    contracts::{BlobUploader, ChatStore, RealtimeSource, StoreError},
};

#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

#[derive(Debug, Default)]
struct BackendState {
    conversations: Vec<Conversation>,
    participants: Vec<Participant>,
    messages: Vec<DurableMessage>,
    last_message_at: Option<DateTime<Utc>>,
    increment_calls: u64,
    blobs: HashMap<String, usize>,
    next_subscriber_id: u64,
    conversation_subs: Vec<Subscriber<RowChange<Conversation>>>,
    participant_subs: Vec<Subscriber<RowChange<Participant>>>,
    presence_channels: HashMap<String, PresenceState>,
    presence_subs: Vec<PresenceSubscriber>,
    faults: Faults,
}

#[derive(Debug)]
struct Subscriber<T> {
    id: u64,
    user_id: UserId,
    tx: mpsc::UnboundedSender<T>,
}

#[derive(Debug)]
struct PresenceSubscriber {
    id: u64,
    channel: String,
    key: String,
    tx: mpsc::UnboundedSender<PresenceState>,
}

#[derive(Debug, Default)]
struct Faults {
    message_insert_failures: u32,
    garbled_message_acks: u32,
    participant_insert_failures: HashSet<UserId>,
    reads_failing: bool,
    uploads_failing: bool,
    failing_feeds: HashSet<FeedKind>,
    failing_closes: HashSet<FeedKind>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BackendState>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }

    /// Rejects the next `count` message inserts.
    pub fn fail_next_message_inserts(&self, count: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.message_insert_failures = count;
        }
    }

    /// Stores the next `count` messages but acknowledges them with an id
    /// from the temp namespace.
    pub fn garble_next_message_acks(&self, count: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.garbled_message_acks = count;
        }
    }

    pub fn fail_participant_insert(&self, user_id: &UserId) {
        if let Ok(mut state) = self.inner.lock() {
            state
                .faults
                .participant_insert_failures
                .insert(user_id.clone());
        }
    }

    pub fn clear_participant_insert_failures(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.participant_insert_failures.clear();
        }
    }

    pub fn set_reads_failing(&self, failing: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.reads_failing = failing;
        }
    }

    pub fn set_uploads_failing(&self, failing: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.uploads_failing = failing;
        }
    }

    /// Makes subscribing to `kind` fail.
    pub fn fail_feed(&self, kind: FeedKind) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.failing_feeds.insert(kind);
        }
    }

    /// Makes closing a `kind` subscription fail.
    pub fn fail_feed_close(&self, kind: FeedKind) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.failing_closes.insert(kind);
        }
    }

    pub fn unread_count(&self, conversation_id: &ConversationId, user_id: &UserId) -> Option<u32> {
        let state = self.inner.lock().ok()?;
        state
            .participants
            .iter()
            .find(|p| &p.conversation_id == conversation_id && &p.user_id == user_id)
            .map(|p| p.unread_count)
    }

    pub fn messages_in(&self, conversation_id: &ConversationId) -> Vec<DurableMessage> {
        self.inner
            .lock()
            .map(|state| {
                state
                    .messages
                    .iter()
                    .filter(|m| &m.conversation_id == conversation_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn conversation_count(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.conversations.len())
            .unwrap_or_default()
    }

    pub fn increment_calls(&self) -> u64 {
        self.inner
            .lock()
            .map(|state| state.increment_calls)
            .unwrap_or_default()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .lock()
            .map(|state| {
                state.conversation_subs.len()
                    + state.participant_subs.len()
                    + state.presence_subs.len()
            })
            .unwrap_or_default()
    }

    /// Publishes presence for a connection that is not a session of this process.
    pub fn track_presence(&self, channel: &str, key: &str, record: PresenceRecord) {
        if let Ok(mut state) = self.inner.lock() {
            state
                .presence_channels
                .entry(channel.to_owned())
                .or_default()
                .entry(key.to_owned())
                .or_default()
                .push(record);
            state.broadcast_presence(channel);
        }
    }

    pub fn untrack_presence(&self, channel: &str, key: &str) {
        if let Ok(mut state) = self.inner.lock() {
            if let Some(channel_state) = state.presence_channels.get_mut(channel) {
                channel_state.remove(key);
            }
            state.broadcast_presence(channel);
        }
    }

    pub fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let index = state
            .conversations
            .iter()
            .position(|c| &c.id == conversation_id)
            .ok_or(StoreError::NotFound)?;
        let old = state.conversations.remove(index);
        state.publish_conversation(RowChange::Delete { old });
        Ok(())
    }
}

impl BackendState {
    fn read_guard(&self) -> Result<(), StoreError> {
        if self.faults.reads_failing {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    fn next_subscriber_id(&mut self) -> u64 {
        self.next_subscriber_id += 1;
        self.next_subscriber_id
    }

    /// Strictly increasing creation time so pagination cursors stay unambiguous.
    fn next_message_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_message_at {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_message_at = Some(at);
        at
    }

    fn detail(&self, conversation: &Conversation) -> ConversationDetail {
        ConversationDetail {
            conversation: conversation.clone(),
            participants: self
                .participants
                .iter()
                .filter(|p| p.conversation_id == conversation.id)
                .cloned()
                .collect(),
        }
    }

    fn publish_conversation(&mut self, change: RowChange<Conversation>) {
        let conversation = match &change {
            RowChange::Insert { new } | RowChange::Update { new, .. } => new,
            RowChange::Delete { old } => old,
        };
        let members = conversation.participant_ids.clone();
        self.conversation_subs.retain(|sub| {
            if !members.contains(&sub.user_id) {
                return true;
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }

    fn publish_participant(&mut self, change: RowChange<Participant>) {
        let user_id = match &change {
            RowChange::Insert { new } | RowChange::Update { new, .. } => new.user_id.clone(),
            RowChange::Delete { old } => old.user_id.clone(),
        };
        self.participant_subs.retain(|sub| {
            if sub.user_id != user_id {
                return true;
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }

    fn broadcast_presence(&mut self, channel: &str) {
        let snapshot = self
            .presence_channels
            .get(channel)
            .cloned()
            .unwrap_or_default();
        self.presence_subs.retain(|sub| {
            if sub.channel != channel {
                return true;
            }
            sub.tx.send(snapshot.clone()).is_ok()
        });
    }

    fn update_participant<F>(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        mutate: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Participant) -> bool,
    {
        let row = self
            .participants
            .iter_mut()
            .find(|p| &p.conversation_id == conversation_id && &p.user_id == user_id)
            .ok_or(StoreError::NotFound)?;
        let old = row.clone();
        if !mutate(row) {
            return Ok(());
        }
        let new = row.clone();
        self.publish_participant(RowChange::Update {
            old: Some(old),
            new,
        });
        Ok(())
    }
}

#[async_trait]
impl ChatStore for InMemoryBackend {
    async fn insert_conversation(&self, row: NewConversation) -> Result<Conversation, StoreError> {
        let mut state = self.state()?;
        let conversation = Conversation {
            id: ConversationId::new(Uuid::new_v4().to_string()),
            kind: row.kind,
            created_by: row.created_by,
            participant_ids: row.participant_ids,
            created_at: row.created_at,
            updated_at: row.created_at,
            last_message: None,
        };
        state.conversations.push(conversation.clone());
        state.publish_conversation(RowChange::Insert {
            new: conversation.clone(),
        });
        Ok(conversation)
    }

    async fn insert_participant(&self, row: NewParticipant) -> Result<Participant, StoreError> {
        let mut state = self.state()?;
        if state.faults.participant_insert_failures.contains(&row.user_id) {
            return Err(StoreError::Rejected(format!(
                "participant insert refused for {}",
                row.user_id
            )));
        }
        if !state.conversations.iter().any(|c| c.id == row.conversation_id) {
            return Err(StoreError::NotFound);
        }
        if state
            .participants
            .iter()
            .any(|p| p.conversation_id == row.conversation_id && p.user_id == row.user_id)
        {
            return Err(StoreError::Rejected("duplicate participant".to_owned()));
        }

        let participant = Participant {
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            role: row.role,
            joined_at: Utc::now(),
            last_read_at: None,
            unread_count: 0,
        };
        state.participants.push(participant.clone());
        state.publish_participant(RowChange::Insert {
            new: participant.clone(),
        });
        Ok(participant)
    }

    async fn find_private_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<Conversation>, StoreError> {
        let state = self.state()?;
        state.read_guard()?;
        Ok(state
            .conversations
            .iter()
            .find(|c| c.is_private_between(a, b))
            .cloned())
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationDetail>, StoreError> {
        let state = self.state()?;
        state.read_guard()?;
        Ok(state
            .conversations
            .iter()
            .find(|c| &c.id == conversation_id)
            .map(|c| state.detail(c)))
    }

    async fn list_conversations_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationDetail>, StoreError> {
        let state = self.state()?;
        state.read_guard()?;
        let mut details: Vec<ConversationDetail> = state
            .conversations
            .iter()
            .filter(|c| c.has_participant(user_id))
            .map(|c| state.detail(c))
            .collect();
        details.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));
        Ok(details)
    }

    async fn list_participant_rows_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Participant>, StoreError> {
        let state = self.state()?;
        state.read_guard()?;
        Ok(state
            .participants
            .iter()
            .filter(|p| &p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Participant>, StoreError> {
        let state = self.state()?;
        state.read_guard()?;
        Ok(state
            .participants
            .iter()
            .filter(|p| &p.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, draft: &MessageDraft) -> Result<DurableMessage, StoreError> {
        let mut state = self.state()?;
        if state.faults.message_insert_failures > 0 {
            state.faults.message_insert_failures -= 1;
            return Err(StoreError::Unavailable);
        }
        if !state
            .conversations
            .iter()
            .any(|c| c.id == draft.conversation_id)
        {
            return Err(StoreError::NotFound);
        }

        let created_at = state.next_message_time();
        let message = DurableMessage {
            id: MessageId::new(Uuid::new_v4().to_string()),
            conversation_id: draft.conversation_id.clone(),
            sender_id: draft.sender_id.clone(),
            content: draft.content.clone(),
            kind: draft.kind,
            attachments: draft.attachments.clone(),
            created_at,
            updated_at: created_at,
        };
        state.messages.push(message.clone());
        if state.faults.garbled_message_acks > 0 {
            state.faults.garbled_message_acks -= 1;
            return Ok(DurableMessage {
                id: MessageId::new(format!("{TEMP_ID_PREFIX}{}", message.id)),
                ..message
            });
        }
        Ok(message)
    }

    async fn touch_conversation(
        &self,
        conversation_id: &ConversationId,
        summary: LastMessageSummary,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state()?;
        let row = state
            .conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)
            .ok_or(StoreError::NotFound)?;
        let old = row.clone();
        row.updated_at = summary.sent_at.max(Utc::now());
        row.last_message = Some(summary);
        let new = row.clone();
        state.publish_conversation(RowChange::Update {
            old: Some(old),
            new: new.clone(),
        });
        Ok(new)
    }

    async fn increment_unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.increment_calls += 1;
        state.update_participant(conversation_id, user_id, |row| {
            row.unread_count = row.unread_count.saturating_add(1);
            true
        })
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.update_participant(conversation_id, user_id, |row| {
            if row.unread_count == 0 && row.last_read_at.is_some() {
                return false;
            }
            row.unread_count = 0;
            row.last_read_at = Some(at);
            true
        })
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<DurableMessage>, StoreError> {
        let state = self.state()?;
        state.read_guard()?;
        let mut page: Vec<DurableMessage> = state
            .messages
            .iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .filter(|m| before.map_or(true, |cursor| m.created_at < cursor))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit);
        Ok(page)
    }
}

struct MemoryFeedCloser {
    backend: Arc<Mutex<BackendState>>,
    kind: FeedKind,
    subscriber_id: u64,
}

#[async_trait]
impl FeedCloser for MemoryFeedCloser {
    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.backend.lock().map_err(|_| StoreError::Unavailable)?;
        if state.faults.failing_closes.contains(&self.kind) {
            return Err(StoreError::Unavailable);
        }

        let id = self.subscriber_id;
        match self.kind {
            FeedKind::Conversations => state.conversation_subs.retain(|sub| sub.id != id),
            FeedKind::Unread => state.participant_subs.retain(|sub| sub.id != id),
            FeedKind::Presence => {
                let removed: Vec<(String, String)> = state
                    .presence_subs
                    .iter()
                    .filter(|sub| sub.id == id)
                    .map(|sub| (sub.channel.clone(), sub.key.clone()))
                    .collect();
                state.presence_subs.retain(|sub| sub.id != id);
                for (channel, key) in removed {
                    if let Some(channel_state) = state.presence_channels.get_mut(&channel) {
                        channel_state.remove(&key);
                    }
                    state.broadcast_presence(&channel);
                }
            }
        }
        Ok(())
    }
}

impl InMemoryBackend {
    fn closer(&self, kind: FeedKind, subscriber_id: u64) -> Box<dyn FeedCloser> {
        Box::new(MemoryFeedCloser {
            backend: Arc::clone(&self.inner),
            kind,
            subscriber_id,
        })
    }
}

#[async_trait]
impl RealtimeSource for InMemoryBackend {
    async fn conversation_changes(
        &self,
        user_id: &UserId,
    ) -> Result<Feed<RowChange<Conversation>>, StoreError> {
        let mut state = self.state()?;
        if state.faults.failing_feeds.contains(&FeedKind::Conversations) {
            return Err(StoreError::Unavailable);
        }
        let (tx, events) = mpsc::unbounded_channel();
        let id = state.next_subscriber_id();
        state.conversation_subs.push(Subscriber {
            id,
            user_id: user_id.clone(),
            tx,
        });
        Ok(Feed {
            events,
            closer: self.closer(FeedKind::Conversations, id),
        })
    }

    async fn participant_changes(
        &self,
        user_id: &UserId,
    ) -> Result<Feed<RowChange<Participant>>, StoreError> {
        let mut state = self.state()?;
        if state.faults.failing_feeds.contains(&FeedKind::Unread) {
            return Err(StoreError::Unavailable);
        }
        let (tx, events) = mpsc::unbounded_channel();
        let id = state.next_subscriber_id();
        state.participant_subs.push(Subscriber {
            id,
            user_id: user_id.clone(),
            tx,
        });
        Ok(Feed {
            events,
            closer: self.closer(FeedKind::Unread, id),
        })
    }

    async fn join_presence(
        &self,
        channel: &str,
        me: PresenceRecord,
    ) -> Result<Feed<PresenceState>, StoreError> {
        let mut state = self.state()?;
        if state.faults.failing_feeds.contains(&FeedKind::Presence) {
            return Err(StoreError::Unavailable);
        }
        let (tx, events) = mpsc::unbounded_channel();
        let id = state.next_subscriber_id();
        let key = format!("{}:{id}", me.user_id);
        state.presence_subs.push(PresenceSubscriber {
            id,
            channel: channel.to_owned(),
            key: key.clone(),
            tx,
        });
        state
            .presence_channels
            .entry(channel.to_owned())
            .or_default()
            .insert(key, vec![me]);
        state.broadcast_presence(channel);
        Ok(Feed {
            events,
            closer: self.closer(FeedKind::Presence, id),
        })
    }
}

#[async_trait]
impl BlobUploader for InMemoryBackend {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String, StoreError> {
        let mut state = self.state()?;
        if state.faults.uploads_failing {
            return Err(StoreError::Unavailable);
        }
        let extension = mime_type.rsplit('/').next().unwrap_or("bin");
        let url = format!("memory://attachments/{}.{extension}", Uuid::new_v4());
        state.blobs.insert(url.clone(), bytes.len());
        Ok(url)
    }
}
