//! Real-time subscriptions: three independent backend feeds forwarded onto
//! the event bus, and listeners dispatching bus events to callbacks.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::{
    backend::{Feed, FeedCloser, FeedKind, RealtimeSource, RowChange, StoreError},
    domain::{
        conversation::{Conversation, Participant},
        events::SyncEvent,
        ids::{ConversationId, TempId, UserId},
        message::DurableMessage,
        presence::{online_users, PresenceRecord, PresenceState},
    },
};

use super::{errors::ChatError, event_bus::EventBus};

const SYNC_LISTENER_LAGGED: &str = "SYNC_LISTENER_LAGGED";
const FEED_SUBSCRIBE_FAILED: &str = "FEED_SUBSCRIBE_FAILED";
const REALTIME_SUBSCRIBED: &str = "REALTIME_SUBSCRIBED";
const FEED_CLOSE_FAILED: &str = "FEED_CLOSE_FAILED";
const REALTIME_UNSUBSCRIBED: &str = "REALTIME_UNSUBSCRIBED";

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

/// Optional handlers invoked for events on the bus.
#[derive(Default)]
pub struct SyncCallbacks {
    on_new_conversation: Option<Handler<Conversation>>,
    on_conversation_updated: Option<Handler<Conversation>>,
    on_conversation_deleted: Option<Handler<ConversationId>>,
    on_unread_count_changed: Option<Handler<(ConversationId, u32)>>,
    on_presence_changed: Option<Handler<BTreeSet<UserId>>>,
    on_message_reconciled: Option<Handler<(TempId, DurableMessage)>>,
    on_message_failed: Option<Handler<(TempId, ConversationId)>>,
}

impl SyncCallbacks {
    pub fn on_new_conversation(mut self, f: impl Fn(Conversation) + Send + Sync + 'static) -> Self {
        self.on_new_conversation = Some(Box::new(f));
        self
    }

    pub fn on_conversation_updated(
        mut self,
        f: impl Fn(Conversation) + Send + Sync + 'static,
    ) -> Self {
        self.on_conversation_updated = Some(Box::new(f));
        self
    }

    pub fn on_conversation_deleted(
        mut self,
        f: impl Fn(ConversationId) + Send + Sync + 'static,
    ) -> Self {
        self.on_conversation_deleted = Some(Box::new(f));
        self
    }

    pub fn on_unread_count_changed(
        mut self,
        f: impl Fn(ConversationId, u32) + Send + Sync + 'static,
    ) -> Self {
        self.on_unread_count_changed = Some(Box::new(move |(id, count)| f(id, count)));
        self
    }

    pub fn on_presence_changed(
        mut self,
        f: impl Fn(BTreeSet<UserId>) + Send + Sync + 'static,
    ) -> Self {
        self.on_presence_changed = Some(Box::new(f));
        self
    }

    pub fn on_message_reconciled(
        mut self,
        f: impl Fn(TempId, DurableMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_message_reconciled = Some(Box::new(move |(temp, message)| f(temp, message)));
        self
    }

    pub fn on_message_failed(
        mut self,
        f: impl Fn(TempId, ConversationId) + Send + Sync + 'static,
    ) -> Self {
        self.on_message_failed = Some(Box::new(move |(temp, conversation)| f(temp, conversation)));
        self
    }

    fn dispatch(&self, event: SyncEvent) {
        match event {
            SyncEvent::ConversationInserted(conversation) => {
                call(&self.on_new_conversation, conversation)
            }
            SyncEvent::ConversationUpdated(conversation) => {
                call(&self.on_conversation_updated, conversation)
            }
            SyncEvent::ConversationDeleted(id) => call(&self.on_conversation_deleted, id),
            SyncEvent::UnreadChanged {
                conversation_id,
                count,
            } => call(&self.on_unread_count_changed, (conversation_id, count)),
            SyncEvent::PresenceSynced(users) => call(&self.on_presence_changed, users),
            SyncEvent::MessageReconciled { temp_id, message } => {
                call(&self.on_message_reconciled, (temp_id, message))
            }
            SyncEvent::MessageDeadLettered {
                temp_id,
                conversation_id,
            } => call(&self.on_message_failed, (temp_id, conversation_id)),
        }
    }
}

fn call<T>(handler: &Option<Handler<T>>, value: T) {
    if let Some(handler) = handler {
        handler(value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Uninitialized,
    Subscribed,
    Unsubscribed,
}

impl SubscriptionState {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

/// Which feeds came up when subscribing.
#[derive(Debug, Default)]
pub struct FeedReport {
    pub established: Vec<FeedKind>,
    pub failed: Vec<(FeedKind, StoreError)>,
}

/// What tearing down the feeds achieved; every close is attempted.
#[derive(Debug, Default)]
pub struct UnsubscribeReport {
    pub closed: Vec<FeedKind>,
    pub failed: Vec<(FeedKind, StoreError)>,
}

impl UnsubscribeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ActiveFeed {
    kind: FeedKind,
    closer: Box<dyn FeedCloser>,
    forwarder: JoinHandle<()>,
}

pub struct RealtimeSubscriptionManager {
    source: Arc<dyn RealtimeSource>,
    bus: EventBus,
    user_id: UserId,
    presence_channel: String,
    state: SubscriptionState,
    feeds: Vec<ActiveFeed>,
    listeners: Vec<JoinHandle<()>>,
    online: Arc<Mutex<BTreeSet<UserId>>>,
}

impl RealtimeSubscriptionManager {
    pub fn new(
        source: Arc<dyn RealtimeSource>,
        bus: EventBus,
        user_id: UserId,
        presence_channel: impl Into<String>,
    ) -> Self {
        Self {
            source,
            bus,
            user_id,
            presence_channel: presence_channel.into(),
            state: SubscriptionState::Uninitialized,
            feeds: Vec::new(),
            listeners: Vec::new(),
            online: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn online_users(&self) -> BTreeSet<UserId> {
        self.online
            .lock()
            .map(|users| users.clone())
            .unwrap_or_default()
    }

    /// Starts dispatching bus events to `callbacks`.
    ///
    /// The bus receiver is taken before returning, so events published
    /// after this call reach the callbacks.
    pub fn listen(&mut self, callbacks: SyncCallbacks) -> Result<(), ChatError> {
        if self.state == SubscriptionState::Unsubscribed {
            return Err(ChatError::Subscription(self.state.as_label()));
        }

        let mut rx = self.bus.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callbacks.dispatch(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            code = SYNC_LISTENER_LAGGED,
                            skipped,
                            "listener fell behind, events skipped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.listeners.push(handle);
        Ok(())
    }

    /// Establishes the three feeds. Each is independent: one failing does
    /// not prevent the others.
    pub async fn subscribe(&mut self) -> Result<FeedReport, ChatError> {
        if self.state != SubscriptionState::Uninitialized {
            return Err(ChatError::Subscription(self.state.as_label()));
        }

        let mut report = FeedReport::default();
        for kind in FeedKind::ALL {
            match self.open(kind).await {
                Ok(feed) => {
                    self.feeds.push(feed);
                    report.established.push(kind);
                }
                Err(error) => {
                    tracing::warn!(
                        code = FEED_SUBSCRIBE_FAILED,
                        feed = kind.as_label(),
                        error = %error,
                        "realtime feed unavailable"
                    );
                    report.failed.push((kind, error));
                }
            }
        }

        self.state = SubscriptionState::Subscribed;
        tracing::info!(
            code = REALTIME_SUBSCRIBED,
            user_id = %self.user_id,
            established = report.established.len(),
            failed = report.failed.len(),
            "realtime feeds established"
        );
        Ok(report)
    }

    /// Stops listeners and forwarders, then closes every feed.
    pub async fn unsubscribe(&mut self) -> UnsubscribeReport {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }

        let mut report = UnsubscribeReport::default();
        for feed in self.feeds.drain(..) {
            feed.forwarder.abort();
            match feed.closer.close().await {
                Ok(()) => report.closed.push(feed.kind),
                Err(error) => {
                    tracing::warn!(
                        code = FEED_CLOSE_FAILED,
                        feed = feed.kind.as_label(),
                        error = %error,
                        "realtime feed did not close cleanly"
                    );
                    report.failed.push((feed.kind, error));
                }
            }
        }

        if let Ok(mut online) = self.online.lock() {
            online.clear();
        }
        self.state = SubscriptionState::Unsubscribed;
        tracing::info!(
            code = REALTIME_UNSUBSCRIBED,
            user_id = %self.user_id,
            closed = report.closed.len(),
            failed = report.failed.len(),
            "realtime feeds torn down"
        );
        report
    }

    async fn open(&self, kind: FeedKind) -> Result<ActiveFeed, StoreError> {
        let bus = self.bus.clone();
        let user_id = self.user_id.clone();

        let (closer, forwarder) = match kind {
            FeedKind::Conversations => {
                let Feed { events, closer } = self.source.conversation_changes(&user_id).await?;
                (closer, forward(kind, events, bus, conversation_event))
            }
            FeedKind::Unread => {
                let Feed { events, closer } = self.source.participant_changes(&user_id).await?;
                (
                    closer,
                    forward(kind, events, bus, move |change: RowChange<Participant>| {
                        unread_event(&user_id, change)
                    }),
                )
            }
            FeedKind::Presence => {
                let me = PresenceRecord {
                    user_id: user_id.clone(),
                    online_at: Utc::now(),
                };
                let Feed { events, closer } =
                    self.source.join_presence(&self.presence_channel, me).await?;
                let online = Arc::clone(&self.online);
                (
                    closer,
                    forward(kind, events, bus, move |state: PresenceState| {
                        let users = online_users(&state);
                        if let Ok(mut snapshot) = online.lock() {
                            *snapshot = users.clone();
                        }
                        Some(SyncEvent::PresenceSynced(users))
                    }),
                )
            }
        };

        Ok(ActiveFeed {
            kind,
            closer,
            forwarder,
        })
    }
}

impl Drop for RealtimeSubscriptionManager {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
        for feed in &self.feeds {
            feed.forwarder.abort();
        }
    }
}

fn forward<T, F>(
    kind: FeedKind,
    mut events: tokio::sync::mpsc::UnboundedReceiver<T>,
    bus: EventBus,
    map: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Option<SyncEvent> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(raw) = events.recv().await {
            if let Some(event) = map(raw) {
                bus.publish(event);
            }
        }
        tracing::debug!(feed = kind.as_label(), "realtime feed ended");
    })
}

fn conversation_event(change: RowChange<Conversation>) -> Option<SyncEvent> {
    Some(match change {
        RowChange::Insert { new } => SyncEvent::ConversationInserted(new),
        RowChange::Update { new, .. } => SyncEvent::ConversationUpdated(new),
        RowChange::Delete { old } => SyncEvent::ConversationDeleted(old.id),
    })
}

fn unread_event(user_id: &UserId, change: RowChange<Participant>) -> Option<SyncEvent> {
    match change {
        RowChange::Update { new, .. } if &new.user_id == user_id => Some(SyncEvent::UnreadChanged {
            conversation_id: new.conversation_id,
            count: new.unread_count,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, ChatStore},
        domain::{
            conversation::{
                ConversationKind, LastMessageSummary, NewConversation, NewParticipant,
                ParticipantRole,
            },
            message::MessageKind,
        },
        test_support::recv_within,
    };

    fn manager(backend: &InMemoryBackend, user: &str) -> RealtimeSubscriptionManager {
        RealtimeSubscriptionManager::new(
            Arc::new(backend.clone()),
            EventBus::new(32),
            UserId::new(user),
            "online-users",
        )
    }

    fn record(user: &str) -> PresenceRecord {
        PresenceRecord {
            user_id: UserId::new(user),
            online_at: Utc::now(),
        }
    }

    #[test]
    fn unread_event_ignores_other_users_and_inserts() {
        let row = Participant {
            conversation_id: ConversationId::new("c1"),
            user_id: UserId::new("u2"),
            role: ParticipantRole::Member,
            joined_at: Utc::now(),
            last_read_at: None,
            unread_count: 3,
        };
        let me = UserId::new("u1");

        assert_eq!(
            unread_event(&me, RowChange::Update { old: None, new: row.clone() }),
            None
        );
        assert_eq!(unread_event(&UserId::new("u2"), RowChange::Insert { new: row.clone() }), None);
        assert_eq!(
            unread_event(&UserId::new("u2"), RowChange::Update { old: None, new: row }),
            Some(SyncEvent::UnreadChanged {
                conversation_id: ConversationId::new("c1"),
                count: 3,
            })
        );
    }

    #[tokio::test]
    async fn new_conversation_reaches_callback() {
        let backend = InMemoryBackend::new();
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_new_conversation(move |c| {
                let _ = tx.send(c.id);
            }))
            .expect("listen");
        manager.subscribe().await.expect("subscribe");

        let created = backend
            .insert_conversation(NewConversation {
                kind: ConversationKind::Private,
                created_by: UserId::new("u2"),
                participant_ids: vec![UserId::new("u2"), UserId::new("u1")],
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        assert_eq!(recv_within(&mut rx).await, Some(created.id));
    }

    async fn shared_conversation(backend: &InMemoryBackend) -> Conversation {
        backend
            .insert_conversation(NewConversation {
                kind: ConversationKind::Group,
                created_by: UserId::new("u2"),
                participant_ids: vec![UserId::new("u2"), UserId::new("u1")],
                created_at: Utc::now(),
            })
            .await
            .expect("insert")
    }

    #[tokio::test]
    async fn conversation_updates_reach_callback() {
        let backend = InMemoryBackend::new();
        let conversation = shared_conversation(&backend).await;
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_conversation_updated(move |c| {
                let _ = tx.send(c);
            }))
            .expect("listen");
        manager.subscribe().await.expect("subscribe");

        backend
            .touch_conversation(
                &conversation.id,
                LastMessageSummary {
                    content: "hello".to_owned(),
                    kind: MessageKind::Text,
                    sent_at: Utc::now(),
                    sender_id: UserId::new("u2"),
                },
            )
            .await
            .expect("touch");

        let updated = recv_within(&mut rx).await.expect("update");
        assert_eq!(updated.id, conversation.id);
        assert_eq!(
            updated.last_message.map(|summary| summary.content),
            Some("hello".to_owned())
        );
    }

    #[tokio::test]
    async fn conversation_deletes_reach_callback() {
        let backend = InMemoryBackend::new();
        let conversation = shared_conversation(&backend).await;
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_conversation_deleted(move |id| {
                let _ = tx.send(id);
            }))
            .expect("listen");
        manager.subscribe().await.expect("subscribe");

        backend.delete_conversation(&conversation.id).expect("delete");

        assert_eq!(recv_within(&mut rx).await, Some(conversation.id));
    }

    #[tokio::test]
    async fn presence_is_rebuilt_when_a_user_leaves() {
        let backend = InMemoryBackend::new();
        backend.track_presence("online-users", "u2:phone", record("u2"));
        backend.track_presence("online-users", "u2:tablet", record("u2"));
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_presence_changed(move |users| {
                let _ = tx.send(users);
            }))
            .expect("listen");
        manager.subscribe().await.expect("subscribe");
        let initial = recv_within(&mut rx).await.expect("presence snapshot");
        assert!(initial.contains(&UserId::new("u2")));

        backend.untrack_presence("online-users", "u2:phone");
        backend.untrack_presence("online-users", "u2:tablet");

        let still_connected = recv_within(&mut rx).await.expect("first leave");
        assert!(still_connected.contains(&UserId::new("u2")));
        let after = recv_within(&mut rx).await.expect("second leave");
        let expected: BTreeSet<UserId> = [UserId::new("u1")].into();
        assert_eq!(after, expected);
        assert_eq!(manager.online_users(), expected);
    }

    #[tokio::test]
    async fn unread_changes_are_delivered_for_own_rows() {
        let backend = InMemoryBackend::new();
        let conversation = backend
            .insert_conversation(NewConversation {
                kind: ConversationKind::Private,
                created_by: UserId::new("u2"),
                participant_ids: vec![UserId::new("u2"), UserId::new("u1")],
                created_at: Utc::now(),
            })
            .await
            .expect("insert");
        backend
            .insert_participant(NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id: UserId::new("u1"),
                role: ParticipantRole::Member,
            })
            .await
            .expect("participant");
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_unread_count_changed(move |id, count| {
                let _ = tx.send((id, count));
            }))
            .expect("listen");
        manager.subscribe().await.expect("subscribe");

        backend
            .increment_unread_count(&conversation.id, &UserId::new("u1"))
            .await
            .expect("increment");

        assert_eq!(recv_within(&mut rx).await, Some((conversation.id, 1)));
    }

    #[tokio::test]
    async fn presence_dedupes_multi_device_users() {
        let backend = InMemoryBackend::new();
        backend.track_presence("online-users", "u2:phone", record("u2"));
        backend.track_presence("online-users", "u2:tablet", record("u2"));
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_presence_changed(move |users| {
                let _ = tx.send(users);
            }))
            .expect("listen");

        manager.subscribe().await.expect("subscribe");

        let users = recv_within(&mut rx).await.expect("presence snapshot");
        let expected: BTreeSet<UserId> = [UserId::new("u1"), UserId::new("u2")].into();
        assert_eq!(users, expected);
        assert_eq!(manager.online_users(), expected);
    }

    #[tokio::test]
    async fn one_failing_feed_leaves_others_working() {
        let backend = InMemoryBackend::new();
        backend.fail_feed(FeedKind::Conversations);
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_presence_changed(move |users| {
                let _ = tx.send(users);
            }))
            .expect("listen");

        let report = manager.subscribe().await.expect("subscribe");

        assert_eq!(report.established, vec![FeedKind::Unread, FeedKind::Presence]);
        assert_eq!(report.failed.len(), 1);
        assert!(recv_within(&mut rx).await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_attempts_every_close() {
        let backend = InMemoryBackend::new();
        backend.fail_feed_close(FeedKind::Unread);
        let mut manager = manager(&backend, "u1");
        manager.subscribe().await.expect("subscribe");
        assert_eq!(backend.active_subscriptions(), 3);

        let report = manager.unsubscribe().await;

        assert_eq!(report.closed, vec![FeedKind::Conversations, FeedKind::Presence]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_clean());
        assert_eq!(backend.active_subscriptions(), 1);
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn no_callbacks_after_unsubscribe() {
        let backend = InMemoryBackend::new();
        let mut manager = manager(&backend, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .listen(SyncCallbacks::default().on_new_conversation(move |c| {
                let _ = tx.send(c.id);
            }))
            .expect("listen");
        manager.subscribe().await.expect("subscribe");

        manager.unsubscribe().await;
        backend
            .insert_conversation(NewConversation {
                kind: ConversationKind::Group,
                created_by: UserId::new("u2"),
                participant_ids: vec![UserId::new("u2"), UserId::new("u1")],
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(received, Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn subscribing_twice_is_rejected() {
        let backend = InMemoryBackend::new();
        let mut manager = manager(&backend, "u1");
        manager.subscribe().await.expect("subscribe");

        let err = manager.subscribe().await.expect_err("must fail");

        assert!(matches!(err, ChatError::Subscription("subscribed")));
    }
}
