//! Explicit chat session owning every per-user component.
//!
//! A session is created once with its collaborators, bound to a user by
//! `init` and released by `cleanup`. Signing in as someone else means
//! `cleanup` followed by a new `init`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use tokio::sync::{broadcast, Mutex};

use crate::{
    backend::{connectivity::ConnectivityTracker, BlobUploader, ChatStore, RealtimeSource},
    domain::{
        conversation::{Conversation, ConversationDetail, ConversationKind},
        events::{ConnectivityStatus, SyncEvent},
        ids::{ConversationId, TempId, UserId},
        message::{Attachment, DurableMessage, Message, MessageKind, PendingMessage},
    },
    infra::{
        config::{OutboxConfig, SyncConfig},
        contracts::OutboxStore,
    },
};

use super::{
    conversations::{ConversationManager, RepairOutcome},
    dispatcher::{DispatcherDeps, MessageDispatcher, MessagesQuery, SyncReport},
    errors::ChatError,
    event_bus::EventBus,
    outbox::{CancelOutcome, MessageQueue, RetryPolicy},
    realtime::{
        FeedReport, RealtimeSubscriptionManager, SubscriptionState, SyncCallbacks,
        UnsubscribeReport,
    },
};

const OUTBOX_RESTORE_FAILED: &str = "OUTBOX_RESTORE_FAILED";
const SESSION_INITIALIZED: &str = "SESSION_INITIALIZED";
const SESSION_CLEANED_UP: &str = "SESSION_CLEANED_UP";

/// Collaborators injected into a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn ChatStore>,
    pub realtime: Arc<dyn RealtimeSource>,
    pub uploader: Arc<dyn BlobUploader>,
    pub outbox: Arc<dyn OutboxStore>,
    pub connectivity: ConnectivityTracker,
}

struct ActiveSession {
    user_id: UserId,
    bus: EventBus,
    conversations: ConversationManager,
    dispatcher: MessageDispatcher,
    realtime: Arc<Mutex<RealtimeSubscriptionManager>>,
}

pub struct ChatSession {
    deps: SessionDeps,
    sync: SyncConfig,
    policy: RetryPolicy,
    active: Option<ActiveSession>,
}

/// Handle returned by `subscribe_to_updates`.
pub struct Subscription {
    manager: Arc<Mutex<RealtimeSubscriptionManager>>,
    pub feeds: FeedReport,
}

impl Subscription {
    /// Tears down every feed and listener of the session.
    pub async fn unsubscribe(self) -> UnsubscribeReport {
        self.manager.lock().await.unsubscribe().await
    }
}

impl ChatSession {
    pub fn new(deps: SessionDeps, sync: SyncConfig, outbox: &OutboxConfig) -> Self {
        Self {
            deps,
            sync,
            policy: RetryPolicy::from_config(outbox),
            active: None,
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.active.as_ref().map(|active| &active.user_id)
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    /// Binds the session to `user_id` and restores that user's queue.
    pub fn init(&mut self, user_id: UserId) -> Result<(), ChatError> {
        if let Some(active) = &self.active {
            return Err(ChatError::AlreadyInitialized(active.user_id.clone()));
        }

        let restored = match self.deps.outbox.load(&user_id) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!(
                    code = OUTBOX_RESTORE_FAILED,
                    user_id = %user_id,
                    error = %error,
                    "starting with an empty queue"
                );
                Vec::new()
            }
        };
        let queue = MessageQueue::from_entries(restored);
        let queued = queue.len();

        let bus = EventBus::new(self.sync.event_buffer);
        let dispatcher = MessageDispatcher::new(
            user_id.clone(),
            DispatcherDeps {
                store: Arc::clone(&self.deps.store),
                uploader: Arc::clone(&self.deps.uploader),
                outbox: Arc::clone(&self.deps.outbox),
                connectivity: self.deps.connectivity.clone(),
                bus: bus.clone(),
            },
            self.sync.clone(),
            self.policy.clone(),
            queue,
        );
        let realtime = RealtimeSubscriptionManager::new(
            Arc::clone(&self.deps.realtime),
            bus.clone(),
            user_id.clone(),
            self.sync.presence_channel.clone(),
        );

        self.active = Some(ActiveSession {
            conversations: ConversationManager::new(Arc::clone(&self.deps.store), user_id.clone()),
            dispatcher,
            realtime: Arc::new(Mutex::new(realtime)),
            bus,
            user_id: user_id.clone(),
        });

        tracing::info!(
            code = SESSION_INITIALIZED,
            user_id = %user_id,
            queued,
            "chat session initialized"
        );
        Ok(())
    }

    /// Releases the session. Subscriptions are torn down; the user's
    /// persisted queue is kept for their next sign-in.
    pub async fn cleanup(&mut self) -> Option<UnsubscribeReport> {
        let active = self.active.take()?;

        let mut realtime = active.realtime.lock().await;
        let report = if realtime.state() == SubscriptionState::Subscribed {
            Some(realtime.unsubscribe().await)
        } else {
            None
        };
        drop(realtime);
        active.dispatcher.forget_queue().await;

        tracing::info!(
            code = SESSION_CLEANED_UP,
            user_id = %active.user_id,
            "chat session released"
        );
        report
    }

    fn active(&self) -> Result<&ActiveSession, ChatError> {
        self.active.as_ref().ok_or(ChatError::NotInitialized)
    }

    pub async fn create_conversation(
        &self,
        participant_ids: &[UserId],
        kind: ConversationKind,
    ) -> Result<Conversation, ChatError> {
        self.active()?
            .conversations
            .create_conversation(participant_ids, kind)
            .await
    }

    pub async fn get_user_conversations(&self) -> Result<Vec<ConversationDetail>, ChatError> {
        self.active()?.conversations.get_user_conversations().await
    }

    pub async fn get_unread_counts(&self) -> Result<HashMap<ConversationId, u32>, ChatError> {
        self.active()?.conversations.get_unread_counts().await
    }

    pub async fn repair_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<RepairOutcome, ChatError> {
        self.active()?
            .conversations
            .repair_participants(conversation_id)
            .await
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
    ) -> Result<Message, ChatError> {
        self.active()?
            .dispatcher
            .send_message(conversation_id, content, kind, attachments)
            .await
    }

    pub async fn send_attachment(
        &self,
        conversation_id: &ConversationId,
        bytes: Vec<u8>,
        mime_type: &str,
        kind: MessageKind,
        caption: &str,
    ) -> Result<Message, ChatError> {
        self.active()?
            .dispatcher
            .send_attachment(conversation_id, bytes, mime_type, kind, caption)
            .await
    }

    pub async fn get_conversation_messages(
        &self,
        query: &MessagesQuery,
    ) -> Result<Vec<DurableMessage>, ChatError> {
        self.active()?
            .dispatcher
            .get_conversation_messages(query)
            .await
    }

    pub async fn mark_conversation_as_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ChatError> {
        self.active()?
            .dispatcher
            .mark_conversation_as_read(conversation_id)
            .await
    }

    pub async fn sync_pending_messages(&self) -> Result<SyncReport, ChatError> {
        Ok(self.active()?.dispatcher.sync_pending_messages().await)
    }

    pub async fn cancel_pending(&self, temp_id: &TempId) -> Result<CancelOutcome, ChatError> {
        Ok(self.active()?.dispatcher.cancel_pending(temp_id).await)
    }

    pub async fn resend_failed(&self, temp_id: &TempId) -> Result<(), ChatError> {
        self.active()?.dispatcher.resend_failed(temp_id).await
    }

    /// Queued messages of a conversation in send order, to append after
    /// its durable history.
    pub async fn pending_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ChatError> {
        Ok(self
            .active()?
            .dispatcher
            .pending_messages(conversation_id)
            .await
            .into_iter()
            .map(Message::Pending)
            .collect())
    }

    pub async fn failed_messages(&self) -> Result<Vec<PendingMessage>, ChatError> {
        Ok(self.active()?.dispatcher.failed_messages().await)
    }

    /// Drops the signed-in user's queue in memory and on disk.
    pub async fn discard_outbox(&self) -> Result<bool, ChatError> {
        self.active()?.dispatcher.discard_queue().await
    }

    /// Subscribes to real-time updates, routing them to `callbacks`.
    ///
    /// Feeds are established on the first call; later calls add listeners
    /// to the same feeds.
    pub async fn subscribe_to_updates(
        &self,
        callbacks: SyncCallbacks,
    ) -> Result<Subscription, ChatError> {
        let active = self.active()?;
        let mut manager = active.realtime.lock().await;
        manager.listen(callbacks)?;
        let feeds = match manager.state() {
            SubscriptionState::Uninitialized => manager.subscribe().await?,
            _ => FeedReport::default(),
        };
        drop(manager);

        Ok(Subscription {
            manager: Arc::clone(&active.realtime),
            feeds,
        })
    }

    /// Raw event stream for consumers that prefer it over callbacks.
    pub fn events(&self) -> Result<broadcast::Receiver<SyncEvent>, ChatError> {
        Ok(self.active()?.bus.subscribe())
    }

    pub async fn online_users(&self) -> Result<BTreeSet<UserId>, ChatError> {
        Ok(self.active()?.realtime.lock().await.online_users())
    }

    pub fn connectivity(&self) -> ConnectivityStatus {
        self.deps.connectivity.status()
    }

    /// Records a connectivity change; coming back online replays the queue.
    pub async fn on_connectivity_changed(
        &self,
        status: ConnectivityStatus,
    ) -> Result<Option<SyncReport>, ChatError> {
        let Some(transition) = self.deps.connectivity.record(status) else {
            return Ok(None);
        };
        if !transition.came_online() {
            return Ok(None);
        }
        let Some(active) = &self.active else {
            return Ok(None);
        };

        Ok(Some(active.dispatcher.sync_pending_messages().await))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, FeedKind},
        domain::{message::MessageStatus, presence::PresenceRecord},
        infra::stubs::MemoryOutboxStore,
        test_support::recv_within,
    };

    struct Fixture {
        backend: InMemoryBackend,
        outbox: Arc<MemoryOutboxStore>,
        connectivity: ConnectivityTracker,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: InMemoryBackend::new(),
                outbox: Arc::new(MemoryOutboxStore::default()),
                connectivity: ConnectivityTracker::new(ConnectivityStatus::Connected),
            }
        }

        fn session(&self, user: &str) -> ChatSession {
            let deps = SessionDeps {
                store: Arc::new(self.backend.clone()),
                realtime: Arc::new(self.backend.clone()),
                uploader: Arc::new(self.backend.clone()),
                outbox: self.outbox.clone(),
                connectivity: self.connectivity.clone(),
            };
            let mut session =
                ChatSession::new(deps, SyncConfig::default(), &OutboxConfig::default());
            session.init(UserId::new(user)).expect("init");
            session
        }
    }

    fn users(values: &[&str]) -> Vec<UserId> {
        values.iter().map(|v| UserId::new(*v)).collect()
    }

    #[tokio::test]
    async fn operations_require_init() {
        let fx = Fixture::new();
        let session = ChatSession::new(
            SessionDeps {
                store: Arc::new(fx.backend.clone()),
                realtime: Arc::new(fx.backend.clone()),
                uploader: Arc::new(fx.backend.clone()),
                outbox: fx.outbox.clone(),
                connectivity: fx.connectivity.clone(),
            },
            SyncConfig::default(),
            &OutboxConfig::default(),
        );

        let err = session.get_unread_counts().await.expect_err("must fail");

        assert!(matches!(err, ChatError::NotInitialized));
    }

    #[tokio::test]
    async fn second_init_is_rejected_until_cleanup() {
        let fx = Fixture::new();
        let mut session = fx.session("u1");

        let err = session.init(UserId::new("u2")).expect_err("must fail");
        assert!(matches!(err, ChatError::AlreadyInitialized(_)));

        session.cleanup().await;
        session.init(UserId::new("u2")).expect("re-init");
        assert_eq!(session.user_id(), Some(&UserId::new("u2")));
    }

    #[tokio::test]
    async fn two_user_scenario() {
        let fx = Fixture::new();
        let alice = fx.session("u1");
        let bob = fx.session("u2");
        let (tx, mut unread_rx) = mpsc::unbounded_channel();
        let bob_sub = bob
            .subscribe_to_updates(SyncCallbacks::default().on_unread_count_changed(
                move |id, count| {
                    let _ = tx.send((id, count));
                },
            ))
            .await
            .expect("subscribe");

        let created = alice
            .create_conversation(&users(&["u1", "u2"]), ConversationKind::Private)
            .await
            .expect("create");
        let again = bob
            .create_conversation(&users(&["u2", "u1"]), ConversationKind::Private)
            .await
            .expect("create reversed");
        assert_eq!(created.id, again.id);

        let sent = alice
            .send_message(&created.id, "hello", MessageKind::Text, Vec::new())
            .await
            .expect("send");
        assert_eq!(sent.status(), MessageStatus::Sent);
        assert_eq!(recv_within(&mut unread_rx).await, Some((created.id.clone(), 1)));
        assert_eq!(
            bob.get_unread_counts().await.expect("counts").get(&created.id),
            Some(&1)
        );

        bob.mark_conversation_as_read(&created.id)
            .await
            .expect("read");
        assert_eq!(recv_within(&mut unread_rx).await, Some((created.id.clone(), 0)));

        fx.connectivity.record(ConnectivityStatus::Disconnected);
        let queued = alice
            .send_message(&created.id, "while away", MessageKind::Text, Vec::new())
            .await
            .expect("queued");
        assert!(matches!(queued, Message::Pending(_)));
        assert_eq!(
            fx.backend.unread_count(&created.id, &UserId::new("u2")),
            Some(0)
        );

        let report = alice
            .on_connectivity_changed(ConnectivityStatus::Connected)
            .await
            .expect("sync")
            .expect("came online");
        assert_eq!(report.reconciled.len(), 1);
        assert_eq!(recv_within(&mut unread_rx).await, Some((created.id.clone(), 1)));

        let history = bob
            .get_conversation_messages(&MessagesQuery::new(created.id.clone()))
            .await
            .expect("history");
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "while away"]);

        let report = bob_sub.unsubscribe().await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn reconciled_callback_fires_for_replayed_messages() {
        let fx = Fixture::new();
        let session = fx.session("u1");
        let conversation = session
            .create_conversation(&users(&["u2"]), ConversationKind::Private)
            .await
            .expect("create");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = session
            .subscribe_to_updates(SyncCallbacks::default().on_message_reconciled(
                move |temp_id, message| {
                    let _ = tx.send((temp_id, message.content));
                },
            ))
            .await
            .expect("subscribe");

        fx.connectivity.record(ConnectivityStatus::Disconnected);
        let queued = session
            .send_message(&conversation.id, "later", MessageKind::Text, Vec::new())
            .await
            .expect("queued");
        session
            .on_connectivity_changed(ConnectivityStatus::Connected)
            .await
            .expect("sync");

        assert_eq!(
            recv_within(&mut rx).await,
            Some((TempId::new(queued.key()), "later".to_owned()))
        );
    }

    #[tokio::test]
    async fn queue_survives_restart() {
        let fx = Fixture::new();
        let mut session = fx.session("u1");
        let conversation = session
            .create_conversation(&users(&["u2"]), ConversationKind::Private)
            .await
            .expect("create");
        fx.connectivity.record(ConnectivityStatus::Disconnected);
        session
            .send_message(&conversation.id, "persisted", MessageKind::Text, Vec::new())
            .await
            .expect("queued");

        session.cleanup().await;
        let restarted = fx.session("u1");
        let pending = restarted
            .pending_messages(&conversation.id)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);

        fx.connectivity.record(ConnectivityStatus::Connected);
        let report = restarted.sync_pending_messages().await.expect("sync");

        assert_eq!(report.reconciled.len(), 1);
        assert_eq!(fx.backend.messages_in(&conversation.id).len(), 1);
    }

    #[tokio::test]
    async fn another_users_queue_is_not_replayed() {
        let fx = Fixture::new();
        let mut alice = fx.session("u1");
        let conversation = alice
            .create_conversation(&users(&["u2"]), ConversationKind::Private)
            .await
            .expect("create");
        fx.connectivity.record(ConnectivityStatus::Disconnected);
        alice
            .send_message(&conversation.id, "mine", MessageKind::Text, Vec::new())
            .await
            .expect("queued");
        alice.cleanup().await;

        let bob = fx.session("u2");

        assert!(bob
            .pending_messages(&conversation.id)
            .await
            .expect("pending")
            .is_empty());
    }

    #[tokio::test]
    async fn staying_online_does_not_replay() {
        let fx = Fixture::new();
        let session = fx.session("u1");

        let report = session
            .on_connectivity_changed(ConnectivityStatus::Connected)
            .await
            .expect("no-op");

        assert!(report.is_none());
    }

    #[tokio::test]
    async fn presence_counts_multi_device_user_once() {
        let fx = Fixture::new();
        fx.backend.track_presence(
            "online-users",
            "u2:web",
            PresenceRecord {
                user_id: UserId::new("u2"),
                online_at: chrono::Utc::now(),
            },
        );
        let alice = fx.session("u1");
        let bob = fx.session("u2");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _bob_sub = bob
            .subscribe_to_updates(SyncCallbacks::default())
            .await
            .expect("bob subscribe");
        let _alice_sub = alice
            .subscribe_to_updates(SyncCallbacks::default().on_presence_changed(move |users| {
                let _ = tx.send(users.len());
            }))
            .await
            .expect("alice subscribe");

        assert_eq!(recv_within(&mut rx).await, Some(2));
        assert_eq!(alice.online_users().await.expect("online").len(), 2);
    }

    #[tokio::test]
    async fn cleanup_tears_down_all_feeds() {
        let fx = Fixture::new();
        let mut session = fx.session("u1");
        let sub = session
            .subscribe_to_updates(SyncCallbacks::default())
            .await
            .expect("subscribe");
        assert_eq!(sub.feeds.established, FeedKind::ALL.to_vec());
        assert_eq!(fx.backend.active_subscriptions(), 3);

        let report = session.cleanup().await.expect("was subscribed");

        assert_eq!(report.closed.len(), 3);
        assert_eq!(fx.backend.active_subscriptions(), 0);
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn failing_feed_does_not_block_the_others() {
        let fx = Fixture::new();
        fx.backend.fail_feed(FeedKind::Unread);
        let alice = fx.session("u1");
        let bob = fx.session("u2");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bob
            .subscribe_to_updates(
                SyncCallbacks::default()
                    .on_unread_count_changed(move |id, count| {
                        sink.lock().expect("sink").push((id, count));
                    })
                    .on_new_conversation(move |conversation| {
                        let _ = tx.send(conversation.id);
                    }),
            )
            .await
            .expect("subscribe");
        assert_eq!(sub.feeds.failed.len(), 1);

        let created = alice
            .create_conversation(&users(&["u2"]), ConversationKind::Private)
            .await
            .expect("create");
        alice
            .send_message(&created.id, "hi", MessageKind::Text, Vec::new())
            .await
            .expect("send");

        assert_eq!(recv_within(&mut rx).await, Some(created.id));
        assert!(seen.lock().expect("seen").is_empty());
    }

    #[tokio::test]
    async fn dead_letter_is_reported_and_cancellable() {
        let fx = Fixture::new();
        let outbox = OutboxConfig {
            max_attempts: 1,
            ..OutboxConfig::default()
        };
        let deps = SessionDeps {
            store: Arc::new(fx.backend.clone()),
            realtime: Arc::new(fx.backend.clone()),
            uploader: Arc::new(fx.backend.clone()),
            outbox: fx.outbox.clone(),
            connectivity: fx.connectivity.clone(),
        };
        let mut session = ChatSession::new(deps, SyncConfig::default(), &outbox);
        session.init(UserId::new("u1")).expect("init");
        let conversation = session
            .create_conversation(&users(&["u2"]), ConversationKind::Private)
            .await
            .expect("create");
        let mut events = session.events().expect("events");

        fx.connectivity.record(ConnectivityStatus::Disconnected);
        let queued = session
            .send_message(&conversation.id, "lost", MessageKind::Text, Vec::new())
            .await
            .expect("queued");
        fx.backend.fail_next_message_inserts(1);
        session
            .on_connectivity_changed(ConnectivityStatus::Connected)
            .await
            .expect("sync");

        let temp_id = TempId::new(queued.key());
        assert!(matches!(
            events.try_recv(),
            Ok(SyncEvent::MessageDeadLettered { temp_id: ref id, .. }) if id == &temp_id
        ));
        assert_eq!(session.failed_messages().await.expect("failed").len(), 1);
        assert_eq!(
            session.cancel_pending(&temp_id).await.expect("cancel"),
            CancelOutcome::Removed
        );
        assert!(fx.outbox.saved(&UserId::new("u1")).is_empty());
    }
}
