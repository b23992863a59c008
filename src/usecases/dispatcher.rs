//! Message delivery: optimistic sends, offline queuing and queue replay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    backend::{connectivity::ConnectivityTracker, BlobUploader, ChatStore, StoreError},
    domain::{
        conversation::LastMessageSummary,
        events::SyncEvent,
        ids::{ConversationId, TempId, UserId},
        message::{
            Attachment, DurableMessage, Message, MessageDraft, MessageKind, PendingMessage,
            Reconciled,
        },
    },
    infra::{config::SyncConfig, contracts::OutboxStore},
};

use super::{
    errors::ChatError,
    event_bus::EventBus,
    outbox::{CancelOutcome, FailureOutcome, MessageQueue, RetryPolicy},
};

const MESSAGE_QUEUED: &str = "MESSAGE_QUEUED";
const MESSAGE_SENT: &str = "MESSAGE_SENT";
const MESSAGE_DEAD_LETTERED: &str = "MESSAGE_DEAD_LETTERED";
const QUEUE_REPLAY_STARTED: &str = "QUEUE_REPLAY_STARTED";
const QUEUE_REPLAY_FAILED: &str = "QUEUE_REPLAY_FAILED";
const QUEUE_REPLAY_FINISHED: &str = "QUEUE_REPLAY_FINISHED";
const CONVERSATION_TOUCH_FAILED: &str = "CONVERSATION_TOUCH_FAILED";
const UNREAD_INCREMENT_FAILED: &str = "UNREAD_INCREMENT_FAILED";
const OUTBOX_PERSIST_FAILED: &str = "OUTBOX_PERSIST_FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagesQuery {
    pub conversation_id: ConversationId,
    pub limit: usize,
    /// Exclusive cursor: only messages created strictly before it.
    pub before: Option<DateTime<Utc>>,
}

impl MessagesQuery {
    /// First page with the configured default size.
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            limit: 0,
            before: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn before(mut self, cursor: DateTime<Utc>) -> Self {
        self.before = Some(cursor);
        self
    }

    fn normalized_limit(&self, config: &SyncConfig) -> usize {
        match self.limit {
            0 => config.page_size,
            value if value > config.max_page_size => config.max_page_size,
            value => value,
        }
    }
}

/// Outcome of one queue replay.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub reconciled: Vec<Reconciled>,
    pub failures: Vec<ChatError>,
    pub dead_lettered: Vec<TempId>,
    /// Entries still waiting out their backoff.
    pub deferred: usize,
    /// Replay was skipped because the client is offline.
    pub offline: bool,
}

impl SyncReport {
    pub fn attempted(&self) -> usize {
        self.reconciled.len() + self.failures.len()
    }
}

/// Why a single delivery attempt did not produce a reconciled message.
#[derive(Debug)]
enum DeliveryError {
    /// The store rejected the write; nothing landed.
    Rejected(StoreError),
    /// The write landed but the acknowledgement does not match the draft.
    Unreconciled(StoreError),
}

impl DeliveryError {
    fn into_source(self) -> StoreError {
        match self {
            Self::Rejected(source) | Self::Unreconciled(source) => source,
        }
    }
}

pub struct MessageDispatcher {
    user_id: UserId,
    store: Arc<dyn ChatStore>,
    uploader: Arc<dyn BlobUploader>,
    outbox: Arc<dyn OutboxStore>,
    connectivity: ConnectivityTracker,
    bus: EventBus,
    config: SyncConfig,
    policy: RetryPolicy,
    queue: Mutex<MessageQueue>,
    replay: Mutex<()>,
}

pub struct DispatcherDeps {
    pub store: Arc<dyn ChatStore>,
    pub uploader: Arc<dyn BlobUploader>,
    pub outbox: Arc<dyn OutboxStore>,
    pub connectivity: ConnectivityTracker,
    pub bus: EventBus,
}

impl MessageDispatcher {
    pub fn new(
        user_id: UserId,
        deps: DispatcherDeps,
        config: SyncConfig,
        policy: RetryPolicy,
        queue: MessageQueue,
    ) -> Self {
        Self {
            user_id,
            store: deps.store,
            uploader: deps.uploader,
            outbox: deps.outbox,
            connectivity: deps.connectivity,
            bus: deps.bus,
            config,
            policy,
            queue: Mutex::new(queue),
            replay: Mutex::new(()),
        }
    }

    /// Sends a message, or parks it in the queue while offline.
    ///
    /// Returns the pending record when queued and the durable record once
    /// the store acknowledged the write.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
    ) -> Result<Message, ChatError> {
        let pending = PendingMessage::new(MessageDraft {
            conversation_id: conversation_id.clone(),
            sender_id: self.user_id.clone(),
            content: content.to_owned(),
            kind,
            attachments,
        });

        if !self.connectivity.is_online() {
            let mut queue = self.queue.lock().await;
            queue.push(pending.clone());
            self.persist(&queue);
            tracing::info!(
                code = MESSAGE_QUEUED,
                temp_id = %pending.temp_id,
                conversation_id = %conversation_id,
                queued = queue.len(),
                "offline, message queued"
            );
            return Ok(Message::Pending(pending));
        }

        let reconciled = self
            .deliver(pending)
            .await
            .map_err(|error| ChatError::Send(error.into_source()))?;
        Ok(Message::Durable(reconciled.message))
    }

    /// Uploads `bytes` and sends a message referencing the uploaded blob.
    pub async fn send_attachment(
        &self,
        conversation_id: &ConversationId,
        bytes: Vec<u8>,
        mime_type: &str,
        kind: MessageKind,
        caption: &str,
    ) -> Result<Message, ChatError> {
        if !self.connectivity.is_online() {
            return Err(ChatError::Offline);
        }

        let size_bytes = u64::try_from(bytes.len()).ok();
        let url = self
            .uploader
            .upload(bytes, mime_type)
            .await
            .map_err(ChatError::Upload)?;
        let attachment = Attachment {
            url,
            mime_type: mime_type.to_owned(),
            file_name: None,
            size_bytes,
        };

        self.send_message(conversation_id, caption, kind, vec![attachment])
            .await
    }

    /// One page of history, oldest first.
    pub async fn get_conversation_messages(
        &self,
        query: &MessagesQuery,
    ) -> Result<Vec<DurableMessage>, ChatError> {
        let limit = query.normalized_limit(&self.config);
        let mut page = self
            .store
            .list_messages(&query.conversation_id, limit, query.before)
            .await
            .map_err(ChatError::read("messages"))?;
        page.reverse();
        Ok(page)
    }

    pub async fn mark_conversation_as_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ChatError> {
        self.store
            .mark_read(conversation_id, &self.user_id, Utc::now())
            .await
            .map_err(ChatError::write("read state"))
    }

    /// Replays every due queued message in send order.
    ///
    /// A single replay runs at a time; a concurrent caller waits for it and
    /// then finds only what is still due.
    pub async fn sync_pending_messages(&self) -> SyncReport {
        let _replay = self.replay.lock().await;
        let mut report = SyncReport::default();

        if !self.connectivity.is_online() {
            report.offline = true;
            report.deferred = self.queue.lock().await.len();
            return report;
        }

        let now = Utc::now();
        let due = self.queue.lock().await.checkout_due(now);
        if due.is_empty() {
            report.deferred = self.queue.lock().await.deferred_count(now);
            return report;
        }

        tracing::info!(
            code = QUEUE_REPLAY_STARTED,
            due = due.len(),
            "replaying queued messages"
        );

        for pending in due {
            let temp_id = pending.temp_id.clone();
            let conversation_id = pending.draft.conversation_id.clone();

            match self.deliver(pending).await {
                Ok(reconciled) => {
                    let mut queue = self.queue.lock().await;
                    queue.complete(&temp_id);
                    self.persist(&queue);
                    drop(queue);

                    self.bus.publish(SyncEvent::MessageReconciled {
                        temp_id: reconciled.temp_id.clone(),
                        message: reconciled.message.clone(),
                    });
                    report.reconciled.push(reconciled);
                }
                Err(error) => {
                    let durable = matches!(error, DeliveryError::Unreconciled(_));
                    let source = error.into_source();
                    let reason = source.to_string();
                    let mut queue = self.queue.lock().await;
                    // Already durable: never replayed.
                    let outcome = if durable {
                        queue.dead_letter(&temp_id, &reason)
                    } else {
                        queue.record_failure(&temp_id, &reason, Utc::now(), &self.policy)
                    };
                    self.persist(&queue);
                    drop(queue);

                    match outcome {
                        Some(FailureOutcome::DeadLettered { attempts }) => {
                            tracing::warn!(
                                code = MESSAGE_DEAD_LETTERED,
                                temp_id = %temp_id,
                                attempts,
                                error = %source,
                                "queued message gave up"
                            );
                            self.bus.publish(SyncEvent::MessageDeadLettered {
                                temp_id: temp_id.clone(),
                                conversation_id,
                            });
                            report.dead_lettered.push(temp_id.clone());
                        }
                        Some(FailureOutcome::Retrying {
                            attempts,
                            next_attempt_at,
                        }) => {
                            tracing::warn!(
                                code = QUEUE_REPLAY_FAILED,
                                temp_id = %temp_id,
                                attempts,
                                next_attempt_at = %next_attempt_at,
                                error = %source,
                                "queued message stays queued"
                            );
                        }
                        None => {}
                    }
                    report.failures.push(ChatError::QueueReplay { temp_id, source });
                }
            }
        }

        report.deferred = self.queue.lock().await.deferred_count(Utc::now());
        tracing::info!(
            code = QUEUE_REPLAY_FINISHED,
            reconciled = report.reconciled.len(),
            failed = report.failures.len(),
            deferred = report.deferred,
            "queue replay finished"
        );
        report
    }

    pub async fn cancel_pending(&self, temp_id: &TempId) -> CancelOutcome {
        let mut queue = self.queue.lock().await;
        let outcome = queue.cancel(temp_id);
        if outcome == CancelOutcome::Removed {
            self.persist(&queue);
        }
        outcome
    }

    /// Moves a dead-lettered message back into the replay queue.
    pub async fn resend_failed(&self, temp_id: &TempId) -> Result<(), ChatError> {
        let mut queue = self.queue.lock().await;
        if !queue.revive(temp_id) {
            return Err(ChatError::UnknownPendingMessage(temp_id.clone()));
        }
        self.persist(&queue);
        Ok(())
    }

    pub async fn pending_messages(&self, conversation_id: &ConversationId) -> Vec<PendingMessage> {
        self.queue.lock().await.pending_for(conversation_id)
    }

    pub async fn failed_messages(&self) -> Vec<PendingMessage> {
        self.queue.lock().await.dead_letters()
    }

    pub async fn queued_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drops the in-memory queue; persisted entries are left alone.
    pub async fn forget_queue(&self) {
        self.queue.lock().await.clear();
    }

    /// Drops the queue both in memory and on disk.
    pub async fn discard_queue(&self) -> Result<bool, ChatError> {
        let mut queue = self.queue.lock().await;
        queue.clear();
        self.outbox.discard(&self.user_id).map_err(ChatError::Outbox)
    }

    /// Writes the message and its side effects, then reconciles the temp id.
    async fn deliver(&self, pending: PendingMessage) -> Result<Reconciled, DeliveryError> {
        let durable = self
            .store
            .insert_message(&pending.draft)
            .await
            .map_err(DeliveryError::Rejected)?;
        let temp_id = pending.temp_id.clone();
        let reconciled = pending.reconcile(durable).map_err(|error| {
            DeliveryError::Unreconciled(StoreError::InvalidData(error.to_string()))
        })?;

        tracing::debug!(
            code = MESSAGE_SENT,
            temp_id = %temp_id,
            message_id = %reconciled.message.id,
            conversation_id = %reconciled.message.conversation_id,
            "message stored"
        );

        self.apply_side_effects(&reconciled.message).await;
        Ok(reconciled)
    }

    /// Conversation summary and unread counters. The message is already
    /// durable, so failures here are logged and not reported to the sender.
    async fn apply_side_effects(&self, message: &DurableMessage) {
        let summary = LastMessageSummary {
            content: summary_text(message),
            kind: message.kind,
            sent_at: message.created_at,
            sender_id: message.sender_id.clone(),
        };
        if let Err(error) = self
            .store
            .touch_conversation(&message.conversation_id, summary)
            .await
        {
            tracing::warn!(
                code = CONVERSATION_TOUCH_FAILED,
                conversation_id = %message.conversation_id,
                error = %error,
                "last message summary not updated"
            );
        }

        let participants = match self.store.list_participants(&message.conversation_id).await {
            Ok(participants) => participants,
            Err(error) => {
                tracing::warn!(
                    code = UNREAD_INCREMENT_FAILED,
                    conversation_id = %message.conversation_id,
                    error = %error,
                    "participants unavailable, unread counts not incremented"
                );
                return;
            }
        };

        for participant in participants
            .iter()
            .filter(|participant| participant.user_id != message.sender_id)
        {
            if let Err(error) = self
                .store
                .increment_unread_count(&message.conversation_id, &participant.user_id)
                .await
            {
                tracing::warn!(
                    code = UNREAD_INCREMENT_FAILED,
                    conversation_id = %message.conversation_id,
                    user_id = %participant.user_id,
                    error = %error,
                    "unread count not incremented"
                );
            }
        }
    }

    fn persist(&self, queue: &MessageQueue) {
        if let Err(error) = self.outbox.save(&self.user_id, &queue.snapshot()) {
            tracing::error!(
                code = OUTBOX_PERSIST_FAILED,
                user_id = %self.user_id,
                error = %error,
                "queued messages kept in memory only"
            );
        }
    }
}

fn summary_text(message: &DurableMessage) -> String {
    MessageDraft {
        conversation_id: message.conversation_id.clone(),
        sender_id: message.sender_id.clone(),
        content: message.content.clone(),
        kind: message.kind,
        attachments: Vec::new(),
    }
    .preview()
}
