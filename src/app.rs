use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chatsync::{
    backend::{self, connectivity::ConnectivityTracker, memory::InMemoryBackend},
    domain::{
        self, conversation::ConversationKind, events::ConnectivityStatus, ids::UserId,
        message::MessageKind,
    },
    infra::{self, contracts::OutboxStore},
    usecases::{
        self, bootstrap, context::AppContext, ChatSession, MessagesQuery, SyncCallbacks,
    },
};

use crate::cli::{Cli, Command, OutboxAction};

const DEMO_SETTLE: Duration = Duration::from_millis(50);
const OUTBOX_PURGED: &str = "OUTBOX_PURGED";

pub fn run(cli: Cli) -> Result<()> {
    let context = bootstrap::bootstrap(cli.config.as_deref())?;

    tracing::debug!(
        domain = domain::module_name(),
        backend = backend::module_name(),
        usecases = usecases::module_name(),
        infra = infra::module_name(),
        "module boundaries loaded"
    );

    match cli.command_or_default() {
        Command::Demo => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(run_demo(&context))?;
        }
        Command::Outbox { action } => {
            let store = bootstrap::outbox_store(&context.config.outbox)?;
            match action {
                OutboxAction::List { user } => {
                    let lines = outbox_lines(store.as_ref(), &UserId::new(user))?;
                    if lines.is_empty() {
                        println!("Outbox is empty.");
                    }
                    for line in lines {
                        println!("{line}");
                    }
                }
                OutboxAction::Purge { user, dead_only } => {
                    let removed = purge_outbox(store.as_ref(), &UserId::new(user), dead_only)?;
                    tracing::info!(code = OUTBOX_PURGED, removed, dead_only, "outbox purged");
                    println!("Removed {removed} queued message(s).");
                }
            }
        }
    }

    Ok(())
}

fn outbox_lines(store: &dyn OutboxStore, user_id: &UserId) -> Result<Vec<String>> {
    let entries = store.load(user_id)?;

    Ok(entries
        .iter()
        .map(|entry| {
            let mut line = format!(
                "{}\t{}\t{}\tattempts={}\t{}",
                entry.message.temp_id,
                entry.state_label(),
                entry.message.draft.conversation_id,
                entry.attempts,
                entry.message.draft.preview(),
            );
            if let Some(error) = &entry.last_error {
                line.push_str(&format!("\tlast_error={error}"));
            }
            line
        })
        .collect())
}

fn purge_outbox(store: &dyn OutboxStore, user_id: &UserId, dead_only: bool) -> Result<usize> {
    let entries = store.load(user_id)?;
    let before = entries.len();

    if !dead_only {
        store.discard(user_id)?;
        return Ok(before);
    }

    let kept: Vec<_> = entries
        .into_iter()
        .filter(|entry| !entry.is_dead_lettered())
        .collect();
    let removed = before - kept.len();
    if removed > 0 {
        store.save(user_id, &kept)?;
    }
    Ok(removed)
}

async fn run_demo(context: &AppContext) -> Result<()> {
    let backend = InMemoryBackend::new();
    let connectivity = ConnectivityTracker::new(ConnectivityStatus::Connected);
    let outbox = bootstrap::outbox_store(&context.config.outbox)?;
    let alice_id = UserId::new("demo-alice");
    let bob_id = UserId::new("demo-bob");

    let mut alice = session(context, &backend, &connectivity, &outbox, &alice_id)?;
    let mut bob = session(context, &backend, &connectivity, &outbox, &bob_id)?;

    let subscription = bob
        .subscribe_to_updates(
            SyncCallbacks::default()
                .on_new_conversation(|conversation| {
                    println!(
                        "[bob] new {} conversation {}",
                        conversation.kind.as_label(),
                        conversation.id
                    );
                })
                .on_unread_count_changed(|conversation_id, count| {
                    println!("[bob] unread in {conversation_id}: {count}");
                })
                .on_presence_changed(|users| {
                    println!("[bob] {} user(s) online", users.len());
                }),
        )
        .await?;

    let conversation = alice
        .create_conversation(&[bob_id.clone()], ConversationKind::Private)
        .await?;
    alice
        .send_message(&conversation.id, "hi bob", MessageKind::Text, Vec::new())
        .await?;
    tokio::time::sleep(DEMO_SETTLE).await;

    bob.mark_conversation_as_read(&conversation.id).await?;
    tokio::time::sleep(DEMO_SETTLE).await;

    println!("[net] going offline");
    alice
        .on_connectivity_changed(ConnectivityStatus::Disconnected)
        .await?;
    let queued = alice
        .send_message(&conversation.id, "sent while offline", MessageKind::Text, Vec::new())
        .await?;
    println!("[alice] queued {} ({:?})", queued.key(), queued.status());

    println!("[net] back online");
    if let Some(report) = alice
        .on_connectivity_changed(ConnectivityStatus::Connected)
        .await?
    {
        println!(
            "[alice] replayed {} queued message(s), {} failed",
            report.reconciled.len(),
            report.failures.len()
        );
    }
    tokio::time::sleep(DEMO_SETTLE).await;

    let history = bob
        .get_conversation_messages(&MessagesQuery::new(conversation.id.clone()))
        .await?;
    for message in &history {
        println!(
            "[bob] {} {}: {}",
            message.created_at.format("%H:%M:%S%.3f"),
            message.sender_id,
            message.content
        );
    }

    let report = subscription.unsubscribe().await;
    if !report.is_clean() {
        tracing::warn!(failed = report.failed.len(), "demo feeds did not close cleanly");
    }
    alice.cleanup().await;
    bob.cleanup().await;

    Ok(())
}

fn session(
    context: &AppContext,
    backend: &InMemoryBackend,
    connectivity: &ConnectivityTracker,
    outbox: &Arc<dyn OutboxStore>,
    user_id: &UserId,
) -> Result<ChatSession> {
    let mut session = bootstrap::compose_memory_session(
        &context.config,
        backend,
        connectivity.clone(),
        Arc::clone(outbox),
    );
    session.init(user_id.clone())?;
    Ok(session)
}
