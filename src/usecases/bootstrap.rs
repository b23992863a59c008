use std::{path::Path, sync::Arc};

use crate::{
    backend::{connectivity::ConnectivityTracker, memory::InMemoryBackend},
    infra::{
        self,
        config::{AppConfig, OutboxConfig},
        contracts::OutboxStore,
        error::AppError,
        outbox_file::FileOutboxStore,
        storage_layout::StorageLayout,
        stubs::NoopOutboxStore,
    },
    usecases::{
        context::AppContext,
        session::{ChatSession, SessionDeps},
    },
};

pub fn bootstrap(config_path: Option<&Path>) -> Result<AppContext, AppError> {
    let config = infra::config::load(config_path)?;
    let log_guard = infra::logging::init(&config.logging)?;

    Ok(AppContext::new(config, log_guard))
}

/// Outbox persistence as configured: a file per user, or nothing.
pub fn outbox_store(config: &OutboxConfig) -> Result<Arc<dyn OutboxStore>, AppError> {
    if !config.persist {
        return Ok(Arc::new(NoopOutboxStore));
    }

    let layout = StorageLayout::resolve()?.with_outbox_dir(config.directory.as_deref());
    layout.ensure_dirs()?;
    Ok(Arc::new(FileOutboxStore::new(layout)))
}

/// Session wired to an in-process backend.
pub fn compose_memory_session(
    config: &AppConfig,
    backend: &InMemoryBackend,
    connectivity: ConnectivityTracker,
    outbox: Arc<dyn OutboxStore>,
) -> ChatSession {
    let deps = SessionDeps {
        store: Arc::new(backend.clone()),
        realtime: Arc::new(backend.clone()),
        uploader: Arc::new(backend.clone()),
        outbox,
        connectivity,
    };

    ChatSession::new(deps, config.sync.clone(), &config.outbox)
}
