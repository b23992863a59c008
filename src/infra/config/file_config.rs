use std::path::PathBuf;

use serde::Deserialize;

use crate::infra::config::{AppConfig, LogConfig, OutboxConfig, SyncConfig};

#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    pub logging: Option<FileLogConfig>,
    pub sync: Option<FileSyncConfig>,
    pub outbox: Option<FileOutboxConfig>,
}

impl FileConfig {
    pub fn merge_into(self, config: &mut AppConfig) {
        if let Some(logging) = self.logging {
            logging.merge_into(&mut config.logging);
        }

        if let Some(sync) = self.sync {
            sync.merge_into(&mut config.sync);
        }

        if let Some(outbox) = self.outbox {
            outbox.merge_into(&mut config.outbox);
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileLogConfig {
    pub level: Option<String>,
    pub directory: Option<PathBuf>,
}

impl FileLogConfig {
    fn merge_into(self, config: &mut LogConfig) {
        if let Some(level) = self.level {
            config.level = level;
        }

        if let Some(directory) = self.directory {
            config.directory = Some(directory);
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileSyncConfig {
    pub page_size: Option<usize>,
    pub max_page_size: Option<usize>,
    pub presence_channel: Option<String>,
    pub event_buffer: Option<usize>,
}

impl FileSyncConfig {
    fn merge_into(self, config: &mut SyncConfig) {
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }

        if let Some(max_page_size) = self.max_page_size {
            config.max_page_size = max_page_size;
        }

        if let Some(channel) = self.presence_channel {
            config.presence_channel = channel;
        }

        if let Some(event_buffer) = self.event_buffer {
            config.event_buffer = event_buffer;
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileOutboxConfig {
    pub persist: Option<bool>,
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub directory: Option<PathBuf>,
}

impl FileOutboxConfig {
    fn merge_into(self, config: &mut OutboxConfig) {
        if let Some(persist) = self.persist {
            config.persist = persist;
        }

        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }

        if let Some(base) = self.base_backoff_ms {
            config.base_backoff_ms = base;
        }

        if let Some(max) = self.max_backoff_ms {
            config.max_backoff_ms = max;
        }

        if let Some(directory) = self.directory {
            config.directory = Some(directory);
        }
    }
}
