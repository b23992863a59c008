use std::{
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::Path,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ids::UserId, outbox::QueueEntry},
    infra::{contracts::OutboxStore, error::AppError, storage_layout::StorageLayout},
};

const OUTBOX_FORMAT_VERSION: u32 = 1;
const OUTBOX_FILE_IGNORED: &str = "OUTBOX_FILE_IGNORED";

#[derive(Debug, Serialize, Deserialize)]
struct OutboxFile {
    version: u32,
    user_id: UserId,
    entries: Vec<QueueEntry>,
}

/// JSON file per user, replaced atomically under an exclusive lock.
#[derive(Debug, Clone)]
pub struct FileOutboxStore {
    layout: StorageLayout,
}

impl FileOutboxStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    fn lock(&self, user_id: &UserId, exclusive: bool) -> Result<File, AppError> {
        self.layout.ensure_dirs()?;
        let path = self.layout.outbox_lock_file(user_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| AppError::OutboxIo {
                path: path.clone(),
                source,
            })?;

        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|source| AppError::OutboxIo { path, source })?;

        Ok(file)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> AppError + '_ {
    move |source| AppError::OutboxIo {
        path: path.to_path_buf(),
        source,
    }
}

impl OutboxStore for FileOutboxStore {
    fn load(&self, user_id: &UserId) -> Result<Vec<QueueEntry>, AppError> {
        let _lock = self.lock(user_id, false)?;
        let path = self.layout.outbox_file(user_id);

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&path)(source)),
        };

        let file: OutboxFile =
            serde_json::from_str(&raw).map_err(|source| AppError::OutboxFormat {
                path: path.clone(),
                source,
            })?;

        if file.version != OUTBOX_FORMAT_VERSION || &file.user_id != user_id {
            tracing::warn!(
                code = OUTBOX_FILE_IGNORED,
                path = %path.display(),
                version = file.version,
                "ignoring outbox file written for another user or format"
            );
            return Ok(Vec::new());
        }

        Ok(file.entries)
    }

    fn save(&self, user_id: &UserId, entries: &[QueueEntry]) -> Result<(), AppError> {
        let _lock = self.lock(user_id, true)?;
        let path = self.layout.outbox_file(user_id);

        if entries.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
                Err(source) => Err(io_error(&path)(source)),
            };
        }

        let payload = OutboxFile {
            version: OUTBOX_FORMAT_VERSION,
            user_id: user_id.clone(),
            entries: entries.to_vec(),
        };
        let json =
            serde_json::to_vec_pretty(&payload).map_err(|source| AppError::OutboxFormat {
                path: path.clone(),
                source,
            })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;

        Ok(())
    }

    fn discard(&self, user_id: &UserId) -> Result<bool, AppError> {
        let _lock = self.lock(user_id, true)?;
        let path = self.layout.outbox_file(user_id);

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(&path)(source)),
        }
    }
}
