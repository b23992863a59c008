use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{domain::ids::UserId, infra::error::AppError};

const APP_DIR_NAME: &str = "chatsync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub data_dir: PathBuf,
    pub outbox_dir: PathBuf,
}

impl StorageLayout {
    pub fn resolve() -> Result<Self, AppError> {
        let data_base = env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(dirs::data_dir)
            .ok_or_else(|| AppError::StoragePathResolution {
                details: "unable to resolve data base directory (XDG_DATA_HOME/platform default)"
                    .into(),
            })?;

        Ok(Self::under(&data_base.join(APP_DIR_NAME)))
    }

    /// Layout rooted at an explicit directory.
    pub fn under(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            outbox_dir: data_dir.join("outbox"),
        }
    }

    pub fn with_outbox_dir(mut self, outbox_dir: Option<&Path>) -> Self {
        if let Some(dir) = outbox_dir {
            self.outbox_dir = dir.to_path_buf();
        }
        self
    }

    pub fn ensure_dirs(&self) -> Result<(), AppError> {
        for dir in [&self.data_dir, &self.outbox_dir] {
            fs::create_dir_all(dir).map_err(|source| AppError::StorageDirCreate {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(())
    }

    pub fn outbox_file(&self, user_id: &UserId) -> PathBuf {
        self.outbox_dir
            .join(format!("{}.json", file_stem(user_id)))
    }

    pub fn outbox_lock_file(&self, user_id: &UserId) -> PathBuf {
        self.outbox_dir
            .join(format!("{}.lock", file_stem(user_id)))
    }
}

/// File-name safe and injective: every byte outside `[A-Za-z0-9-]`,
/// `_` included, becomes `_XX`.
fn file_stem(user_id: &UserId) -> String {
    let mut stem = String::with_capacity(user_id.as_str().len());
    for byte in user_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02X}"));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    #[test]
    fn outbox_is_under_data_dir() {
        let layout = StorageLayout::under(Path::new("/tmp/chatsync-layout"));

        assert!(layout.outbox_dir.starts_with(&layout.data_dir));
        assert_eq!(
            layout.outbox_file(&UserId::new("u1")),
            PathBuf::from("/tmp/chatsync-layout/outbox/u1.json")
        );
    }

    #[test]
    fn user_ids_are_escaped_for_file_names() {
        let layout = StorageLayout::under(Path::new("/data"));

        let file = layout.outbox_file(&UserId::new("../evil/u1"));

        assert_eq!(file, PathBuf::from("/data/outbox/_2E_2E_2Fevil_2Fu1.json"));
    }

    #[test]
    fn distinct_user_ids_never_share_a_file() {
        let layout = StorageLayout::under(Path::new("/data"));
        let ids = ["a.b", "a_b", "a_2Eb", "a.b@x.io", "a_b@x_io", "ä"];

        let files: std::collections::HashSet<_> = ids
            .iter()
            .map(|id| layout.outbox_file(&UserId::new(*id)))
            .collect();

        assert_eq!(files.len(), ids.len());
        assert_eq!(
            layout.outbox_file(&UserId::new("a_b")),
            PathBuf::from("/data/outbox/a_5Fb.json")
        );
    }

    #[test]
    fn resolves_from_xdg_data_home() {
        let _guard = env_lock();
        let root = tempfile::tempdir().expect("temp dir");

        let old = env::var_os("XDG_DATA_HOME");
        // SAFETY: env is guarded by process-wide test mutex.
        unsafe { env::set_var("XDG_DATA_HOME", root.path()) };

        let layout = StorageLayout::resolve().expect("layout should resolve");

        match old {
            // SAFETY: restoring env while guard is held.
            Some(value) => unsafe { env::set_var("XDG_DATA_HOME", value) },
            // SAFETY: restoring env while guard is held.
            None => unsafe { env::remove_var("XDG_DATA_HOME") },
        }

        assert_eq!(layout.data_dir, root.path().join("chatsync"));
    }

    #[test]
    fn explicit_outbox_dir_overrides_default() {
        let layout = StorageLayout::under(Path::new("/data"))
            .with_outbox_dir(Some(Path::new("/elsewhere/outbox")));

        assert_eq!(layout.outbox_dir, PathBuf::from("/elsewhere/outbox"));
    }
}
