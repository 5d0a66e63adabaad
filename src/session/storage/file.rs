use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{SessionStorage, StorageError};
use crate::session::Session;

const SESSION_FILE_SUFFIX: &str = ".session.json";

/// One JSON document per session under a directory: `<dir>/<key>.session.json`.
///
/// Writes go to a temporary file in the same directory which then replaces the final path,
/// so a crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    dir: PathBuf,
}

impl FileSessionStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage under the per-user data directory.
    pub fn new_default() -> Self {
        Self::new(default_session_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}{SESSION_FILE_SUFFIX}")))
    }
}

impl SessionStorage for FileSessionStorage {
    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.session_path(key)?.is_file())
    }

    fn get(&self, key: &str) -> Result<Option<Session>, StorageError> {
        let path = self.session_path(key)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::Io(format!("{}: {err}", path.display()))),
        };
        let session = serde_json::from_str(&raw)
            .map_err(|err| StorageError::Serialization(format!("{}: {err}", path.display())))?;
        Ok(Some(session))
    }

    fn put(&self, key: &str, session: &Session) -> Result<(), StorageError> {
        let path = self.session_path(key)?;
        let serialized = serde_json::to_vec_pretty(session)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        fs::create_dir_all(&self.dir)
            .map_err(|err| StorageError::Io(format!("{}: {err}", self.dir.display())))?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|err| StorageError::Io(format!("creating temporary file: {err}")))?;
        tmp.write_all(&serialized)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| StorageError::Io(format!("writing temporary file: {err}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
                .map_err(|err| StorageError::Io(format!("restricting permissions: {err}")))?;
        }

        tmp.persist(&path)
            .map_err(|err| StorageError::Io(format!("{}: {}", path.display(), err.error)))?;
        debug!(path = %path.display(), "session persisted");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.session_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(format!("{}: {err}", path.display()))),
        }
    }
}

fn default_session_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "oauth2-session")
        .map(|dirs| dirs.data_dir().join("sessions"))
        .unwrap_or_else(|| PathBuf::from(".oauth2-session").join("sessions"))
}
