use std::sync::Arc;

use thiserror::Error;

use super::Session;

pub mod file;
pub mod memory;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid session key `{0}`")]
    InvalidKey(String),
    #[error("session storage io error: `{0}`")]
    Io(String),
    #[error("unable to (de)serialize session: `{0}`")]
    Serialization(String),
    #[error("session storage lock poisoned")]
    PoisonError,
}

/// Key-value persistence of sessions, keyed by config hash.
///
/// Implementations do not coordinate concurrent access to the same key, the
/// [`crate::session::manager::SessionManager`] does.
pub trait SessionStorage: Send + Sync {
    fn contains(&self, key: &str) -> Result<bool, StorageError>;
    fn get(&self, key: &str) -> Result<Option<Session>, StorageError>;
    fn put(&self, key: &str, session: &Session) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

impl<S> SessionStorage for Arc<S>
where
    S: SessionStorage + ?Sized,
{
    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        self.as_ref().contains(key)
    }

    fn get(&self, key: &str) -> Result<Option<Session>, StorageError> {
        self.as_ref().get(key)
    }

    fn put(&self, key: &str, session: &Session) -> Result<(), StorageError> {
        self.as_ref().put(key, session)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.as_ref().delete(key)
    }
}
