use std::collections::HashMap;
use std::sync::RwLock;

use super::{SessionStorage, StorageError};
use crate::session::Session;

/// Process-local storage, for tests and short-lived processes.
#[derive(Debug, Default)]
pub struct InMemorySessionStorage {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for InMemorySessionStorage {
    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        let sessions = self.sessions.read().map_err(|_| StorageError::PoisonError)?;
        Ok(sessions.contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Option<Session>, StorageError> {
        let sessions = self.sessions.read().map_err(|_| StorageError::PoisonError)?;
        Ok(sessions.get(key).cloned())
    }

    fn put(&self, key: &str, session: &Session) -> Result<(), StorageError> {
        let mut sessions = self.sessions.write().map_err(|_| StorageError::PoisonError)?;
        sessions.insert(key.to_string(), session.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut sessions = self.sessions.write().map_err(|_| StorageError::PoisonError)?;
        sessions.remove(key);
        Ok(())
    }
}
