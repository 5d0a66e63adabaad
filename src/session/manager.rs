use std::collections::HashSet;
use std::env;
use std::env::VarError;
use std::sync::{Condvar, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use super::Session;
use super::storage::{SessionStorage, StorageError};

/// Environment variable holding a JSON-encoded static session.
pub const STATIC_SESSION_ENV_NAME: &str = "OAUTH2_SESSION";

#[derive(Error, Debug)]
pub enum SessionManagerError {
    #[error("session storage: `{0}`")]
    Storage(#[from] StorageError),
    #[error("invalid static session: `{0}`")]
    InvalidStaticSession(String),
    #[error("acquiring session lock")]
    PoisonError,
}

/// Thread-safe facade over a [`SessionStorage`].
///
/// Every operation holds the lock of its key, so operations on the same key are serialized
/// while different keys proceed in parallel. A key lock exists only while held.
pub struct SessionManager<S> {
    storage: S,
    locks: KeyLocks,
    static_session: Mutex<Option<Session>>,
}

impl<S> SessionManager<S>
where
    S: SessionStorage,
{
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            locks: KeyLocks::default(),
            static_session: Mutex::new(None),
        }
    }

    /// Serves `session` instead of the storage content.
    ///
    /// The session applies to the key equal to its config hash, or to every key when that
    /// hash is empty. It is served only while not expired. Saving its own key or deleting a key
    /// it applies to discards it.
    pub fn with_static_session(self, session: Session) -> Self {
        Self {
            static_session: Mutex::new(Some(session)),
            ..self
        }
    }

    /// Exclusive access to `key` until the returned guard is dropped.
    ///
    /// Locking the same key twice from one thread deadlocks.
    pub fn lock(&self, key: &str) -> Result<SessionGuard<'_, S>, SessionManagerError> {
        self.locks.acquire(key)?;
        Ok(SessionGuard {
            manager: self,
            key: key.to_string(),
        })
    }

    pub fn restore(&self, key: &str) -> Result<Option<Session>, SessionManagerError> {
        self.lock(key)?.restore()
    }

    pub fn save(&self, key: &str, session: &Session) -> Result<(), SessionManagerError> {
        self.lock(key)?.save(session)
    }

    pub fn delete(&self, key: &str) -> Result<(), SessionManagerError> {
        self.lock(key)?.delete()
    }

    fn static_session_for(&self, key: &str) -> Result<Option<Session>, SessionManagerError> {
        let static_session = self
            .static_session
            .lock()
            .map_err(|_| SessionManagerError::PoisonError)?;
        Ok(static_session.as_ref().and_then(|session| {
            if session.is_expired() {
                None
            } else if session.config_hash() == key {
                Some(session.clone())
            } else if session.config_hash().is_empty() {
                Some(Session {
                    config_hash: key.to_string(),
                    ..session.clone()
                })
            } else {
                None
            }
        }))
    }

    fn discard_static_session(
        &self,
        key: &str,
        include_wildcard: bool,
    ) -> Result<(), SessionManagerError> {
        let mut static_session = self
            .static_session
            .lock()
            .map_err(|_| SessionManagerError::PoisonError)?;
        if static_session.as_ref().is_some_and(|s| {
            s.config_hash() == key || (include_wildcard && s.config_hash().is_empty())
        }) {
            debug!(session_id = key, "static session discarded");
            *static_session = None;
        }
        Ok(())
    }
}

/// Holds the lock of one key. Storage operations through the guard are exclusive for that key.
pub struct SessionGuard<'a, S>
where
    S: SessionStorage,
{
    manager: &'a SessionManager<S>,
    key: String,
}

impl<S> SessionGuard<'_, S>
where
    S: SessionStorage,
{
    pub fn restore(&self) -> Result<Option<Session>, SessionManagerError> {
        if let Some(session) = self.manager.static_session_for(&self.key)? {
            debug!(session_id = %self.key, "using static session");
            return Ok(Some(session));
        }
        Ok(self.manager.storage.get(&self.key)?)
    }

    /// Persists `session`. A static session bound to this key is superseded by it.
    pub fn save(&self, session: &Session) -> Result<(), SessionManagerError> {
        self.manager.storage.put(&self.key, session)?;
        self.manager.discard_static_session(&self.key, false)
    }

    pub fn delete(&self) -> Result<(), SessionManagerError> {
        self.manager.discard_static_session(&self.key, true)?;
        if self.manager.storage.contains(&self.key)? {
            self.manager.storage.delete(&self.key)?;
        }
        Ok(())
    }
}

impl<S> Drop for SessionGuard<'_, S>
where
    S: SessionStorage,
{
    fn drop(&mut self) {
        self.manager.locks.release(&self.key);
    }
}

/// Set of currently held keys. Waiters block on the condition variable until the key is gone.
#[derive(Default)]
struct KeyLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyLocks {
    fn acquire(&self, key: &str) -> Result<(), SessionManagerError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| SessionManagerError::PoisonError)?;
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .map_err(|_| SessionManagerError::PoisonError)?;
        }
        held.insert(key.to_string());
        Ok(())
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(key);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or_default()
    }
}

/// Loads the static session from the environment.
pub struct StaticSession;

impl StaticSession {
    /// Reads a JSON [`Session`] from `var_name`. An unset or empty variable means no session.
    pub fn from_env(var_name: &'static str) -> Result<Option<Session>, SessionManagerError> {
        Self::from_env_with(var_name, env::var)
    }

    fn from_env_with<F>(var_name: &'static str, env_var: F) -> Result<Option<Session>, SessionManagerError>
    where
        F: Fn(&'static str) -> Result<String, VarError>,
    {
        match env_var(var_name) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SessionManagerError::InvalidStaticSession(e.to_string())),
            Ok(_) | Err(VarError::NotPresent) => Ok(None),
            Err(e @ VarError::NotUnicode(_)) => {
                Err(SessionManagerError::InvalidStaticSession(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::auth_config::tests::client_credentials_config;
    use crate::session::storage::memory::InMemorySessionStorage;
    use crate::session::storage::tests::MockSessionStorage;
    use crate::session::tests::session_for;
    use crate::token::TokenType;

    fn numbered_session(n: usize) -> Session {
        Session::new(
            "key",
            format!("token-{n}"),
            TokenType::Bearer,
            Utc::now(),
            Utc::now() + TimeDelta::seconds(60),
        )
    }

    #[test]
    fn save_restore_delete() {
        let manager = SessionManager::new(InMemorySessionStorage::new());
        let session = numbered_session(1);

        assert_eq!(manager.restore("key").unwrap(), None);
        manager.save("key", &session).unwrap();
        assert_eq!(manager.restore("key").unwrap(), Some(session));
        manager.delete("key").unwrap();
        assert_eq!(manager.restore("key").unwrap(), None);
        // Locks do not outlive the operations.
        assert_eq!(manager.locks.held_count(), 0);
    }

    #[test]
    fn concurrent_saves_on_one_key_do_not_interleave() {
        let manager = Arc::new(SessionManager::new(InMemorySessionStorage::new()));
        let submitted: Vec<Session> = (0..16).map(numbered_session).collect();

        let handles: Vec<_> = submitted
            .iter()
            .cloned()
            .map(|session| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for _ in 0..20 {
                        manager.save("key", &session).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = manager.restore("key").unwrap().unwrap();
        assert!(submitted.contains(&stored));
    }

    #[test]
    fn same_key_waits_for_the_holder() {
        let manager = Arc::new(SessionManager::new(InMemorySessionStorage::new()));
        let guard = manager.lock("key").unwrap();

        let (tx, rx) = mpsc::channel();
        let background = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.save("key", &numbered_session(2)).unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        guard.save(&numbered_session(1)).unwrap();
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        background.join().unwrap();

        assert_eq!(
            manager.restore("key").unwrap().unwrap().access_token(),
            "token-2"
        );
    }

    #[test]
    fn different_keys_do_not_block_each_other() {
        let manager = Arc::new(SessionManager::new(InMemorySessionStorage::new()));
        let _guard = manager.lock("one").unwrap();

        let (tx, rx) = mpsc::channel();
        {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.save("other", &numbered_session(1)).unwrap();
                tx.send(()).unwrap();
            });
        }

        rx.recv_timeout(Duration::from_secs(5))
            .expect("a held key must not block other keys");
    }

    #[test]
    fn static_session_is_preferred() {
        let config = client_credentials_config("https://x/auth/token");
        let key = config.config_hash();
        let stored = session_for(&config, TimeDelta::seconds(60));
        let injected = Session {
            access_token: "injected".to_string(),
            ..stored.clone()
        };

        let storage = InMemorySessionStorage::new();
        storage.put(&key, &stored).unwrap();
        let manager = SessionManager::new(storage).with_static_session(injected.clone());

        assert_eq!(manager.restore(&key).unwrap(), Some(injected));
        assert_eq!(manager.restore("other-key").unwrap(), None);

        // Revoking discards the override, storage is used again afterwards.
        manager.delete(&key).unwrap();
        manager.save(&key, &stored).unwrap();
        assert_eq!(manager.restore(&key).unwrap(), Some(stored));
    }

    #[test]
    fn saved_session_supersedes_static_session() {
        let config = client_credentials_config("https://x/auth/token");
        let key = config.config_hash();
        let injected = Session {
            access_token: "injected".to_string(),
            ..session_for(&config, TimeDelta::seconds(60))
        };
        let fresh = session_for(&config, TimeDelta::seconds(120));

        let manager = SessionManager::new(InMemorySessionStorage::new())
            .with_static_session(injected);
        manager.save(&key, &fresh).unwrap();

        assert_eq!(manager.restore(&key).unwrap(), Some(fresh));
    }

    #[test]
    fn expired_static_session_is_ignored() {
        let config = client_credentials_config("https://x/auth/token");
        let key = config.config_hash();
        let stored = session_for(&config, TimeDelta::seconds(60));
        let expired = Session {
            access_token: "injected".to_string(),
            ..session_for(&config, TimeDelta::seconds(-60))
        };

        let storage = InMemorySessionStorage::new();
        storage.put(&key, &stored).unwrap();
        let manager = SessionManager::new(storage).with_static_session(expired);

        assert_eq!(manager.restore(&key).unwrap(), Some(stored));
    }

    #[test]
    fn wildcard_static_session_applies_to_every_key() {
        let injected = Session::new(
            "",
            "injected".to_string(),
            TokenType::Bearer,
            Utc::now(),
            Utc::now() + TimeDelta::seconds(60),
        );
        let manager =
            SessionManager::new(InMemorySessionStorage::new()).with_static_session(injected);

        let restored = manager.restore("any").unwrap().unwrap();
        assert_eq!(restored.access_token(), "injected");
        assert_eq!(restored.config_hash(), "any");
    }

    #[test]
    fn storage_errors_are_propagated() {
        let mut storage = MockSessionStorage::new();
        storage
            .expect_get()
            .once()
            .returning(|_| Err(StorageError::Io("disk on fire".to_string())));
        let manager = SessionManager::new(storage);

        assert_matches!(
            manager.restore("key"),
            Err(SessionManagerError::Storage(StorageError::Io(_)))
        );
        assert_eq!(manager.locks.held_count(), 0);
    }

    #[test]
    fn static_session_from_env() {
        let session = numbered_session(7);
        let raw = serde_json::to_string(&session).unwrap();

        let loaded = StaticSession::from_env_with(STATIC_SESSION_ENV_NAME, |_| Ok(raw.clone()))
            .unwrap();
        assert_eq!(loaded, Some(session));

        let missing =
            StaticSession::from_env_with(STATIC_SESSION_ENV_NAME, |_| Err(VarError::NotPresent))
                .unwrap();
        assert_eq!(missing, None);

        assert_matches!(
            StaticSession::from_env_with(STATIC_SESSION_ENV_NAME, |_| Ok("nope".to_string())),
            Err(SessionManagerError::InvalidStaticSession(_))
        );
    }
}
