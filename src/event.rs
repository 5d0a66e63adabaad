use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::warn;

/// Notifications emitted by authenticators and grant adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    AuthenticationBefore { session_id: String },
    AuthenticationOk { session_id: String },
    AuthenticationFailure { session_id: String, reason: String },
    RefreshBefore { session_id: String },
    RefreshOk { session_id: String },
    RefreshFailure { session_id: String, reason: String },
    SessionRestored { session_id: String },
    SessionNotRestored { session_id: String, reason: String },
    SessionRevoked { session_id: String },
    /// A human must act, e.g. open `url` to approve a device code. Polling continues meanwhile.
    BlockingResponseRequired { kind: String, url: String },
    BlockingResponseOk { kind: String },
    BlockingResponseFailed { kind: String, reason: String },
}

impl AuthEvent {
    /// Wire-style name, e.g. `authentication-ok`.
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::AuthenticationBefore { .. } => "authentication-before",
            AuthEvent::AuthenticationOk { .. } => "authentication-ok",
            AuthEvent::AuthenticationFailure { .. } => "authentication-failure",
            AuthEvent::RefreshBefore { .. } => "refresh-before",
            AuthEvent::RefreshOk { .. } => "refresh-ok",
            AuthEvent::RefreshFailure { .. } => "refresh-failure",
            AuthEvent::SessionRestored { .. } => "session-restored",
            AuthEvent::SessionNotRestored { .. } => "session-not-restored",
            AuthEvent::SessionRevoked { .. } => "session-revoked",
            AuthEvent::BlockingResponseRequired { .. } => "blocking-response-required",
            AuthEvent::BlockingResponseOk { .. } => "blocking-response-ok",
            AuthEvent::BlockingResponseFailed { .. } => "blocking-response-failed",
        }
    }
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &AuthEvent);
}

// Accept closures as EventListener implementations
impl<F> EventListener for F
where
    F: Fn(&AuthEvent) + Send + Sync,
{
    fn on_event(&self, event: &AuthEvent) {
        self(event)
    }
}

/// Fan-out of [`AuthEvent`]s to the registered listeners, in registration order.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L>(&self, listener: L)
    where
        L: EventListener + 'static,
    {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(_) => warn!("event listeners lock poisoned, listener dropped"),
        }
    }

    pub fn dispatch(&self, event: AuthEvent) {
        // Listeners are cloned out so a listener may subscribe without deadlocking.
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                warn!(event = event.name(), "event listeners lock poisoned");
                return;
            }
        };
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.listeners.read().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("EventDispatcher")
            .field("listeners", &count)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Subscribes a recorder and returns the shared list of received events.
    pub(crate) fn record_events(dispatcher: &EventDispatcher) -> Arc<Mutex<Vec<AuthEvent>>> {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        dispatcher.subscribe(move |event: &AuthEvent| sink.lock().unwrap().push(event.clone()));
        recorded
    }

    pub(crate) fn event_names(recorded: &Mutex<Vec<AuthEvent>>) -> Vec<&'static str> {
        recorded.lock().unwrap().iter().map(AuthEvent::name).collect()
    }

    #[test]
    fn listeners_receive_events_in_order() {
        let dispatcher = EventDispatcher::new();
        let first = record_events(&dispatcher);
        let second = record_events(&dispatcher.clone());

        dispatcher.dispatch(AuthEvent::SessionRestored {
            session_id: "s".into(),
        });
        dispatcher.dispatch(AuthEvent::SessionRevoked {
            session_id: "s".into(),
        });

        assert_eq!(
            event_names(&first),
            vec!["session-restored", "session-revoked"]
        );
        assert_eq!(event_names(&first), event_names(&second));
    }
}
