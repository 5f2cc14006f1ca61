//! Session registry and poke fan-out for the realtime channel.
//!
//! The registry is created once per server and handed to the routes as
//! state. Each session owns a queue with room for a single poke: a poke that
//! finds the queue full is already covered by the one waiting there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    closed: bool,
    users: HashMap<String, HashMap<String, mpsc::Sender<()>>>,
}

/// One registered realtime connection. Dropping it unregisters it.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pokes: mpsc::Receiver<()>,
    registry: SessionRegistry,
}

impl Session {
    /// Waits for the next poke. `None` once the registry is closed.
    pub async fn next_poke(&mut self) -> Option<()> {
        self.pokes.recv().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.unregister(&self.user_id, &self.id);
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session to `user_id`'s group, or `None` once the registry has
    /// been closed for shutdown.
    pub fn register(&self, user_id: &str) -> Option<Session> {
        let (sender, receiver) = mpsc::channel(1);
        let id = uuid::Uuid::new_v4().to_string();

        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state
            .users
            .entry(user_id.to_string())
            .or_default()
            .insert(id.clone(), sender);
        drop(state);

        debug!(user_id, session_id = %id, "realtime session registered");
        Some(Session {
            id,
            user_id: user_id.to_string(),
            pokes: receiver,
            registry: self.clone(),
        })
    }

    pub fn unregister(&self, user_id: &str, session_id: &str) {
        let mut state = self.lock();
        if let Some(sessions) = state.users.get_mut(user_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                state.users.remove(user_id);
            }
        }
        drop(state);

        debug!(user_id, session_id, "realtime session unregistered");
    }

    /// Pokes every session of `user_id` except `exclude`. Returns how many
    /// sessions have a poke pending afterwards.
    pub fn notify(&self, user_id: &str, exclude: Option<&str>) -> usize {
        let mut state = self.lock();
        let Some(sessions) = state.users.get_mut(user_id) else {
            return 0;
        };

        let mut reached = 0;
        sessions.retain(|session_id, sender| {
            if exclude == Some(session_id.as_str()) {
                return true;
            }
            match sender.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {
                    reached += 1;
                    true
                }
                Err(TrySendError::Closed(())) => false,
            }
        });

        if sessions.is_empty() {
            state.users.remove(user_id);
        }

        reached
    }

    pub fn session_count(&self, user_id: &str) -> usize {
        self.lock().users.get(user_id).map_or(0, HashMap::len)
    }

    /// Drops every session queue and refuses new registrations.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.closed = true;
        let dropped: usize = state.users.values().map(HashMap::len).sum();
        state.users.clear();
        drop(state);

        debug!(sessions = dropped, "realtime registry closed");
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
