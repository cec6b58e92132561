/// Shared handle to a session's entity store plus its event bus.
///
/// The lock is only ever held inside the closures below, never across an
/// await point, so a slow durable write never blocks other intents.
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::events::SessionEvent;
use crate::store::EntityStore;
use crate::types::BoardSnapshot;

#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<RwLock<EntityStore>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SharedStore {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EntityStore::new())),
            events,
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&EntityStore) -> R) -> R {
        let store = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&store)
    }

    /// Mutate the store and notify subscribers.
    pub fn update<R>(&self, f: impl FnOnce(&mut EntityStore) -> R) -> R {
        let result = {
            let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut store)
        };
        self.notify(SessionEvent::StoreChanged);
        result
    }

    /// Validate and mutate under one lock. Subscribers are notified only on `Ok`.
    pub fn try_update<T, E>(&self, f: impl FnOnce(&mut EntityStore) -> Result<T, E>) -> Result<T, E> {
        let result = {
            let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut store)
        };
        if result.is_ok() {
            self.notify(SessionEvent::StoreChanged);
        }
        result
    }

    /// Mutate the store; subscribers are notified only if `f` reports a change.
    pub fn apply(&self, f: impl FnOnce(&mut EntityStore) -> bool) -> bool {
        let changed = {
            let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut store)
        };
        if changed {
            self.notify(SessionEvent::StoreChanged);
        }
        changed
    }

    pub fn replace_all(&self, snapshot: BoardSnapshot) {
        self.update(|store| store.replace_all(snapshot));
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.read(|store| store.snapshot())
    }

    pub fn events(&self) -> &broadcast::Sender<SessionEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn notify(&self, event: SessionEvent) {
        // No receivers is fine: nobody is rendering yet.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}
