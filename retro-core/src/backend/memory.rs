/// In-process backend shared by every client of a [`MemoryHub`].
///
/// Mirrors the behavior a hosted row store exposes to browsers:
/// - every committed change is pushed to every subscribed client, the writer
///   included, so writers see their own echoes
/// - deletes cascade on the store side and emit one DELETE per removed row
/// - while a client is disconnected its subscription receives nothing and its
///   requests fail with `Unavailable`
///
/// Broadcast and presence topics do not follow the record connection state.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::{
    BroadcastChannel, BroadcastMessage, ChangeEvent, ChannelStatus, PresenceChannel, PresenceMeta,
    PresenceSnapshot, RecordStore, Subscription, SubscriptionEvent, Transport,
};
use crate::error::{ChannelError, StoreError};
use crate::store::EntityStore;
use crate::types::{new_id, BoardSnapshot, Row, RowKey, Table};

struct RecordSub {
    client_id: String,
    board_id: String,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

#[derive(Default)]
struct PresenceTopic {
    members: PresenceSnapshot,
    /// client id -> participant id it tracks
    owners: HashMap<String, String>,
    subs: Vec<mpsc::UnboundedSender<PresenceSnapshot>>,
}

impl PresenceTopic {
    fn publish(&mut self) {
        let snapshot = self.members.clone();
        self.subs.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

#[derive(Default)]
struct HubInner {
    boards: HashMap<String, EntityStore>,
    offline: Vec<String>,
    record_subs: Vec<RecordSub>,
    topics: HashMap<String, Vec<(String, mpsc::UnboundedSender<BroadcastMessage>)>>,
    presence: HashMap<String, PresenceTopic>,
    reject_writes: usize,
    fail_fetches: usize,
    writes: usize,
}

impl HubInner {
    fn is_online(&self, client_id: &str) -> bool {
        !self.offline.iter().any(|id| id == client_id)
    }

    fn ensure_online(&self, client_id: &str) -> Result<(), StoreError> {
        if self.is_online(client_id) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("client {} is offline", client_id)))
        }
    }

    /// Count the write and consume a queued rejection, if any.
    fn admit_write(&mut self, client_id: &str) -> Result<(), StoreError> {
        self.writes += 1;
        self.ensure_online(client_id)?;
        if self.reject_writes > 0 {
            self.reject_writes -= 1;
            return Err(StoreError::Rejected("rejected by store".to_string()));
        }
        Ok(())
    }

    fn emit(&mut self, board_id: &str, change: ChangeEvent) {
        let offline = &self.offline;
        self.record_subs.retain(|sub| {
            if sub.board_id != board_id || offline.iter().any(|id| id == &sub.client_id) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(SubscriptionEvent::Change(change.clone())).is_ok()
        });
    }

    fn send_status(&mut self, client_id: &str, status: ChannelStatus) {
        self.record_subs.retain(|sub| {
            if sub.client_id != client_id {
                return true;
            }
            sub.tx.send(SubscriptionEvent::Status(status)).is_ok()
        });
    }

    fn board_of(&self, key: &RowKey) -> Option<String> {
        self.boards
            .iter()
            .find(|(_, store)| store.contains(key))
            .map(|(board_id, _)| board_id.clone())
    }
}

/// Shared in-memory record store, broadcast bus and presence registry.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new client connection with its own identity.
    pub fn connect(&self) -> MemoryClient {
        MemoryClient {
            hub: self.clone(),
            id: new_id(),
        }
    }

    /// Load rows directly, without emitting change events.
    pub fn seed(&self, snapshot: BoardSnapshot) {
        let mut inner = self.lock();
        for row in snapshot.into_rows() {
            let board_id = row.board_id().to_string();
            inner.boards.entry(board_id).or_default().put_row(row);
        }
    }

    /// Durable contents of a board.
    pub fn snapshot(&self, board_id: &str) -> BoardSnapshot {
        self.lock()
            .boards
            .get(board_id)
            .map(EntityStore::snapshot)
            .unwrap_or_default()
    }

    /// Reject the next `n` writes from any client.
    pub fn reject_next_writes(&self, n: usize) {
        self.lock().reject_writes = n;
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.lock().fail_fetches = n;
    }

    /// Writes attempted so far, including rejected ones.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Cut a client's record connection. Its subscriptions see `CHANNEL_ERROR`.
    pub fn disconnect(&self, client_id: &str) {
        let mut inner = self.lock();
        if !inner.is_online(client_id) {
            return;
        }
        inner.send_status(client_id, ChannelStatus::ChannelError);
        inner.offline.push(client_id.to_string());
        log::debug!("[retro.memory] Client {} disconnected", client_id);
    }

    /// Restore a client's record connection. Its subscriptions see `SUBSCRIBED`.
    pub fn reconnect(&self, client_id: &str) {
        let mut inner = self.lock();
        if inner.is_online(client_id) {
            return;
        }
        inner.offline.retain(|id| id != client_id);
        inner.send_status(client_id, ChannelStatus::Subscribed);
        log::debug!("[retro.memory] Client {} reconnected", client_id);
    }

    /// Remove a participant from a presence topic, as a heartbeat timeout would.
    pub fn drop_presence(&self, topic: &str, participant_id: &str) {
        let mut inner = self.lock();
        if let Some(presence) = inner.presence.get_mut(topic) {
            presence.owners.retain(|_, p| p != participant_id);
            if presence.members.remove(participant_id).is_some() {
                presence.publish();
            }
        }
    }

    fn fetch(&self, client_id: &str, board_id: &str) -> Result<BoardSnapshot, StoreError> {
        let mut inner = self.lock();
        inner.ensure_online(client_id)?;
        if inner.fail_fetches > 0 {
            inner.fail_fetches -= 1;
            return Err(StoreError::Unavailable("fetch failed".to_string()));
        }
        Ok(inner
            .boards
            .get(board_id)
            .map(EntityStore::snapshot)
            .unwrap_or_default())
    }

    fn insert(&self, client_id: &str, row: Row) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.admit_write(client_id)?;
        let board_id = row.board_id().to_string();
        let store = inner.boards.entry(board_id.clone()).or_default();
        if !store.insert_row(row.clone()) {
            return Err(StoreError::Duplicate(row.key()));
        }
        inner.emit(&board_id, ChangeEvent::Insert { row });
        Ok(())
    }

    fn update(&self, client_id: &str, row: Row) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.admit_write(client_id)?;
        let board_id = row.board_id().to_string();
        let replaced = inner
            .boards
            .get_mut(&board_id)
            .is_some_and(|store| store.replace_row(row.clone()));
        if !replaced {
            return Err(StoreError::NotFound(row.key()));
        }
        inner.emit(&board_id, ChangeEvent::Update { row });
        Ok(())
    }

    fn delete(&self, client_id: &str, key: RowKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.admit_write(client_id)?;
        let board_id = inner
            .board_of(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let Some(store) = inner.boards.get_mut(&board_id) else {
            return Err(StoreError::NotFound(key));
        };

        // Children of a deleted card lose their parent reference.
        let mut released = Vec::new();
        if key.table == Table::Cards {
            let ids: Vec<String> = store
                .children_of(&key.id)
                .iter()
                .map(|c| c.id.clone())
                .collect();
            for id in ids {
                if let Some(card) = store.card_mut(&id) {
                    card.merged_with = None;
                    released.push(Row::Card(card.clone()));
                }
            }
        }
        let removed = store.remove_cascade(&key);

        for row in released {
            inner.emit(&board_id, ChangeEvent::Update { row });
        }
        for row in removed {
            inner.emit(&board_id, ChangeEvent::Delete { key: row.key() });
        }
        Ok(())
    }

    fn subscribe(&self, client_id: &str, board_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if inner.is_online(client_id) {
            let _ = tx.send(SubscriptionEvent::Status(ChannelStatus::Subscribed));
        }
        inner.record_subs.push(RecordSub {
            client_id: client_id.to_string(),
            board_id: board_id.to_string(),
            tx,
        });
        rx
    }
}

/// One client's view of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryClient {
    hub: MemoryHub,
    id: String,
}

impl MemoryClient {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    pub fn disconnect(&self) {
        self.hub.disconnect(&self.id);
    }

    pub fn reconnect(&self) {
        self.hub.reconnect(&self.id);
    }
}

impl RecordStore for MemoryClient {
    fn fetch(&self, board_id: &str) -> BoxFuture<'_, Result<BoardSnapshot, StoreError>> {
        let result = self.hub.fetch(&self.id, board_id);
        Box::pin(async move { result })
    }

    fn insert(&self, row: Row) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.hub.insert(&self.id, row) })
    }

    fn update(&self, row: Row) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.hub.update(&self.id, row) })
    }

    fn delete(&self, key: RowKey) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.hub.delete(&self.id, key) })
    }

    fn subscribe(&self, board_id: &str) -> BoxFuture<'_, Result<Subscription, StoreError>> {
        let subscription = self.hub.subscribe(&self.id, board_id);
        Box::pin(async move { Ok(subscription) })
    }
}

impl Transport for MemoryClient {
    fn records(&self) -> Arc<dyn RecordStore> {
        Arc::new(self.clone())
    }

    fn broadcast(&self, topic: &str) -> Arc<dyn BroadcastChannel> {
        Arc::new(MemoryTopic {
            client: self.clone(),
            topic: topic.to_string(),
        })
    }

    fn presence(&self, topic: &str) -> Arc<dyn PresenceChannel> {
        Arc::new(MemoryTopic {
            client: self.clone(),
            topic: topic.to_string(),
        })
    }
}

/// A client's handle on one broadcast or presence topic.
struct MemoryTopic {
    client: MemoryClient,
    topic: String,
}

impl BroadcastChannel for MemoryTopic {
    fn publish(&self, message: BroadcastMessage) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let mut inner = self.client.hub.lock();
            if let Some(subs) = inner.topics.get_mut(&self.topic) {
                subs.retain(|(client_id, tx)| {
                    client_id == &self.client.id || tx.send(message.clone()).is_ok()
                });
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<BroadcastMessage>, ChannelError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            self.client
                .hub
                .lock()
                .topics
                .entry(self.topic.clone())
                .or_default()
                .push((self.client.id.clone(), tx));
            Ok(rx)
        })
    }
}

impl PresenceChannel for MemoryTopic {
    fn track(&self, meta: PresenceMeta) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let mut inner = self.client.hub.lock();
            let presence = inner.presence.entry(self.topic.clone()).or_default();
            if let Some(previous) = presence
                .owners
                .insert(self.client.id.clone(), meta.participant_id.clone())
            {
                presence.members.remove(&previous);
            }
            presence.members.insert(meta.participant_id.clone(), meta);
            presence.publish();
            Ok(())
        })
    }

    fn untrack(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let mut inner = self.client.hub.lock();
            if let Some(presence) = inner.presence.get_mut(&self.topic) {
                if let Some(participant_id) = presence.owners.remove(&self.client.id) {
                    presence.members.remove(&participant_id);
                    presence.publish();
                }
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<PresenceSnapshot>, ChannelError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut inner = self.client.hub.lock();
            let presence = inner.presence.entry(self.topic.clone()).or_default();
            tx.send(presence.members.clone())
                .map_err(|_| ChannelError::Closed(self.topic.clone()))?;
            presence.subs.push(tx);
            Ok(rx)
        })
    }
}
