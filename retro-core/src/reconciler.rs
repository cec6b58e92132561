/// Folds a board's change stream into the local store.
///
/// - INSERT of an id already present is our own echo and is dropped
/// - UPDATE overwrites the whole row, inserting it if unknown (last writer wins)
/// - DELETE cascades locally as the store does remotely
///
/// Events can be lost while the subscription is down, so every reconnect is
/// followed by a full re-fetch that replaces the snapshot.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::backend::{ChangeEvent, ChannelStatus, RecordStore, Subscription, SubscriptionEvent};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::events::{ConnectionStatus, SessionEvent};
use crate::gateway::refresh_snapshot;
use crate::merge;
use crate::state::SharedStore;
use crate::store::EntityStore;
use crate::types::Table;

/// Apply one change. Returns whether the store changed.
pub fn apply_change(store: &mut EntityStore, change: ChangeEvent) -> bool {
    match change {
        ChangeEvent::Insert { row } => {
            let key = row.key();
            let inserted = store.insert_row(row);
            if !inserted {
                log::trace!("[retro.reconciler] Ignoring echo for {}", key);
            }
            inserted
        }
        ChangeEvent::Update { row } => {
            if store.get_row(&row.key()).as_ref() == Some(&row) {
                return false;
            }
            store.put_row(row);
            true
        }
        ChangeEvent::Delete { key } => {
            let released = if key.table == Table::Cards {
                merge::release_children(store, &key.id)
            } else {
                Vec::new()
            };
            let removed = store.remove_cascade(&key);
            !removed.is_empty() || !released.is_empty()
        }
    }
}

/// Keeps one board's store in step with the durable record store.
#[derive(Clone)]
pub struct Reconciler {
    board_id: String,
    state: SharedStore,
    records: Arc<dyn RecordStore>,
    config: EngineConfig,
    status: Arc<Mutex<ConnectionStatus>>,
    /// Bumped on every status change so a stale grace timer cannot settle.
    epoch: Arc<AtomicU64>,
}

impl Reconciler {
    pub fn new(
        board_id: impl Into<String>,
        state: SharedStore,
        records: Arc<dyn RecordStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            board_id: board_id.into(),
            state,
            records,
            config,
            status: Arc::new(Mutex::new(ConnectionStatus::Connecting)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = std::mem::replace(
            &mut *self.status.lock().unwrap_or_else(PoisonError::into_inner),
            status,
        );
        if previous != status {
            log::info!(
                "[retro.reconciler.status] Board {}: {:?} -> {:?}",
                self.board_id,
                previous,
                status
            );
            self.state.notify(SessionEvent::Connection { status });
        }
        epoch
    }

    /// Subscribe to the board's changes and process them on a background task.
    pub async fn start(self) -> Result<JoinHandle<()>, SyncError> {
        self.set_status(ConnectionStatus::Connecting);
        let subscription = self.records.subscribe(&self.board_id).await?;
        Ok(tokio::spawn(self.run(subscription)))
    }

    pub async fn run(self, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            match event {
                SubscriptionEvent::Status(status) => self.on_status(status).await,
                SubscriptionEvent::Change(change) => {
                    self.state.apply(|store| apply_change(store, change));
                }
            }
        }
        log::warn!("[retro.reconciler] Change stream for {} ended", self.board_id);
        self.set_status(ConnectionStatus::Disconnected);
    }

    pub async fn on_status(&self, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => match self.status() {
                ConnectionStatus::Connecting => {
                    self.set_status(ConnectionStatus::Connected);
                }
                ConnectionStatus::Disconnected => self.repair().await,
                ConnectionStatus::Connected | ConnectionStatus::Reconnected => {}
            },
            ChannelStatus::ChannelError | ChannelStatus::TimedOut | ChannelStatus::Closed => {
                log::warn!(
                    "[retro.reconciler] Subscription for {} lost: {:?}",
                    self.board_id,
                    status
                );
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    /// Re-fetch everything after a gap, then settle back to connected.
    async fn repair(&self) {
        self.set_status(ConnectionStatus::Reconnected);
        if let Err(e) =
            refresh_snapshot(self.records.as_ref(), &self.board_id, &self.state, &self.config).await
        {
            log::warn!(
                "[retro.reconciler.refetch] Re-fetch of {} failed, still stale: {}",
                self.board_id,
                e
            );
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let this = self.clone();
        let grace = self.config.reconnect_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if this.epoch.load(Ordering::SeqCst) == epoch
                && this.status() == ConnectionStatus::Reconnected
            {
                this.set_status(ConnectionStatus::Connected);
            }
        });
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("board_id", &self.board_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
