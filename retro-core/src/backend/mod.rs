pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ChannelError, StoreError};
use crate::types::{BoardSnapshot, Row, RowKey};

/// One row-level change reported by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert { row: Row },
    Update { row: Row },
    /// Deletes only carry the identity of the removed row.
    Delete { key: RowKey },
}

/// Lifecycle reported by a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Items delivered on a change subscription, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

pub type Subscription = mpsc::UnboundedReceiver<SubscriptionEvent>;

/// Durable, per-board record store.
///
/// Subscriptions may drop events while disconnected but never reorder events
/// for the same row.
pub trait RecordStore: Send + Sync {
    /// Every row belonging to `board_id`.
    fn fetch(&self, board_id: &str) -> BoxFuture<'_, Result<BoardSnapshot, StoreError>>;

    fn insert(&self, row: Row) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Replace the stored row with the same key.
    fn update(&self, row: Row) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Delete a row; the store cascades dependents on its side.
    fn delete(&self, key: RowKey) -> BoxFuture<'_, Result<(), StoreError>>;

    fn subscribe(&self, board_id: &str) -> BoxFuture<'_, Result<Subscription, StoreError>>;
}

/// A named event on an ephemeral broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Best-effort fan-out channel for one topic. A publisher does not receive its
/// own messages.
pub trait BroadcastChannel: Send + Sync {
    fn publish(&self, message: BroadcastMessage) -> BoxFuture<'_, Result<(), ChannelError>>;

    fn subscribe(
        &self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<BroadcastMessage>, ChannelError>>;
}

/// Descriptor a client publishes about itself while online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub participant_id: String,
    pub display_name: String,
    pub is_admin: bool,
    pub online_at: DateTime<Utc>,
}

/// Full membership of a presence channel, keyed by participant id.
pub type PresenceSnapshot = BTreeMap<String, PresenceMeta>;

/// Ephemeral membership channel for one topic. Every change delivers the
/// complete member set.
pub trait PresenceChannel: Send + Sync {
    fn track(&self, meta: PresenceMeta) -> BoxFuture<'_, Result<(), ChannelError>>;

    fn untrack(&self) -> BoxFuture<'_, Result<(), ChannelError>>;

    fn subscribe(
        &self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<PresenceSnapshot>, ChannelError>>;
}

/// Everything one client connection needs to reach its collaborators.
pub trait Transport: Send + Sync {
    fn records(&self) -> Arc<dyn RecordStore>;

    fn broadcast(&self, topic: &str) -> Arc<dyn BroadcastChannel>;

    fn presence(&self, topic: &str) -> Arc<dyn PresenceChannel>;
}

pub fn timer_topic(board_id: &str) -> String {
    format!("timer:{}", board_id)
}

pub fn presence_topic(board_id: &str) -> String {
    format!("presence:{}", board_id)
}
