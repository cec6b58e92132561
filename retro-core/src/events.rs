/// Notifications a board session pushes to its UI surfaces.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::timer::TimerState;

/// Health of the change-stream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Subscription requested, not yet confirmed.
    Connecting,
    Connected,
    /// Lost; the local snapshot is kept but may be stale.
    Disconnected,
    /// Back after a gap and freshly re-fetched; settles to `Connected`.
    Reconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// The entity snapshot changed; re-render from it.
    StoreChanged,
    Connection { status: ConnectionStatus },
    Timer { state: TimerState },
    /// The countdown reached zero. Fired once per run.
    TimerExpired,
    Presence { online: BTreeSet<String> },
}
