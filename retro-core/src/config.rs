/// Engine tuning shared by every board session.
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Local timer recompute interval.
    pub tick_interval_ms: u64,
    /// How long the connection stays `Reconnected` before settling to `Connected`.
    pub reconnect_grace_ms: u64,
    /// Durable writes that take longer than this are treated as failed.
    pub write_timeout_ms: u64,
    pub max_columns: usize,
    /// Capacity of the session event bus.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            reconnect_grace_ms: 3000,
            write_timeout_ms: 10_000,
            max_columns: 10,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
