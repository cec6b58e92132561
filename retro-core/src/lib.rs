//! Client-side sync engine for collaborative retrospective boards.
//!
//! A [`BoardSession`] owns one board's local entity store and keeps it in step
//! with a durable record store: local intents go through the optimistic
//! [`Gateway`], remote changes come in through the [`Reconciler`]. The shared
//! countdown ([`TimerProtocol`]) and the online set ([`PresenceTracker`]) ride
//! on ephemeral broadcast channels and are never persisted.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod merge;
pub mod position;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod state;
pub mod store;
pub mod templates;
pub mod timer;
pub mod types;

pub use backend::memory::{MemoryClient, MemoryHub};
pub use backend::{ChangeEvent, ChannelStatus, RecordStore, Transport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{ChannelError, StoreError, SyncError, ValidationError};
pub use events::{ConnectionStatus, SessionEvent};
pub use gateway::{create_board, Gateway, VoteToggle};
pub use presence::PresenceTracker;
pub use reconciler::Reconciler;
pub use session::BoardSession;
pub use state::SharedStore;
pub use store::EntityStore;
pub use timer::{TimerMessage, TimerProtocol, TimerState, TimerStatus};
pub use types::*;
