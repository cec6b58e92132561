use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{presence_topic, timer_topic, Transport};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::events::{ConnectionStatus, SessionEvent};
use crate::gateway::Gateway;
use crate::presence::PresenceTracker;
use crate::reconciler::Reconciler;
use crate::state::SharedStore;
use crate::timer::TimerProtocol;
use crate::types::{BoardSnapshot, Participant};

/// Everything one client holds for one open board. Dropping the session stops
/// its background tasks.
pub struct BoardSession {
    board_id: String,
    state: SharedStore,
    gateway: Gateway,
    reconciler: Reconciler,
    reconciler_task: Option<JoinHandle<()>>,
    timer: TimerProtocol,
    presence: PresenceTracker,
}

impl BoardSession {
    /// Subscribe to the board's changes, load it, and join its timer topic.
    pub async fn open(
        board_id: &str,
        transport: &dyn Transport,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = SharedStore::new(events.clone());
        let records = transport.records();

        // Subscribe before the first fetch so nothing in between is lost.
        let reconciler = Reconciler::new(board_id, state.clone(), records.clone(), config.clone());
        let reconciler_task = reconciler.clone().start().await?;

        let gateway = Gateway::new(board_id, state.clone(), records, clock.clone(), config.clone());
        if let Err(e) = gateway.load().await {
            reconciler_task.abort();
            return Err(e);
        }

        let timer = TimerProtocol::new(
            transport.broadcast(&timer_topic(board_id)),
            clock.clone(),
            events.clone(),
            &config,
        );
        if let Err(e) = timer.attach().await {
            reconciler_task.abort();
            return Err(e);
        }

        let presence =
            PresenceTracker::new(transport.presence(&presence_topic(board_id)), clock, events);
        log::info!("[retro.session.open] Opened board {}", board_id);

        Ok(Self {
            board_id: board_id.to_string(),
            state,
            gateway,
            reconciler,
            reconciler_task: Some(reconciler_task),
            timer,
            presence,
        })
    }

    /// Join as a new participant and announce presence.
    pub async fn join(&self, display_name: &str) -> Result<Participant, SyncError> {
        let participant = self.gateway.join(display_name).await?;
        self.presence.join(&participant).await?;
        Ok(participant)
    }

    /// Continue as a participant that joined in an earlier session.
    pub async fn resume(&self, participant_id: &str) -> Result<Participant, SyncError> {
        let participant = self.gateway.resume(participant_id)?;
        self.presence.join(&participant).await?;
        Ok(participant)
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn timer(&self) -> &TimerProtocol {
        &self.timer
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn state(&self) -> &SharedStore {
        &self.state
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.state.snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.reconciler.status()
    }

    pub fn is_archived(&self) -> bool {
        self.gateway.is_archived()
    }

    /// Leave presence and stop all background work.
    pub async fn close(mut self) {
        if self.gateway.participant_id().is_some() {
            if let Err(e) = self.presence.leave().await {
                log::warn!("[retro.session.close] Leaving presence failed: {}", e);
            }
        }
        self.stop();
        log::info!("[retro.session.close] Closed board {}", self.board_id);
    }

    fn stop(&mut self) {
        self.timer.detach();
        self.presence.stop();
        if let Some(task) = self.reconciler_task.take() {
            task.abort();
        }
    }
}

impl Drop for BoardSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BoardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardSession")
            .field("board_id", &self.board_id)
            .field("status", &self.connection_status())
            .finish_non_exhaustive()
    }
}
