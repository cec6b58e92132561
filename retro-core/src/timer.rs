/// Shared countdown timer, synchronized over a broadcast topic.
///
/// Nothing is persisted. Every client holds its own copy of [`TimerState`] and
/// recomputes `remaining` from `started_at` on each tick, so clients converge
/// on the same expiry without exchanging ticks. A client that joins late asks
/// its peers for their state and adopts the first answer.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{BroadcastChannel, BroadcastMessage};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{ChannelError, SyncError, ValidationError};
use crate::events::SessionEvent;
use crate::types::new_id;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Expired,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Idle => "idle",
            TimerStatus::Running => "running",
            TimerStatus::Paused => "paused",
            TimerStatus::Expired => "expired",
        }
    }
}

/// Durations are whole seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub duration: u32,
    pub remaining: u32,
    pub status: TimerStatus,
    /// Set only while running.
    pub started_at: Option<DateTime<Utc>>,
}

impl TimerState {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Seconds left at `now`. Only a running timer moves.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u32 {
        match (self.status, self.started_at) {
            (TimerStatus::Running, Some(started_at)) => {
                let elapsed = (now - started_at).num_seconds().max(0);
                (i64::from(self.duration) - elapsed).max(0) as u32
            }
            _ => self.remaining,
        }
    }
}

/// Messages on a board's timer topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum TimerMessage {
    #[serde(rename = "timer:start")]
    Start(TimerState),
    #[serde(rename = "timer:pause")]
    Pause(TimerState),
    #[serde(rename = "timer:resume")]
    Resume(TimerState),
    #[serde(rename = "timer:reset")]
    Reset(TimerState),
    #[serde(rename = "timer:sync-request")]
    SyncRequest { requester: String },
    #[serde(rename = "timer:sync-response")]
    SyncResponse { responder: String, state: TimerState },
}

impl TimerMessage {
    pub fn to_broadcast(&self) -> Result<BroadcastMessage, ChannelError> {
        let malformed = |reason: String| ChannelError::Payload {
            event: "timer".to_string(),
            reason,
        };
        match serde_json::to_value(self).map_err(|e| malformed(e.to_string()))? {
            serde_json::Value::Object(mut map) => {
                let event = match map.remove("event") {
                    Some(serde_json::Value::String(event)) => event,
                    _ => return Err(malformed("missing event name".to_string())),
                };
                let payload = map.remove("payload").unwrap_or_default();
                Ok(BroadcastMessage { event, payload })
            }
            other => Err(malformed(format!("unexpected shape {}", other))),
        }
    }

    pub fn from_broadcast(message: &BroadcastMessage) -> Result<Self, ChannelError> {
        let value = serde_json::json!({
            "event": message.event,
            "payload": message.payload,
        });
        serde_json::from_value(value).map_err(|e| ChannelError::Payload {
            event: message.event.clone(),
            reason: e.to_string(),
        })
    }
}

struct TimerInner {
    state: TimerState,
    /// The expiry alert for the current run has fired.
    alerted: bool,
    /// A sync request is out and no response has been adopted yet.
    awaiting_sync: bool,
    ticker: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

struct Shared {
    client_id: String,
    channel: Arc<dyn BroadcastChannel>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
    tick_interval: Duration,
    inner: Mutex<TimerInner>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in [inner.ticker.take(), inner.listener.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn current(&self) -> TimerState {
        let mut state = self.lock().state.clone();
        state.remaining = state.remaining_at(self.clock.now());
        state
    }

    /// Recompute `remaining`. Returns whether the timer is still running.
    fn tick(&self) -> bool {
        let now = self.clock.now();
        let (state, expired) = {
            let mut inner = self.lock();
            if inner.state.status != TimerStatus::Running {
                return false;
            }
            let remaining = inner.state.remaining_at(now);
            inner.state.remaining = remaining;
            let mut expired = false;
            if remaining == 0 {
                inner.state.status = TimerStatus::Expired;
                expired = !inner.alerted;
                inner.alerted = true;
            }
            (inner.state.clone(), expired)
        };
        if expired {
            log::info!("[retro.timer.expired] Countdown of {}s finished", state.duration);
            self.emit(SessionEvent::Timer { state });
            self.emit(SessionEvent::TimerExpired);
            return false;
        }
        self.emit(SessionEvent::Timer { state });
        true
    }
}

fn apply(shared: &Arc<Shared>, state: TimerState) {
    let running = state.status == TimerStatus::Running;
    {
        let mut inner = shared.lock();
        // An expired state adopted from a peer has already alerted there. A
        // repeat of the countdown that already ran out here must not re-arm.
        let repeat = running
            && inner.state.started_at == state.started_at
            && inner.state.duration == state.duration;
        inner.alerted = state.status == TimerStatus::Expired || (repeat && inner.alerted);
        inner.state = state.clone();
        if running {
            let alive = inner.ticker.as_ref().is_some_and(|h| !h.is_finished());
            if !alive {
                inner.ticker = spawn_ticker(shared);
            }
        } else if let Some(handle) = inner.ticker.take() {
            handle.abort();
        }
    }
    shared.emit(SessionEvent::Timer { state });
    if running {
        shared.tick();
    }
}

fn spawn_ticker(shared: &Arc<Shared>) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let period = shared.tick_interval;
    Some(runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if !shared.tick() {
                break;
            }
        }
    }))
}

fn handle(shared: &Arc<Shared>, message: TimerMessage) -> Option<TimerMessage> {
    match message {
        TimerMessage::Start(state)
        | TimerMessage::Pause(state)
        | TimerMessage::Resume(state)
        | TimerMessage::Reset(state) => {
            shared.lock().awaiting_sync = false;
            apply(shared, state);
            None
        }
        TimerMessage::SyncRequest { requester } => {
            if requester == shared.client_id {
                return None;
            }
            Some(TimerMessage::SyncResponse {
                responder: shared.client_id.clone(),
                state: shared.current(),
            })
        }
        TimerMessage::SyncResponse { responder, state } => {
            let adopt = std::mem::take(&mut shared.lock().awaiting_sync);
            if adopt {
                log::debug!(
                    "[retro.timer.sync] Adopted {} timer from {}",
                    state.status.as_str(),
                    responder
                );
                apply(shared, state);
            }
            None
        }
    }
}

/// One client's participation in a board's shared timer.
#[derive(Clone)]
pub struct TimerProtocol {
    shared: Arc<Shared>,
}

impl TimerProtocol {
    pub fn new(
        channel: Arc<dyn BroadcastChannel>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<SessionEvent>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client_id: new_id(),
                channel,
                clock,
                events,
                tick_interval: config.tick_interval(),
                inner: Mutex::new(TimerInner {
                    state: TimerState::idle(),
                    alerted: false,
                    awaiting_sync: false,
                    ticker: None,
                    listener: None,
                }),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Current state with `remaining` recomputed for now.
    pub fn state(&self) -> TimerState {
        self.shared.current()
    }

    /// Subscribe to the topic and ask peers for the running timer.
    pub async fn attach(&self) -> Result<(), SyncError> {
        let mut rx = self.shared.channel.subscribe().await?;
        let weak = Arc::downgrade(&self.shared);
        let listener = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let decoded = match TimerMessage::from_broadcast(&message) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        log::warn!("[retro.timer.recv] Ignoring message: {}", e);
                        continue;
                    }
                };
                let Some(reply) = handle(&shared, decoded) else {
                    continue;
                };
                let sent = match reply.to_broadcast() {
                    Ok(encoded) => shared.channel.publish(encoded).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    log::warn!("[retro.timer.sync] Failed to answer sync request: {}", e);
                }
            }
        });
        {
            let mut inner = self.shared.lock();
            if let Some(previous) = inner.listener.replace(listener) {
                previous.abort();
            }
            inner.awaiting_sync = true;
        }
        self.publish(TimerMessage::SyncRequest {
            requester: self.shared.client_id.clone(),
        })
        .await
    }

    /// Stop listening and ticking. The local state is kept.
    pub fn detach(&self) {
        let mut inner = self.shared.lock();
        for handle in [inner.ticker.take(), inner.listener.take()].into_iter().flatten() {
            handle.abort();
        }
        inner.awaiting_sync = false;
    }

    async fn publish(&self, message: TimerMessage) -> Result<(), SyncError> {
        let encoded = message.to_broadcast()?;
        if let Err(e) = self.shared.channel.publish(encoded).await {
            log::warn!("[retro.timer.send] Broadcast of {:?} failed: {}", message, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn transition_error(action: &'static str, status: TimerStatus) -> SyncError {
        ValidationError::InvalidTimerTransition {
            action,
            status: status.as_str(),
        }
        .into()
    }

    pub async fn start(&self, duration_secs: u32) -> Result<TimerState, SyncError> {
        if duration_secs == 0 {
            return Err(ValidationError::InvalidDuration.into());
        }
        let state = TimerState {
            duration: duration_secs,
            remaining: duration_secs,
            status: TimerStatus::Running,
            started_at: Some(self.shared.clock.now()),
        };
        self.shared.lock().awaiting_sync = false;
        apply(&self.shared, state.clone());
        log::info!("[retro.timer.start] {}s countdown started", duration_secs);
        self.publish(TimerMessage::Start(state.clone())).await?;
        Ok(state)
    }

    /// Freeze the countdown. Pausing at zero expires instead.
    pub async fn pause(&self) -> Result<TimerState, SyncError> {
        let current = self.shared.current();
        if current.status != TimerStatus::Running {
            return Err(Self::transition_error("pause", current.status));
        }
        if current.remaining == 0 {
            self.shared.tick();
            return Ok(self.shared.current());
        }
        let state = TimerState {
            status: TimerStatus::Paused,
            started_at: None,
            ..current
        };
        apply(&self.shared, state.clone());
        self.publish(TimerMessage::Pause(state.clone())).await?;
        Ok(state)
    }

    /// Continue from the paused `remaining` with a synthetic `started_at`.
    pub async fn resume(&self) -> Result<TimerState, SyncError> {
        let current = self.shared.current();
        if current.status != TimerStatus::Paused {
            return Err(Self::transition_error("resume", current.status));
        }
        let elapsed = i64::from(current.duration.saturating_sub(current.remaining));
        let state = TimerState {
            status: TimerStatus::Running,
            started_at: Some(self.shared.clock.now() - chrono::Duration::seconds(elapsed)),
            ..current
        };
        apply(&self.shared, state.clone());
        self.publish(TimerMessage::Resume(state.clone())).await?;
        Ok(state)
    }

    pub async fn reset(&self) -> Result<(), SyncError> {
        apply(&self.shared, TimerState::idle());
        self.publish(TimerMessage::Reset(TimerState::idle())).await
    }

    /// Recompute from the clock now instead of waiting for the next tick.
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Apply one inbound message. Returns the reply to publish, if any.
    pub fn handle_message(&self, message: TimerMessage) -> Option<TimerMessage> {
        handle(&self.shared, message)
    }
}

impl std::fmt::Debug for TimerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerProtocol")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.shared.lock().state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryHub;
    use crate::backend::Transport;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        ))
    }

    fn timer_on(hub: &MemoryHub, clock: Arc<ManualClock>) -> (TimerProtocol, broadcast::Receiver<SessionEvent>) {
        let (events, rx) = broadcast::channel(256);
        let channel = hub.connect().broadcast("timer:b1");
        (
            TimerProtocol::new(channel, clock, events, &EngineConfig::default()),
            rx,
        )
    }

    fn expiries(rx: &mut broadcast::Receiver<SessionEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if event == SessionEvent::TimerExpired {
                count += 1;
            }
        }
        count
    }

    /// Let spawned listeners drain their queues.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_remaining_is_derived_from_start() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let state = TimerState {
            duration: 300,
            remaining: 300,
            status: TimerStatus::Running,
            started_at: Some(t0),
        };
        assert_eq!(state.remaining_at(t0 + chrono::Duration::milliseconds(90_900)), 210);
        assert_eq!(state.remaining_at(t0 + chrono::Duration::seconds(400)), 0);
        // A peer whose clock runs behind never sees more than the full duration.
        assert_eq!(state.remaining_at(t0 - chrono::Duration::seconds(5)), 300);
    }

    #[test]
    fn test_wire_shape() {
        let message = TimerMessage::SyncRequest {
            requester: "c1".to_string(),
        };
        let encoded = message.to_broadcast().unwrap();
        assert_eq!(encoded.event, "timer:sync-request");
        assert_eq!(encoded.payload["requester"], "c1");
        assert_eq!(TimerMessage::from_broadcast(&encoded).unwrap(), message);

        let start = TimerMessage::Start(TimerState {
            duration: 60,
            remaining: 60,
            status: TimerStatus::Running,
            started_at: None,
        })
        .to_broadcast()
        .unwrap();
        assert_eq!(start.event, "timer:start");
        assert_eq!(start.payload["status"], "running");
        let fields = start.payload.as_object().unwrap();
        assert!(fields.contains_key("started_at"));
        assert!(!fields.contains_key("startedAt"));

        let bogus = BroadcastMessage {
            event: "timer:explode".to_string(),
            payload: serde_json::Value::Null,
        };
        assert!(matches!(
            TimerMessage::from_broadcast(&bogus),
            Err(ChannelError::Payload { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let hub = MemoryHub::new();
        let (timer, _rx) = timer_on(&hub, clock());
        assert_eq!(
            timer.start(0).await.unwrap_err(),
            SyncError::Validation(ValidationError::InvalidDuration)
        );
        assert!(timer.pause().await.unwrap_err().is_validation());
        assert!(timer.resume().await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_resume_preserves_remaining() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (timer, _rx) = timer_on(&hub, clock.clone());

        timer.start(60).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(17_400));
        let paused = timer.pause().await.unwrap();
        assert_eq!(paused.remaining, 43);
        assert_eq!(paused.started_at, None);

        clock.advance(chrono::Duration::seconds(100));
        assert_eq!(timer.state().remaining, 43);

        let resumed = timer.resume().await.unwrap();
        assert_eq!(resumed.remaining_at(clock.now()), 43);
        clock.advance(chrono::Duration::seconds(3));
        assert_eq!(timer.state().remaining, 40);
    }

    #[tokio::test]
    async fn test_expiry_alerts_once() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (timer, mut rx) = timer_on(&hub, clock.clone());

        timer.start(5).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));
        timer.tick();
        timer.tick();
        settle().await;
        timer.tick();

        assert_eq!(timer.state().status, TimerStatus::Expired);
        assert_eq!(timer.state().remaining, 0);
        assert_eq!(expiries(&mut rx), 1);
        assert!(timer.pause().await.unwrap_err().is_validation());

        timer.reset().await.unwrap();
        assert_eq!(timer.state(), TimerState::idle());
    }

    #[tokio::test]
    async fn test_duplicate_start_does_not_alert_again() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (timer, mut rx) = timer_on(&hub, clock.clone());

        let started = timer.start(5).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));
        timer.tick();
        assert_eq!(expiries(&mut rx), 1);

        timer.handle_message(TimerMessage::Start(started));
        timer.tick();
        settle().await;
        assert_eq!(timer.state().status, TimerStatus::Expired);
        assert_eq!(expiries(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_peers_follow_start_and_pause() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (a, _) = timer_on(&hub, clock.clone());
        let (b, _) = timer_on(&hub, clock.clone());
        a.attach().await.unwrap();
        b.attach().await.unwrap();
        settle().await;

        a.start(120).await.unwrap();
        settle().await;
        assert_eq!(b.state().status, TimerStatus::Running);

        clock.advance(chrono::Duration::seconds(20));
        a.pause().await.unwrap();
        settle().await;
        assert_eq!(b.state().status, TimerStatus::Paused);
        assert_eq!(b.state().remaining, 100);
    }

    #[tokio::test]
    async fn test_late_joiner_adopts_running_timer() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (a, _) = timer_on(&hub, clock.clone());
        a.attach().await.unwrap();
        a.start(300).await.unwrap();
        clock.advance(chrono::Duration::seconds(45));

        let (late, _) = timer_on(&hub, clock.clone());
        late.attach().await.unwrap();
        settle().await;

        let state = late.state();
        assert_eq!(state.status, TimerStatus::Running);
        assert_eq!(state.remaining, 255);
    }

    #[tokio::test]
    async fn test_sole_participant_stays_idle() {
        let hub = MemoryHub::new();
        let (alone, _) = timer_on(&hub, clock());
        alone.attach().await.unwrap();
        settle().await;
        assert_eq!(alone.state(), TimerState::idle());
    }

    #[tokio::test]
    async fn test_only_first_sync_response_is_adopted() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (timer, mut rx) = timer_on(&hub, clock.clone());
        timer.shared.lock().awaiting_sync = true;

        let expired = TimerState {
            duration: 60,
            remaining: 0,
            status: TimerStatus::Expired,
            started_at: None,
        };
        let reply = timer.handle_message(TimerMessage::SyncResponse {
            responder: "peer-1".to_string(),
            state: expired.clone(),
        });
        assert!(reply.is_none());
        timer.handle_message(TimerMessage::SyncResponse {
            responder: "peer-2".to_string(),
            state: TimerState::idle(),
        });

        assert_eq!(timer.state(), expired);
        // Adopting an already expired timer does not alert again.
        assert_eq!(expiries(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_sync_request_answers_with_current_state() {
        let hub = MemoryHub::new();
        let clock = clock();
        let (timer, _) = timer_on(&hub, clock.clone());
        timer.start(90).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));

        let own = timer.handle_message(TimerMessage::SyncRequest {
            requester: timer.client_id().to_string(),
        });
        assert!(own.is_none());

        let reply = timer.handle_message(TimerMessage::SyncRequest {
            requester: "newcomer".to_string(),
        });
        match reply {
            Some(TimerMessage::SyncResponse { responder, state }) => {
                assert_eq!(responder, timer.client_id());
                assert_eq!(state.remaining, 60);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
