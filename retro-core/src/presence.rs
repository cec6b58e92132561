/// Online participants of a board, from an ephemeral presence topic.
///
/// Every membership change delivers the whole member set; the local online
/// set is replaced with it, never patched.
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{PresenceChannel, PresenceMeta, PresenceSnapshot};
use crate::clock::Clock;
use crate::error::SyncError;
use crate::events::SessionEvent;
use crate::types::Participant;

#[derive(Clone)]
pub struct PresenceTracker {
    channel: Arc<dyn PresenceChannel>,
    clock: Arc<dyn Clock>,
    online: Arc<RwLock<BTreeSet<String>>>,
    events: broadcast::Sender<SessionEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PresenceTracker {
    pub fn new(
        channel: Arc<dyn PresenceChannel>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            channel,
            clock,
            online: Arc::new(RwLock::new(BTreeSet::new())),
            events,
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the online set with the ids in `snapshot`.
    pub fn apply_snapshot(&self, snapshot: &PresenceSnapshot) {
        let ids: BTreeSet<String> = snapshot.keys().cloned().collect();
        {
            let mut online = self.online.write().unwrap_or_else(PoisonError::into_inner);
            if *online == ids {
                return;
            }
            *online = ids.clone();
        }
        log::debug!("[retro.presence] {} online", ids.len());
        let _ = self.events.send(SessionEvent::Presence { online: ids });
    }

    /// Start following membership and announce `participant`.
    pub async fn join(&self, participant: &Participant) -> Result<(), SyncError> {
        let mut rx = self.channel.subscribe().await?;
        let tracker = self.clone();
        let listener = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                tracker.apply_snapshot(&snapshot);
            }
        });
        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener)
        {
            previous.abort();
        }

        self.channel
            .track(PresenceMeta {
                participant_id: participant.id.clone(),
                display_name: participant.display_name.clone(),
                is_admin: participant.is_admin,
                online_at: self.clock.now(),
            })
            .await?;
        log::info!("[retro.presence.track] {} is online", participant.id);
        Ok(())
    }

    /// Withdraw from the topic and forget who is online.
    pub async fn leave(&self) -> Result<(), SyncError> {
        let result = self.channel.untrack().await;
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.online
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        result?;
        Ok(())
    }

    /// Synchronous teardown for drop paths: abort the listener and withdraw
    /// in the background if a runtime is around. No-op when not joined.
    pub fn stop(&self) {
        let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        task.abort();
        self.online
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            runtime.spawn(async move {
                if let Err(e) = channel.untrack().await {
                    log::warn!("[retro.presence.stop] Untrack failed: {}", e);
                }
            });
        }
    }

    pub fn online_ids(&self) -> BTreeSet<String> {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(participant_id)
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("online", &self.online_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryHub;
    use crate::backend::Transport;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn participant(id: &str) -> Participant {
        Participant {
            id: id.to_string(),
            board_id: "b1".to_string(),
            display_name: id.to_uppercase(),
            is_admin: false,
            joined_at: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    fn tracker(hub: &MemoryHub) -> PresenceTracker {
        let (events, _) = broadcast::channel(64);
        PresenceTracker::new(
            hub.connect().presence("presence:b1"),
            Arc::new(ManualClock::default()),
            events,
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let (events, mut rx) = broadcast::channel(8);
        let hub = MemoryHub::new();
        let tracker = PresenceTracker::new(
            hub.connect().presence("presence:b1"),
            Arc::new(ManualClock::default()),
            events,
        );
        let meta = |id: &str| PresenceMeta {
            participant_id: id.to_string(),
            display_name: id.to_string(),
            is_admin: false,
            online_at: Utc::now(),
        };

        let first: PresenceSnapshot = ["p1", "p2"].iter().map(|id| (id.to_string(), meta(id))).collect();
        tracker.apply_snapshot(&first);
        let second: PresenceSnapshot = ["p3"].iter().map(|id| (id.to_string(), meta(id))).collect();
        tracker.apply_snapshot(&second);

        assert_eq!(tracker.online_ids(), ids(&["p3"]));
        assert!(!tracker.is_online("p1"));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Presence { .. })));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Presence { online: ids(&["p3"]) }
        );
    }

    #[tokio::test]
    async fn test_peers_see_join_and_leave() {
        let hub = MemoryHub::new();
        let ada = tracker(&hub);
        let grace = tracker(&hub);

        ada.join(&participant("p1")).await.unwrap();
        grace.join(&participant("p2")).await.unwrap();
        settle().await;
        assert_eq!(ada.online_ids(), ids(&["p1", "p2"]));
        assert_eq!(grace.online_ids(), ids(&["p1", "p2"]));

        grace.leave().await.unwrap();
        settle().await;
        assert_eq!(ada.online_ids(), ids(&["p1"]));
        assert!(grace.online_ids().is_empty());
    }

    #[tokio::test]
    async fn test_pruned_peer_disappears() {
        let hub = MemoryHub::new();
        let ada = tracker(&hub);
        let grace = tracker(&hub);
        ada.join(&participant("p1")).await.unwrap();
        grace.join(&participant("p2")).await.unwrap();
        settle().await;

        hub.drop_presence("presence:b1", "p2");
        settle().await;
        assert_eq!(ada.online_ids(), ids(&["p1"]));
    }

    #[tokio::test]
    async fn test_online_at_is_join_time() {
        let hub = MemoryHub::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let (events, _) = broadcast::channel(8);
        let ada = PresenceTracker::new(hub.connect().presence("presence:b1"), clock, events);
        let mut stale = participant("p1");
        stale.last_seen = now - chrono::Duration::days(3);

        let mut watcher = hub.connect().presence("presence:b1").subscribe().await.unwrap();
        ada.join(&stale).await.unwrap();
        settle().await;

        let mut latest = None;
        while let Ok(snapshot) = watcher.try_recv() {
            latest = Some(snapshot);
        }
        let meta = latest.unwrap().remove("p1").unwrap();
        assert_eq!(meta.online_at, now);
    }

    #[tokio::test]
    async fn test_stop_withdraws_and_ends_listener() {
        let hub = MemoryHub::new();
        let ada = tracker(&hub);
        let grace = tracker(&hub);
        ada.join(&participant("p1")).await.unwrap();
        grace.join(&participant("p2")).await.unwrap();
        settle().await;

        grace.stop();
        settle().await;
        assert!(grace.online_ids().is_empty());
        assert_eq!(ada.online_ids(), ids(&["p1"]));

        // Already stopped.
        grace.stop();
    }
}
