//! Directory mapping game IDs to live hubs.
//!
//! The lock is held only for lookup, insert, and retirement, never
//! while dispatching messages. Admission and teardown are kept
//! race-free by the pending-admissions count on each hub handle:
//! checkout bumps it under the lock, the hub decrements it after
//! processing the admission, and a hub retires only when it is empty
//! with no checkout in flight.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::hub::{Hub, HubHandle, HubShared};

pub(crate) struct HubRegistry {
    hubs: Mutex<HashMap<String, HubHandle>>,
    hub_queue_depth: usize,
    replay_depth: usize,
}

impl HubRegistry {
    pub fn new(hub_queue_depth: usize, replay_depth: usize) -> Self {
        Self {
            hubs: Mutex::new(HashMap::new()),
            hub_queue_depth,
            replay_depth,
        }
    }

    /// Hand out the hub for `game_id`, creating it on first admission.
    ///
    /// The returned handle carries one reserved admission slot; the
    /// caller must follow up with exactly one `HubEvent::Join` send.
    pub async fn checkout(self: Arc<Self>, game_id: &str) -> HubHandle {
        let mut map = self.hubs.lock().await;
        if let Some(handle) = map.get(game_id) {
            if !handle.shared.closed.load(Ordering::Acquire) {
                handle.shared.pending.fetch_add(1, Ordering::AcqRel);
                return handle.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.hub_queue_depth);
        let shared = Arc::new(HubShared::new());
        let handle = HubHandle {
            tx,
            shared: shared.clone(),
        };
        handle.shared.pending.fetch_add(1, Ordering::AcqRel);
        map.insert(game_id.to_string(), handle.clone());
        debug!(game = %game_id, "created hub");

        let hub = Hub::new(game_id, self.replay_depth);
        let registry = self.clone();
        tokio::spawn(hub.run(rx, registry, shared));

        handle
    }

    /// Deregister an emptied hub. Returns false when an admission is
    /// still checked out, in which case the hub must keep running.
    pub async fn try_retire(&self, game_id: &str, shared: &Arc<HubShared>) -> bool {
        let mut map = self.hubs.lock().await;
        if shared.pending.load(Ordering::Acquire) > 0 {
            return false;
        }
        if let Some(handle) = map.get(game_id) {
            if Arc::ptr_eq(&handle.shared, shared) {
                map.remove(game_id);
            }
        }
        shared.closed.store(true, Ordering::Release);
        debug!(game = %game_id, "removed hub from directory");
        true
    }

    #[cfg(test)]
    pub async fn hub_count(&self) -> usize {
        self.hubs.lock().await.len()
    }
}
