use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use leadline_core::domain::session::SessionId;

/// One lane per session: work on the same session runs in arrival order, different sessions
/// run in parallel. Lanes nobody holds or waits on are dropped on the next acquire.
#[derive(Default)]
pub struct SessionLanes {
    lanes: Mutex<HashMap<SessionId, Weak<AsyncMutex<()>>>>,
}

pub type LaneGuard = OwnedMutexGuard<()>;

impl SessionLanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &SessionId) -> LaneGuard {
        let lane = self.lane(session_id);
        lane.lock_owned().await
    }

    pub fn active_lanes(&self) -> usize {
        let lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes.values().filter(|lane| lane.strong_count() > 0).count()
    }

    fn lane(&self, session_id: &SessionId) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes.retain(|_, lane| lane.strong_count() > 0);

        if let Some(lane) = lanes.get(session_id).and_then(Weak::upgrade) {
            return lane;
        }
        let lane = Arc::new(AsyncMutex::new(()));
        lanes.insert(session_id.clone(), Arc::downgrade(&lane));
        lane
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use leadline_core::domain::session::SessionId;

    use super::SessionLanes;

    #[tokio::test]
    async fn same_session_work_is_serialized_in_order() {
        let lanes = Arc::new(SessionLanes::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let session = SessionId("S-1".to_string());

        let first = lanes.acquire(&session).await;
        let waiter = {
            let lanes = lanes.clone();
            let order = order.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let _guard = lanes.acquire(&session).await;
                order.lock().await.push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().await.push("first");
        drop(first);
        waiter.await.expect("join");

        assert_eq!(*order.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn different_sessions_do_not_block_and_idle_lanes_are_pruned() {
        let lanes = SessionLanes::new();
        let a = lanes.acquire(&SessionId("S-a".to_string())).await;
        let b = lanes.acquire(&SessionId("S-b".to_string())).await;
        assert_eq!(lanes.active_lanes(), 2);

        drop(a);
        drop(b);
        let _c = lanes.acquire(&SessionId("S-c".to_string())).await;
        assert_eq!(lanes.active_lanes(), 1);
    }
}
