//! Persistence of accepted persistent tasks.
//!
//! A task is recorded before `schedule` returns and removed once it completed or failed
//! permanently. Anything still recorded at startup is handed back by `list_pending`.

use crate::error::{ProtocolError, Result};
use crate::task::{ActiveTask, TaskId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks accepted but not completed, in acceptance order
    async fn list_pending(&self) -> Result<Vec<(TaskId, ActiveTask)>>;

    async fn record_accepted(&self, task: &ActiveTask) -> Result<TaskId>;

    async fn record_completed(&self, id: TaskId) -> Result<()>;
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    tasks: BTreeMap<TaskId, Vec<u8>>,
}

/// [`TaskStore`] keeping serialized tasks in memory
///
/// Shared between task manager instances it behaves like a store surviving a restart.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    state: Mutex<StoreState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_pending(&self) -> Result<Vec<(TaskId, ActiveTask)>> {
        self.lock()
            .tasks
            .iter()
            .map(|(id, bytes)| {
                bincode::deserialize(bytes)
                    .map(|task| (*id, task))
                    .map_err(ProtocolError::from)
            })
            .collect()
    }

    async fn record_accepted(&self, task: &ActiveTask) -> Result<TaskId> {
        let bytes = bincode::serialize(task)?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = TaskId(state.next_id);
        state.tasks.insert(id, bytes);
        trace!(%id, "Task recorded");
        Ok(id)
    }

    async fn record_completed(&self, id: TaskId) -> Result<()> {
        self.lock().tasks.remove(&id);
        trace!(%id, "Task removed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::GroupId;
    use crate::types::GroupIdentity;

    #[tokio::test]
    async fn test_pending_in_acceptance_order() {
        let store = MemoryTaskStore::new();
        let group = GroupIdentity {
            creator: "CREATOR1".parse().unwrap(),
            group_id: GroupId(1),
        };
        let first = store
            .record_accepted(&ActiveTask::LeaveGroup { group })
            .await
            .unwrap();
        let second = store.record_accepted(&ActiveTask::GetDevicesInfo).await.unwrap();
        store.record_completed(first).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending, vec![(second, ActiveTask::GetDevicesInfo)]);
    }
}
