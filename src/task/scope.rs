//! Per-scope FIFO lanes.
//!
//! Each key owns at most one lane: an unbounded queue drained by a single worker task.
//! A lane is created on the first job for its key and removed once its queue ran dry,
//! so idle scopes hold no resources. Jobs of one key never overlap; jobs of different
//! keys run concurrently.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

type Runner<J> = Arc<dyn Fn(J) -> BoxFuture<'static, ()> + Send + Sync>;
type LaneTable<K, J> = Arc<Mutex<HashMap<K, mpsc::UnboundedSender<J>>>>;

pub struct ScopeLanes<K, J> {
    lanes: LaneTable<K, J>,
    runner: Runner<J>,
}

impl<K, J> ScopeLanes<K, J>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    J: Send + 'static,
{
    pub fn new<F>(runner: F) -> Self
    where
        F: Fn(J) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            runner: Arc::new(runner),
        }
    }

    fn lock(lanes: &LaneTable<K, J>) -> MutexGuard<'_, HashMap<K, mpsc::UnboundedSender<J>>> {
        lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job to the lane of `key`, spawning the lane if needed
    pub fn enqueue(&self, key: K, job: J) {
        let mut lanes = Self::lock(&self.lanes);
        let job = match lanes.get(&key) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below exits
        let _ = sender.send(job);
        lanes.insert(key.clone(), sender);
        drop(lanes);

        trace!(?key, "Lane opened");
        tokio::spawn(Self::drain(
            key,
            receiver,
            self.lanes.clone(),
            self.runner.clone(),
        ));
    }

    /// Number of lanes with queued or running jobs
    pub fn active_lanes(&self) -> usize {
        Self::lock(&self.lanes).len()
    }

    async fn drain(
        key: K,
        mut receiver: mpsc::UnboundedReceiver<J>,
        lanes: LaneTable<K, J>,
        runner: Runner<J>,
    ) {
        loop {
            let job = match receiver.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    // Enqueue sends under the table lock, so an empty queue observed
                    // under the lock stays empty.
                    let mut table = Self::lock(&lanes);
                    match receiver.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            table.remove(&key);
                            trace!(?key, "Lane closed");
                            return;
                        }
                    }
                }
            };
            runner(job).await;
        }
    }
}
