//! Task scheduling, connection binding and retries.
//!
//! The manager owns the lane table and the currently attached connection. A persistent
//! task waits for a connection before each run and retries transient failures with
//! [`Backoff`]. Once its retries are exhausted it is parked: it stays in the store, keeps
//! its lane and runs again with a fresh backoff as soon as a newer connection is
//! attached. Only a permanent failure resolves its handle with an error. A volatile task
//! is bound to the connection that was attached when it was scheduled and aborts if that
//! connection went away.

use crate::error::{TaskError, TaskResult};
use crate::protocol::session::OutboundMessage;
use crate::services::Services;
use crate::task::backoff::Backoff;
use crate::task::codec::{ConnectionHandle, TaskCodec};
use crate::task::scope::ScopeLanes;
use crate::task::store::TaskStore;
use crate::task::{ActiveTask, PassiveTask, Persistence, TaskId, TaskOutput, TransactionScope};
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

type LaneKey = Option<TransactionScope>;
type Reply = oneshot::Sender<TaskResult<TaskOutput>>;

enum Job {
    Active {
        id: Option<TaskId>,
        task: ActiveTask,
        /// Generation of the connection a volatile task is bound to
        generation: u64,
        reply: Option<Reply>,
    },
    Passive {
        task: PassiveTask,
        generation: u64,
    },
}

/// Completion of a scheduled task
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    receiver: oneshot::Receiver<TaskResult<TaskOutput>>,
}

impl Future for TaskHandle {
    type Output = TaskResult<TaskOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TaskError::Aborted("task manager shut down"))))
    }
}

struct ManagerInner {
    services: Arc<Services>,
    store: Arc<dyn TaskStore>,
    lanes: ScopeLanes<LaneKey, Job>,
    connection: watch::Sender<Option<Arc<ConnectionHandle>>>,
    generation: AtomicU64,
}

/// Cheap to clone handle to the task manager
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(services: Arc<Services>, store: Arc<dyn TaskStore>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = weak.clone();
            ManagerInner {
                services,
                store,
                lanes: ScopeLanes::new(move |job: Job| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => run_job(inner, job).await,
                            None => debug!("Task manager gone, dropping job"),
                        }
                    }
                    .boxed()
                }),
                connection: watch::Sender::new(None),
                generation: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    fn current_connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.inner.connection.borrow().clone()
    }

    /// Accept a task and queue it in its scope lane
    ///
    /// Persistent tasks are recorded in the store before this returns. Volatile tasks
    /// need an attached connection.
    pub async fn schedule(&self, task: ActiveTask) -> TaskResult<TaskHandle> {
        let generation = match (task.persistence(), self.current_connection()) {
            (Persistence::Volatile, None) => {
                return Err(TaskError::Aborted("no connection for volatile task"));
            }
            (Persistence::Volatile, Some(connection)) => connection.generation(),
            (Persistence::Persistent, _) => 0,
        };
        let id = match task.persistence() {
            Persistence::Persistent => Some(self.inner.store.record_accepted(&task).await?),
            Persistence::Volatile => None,
        };
        debug!(task = task.name(), ?id, "Task scheduled");
        Ok(self.enqueue_active(id, task, generation))
    }

    fn enqueue_active(&self, id: Option<TaskId>, task: ActiveTask, generation: u64) -> TaskHandle {
        let (reply, receiver) = oneshot::channel();
        self.inner.services.metrics.task_scheduled();
        self.inner.lanes.enqueue(
            task.scope(),
            Job::Active {
                id,
                task,
                generation,
                reply: Some(reply),
            },
        );
        TaskHandle { receiver }
    }

    /// Queue every persistent task left over from a previous run
    pub async fn restore(&self) -> TaskResult<Vec<(TaskId, TaskHandle)>> {
        let pending = self.inner.store.list_pending().await?;
        info!(count = pending.len(), "Restoring persistent tasks");
        Ok(pending
            .into_iter()
            .map(|(id, task)| (id, self.enqueue_active(Some(id), task, 0)))
            .collect())
    }

    /// Queue a task created from an inbound message of connection `generation`
    pub fn enqueue_passive(&self, task: PassiveTask, generation: u64) {
        let scope = task.scope(&self.inner.services);
        self.inner
            .lanes
            .enqueue(scope, Job::Passive { task, generation });
    }

    /// Create the handle for a new pipeline
    pub fn create_connection(&self, outbound: mpsc::Sender<OutboundMessage>) -> Arc<ConnectionHandle> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(ConnectionHandle::new(generation, outbound))
    }

    /// Make `connection` the one tasks run on
    pub fn attach(&self, connection: Arc<ConnectionHandle>) {
        info!(generation = connection.generation(), "Connection attached");
        if let Some(previous) = self.inner.connection.send_replace(Some(connection)) {
            previous.close();
        }
    }

    /// Detach the connection of `generation` if it is still attached
    pub fn detach(&self, generation: u64) {
        self.inner.connection.send_if_modified(|current| {
            let attached = current
                .as_ref()
                .is_some_and(|connection| connection.generation() == generation);
            if attached {
                if let Some(connection) = current.take() {
                    connection.close();
                    info!(generation, "Connection detached");
                }
            }
            attached
        });
    }
}

/// Wait for an open connection with a generation above `newer_than`
async fn wait_for_connection(
    inner: &ManagerInner,
    newer_than: u64,
) -> Option<Arc<ConnectionHandle>> {
    let mut receiver = inner.connection.subscribe();
    let connection = receiver
        .wait_for(|connection| {
            connection
                .as_ref()
                .is_some_and(|c| !c.is_closed() && c.generation() > newer_than)
        })
        .await
        .ok()?;
    connection.clone()
}

/// The attached connection if it is still the one of `generation`
fn bound_connection(inner: &ManagerInner, generation: u64) -> Option<Arc<ConnectionHandle>> {
    inner
        .connection
        .borrow()
        .clone()
        .filter(|c| c.generation() == generation && !c.is_closed())
}

fn reply(reply: Option<Reply>, result: TaskResult<TaskOutput>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

async fn run_job(inner: Arc<ManagerInner>, job: Job) {
    match job {
        Job::Passive { task, generation } => {
            let span = tracing::info_span!("passive_task", task = task.name(), generation);
            run_passive(&inner, task, generation).instrument(span).await;
        }
        Job::Active {
            id,
            task,
            generation,
            reply: sender,
        } => {
            let span = tracing::info_span!("active_task", task = task.name(), ?id);
            let result = run_active(&inner, id, &task, generation).instrument(span).await;
            reply(sender, result);
        }
    }
}

async fn run_passive(inner: &ManagerInner, task: PassiveTask, generation: u64) {
    let metrics = &inner.services.metrics;
    let Some(connection) = wait_for_connection(inner, 0).await else {
        return;
    };
    if connection.generation() != generation {
        debug!(current = connection.generation(), "Connection of passive task is gone");
        metrics.task_aborted();
        return;
    }
    let codec = TaskCodec::new(connection, inner.services.clone());
    match task.run(&codec).await {
        Ok(()) => metrics.task_completed(),
        Err(e) => {
            warn!(error = %e, "Passive task failed");
            metrics.task_failed();
        }
    }
}

async fn run_active(
    inner: &ManagerInner,
    id: Option<TaskId>,
    task: &ActiveTask,
    generation: u64,
) -> TaskResult<TaskOutput> {
    let metrics = &inner.services.metrics;
    let mut backoff = Backoff::from_config(&inner.services.config.tasks);
    let mut parked_after = 0;

    loop {
        let connection = match task.persistence() {
            Persistence::Persistent => wait_for_connection(inner, parked_after).await,
            Persistence::Volatile => bound_connection(inner, generation),
        };
        let Some(connection) = connection else {
            debug!("Connection of volatile task is gone");
            metrics.task_aborted();
            return Err(TaskError::Aborted("connection closed before the task ran"));
        };

        let ran_on = connection.generation();
        let codec = TaskCodec::new(connection, inner.services.clone());
        let error = match task.run(&codec).await {
            Ok(output) => {
                complete(inner, id).await;
                metrics.task_completed();
                return Ok(output);
            }
            Err(e) => e,
        };

        if id.is_some() && error.is_transient() {
            if let Some(delay) = backoff.next_delay() {
                warn!(error = %error, attempt = backoff.attempt(), ?delay, "Task failed, retrying");
                metrics.task_retried();
                tokio::time::sleep(delay).await;
                continue;
            }
            warn!(
                error = %error,
                generation = ran_on,
                "Task retries exhausted, parked until the next connection"
            );
            metrics.task_retried();
            backoff.reset();
            parked_after = ran_on;
            continue;
        }

        warn!(error = %error, "Task failed");
        complete(inner, id).await;
        metrics.task_failed();
        return Err(error);
    }
}

async fn complete(inner: &ManagerInner, id: Option<TaskId>) {
    if let Some(id) = id {
        if let Err(e) = inner.store.record_completed(id).await {
            error!(%id, error = %e, "Failed to remove completed task from store");
        }
    }
}
