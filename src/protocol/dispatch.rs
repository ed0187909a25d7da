//! Layer 5: hands inbound messages to the task layer.
//!
//! Acknowledgements and responses go to the task waiting for them; everything else
//! becomes a passive task bound to this connection.

use crate::protocol::session::InboundMessage;
use crate::task::codec::ConnectionHandle;
use crate::task::{PassiveTask, TaskManager};
use std::sync::Arc;
use tracing::trace;

pub struct Dispatcher {
    connection: Arc<ConnectionHandle>,
    manager: TaskManager,
}

impl Dispatcher {
    pub fn new(connection: Arc<ConnectionHandle>, manager: TaskManager) -> Self {
        Self {
            connection,
            manager,
        }
    }

    pub fn dispatch(&self, message: InboundMessage) {
        let Some(message) = self.connection.route(message) else {
            trace!("Inbound message routed to a waiting task");
            return;
        };
        if let Some(task) = PassiveTask::from_inbound(message) {
            trace!(task = task.name(), "Passive task queued");
            self.manager
                .enqueue_passive(task, self.connection.generation());
        }
    }
}
