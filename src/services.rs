//! Process wide context handed to pipelines and tasks.
//!
//! There are no global singletons: the owner builds one [`Services`] and passes it to
//! the task manager, which shares it with every pipeline and task run.

use crate::config::ProtocolConfig;
use crate::crypto::boxes::SharedBoxFactory;
use crate::crypto::device_group::DeviceGroupBoxes;
use crate::crypto::nonce::NonceService;
use crate::task::model::ModelStore;
use crate::types::{DeviceId, Identity};
use crate::utils::metrics::Metrics;
use std::fmt;
use std::sync::Arc;

pub struct Services {
    /// Identity of the local user
    pub identity: Identity,
    /// Permanent client key of the identity
    pub client_key: SharedBoxFactory,
    pub device_group: DeviceGroupBoxes,
    pub nonces: NonceService,
    pub model: Arc<dyn ModelStore>,
    pub metrics: Arc<Metrics>,
    pub config: ProtocolConfig,
}

impl Services {
    pub fn device_id(&self) -> DeviceId {
        self.config.session.device_id
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("identity", &self.identity)
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}
