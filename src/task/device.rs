//! Linked device management through the mediator.

use crate::error::{TaskError, TaskResult};
use crate::task::codec::TaskCodec;
use crate::task::{LinkedDevice, TaskOutput};
use crate::types::DeviceId;
use tracing::{info, warn};

pub(crate) async fn get_devices_info(codec: &TaskCodec) -> TaskResult<TaskOutput> {
    let info = codec.devices_info().await?;
    let dgdik = &codec.services().device_group.dgdik;
    let devices = info
        .augmented_device_info
        .into_iter()
        .map(|device| {
            let label = dgdik
                .decrypt_with_nonce_ahead(&device.encrypted_device_info)
                .ok()
                .and_then(|(_, plain)| String::from_utf8(plain).ok());
            if label.is_none() {
                warn!(device_id = device.device_id, "Device info not readable");
            }
            LinkedDevice {
                device_id: device.device_id,
                label,
                last_login_at: device.last_login_at,
            }
        })
        .collect::<Vec<_>>();
    info!(count = devices.len(), "Linked devices");
    Ok(TaskOutput::Devices(devices))
}

pub(crate) async fn drop_device(codec: &TaskCodec, device_id: DeviceId) -> TaskResult<TaskOutput> {
    if device_id == codec.services().device_id() {
        return Err(TaskError::Permanent("Cannot drop the own device".into()));
    }
    codec.drop_device(device_id).await?;
    info!(device_id, "Device dropped");
    Ok(TaskOutput::Done)
}
