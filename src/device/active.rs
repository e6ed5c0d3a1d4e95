//! Current active devices and HAL route updates.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::facade::{AudioRoute, HdiAdapter};
use crate::priming::RenderEmptyGate;
use crate::FacadeError;

use super::descriptor::{DeviceDescriptor, DeviceRole};

#[derive(Debug, Default)]
struct ActiveState {
    current_output: DeviceDescriptor,
    current_input: DeviceDescriptor,
    active_bt_mac: String,
    active_bt_in_mac: String,
}

/// Tracks the current input and output device and pushes routes to the HAL.
///
/// Route updates first wait on the [`RenderEmptyGate`] so audio queued on
/// the old device can drain.
pub struct ActiveDeviceTracker {
    hdi: Arc<dyn HdiAdapter>,
    gate: Arc<RenderEmptyGate>,
    render_empty_wait: Duration,
    state: Mutex<ActiveState>,
}

impl ActiveDeviceTracker {
    /// Creates a tracker with no current devices.
    pub fn new(hdi: Arc<dyn HdiAdapter>, gate: Arc<RenderEmptyGate>, render_empty_wait: Duration) -> Self {
        Self {
            hdi,
            gate,
            render_empty_wait,
            state: Mutex::new(ActiveState {
                current_output: DeviceDescriptor::none(DeviceRole::Output),
                current_input: DeviceDescriptor::none(DeviceRole::Input),
                ..ActiveState::default()
            }),
        }
    }

    /// Current output device.
    pub fn current_output_device(&self) -> DeviceDescriptor {
        self.state.lock().current_output.clone()
    }

    /// Current input device.
    pub fn current_input_device(&self) -> DeviceDescriptor {
        self.state.lock().current_input.clone()
    }

    /// Sets the current output device.
    pub fn set_current_output_device(&self, device: &DeviceDescriptor) {
        info!(device = %device, "current output device");
        self.state.lock().current_output = device.to_info();
    }

    /// Sets the current input device.
    pub fn set_current_input_device(&self, device: &DeviceDescriptor) {
        info!(device = %device, "current input device");
        self.state.lock().current_input = device.to_info();
    }

    /// Address of the active Bluetooth output peer.
    pub fn active_bt_mac(&self) -> String {
        self.state.lock().active_bt_mac.clone()
    }

    /// Sets the address of the active Bluetooth output peer.
    pub fn set_active_bt_mac(&self, mac: &str) {
        self.state.lock().active_bt_mac = mac.to_string();
    }

    /// Address of the active Bluetooth input peer.
    pub fn active_bt_in_mac(&self) -> String {
        self.state.lock().active_bt_in_mac.clone()
    }

    /// Sets the address of the active Bluetooth input peer.
    pub fn set_active_bt_in_mac(&self, mac: &str) {
        self.state.lock().active_bt_in_mac = mac.to_string();
    }

    /// Render-empty gate consulted before route updates.
    pub fn gate(&self) -> &Arc<RenderEmptyGate> {
        &self.gate
    }

    /// Routes a single device.
    pub async fn update_active_device_route(
        &self,
        device: &DeviceDescriptor,
        role: DeviceRole,
    ) -> Result<(), FacadeError> {
        self.gate.wait_drained(self.render_empty_wait).await;
        debug!(device = %device, ?role, "set active device route");
        self.hdi.set_active_device_route(device, role).await.inspect_err(|e| {
            warn!(device = %device, error = %e, "set active device route failed");
        })
    }

    /// Routes several devices; a single device goes through
    /// [`update_active_device_route`](Self::update_active_device_route).
    pub async fn update_active_devices_route(
        &self,
        devices: &[DeviceDescriptor],
        role: DeviceRole,
        port_name: &str,
    ) -> Result<(), FacadeError> {
        match devices {
            [] => Ok(()),
            [device] => self.update_active_device_route(device, role).await,
            _ => {
                self.gate.wait_drained(self.render_empty_wait).await;
                let route = AudioRoute {
                    role,
                    devices: devices.to_vec(),
                    port_name: port_name.to_string(),
                };
                debug!(count = devices.len(), port = port_name, "update audio route");
                self.hdi.update_audio_route(&route).await.inspect_err(|e| {
                    warn!(port = port_name, error = %e, "update audio route failed");
                })
            }
        }
    }
}

impl std::fmt::Debug for ActiveDeviceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDeviceTracker")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
