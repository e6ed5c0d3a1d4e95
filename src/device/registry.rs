//! Connected device registry.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::descriptor::{A2dpOffloadState, ConnectState, DeviceDescriptor, DeviceRole, DeviceType};

/// User preference slots consulted by the router before its own ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferredSlot {
    /// Preferred output for media playback.
    MediaRender,
    /// Preferred output for calls.
    CallRender,
    /// Preferred input for calls.
    CallCapture,
    /// Preferred input for recording.
    RecordCapture,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connected: Vec<DeviceDescriptor>,
    next_connect_time: u64,
    a2dp_macs: HashSet<String>,
    a2dp_offload: A2dpOffloadState,
    preferred: HashMap<PreferredSlot, DeviceDescriptor>,
    renderer_affinity: HashMap<i32, DeviceDescriptor>,
    capturer_affinity: HashMap<i32, DeviceDescriptor>,
}

/// Thread-safe table of connected devices and routing preferences.
///
/// Every read returns clones; no guard escapes this type.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in speaker and microphone.
    pub fn with_builtin_devices() -> Self {
        let registry = Self::new();
        registry.add_connected_device(DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output));
        registry.add_connected_device(DeviceDescriptor::new(DeviceType::Mic, DeviceRole::Input));
        registry
    }

    /// Adds or refreshes a connected device and stamps its connection order.
    ///
    /// A2DP devices are also recorded in the A2DP peer table.
    pub fn add_connected_device(&self, mut device: DeviceDescriptor) {
        let mut inner = self.inner.lock();
        inner.next_connect_time += 1;
        device.connect_time = inner.next_connect_time;
        if device.device_type == DeviceType::BluetoothA2dp {
            inner.a2dp_macs.insert(device.mac_address.clone());
        }
        inner.connected.retain(|d| !d.is_same_device_info(&device));
        info!(device = %device, mac = %device.mac_address, "device connected");
        inner.connected.push(device);
    }

    /// Removes a device. Returns the removed record, if any.
    pub fn remove_connected_device(&self, device: &DeviceDescriptor) -> Option<DeviceDescriptor> {
        let mut inner = self.inner.lock();
        let pos = inner.connected.iter().position(|d| d.is_same_device_info(device))?;
        let removed = inner.connected.remove(pos);
        if removed.device_type == DeviceType::BluetoothA2dp {
            let still_present = inner
                .connected
                .iter()
                .any(|d| d.device_type == DeviceType::BluetoothA2dp && d.mac_address == removed.mac_address);
            if !still_present {
                inner.a2dp_macs.remove(&removed.mac_address);
            }
        }
        inner.preferred.retain(|_, d| !d.is_same_device_info(&removed));
        inner.renderer_affinity.retain(|_, d| !d.is_same_device_info(&removed));
        inner.capturer_affinity.retain(|_, d| !d.is_same_device_info(&removed));
        info!(device = %removed, "device disconnected");
        Some(removed)
    }

    /// Returns a snapshot of every connected device.
    pub fn connected_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.lock().connected.clone()
    }

    /// Returns the connected devices with the given role.
    pub fn devices_with_role(&self, role: DeviceRole) -> Vec<DeviceDescriptor> {
        self.inner
            .lock()
            .connected
            .iter()
            .filter(|d| d.device_role == role)
            .cloned()
            .collect()
    }

    /// Looks up a connected device by type, role and address.
    pub fn find(&self, device_type: DeviceType, role: DeviceRole, mac: &str) -> Option<DeviceDescriptor> {
        self.inner
            .lock()
            .connected
            .iter()
            .find(|d| d.device_type == device_type && d.device_role == role && d.mac_address == mac)
            .cloned()
    }

    /// Sets or clears the exception flag of every record matching
    /// type and address (both roles).
    pub fn set_exception_flag(&self, device_type: DeviceType, mac: &str, flag: bool) {
        let mut inner = self.inner.lock();
        for device in inner
            .connected
            .iter_mut()
            .filter(|d| d.device_type == device_type && d.mac_address == mac)
        {
            device.exception_flag = flag;
        }
        debug!(%device_type, mac, flag, "exception flag updated");
    }

    /// Updates the link state of every record matching type and address.
    pub fn update_connect_state(&self, device_type: DeviceType, mac: &str, state: ConnectState) {
        let mut inner = self.inner.lock();
        for device in inner
            .connected
            .iter_mut()
            .filter(|d| d.device_type == device_type && d.mac_address == mac)
        {
            device.connect_state = state;
        }
    }

    /// Returns `true` if an A2DP peer with this address is connected.
    pub fn has_a2dp_device(&self, mac: &str) -> bool {
        self.inner.lock().a2dp_macs.contains(mac)
    }

    /// Returns the live A2DP offload mode.
    pub fn a2dp_offload_state(&self) -> A2dpOffloadState {
        self.inner.lock().a2dp_offload
    }

    /// Sets the live A2DP offload mode.
    pub fn set_a2dp_offload_state(&self, state: A2dpOffloadState) {
        self.inner.lock().a2dp_offload = state;
    }

    /// Returns the device stored in a preference slot.
    pub fn preferred(&self, slot: PreferredSlot) -> Option<DeviceDescriptor> {
        self.inner.lock().preferred.get(&slot).cloned()
    }

    /// Stores or clears a preference slot.
    pub fn set_preferred(&self, slot: PreferredSlot, device: Option<DeviceDescriptor>) {
        let mut inner = self.inner.lock();
        match device {
            Some(device) => {
                inner.preferred.insert(slot, device);
            }
            None => {
                inner.preferred.remove(&slot);
            }
        }
    }

    /// Returns the output device an application pinned itself to.
    pub fn renderer_affinity(&self, uid: i32) -> Option<DeviceDescriptor> {
        self.inner.lock().renderer_affinity.get(&uid).cloned()
    }

    /// Pins or unpins an application's output device.
    pub fn set_renderer_affinity(&self, uid: i32, device: Option<DeviceDescriptor>) {
        let mut inner = self.inner.lock();
        match device {
            Some(device) => {
                inner.renderer_affinity.insert(uid, device);
            }
            None => {
                inner.renderer_affinity.remove(&uid);
            }
        }
    }

    /// Returns the input device an application pinned itself to.
    pub fn capturer_affinity(&self, uid: i32) -> Option<DeviceDescriptor> {
        self.inner.lock().capturer_affinity.get(&uid).cloned()
    }

    /// Pins or unpins an application's input device.
    pub fn set_capturer_affinity(&self, uid: i32, device: Option<DeviceDescriptor>) {
        let mut inner = self.inner.lock();
        match device {
            Some(device) => {
                inner.capturer_affinity.insert(uid, device);
            }
            None => {
                inner.capturer_affinity.remove(&uid);
            }
        }
    }
}
