//! Configuration types for the routing core.

use std::collections::HashMap;
use std::time::Duration;

use crate::device::{DeviceDescriptor, DeviceType};
use crate::pipe::ConcurrencyRules;

/// Adapter name prefix for remote nodes; the network id is appended.
pub const REMOTE_ADAPTER_PREFIX: &str = "remote@";

/// Maps device types to the adapter that serves them.
///
/// Stands in for the adapter section of the platform's audio policy
/// configuration file.
///
/// # Example
///
/// ```
/// use audio_route_core::{AdapterTable, DeviceType};
///
/// let mut adapters = AdapterTable::default();
/// adapters.set(DeviceType::UsbArmHeadset, "usb_arm");
/// assert_eq!(adapters.adapter_name(DeviceType::UsbArmHeadset), Some("usb_arm"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTable {
    by_type: HashMap<DeviceType, String>,
}

impl AdapterTable {
    /// Creates an empty table.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// Assigns an adapter to a device type.
    pub fn set(&mut self, device_type: DeviceType, adapter: impl Into<String>) {
        self.by_type.insert(device_type, adapter.into());
    }

    /// Returns the adapter assigned to a local device type.
    pub fn adapter_name(&self, device_type: DeviceType) -> Option<&str> {
        self.by_type.get(&device_type).map(String::as_str)
    }

    /// Resolves the adapter for a device, including remote devices.
    pub fn adapter_for(&self, device: &DeviceDescriptor) -> Option<String> {
        if !device.is_local() {
            return Some(format!("{REMOTE_ADAPTER_PREFIX}{}", device.network_id));
        }
        self.adapter_name(device.device_type).map(str::to_string)
    }
}

impl Default for AdapterTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for device_type in [
            DeviceType::Speaker,
            DeviceType::Earpiece,
            DeviceType::Mic,
            DeviceType::BluetoothSco,
        ] {
            table.set(device_type, "primary");
        }
        table.set(DeviceType::WiredHeadset, "wired");
        table.set(DeviceType::WiredHeadphones, "wired");
        table.set(DeviceType::BluetoothA2dp, "a2dp");
        table.set(DeviceType::UsbHeadset, "usb");
        table.set(DeviceType::UsbArmHeadset, "usb");
        table.set(DeviceType::Hdmi, "dp");
        table.set(DeviceType::LineDigital, "dp");
        table.set(DeviceType::RemoteCast, "remote_cast");
        table
    }
}

/// Configuration for the routing core.
///
/// Use [`CoreConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use audio_route_core::CoreConfig;
/// use std::time::Duration;
///
/// let config = CoreConfig {
///     offload_close_wait: Duration::from_secs(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Longest wait for muted streams to drain before a route change.
    ///
    /// Default: 120ms
    pub render_empty_wait: Duration,

    /// How long an idle offload port stays open before it is closed.
    ///
    /// A new offload stream within this window reuses the port.
    /// Default: 10 seconds
    pub offload_close_wait: Duration,

    /// Whether a missing remote module may be opened on demand.
    ///
    /// Default: true
    pub remote_open_enabled: bool,

    /// Whether starting a stream pushes its route to the HAL.
    ///
    /// Default: true
    pub update_route_supported: bool,

    /// Whether volume is kept per device class on PC builds.
    ///
    /// Default: false
    pub pc_volume_enabled: bool,

    /// Uid of the microcontroller service; its sessions carry no audio and
    /// are not recorded as owned by it.
    ///
    /// Default: 7500
    pub mcu_uid: i32,

    /// Upper bound on fetch passes after Bluetooth activation failures.
    ///
    /// Default: 4
    pub max_fetch_retries: u32,

    /// Capacity of the core worker's command queue.
    ///
    /// Default: 32
    pub worker_queue_capacity: usize,

    /// Device type to adapter mapping.
    pub adapters: AdapterTable,

    /// Pipe concurrency rules.
    pub concurrency: ConcurrencyRules,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            render_empty_wait: Duration::from_millis(120),
            offload_close_wait: Duration::from_secs(10),
            remote_open_enabled: true,
            update_route_supported: true,
            pc_volume_enabled: false,
            mcu_uid: 7500,
            max_fetch_retries: 4,
            worker_queue_capacity: 32,
            adapters: AdapterTable::default(),
            concurrency: ConcurrencyRules::default(),
        }
    }
}
