//! Devices: descriptors, the connected-device registry and the active
//! device tracker.

mod active;
mod descriptor;
mod registry;

pub use active::ActiveDeviceTracker;
pub use descriptor::{
    A2dpOffloadState, ConnectState, DescriptorKind, DeviceDescriptor, DeviceRole, DeviceType, LOCAL_NETWORK_ID,
};
pub use registry::{DeviceRegistry, PreferredSlot};
