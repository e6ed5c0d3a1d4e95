//! Device descriptor and identity rules.

use std::fmt;

/// Network id of devices attached to this node.
pub const LOCAL_NETWORK_ID: &str = "LocalDevice";

/// Kind of physical or virtual audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    /// No device. The router returns this when nothing is eligible.
    #[default]
    None,
    /// Placeholder for capture sources that have no hardware device.
    Invalid,
    /// Handset earpiece.
    Earpiece,
    /// Built-in loudspeaker.
    Speaker,
    /// Wired headset with microphone.
    WiredHeadset,
    /// Wired headphones without microphone.
    WiredHeadphones,
    /// Bluetooth hands-free (SCO) link.
    BluetoothSco,
    /// Bluetooth high-quality stereo (A2DP) link.
    BluetoothA2dp,
    /// Built-in microphone.
    Mic,
    /// USB headset handled by the primary adapter.
    UsbHeadset,
    /// USB headset handled by the application processor.
    UsbArmHeadset,
    /// HDMI output.
    Hdmi,
    /// Digital line output.
    LineDigital,
    /// Cast session to a remote screen.
    RemoteCast,
}

impl DeviceType {
    /// Returns the stable lowercase name used in logs and module parameters.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Invalid => "invalid",
            Self::Earpiece => "earpiece",
            Self::Speaker => "speaker",
            Self::WiredHeadset => "wired_headset",
            Self::WiredHeadphones => "wired_headphones",
            Self::BluetoothSco => "bluetooth_sco",
            Self::BluetoothA2dp => "bluetooth_a2dp",
            Self::Mic => "mic",
            Self::UsbHeadset => "usb_headset",
            Self::UsbArmHeadset => "usb_arm_headset",
            Self::Hdmi => "hdmi",
            Self::LineDigital => "line_digital",
            Self::RemoteCast => "remote_cast",
        }
    }

    /// Returns `true` for USB attached devices.
    pub fn is_usb(self) -> bool {
        matches!(self, Self::UsbHeadset | Self::UsbArmHeadset)
    }

    /// Returns `true` for Bluetooth devices.
    pub fn is_bluetooth(self) -> bool {
        matches!(self, Self::BluetoothSco | Self::BluetoothA2dp)
    }

    /// Returns `true` if a ringer or alarm stream may play on this device
    /// together with a second one.
    pub fn is_dual_tone_capable(self) -> bool {
        matches!(
            self,
            Self::Speaker
                | Self::WiredHeadset
                | Self::WiredHeadphones
                | Self::BluetoothSco
                | Self::BluetoothA2dp
                | Self::UsbHeadset
                | Self::UsbArmHeadset
        )
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceRole {
    /// Unassigned.
    #[default]
    None,
    /// Capture device.
    Input,
    /// Playback device.
    Output,
}

/// Link state of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectState {
    /// Connected and usable.
    #[default]
    Connected,
    /// Connected but its link is not active (e.g. SCO not established).
    DeactiveConnected,
    /// Connected but suspended; never selected by the router.
    SuspendConnected,
    /// Virtually connected (known peer, not yet linked).
    VirtualConnected,
}

/// A2DP offload mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum A2dpOffloadState {
    /// No A2DP device is active.
    #[default]
    NoDevice,
    /// Encoding runs on the Bluetooth DSP.
    Offload,
    /// Encoding runs on the application processor.
    NotOffload,
}

/// Whether a descriptor is a full registry record or a lightweight snapshot.
///
/// Snapshots are what a stream remembers about the device it was routed to.
/// Comparing a candidate against a snapshot applies the offload and USB
/// role rules of [`DeviceDescriptor::is_same_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DescriptorKind {
    /// Full registry record.
    #[default]
    Full,
    /// Lightweight snapshot.
    Info,
}

/// A physical or virtual audio device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device kind.
    pub device_type: DeviceType,
    /// Input or output.
    pub device_role: DeviceRole,
    /// [`LOCAL_NETWORK_ID`] or the id of a remote node.
    pub network_id: String,
    /// Bluetooth address; empty for wired devices.
    pub mac_address: String,
    /// Link state.
    pub connect_state: ConnectState,
    /// Whether the user has the device enabled.
    pub is_enable: bool,
    /// Offload mode recorded for A2DP devices.
    pub a2dp_offload: A2dpOffloadState,
    /// Set after an activation failure; excluded from routing.
    pub exception_flag: bool,
    /// Human readable name.
    pub device_name: String,
    /// Connection order; the router prefers the latest.
    pub connect_time: u64,
    /// Full record or snapshot.
    pub kind: DescriptorKind,
}

impl DeviceDescriptor {
    /// Creates a local, connected, enabled device.
    pub fn new(device_type: DeviceType, device_role: DeviceRole) -> Self {
        Self {
            device_type,
            device_role,
            network_id: LOCAL_NETWORK_ID.to_string(),
            mac_address: String::new(),
            connect_state: ConnectState::Connected,
            is_enable: true,
            a2dp_offload: A2dpOffloadState::NoDevice,
            exception_flag: false,
            device_name: device_type.as_str().to_string(),
            connect_time: 0,
            kind: DescriptorKind::Full,
        }
    }

    /// Creates the "no device" placeholder for a role.
    pub fn none(device_role: DeviceRole) -> Self {
        Self::new(DeviceType::None, device_role)
    }

    /// Sets the Bluetooth address.
    #[must_use]
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = mac.into();
        self
    }

    /// Sets the network id.
    #[must_use]
    pub fn with_network_id(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = network_id.into();
        self
    }

    /// Sets the link state.
    #[must_use]
    pub fn with_connect_state(mut self, state: ConnectState) -> Self {
        self.connect_state = state;
        self
    }

    /// Sets the A2DP offload mode.
    #[must_use]
    pub fn with_a2dp_offload(mut self, state: A2dpOffloadState) -> Self {
        self.a2dp_offload = state;
        self
    }

    /// Sets the device name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Returns a lightweight snapshot of this descriptor.
    #[must_use]
    pub fn to_info(&self) -> Self {
        Self {
            kind: DescriptorKind::Info,
            ..self.clone()
        }
    }

    /// Returns `true` if the device lives on this node.
    pub fn is_local(&self) -> bool {
        self.network_id == LOCAL_NETWORK_ID
    }

    /// Returns `true` for the "no device" placeholder.
    pub fn is_none(&self) -> bool {
        self.device_type == DeviceType::None
    }

    /// Returns `true` if the router may pick this device.
    pub fn is_usable(&self) -> bool {
        !self.exception_flag && self.is_enable && self.connect_state != ConnectState::SuspendConnected
    }

    /// Decides whether `self` (a routing candidate) and `current` denote the
    /// same device.
    ///
    /// Network id, type, address and link state must all match. A full
    /// record is then always the same device. Against a snapshot, an A2DP
    /// device whose recorded offload mode disagrees with the live
    /// `offload_state` is a different device, and USB devices must also
    /// agree on role.
    pub fn is_same_device(&self, current: &DeviceDescriptor, offload_state: A2dpOffloadState) -> bool {
        if self.network_id != current.network_id
            || self.device_type != current.device_type
            || self.mac_address != current.mac_address
            || self.connect_state != current.connect_state
        {
            return false;
        }
        if current.kind == DescriptorKind::Full {
            return true;
        }
        if self.device_type == DeviceType::BluetoothA2dp {
            let recorded_offload = current.a2dp_offload == A2dpOffloadState::Offload;
            let live_offload = offload_state == A2dpOffloadState::Offload;
            if recorded_offload != live_offload {
                return false;
            }
        }
        if self.device_type.is_usb() {
            return self.device_role == current.device_role;
        }
        true
    }

    /// Identity on type, address and network id, plus role for USB devices.
    pub fn is_same_device_desc(&self, other: &DeviceDescriptor) -> bool {
        self.device_type == other.device_type
            && self.mac_address == other.mac_address
            && self.network_id == other.network_id
            && (!self.device_type.is_usb() || self.device_role == other.device_role)
    }

    /// Identity on type, role, address and network id.
    pub fn is_same_device_info(&self, other: &DeviceDescriptor) -> bool {
        self.device_type == other.device_type
            && self.device_role == other.device_role
            && self.mac_address == other.mac_address
            && self.network_id == other.network_id
    }
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self::none(DeviceRole::None)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "{}", self.device_type)
        } else {
            write!(f, "{}@{}", self.device_type, self.network_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a2dp(flag: A2dpOffloadState) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceType::BluetoothA2dp, DeviceRole::Output)
            .with_mac("11:22:33:44:55:66")
            .with_a2dp_offload(flag)
    }

    #[test]
    fn test_same_device_matching_fields() {
        let speaker = DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output);
        assert!(speaker.is_same_device(&speaker.to_info(), A2dpOffloadState::NoDevice));
    }

    #[test]
    fn test_same_device_connect_state_differs() {
        let sco = DeviceDescriptor::new(DeviceType::BluetoothSco, DeviceRole::Output).with_mac("aa");
        let deactive = sco.clone().with_connect_state(ConnectState::DeactiveConnected);
        assert!(!sco.is_same_device(&deactive, A2dpOffloadState::NoDevice));
    }

    #[test]
    fn test_a2dp_offload_mismatch_is_different_device() {
        let candidate = a2dp(A2dpOffloadState::Offload);

        // recorded offload, live not offload
        let recorded = a2dp(A2dpOffloadState::Offload).to_info();
        assert!(!candidate.is_same_device(&recorded, A2dpOffloadState::NotOffload));

        // recorded not offload, live offload
        let recorded = a2dp(A2dpOffloadState::NotOffload).to_info();
        assert!(!candidate.is_same_device(&recorded, A2dpOffloadState::Offload));

        // agreement
        let recorded = a2dp(A2dpOffloadState::Offload).to_info();
        assert!(candidate.is_same_device(&recorded, A2dpOffloadState::Offload));
    }

    #[test]
    fn test_full_record_skips_offload_rule() {
        let candidate = a2dp(A2dpOffloadState::Offload);
        let full = a2dp(A2dpOffloadState::NotOffload);
        assert!(candidate.is_same_device(&full, A2dpOffloadState::Offload));
    }

    #[test]
    fn test_usb_role_must_match_against_snapshot() {
        let out = DeviceDescriptor::new(DeviceType::UsbHeadset, DeviceRole::Output);
        let input = DeviceDescriptor::new(DeviceType::UsbHeadset, DeviceRole::Input).to_info();
        assert!(!out.is_same_device(&input, A2dpOffloadState::NoDevice));
        assert!(out.is_same_device(&out.to_info(), A2dpOffloadState::NoDevice));
    }

    #[test]
    fn test_usable_excludes_exception_and_suspend() {
        let mut dev = DeviceDescriptor::new(DeviceType::BluetoothSco, DeviceRole::Output);
        assert!(dev.is_usable());
        dev.exception_flag = true;
        assert!(!dev.is_usable());
        let suspended = DeviceDescriptor::new(DeviceType::BluetoothSco, DeviceRole::Output)
            .with_connect_state(ConnectState::SuspendConnected);
        assert!(!suspended.is_usable());
    }

    #[test]
    fn test_display_remote() {
        let remote = DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output).with_network_id("node-7");
        assert_eq!(remote.to_string(), "speaker@node-7");
        assert!(!remote.is_local());
    }
}
