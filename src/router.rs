//! Device selection policy.

use std::sync::Arc;

use tracing::debug;

use crate::device::{DeviceDescriptor, DeviceRegistry, DeviceRole, DeviceType, PreferredSlot};
use crate::stream::{SourceType, StreamUsage};

const MEDIA_OUTPUTS: &[DeviceType] = &[
    DeviceType::BluetoothA2dp,
    DeviceType::UsbHeadset,
    DeviceType::UsbArmHeadset,
    DeviceType::WiredHeadset,
    DeviceType::WiredHeadphones,
    DeviceType::Hdmi,
    DeviceType::LineDigital,
];

const CALL_OUTPUTS: &[DeviceType] = &[
    DeviceType::BluetoothSco,
    DeviceType::UsbHeadset,
    DeviceType::UsbArmHeadset,
    DeviceType::WiredHeadset,
    DeviceType::WiredHeadphones,
];

const CALL_INPUTS: &[DeviceType] = &[
    DeviceType::BluetoothSco,
    DeviceType::UsbHeadset,
    DeviceType::UsbArmHeadset,
    DeviceType::WiredHeadset,
];

const RECORD_INPUTS: &[DeviceType] = &[DeviceType::UsbHeadset, DeviceType::UsbArmHeadset, DeviceType::WiredHeadset];

/// Picks devices for streams from the registry.
///
/// Order of precedence: an application's pinned device, then the user's
/// preferred device for the usage class, then the most recently connected
/// eligible device, then the built-in device.
#[derive(Debug, Clone)]
pub struct RouterCenter {
    registry: Arc<DeviceRegistry>,
}

impl RouterCenter {
    /// Creates a router over a registry.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Output devices for a playback usage, main device first.
    ///
    /// Ringtones and alarms get a second entry (the speaker) when their main
    /// device is a personal device that can ring alongside it. Returns a
    /// single "none" descriptor when nothing is eligible.
    pub fn fetch_output_devices(&self, usage: StreamUsage, uid: i32) -> Vec<DeviceDescriptor> {
        if let Some(pinned) = self
            .registry
            .renderer_affinity(uid)
            .and_then(|d| self.live(&d))
        {
            debug!(uid, device = %pinned, "output from affinity");
            return vec![pinned];
        }

        if usage.is_ringer_or_alarm() {
            return self.ringer_devices();
        }

        let (slot, candidates) = if usage.is_call() {
            (PreferredSlot::CallRender, CALL_OUTPUTS)
        } else {
            (PreferredSlot::MediaRender, MEDIA_OUTPUTS)
        };
        if let Some(preferred) = self.registry.preferred(slot).and_then(|d| self.live(&d)) {
            return vec![preferred];
        }

        let picked = self.latest_connected(candidates, DeviceRole::Output).or_else(|| {
            if usage.is_call() {
                self.latest_connected(&[DeviceType::Earpiece], DeviceRole::Output)
                    .or_else(|| self.latest_connected(&[DeviceType::Speaker], DeviceRole::Output))
            } else {
                self.latest_connected(&[DeviceType::Speaker], DeviceRole::Output)
            }
        });
        vec![picked.unwrap_or_else(|| DeviceDescriptor::none(DeviceRole::Output))]
    }

    /// Input device for a capture source.
    pub fn fetch_input_device(&self, source: SourceType, uid: i32) -> DeviceDescriptor {
        match source {
            SourceType::PlaybackCapture => return DeviceDescriptor::new(DeviceType::Invalid, DeviceRole::Input),
            SourceType::RemoteCast => return DeviceDescriptor::new(DeviceType::RemoteCast, DeviceRole::Input),
            _ => {}
        }

        if let Some(pinned) = self
            .registry
            .capturer_affinity(uid)
            .and_then(|d| self.live(&d))
        {
            return pinned;
        }

        let call_like = matches!(
            source,
            SourceType::VoiceCall | SourceType::VoiceCommunication | SourceType::VoiceRecognition
        );
        let slot = if call_like {
            PreferredSlot::CallCapture
        } else {
            PreferredSlot::RecordCapture
        };
        if source != SourceType::Wakeup {
            if let Some(preferred) = self.registry.preferred(slot).and_then(|d| self.live(&d)) {
                return preferred;
            }
        }

        let candidates: &[DeviceType] = match source {
            SourceType::Wakeup => &[],
            _ if call_like => CALL_INPUTS,
            _ => RECORD_INPUTS,
        };
        self.latest_connected(candidates, DeviceRole::Input)
            .or_else(|| self.latest_connected(&[DeviceType::Mic], DeviceRole::Input))
            .unwrap_or_else(|| DeviceDescriptor::none(DeviceRole::Input))
    }

    fn ringer_devices(&self) -> Vec<DeviceDescriptor> {
        let speaker = self.latest_connected(&[DeviceType::Speaker], DeviceRole::Output);
        let primary = self
            .registry
            .preferred(PreferredSlot::MediaRender)
            .and_then(|d| self.live(&d))
            .or_else(|| self.latest_connected(MEDIA_OUTPUTS, DeviceRole::Output));

        match (primary, speaker) {
            (Some(primary), Some(speaker))
                if primary.device_type != DeviceType::Speaker && primary.device_type.is_dual_tone_capable() =>
            {
                vec![primary, speaker]
            }
            (_, Some(speaker)) => vec![speaker],
            (Some(primary), None) => vec![primary],
            (None, None) => vec![DeviceDescriptor::none(DeviceRole::Output)],
        }
    }

    /// The registry's current record for `device`, if still connected and usable.
    fn live(&self, device: &DeviceDescriptor) -> Option<DeviceDescriptor> {
        self.registry
            .connected_devices()
            .into_iter()
            .find(|d| d.is_same_device_info(device))
            .filter(DeviceDescriptor::is_usable)
    }

    /// Most recently connected usable local device among `candidates`.
    pub fn latest_connected(&self, candidates: &[DeviceType], role: DeviceRole) -> Option<DeviceDescriptor> {
        self.registry
            .devices_with_role(role)
            .into_iter()
            .filter(|d| d.is_local() && d.is_usable() && candidates.contains(&d.device_type))
            .max_by_key(|d| d.connect_time)
    }
}
