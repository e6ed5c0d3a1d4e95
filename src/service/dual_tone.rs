//! Ringer and alarm routing over two devices.
//!
//! At most one session owns the dual tone at a time. Enabling it for a new
//! session first disables it for the previous owner.

use tracing::{debug, info, warn};

use crate::device::{DeviceRole, DeviceType};
use crate::event::CoreEvent;
use crate::scene::RingerMode;
use crate::stream::{StreamDescriptor, StreamUsage};

use super::AudioCoreService;

impl AudioCoreService {
    /// Pushes the HAL route for a renderer's devices.
    ///
    /// Ringtones and alarms on dual-capable devices may use both devices;
    /// everything else routes its main device only.
    pub(crate) async fn update_output_route(&self, stream: &StreamDescriptor) {
        let Some(first) = stream.first_new_device() else {
            return;
        };
        let usage = stream.renderer_info.usage;
        if usage.is_ringer_or_alarm() && first.device_type.is_dual_tone_capable() && !self.config.pc_volume_enabled {
            if self.select_ringer_or_alarm_devices(stream).await {
                return;
            }
        } else if self.dual_tone_session() == Some(stream.session_id) {
            self.update_dual_tone_state(false, stream.session_id).await;
        }
        if let Err(e) = self.active.update_active_device_route(first, DeviceRole::Output).await {
            warn!(session_id = stream.session_id, device = %first, error = %e, "output route failed");
        }
    }

    /// Routes a ringer or alarm stream to its devices.
    ///
    /// Returns `false` when the caller should fall back to routing the main
    /// device alone: more than two devices, a device that cannot ring
    /// alongside another, or a ringer mode that silences the second device.
    pub(crate) async fn select_ringer_or_alarm_devices(&self, stream: &StreamDescriptor) -> bool {
        let devices = &stream.new_device_descs;
        if devices.len() > 2 || !devices.iter().all(|d| d.device_type.is_dual_tone_capable()) {
            info!(session_id = stream.session_id, count = devices.len(), "devices do not qualify for dual tone");
            return false;
        }

        let adapters = self.selector.adapters();
        let split = match devices.as_slice() {
            [a, b] => adapters.adapter_for(a) != adapters.adapter_for(b),
            _ => false,
        };
        if split {
            if let Some(speaker) = devices.iter().find(|d| d.device_type == DeviceType::Speaker) {
                if let Err(e) = self.active.update_active_device_route(speaker, DeviceRole::Output).await {
                    warn!(error = %e, "speaker route for dual tone failed");
                }
            }
            let silenced =
                self.ringer_mode() != RingerMode::Normal && stream.renderer_info.usage != StreamUsage::Alarm;
            if silenced {
                info!(session_id = stream.session_id, "ringer mode silences the second device");
                if let Some(owner) = self.dual_tone_session() {
                    self.update_dual_tone_state(false, owner).await;
                }
                return false;
            }
            self.update_dual_tone_state(true, stream.session_id).await;
            return true;
        }

        if self.dual_tone_session() == Some(stream.session_id) {
            self.update_dual_tone_state(false, stream.session_id).await;
        }
        let port = self
            .selector
            .pipe_name_for(stream)
            .or_else(|| devices.first().and_then(|d| adapters.adapter_for(d)))
            .unwrap_or_default();
        if let Err(e) = self
            .active
            .update_active_devices_route(devices, DeviceRole::Output, &port)
            .await
        {
            warn!(session_id = stream.session_id, port = %port, error = %e, "ringer route failed");
        }
        true
    }

    /// Switches the dual tone on for `session_id`, or off if it owns it.
    pub(crate) async fn update_dual_tone_state(&self, enable: bool, session_id: u32) {
        let previous = {
            let mut state = self.state.lock();
            let owner = state.dual_tone_session;
            if enable {
                if owner == Some(session_id) {
                    return;
                }
                state.dual_tone_session = Some(session_id);
            } else {
                if owner != Some(session_id) {
                    return;
                }
                state.dual_tone_session = None;
            }
            owner
        };

        if let Some(previous) = previous.filter(|p| enable && *p != session_id) {
            self.push_dual_tone_state(false, previous).await;
        }
        self.push_dual_tone_state(enable, session_id).await;
    }

    async fn push_dual_tone_state(&self, enable: bool, session_id: u32) {
        debug!(enable, session_id, "dual tone state");
        if let Err(e) = self.hdi.update_dual_tone_state(enable, session_id).await {
            warn!(enable, session_id, error = %e, "update dual tone state failed");
        }
        self.emit(CoreEvent::DualToneStateChanged {
            enabled: enable,
            session_id,
        });
    }
}
