//! Bluetooth device activation.

use tracing::{debug, error, info, warn};

use crate::device::{ConnectState, DeviceDescriptor, DeviceRole, DeviceType};
use crate::event::CoreEvent;
use crate::pipe::PipeInfo;
use crate::stream::StreamDescriptor;
use crate::{FacadeError, RouteError};

use super::AudioCoreService;

/// Result of activating a stream's device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Activation {
    /// The device is usable.
    Ready,
    /// The device failed and was excluded; the pass must run again.
    Refetch {
        /// Address of the failed peer.
        mac: String,
    },
}

impl AudioCoreService {
    /// Activates the Bluetooth peer a renderer was fetched for.
    pub(crate) async fn activate_output_device(&self, stream: &StreamDescriptor) -> Result<Activation, RouteError> {
        let Some(device) = stream.first_new_device() else {
            return Ok(Activation::Ready);
        };
        match device.device_type {
            DeviceType::BluetoothA2dp => {
                self.switch_active_a2dp_locked(device).await?;
                Ok(Activation::Ready)
            }
            DeviceType::BluetoothSco => {
                if let Some(mac) = self.activate_hfp_device(device).await {
                    return Ok(Activation::Refetch { mac });
                }
                if stream.is_started() {
                    let scene = self.audio_scene();
                    if let Err(e) = self.bluetooth.connect_sco_with_audio_scene(scene).await {
                        warn!(?scene, error = %e, "connect sco failed");
                    }
                }
                Ok(Activation::Ready)
            }
            _ => Ok(Activation::Ready),
        }
    }

    /// Activates the Bluetooth peer a capturer was fetched for.
    ///
    /// Voice recognition drives its own SCO link so an unrelated call link
    /// is not torn down.
    pub(crate) async fn activate_input_device(&self, stream: &StreamDescriptor) -> Activation {
        let Some(device) = stream.first_new_device() else {
            return Activation::Ready;
        };
        if device.device_type != DeviceType::BluetoothSco {
            return Activation::Ready;
        }
        if let Some(mac) = self.activate_hfp_device(device).await {
            return Activation::Refetch { mac };
        }
        self.active.set_active_bt_in_mac(&device.mac_address);
        if stream.is_started() {
            let result = if stream.capturer_info.source_type.uses_recognition_sco() {
                self.sco_fetched_for_recognition(device).await
            } else {
                self.bluetooth.connect_sco_with_audio_scene(self.audio_scene()).await
            };
            if let Err(e) = result {
                warn!(device = %device, error = %e, "sco for capture failed");
            }
        }
        Activation::Ready
    }

    /// Brings up the recognition SCO link. A peer whose link is already
    /// up is left alone.
    async fn sco_fetched_for_recognition(&self, device: &DeviceDescriptor) -> Result<(), FacadeError> {
        if device.connect_state != ConnectState::DeactiveConnected {
            debug!(device = %device, state = ?device.connect_state, "recognition sco already linked");
            return Ok(());
        }
        self.bluetooth.handle_sco_with_recognition(true, device).await
    }

    /// Drops the recognition SCO link once a capturer that held it stops or
    /// is released.
    pub(crate) async fn release_recognition_sco(&self, stream: &StreamDescriptor) {
        if stream.is_playback() || !stream.capturer_info.source_type.uses_recognition_sco() {
            return;
        }
        let device = stream
            .first_new_device()
            .cloned()
            .unwrap_or_else(|| DeviceDescriptor::none(DeviceRole::Input));
        info!(session_id = stream.session_id, device = %device, "release recognition sco");
        if let Err(e) = self.bluetooth.handle_sco_with_recognition(false, &device).await {
            warn!(session_id = stream.session_id, error = %e, "recognition sco release failed");
        }
    }

    /// Makes a hands-free peer active. On failure the peer is marked
    /// exceptional and its address returned.
    pub(crate) async fn activate_hfp_device(&self, device: &DeviceDescriptor) -> Option<String> {
        let mac = &device.mac_address;
        match self.bluetooth.set_active_hfp_device(mac).await {
            Ok(()) => {
                info!(mac = %mac, "hfp device active");
                None
            }
            Err(e) => {
                error!(mac = %mac, error = %e, "hfp activation failed, excluding device");
                self.registry.set_exception_flag(DeviceType::BluetoothSco, mac, true);
                self.emit(CoreEvent::DeviceMarkedExceptional {
                    device_type: DeviceType::BluetoothSco,
                    mac: mac.clone(),
                });
                Some(mac.clone())
            }
        }
    }

    /// Makes an A2DP peer the active one.
    ///
    /// If the A2DP port is already open for another peer it is reopened
    /// with the new peer's stream parameters. On failure the previous peer
    /// stays active.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidParam`] if the peer is not connected,
    /// [`RouteError::A2dpActivationFailed`] if the Bluetooth stack refuses
    /// it, or [`RouteError::OpenPortFailed`] if the port cannot be reopened.
    pub async fn switch_active_a2dp(&self, device: &DeviceDescriptor) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.switch_active_a2dp_locked(device).await
    }

    pub(crate) async fn switch_active_a2dp_locked(&self, device: &DeviceDescriptor) -> Result<(), RouteError> {
        let mac = device.mac_address.as_str();
        if !self.registry.has_a2dp_device(mac) {
            return Err(RouteError::invalid_param(format!("a2dp device {mac} is not connected")));
        }
        let loaded = self.a2dp_pipe();
        let previous = self.active.active_bt_mac();
        if previous == mac && loaded.is_some() {
            return Ok(());
        }

        self.active.set_active_bt_mac(mac);
        if let Err(e) = self.bluetooth.set_active_a2dp_device(mac).await {
            error!(mac, previous = %previous, error = %e, "a2dp activation failed, restoring previous device");
            self.active.set_active_bt_mac(&previous);
            return Err(RouteError::A2dpActivationFailed {
                mac: mac.to_string(),
                reason: e.to_string(),
            });
        }
        info!(mac, previous = %previous, "a2dp device active");

        if let Some(pipe) = loaded {
            self.reload_a2dp_pipe(pipe, mac).await?;
        }
        Ok(())
    }

    fn a2dp_pipe(&self) -> Option<PipeInfo> {
        let adapter = self.selector.adapters().adapter_name(DeviceType::BluetoothA2dp)?;
        self.pipes
            .pipes()
            .into_iter()
            .find(|p| p.adapter_name == adapter && p.is_open())
    }

    async fn reload_a2dp_pipe(&self, mut pipe: PipeInfo, mac: &str) -> Result<(), RouteError> {
        let info = self.bluetooth.a2dp_stream_info(mac).await?;
        let module = &mut pipe.module_info;
        module.rate = info.sampling_rate;
        module.format = info.format;
        module.channels = info.channels;
        module.buffer_size = info.sampling_rate * info.format.bytes() * info.channels / 50;

        let port = self
            .hdi
            .reload_audio_port(pipe.port(), &pipe)
            .await
            .map_err(|e| RouteError::OpenPortFailed {
                pipe: pipe.name.clone(),
                reason: e.to_string(),
            })?;
        info!(pipe = %pipe.name, id = port.id, rate = info.sampling_rate, "a2dp port reloaded");
        pipe.id = port.id;
        pipe.pa_index = port.pa_index;
        self.pipes.update_pipe(pipe);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{music, out, Harness};
    use super::*;
    use crate::device::DeviceRole;
    use crate::event::DeviceChangeReason;
    use crate::facade::A2dpStreamInfo;
    use crate::mock::{BluetoothCall, HdiCall};
    use crate::pipe::A2DP_OUTPUT;
    use crate::stream::{SampleFormat, StreamInfo, StreamUsage};

    #[tokio::test]
    async fn test_a2dp_failure_restores_previous_mac() {
        let h = Harness::new();
        let first = out(DeviceType::BluetoothA2dp).with_mac("aa:01");
        let second = out(DeviceType::BluetoothA2dp).with_mac("aa:02");
        h.connect(first.clone());
        h.connect(second.clone());

        h.service.switch_active_a2dp(&first).await.unwrap();
        assert_eq!(h.service.active_devices().active_bt_mac(), "aa:01");

        h.bluetooth.fail_mac("aa:02");
        let err = h.service.switch_active_a2dp(&second).await.unwrap_err();
        assert!(matches!(err, RouteError::A2dpActivationFailed { ref mac, .. } if mac == "aa:02"));
        assert_eq!(h.service.active_devices().active_bt_mac(), "aa:01");
    }

    #[tokio::test]
    async fn test_unknown_a2dp_device_rejected() {
        let h = Harness::new();
        let ghost = out(DeviceType::BluetoothA2dp).with_mac("ff:ff");
        let err = h.service.switch_active_a2dp(&ghost).await.unwrap_err();
        assert!(matches!(err, RouteError::InvalidParam { .. }));
        assert!(h.bluetooth.calls().is_empty());
    }

    #[tokio::test]
    async fn test_peer_swap_reloads_port() {
        let h = Harness::new();
        let first = out(DeviceType::BluetoothA2dp).with_mac("aa:01");
        h.service.on_device_connected(first).await.unwrap();
        let created = h.service.create_renderer_client(music()).await.unwrap();
        assert!(h.service.pipe_manager().pipe_by_name(A2DP_OUTPUT).is_some());

        h.bluetooth.set_stream_info(
            "aa:02",
            A2dpStreamInfo {
                sampling_rate: 44_100,
                format: SampleFormat::S16Le,
                channels: 2,
            },
        );
        let second = out(DeviceType::BluetoothA2dp).with_mac("aa:02");
        h.service.on_device_connected(second).await.unwrap();

        assert!(h.hdi.calls().contains(&HdiCall::ReloadAudioPort(A2DP_OUTPUT.to_string())));
        let pipe = h.service.pipe_manager().pipe_by_name(A2DP_OUTPUT).unwrap();
        assert_eq!(pipe.module_info.rate, 44_100);
        assert_eq!(pipe.module_info.buffer_size, 44_100 * 2 * 2 / 50);
        assert!(pipe.contains_session(created.session_id));
        assert_eq!(h.service.active_devices().active_bt_mac(), "aa:02");
    }

    #[tokio::test]
    async fn test_sco_failure_excludes_device_and_refetches() {
        let h = Harness::new();
        h.connect(out(DeviceType::Earpiece));
        h.connect(out(DeviceType::BluetoothSco).with_mac("bb:01"));
        h.bluetooth.fail_mac("bb:01");

        let call = StreamDescriptor::renderer(StreamUsage::VoiceCommunication, StreamInfo::default())
            .with_app(20_020, 400);
        let created = h.service.create_renderer_client(call).await.unwrap();
        let stream = h.service.pipe_manager().stream_desc_by_id(created.session_id).unwrap();
        assert_eq!(stream.new_device_descs[0].device_type, DeviceType::Earpiece);
        assert!(h
            .registry
            .find(DeviceType::BluetoothSco, DeviceRole::Output, "bb:01")
            .unwrap()
            .exception_flag);
        assert!(h.events().iter().any(|e| matches!(e, CoreEvent::DeviceMarkedExceptional { .. })));
    }

    #[tokio::test]
    async fn test_started_sco_stream_connects_link() {
        let h = Harness::new();
        h.connect(out(DeviceType::BluetoothSco).with_mac("bb:01"));
        let call = StreamDescriptor::renderer(StreamUsage::VoiceCommunication, StreamInfo::default())
            .with_app(20_020, 400);
        let created = h.service.create_renderer_client(call).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        let calls = h.bluetooth.calls();
        assert!(calls.contains(&BluetoothCall::SetActiveHfpDevice("bb:01".to_string())));
        assert!(calls.contains(&BluetoothCall::ConnectScoWithAudioScene(crate::scene::AudioScene::Default)));
        h.service
            .fetch_output_device_and_route(DeviceChangeReason::Unknown)
            .await
            .unwrap();
    }
}
