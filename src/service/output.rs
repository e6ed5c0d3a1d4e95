//! Output fetch.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::device::{ConnectState, DeviceDescriptor, DeviceRole, DeviceType};
use crate::event::{CoreEvent, DeviceChangeReason};
use crate::pipe::{PipeInfo, PipeRole};
use crate::scene::AudioScene;
use crate::stream::{Encoding, StreamDescriptor, StreamStatus, StreamUsage};
use crate::RouteError;

use super::bluetooth::Activation;
use super::execute::PassOutcome;
use super::AudioCoreService;

/// Whether a running stream must switch to its newly fetched device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    /// Route the stream to the new device.
    Switch,
    /// The stream already plays on the right device.
    NeedNotSwitch,
}

/// Session to pipe name, taken before a pass changes the table.
pub(crate) fn pipe_of_sessions(pipes: &[PipeInfo]) -> HashMap<u32, String> {
    pipes
        .iter()
        .flat_map(|p| p.streams.iter().map(move |s| (s.session_id, p.name.clone())))
        .collect()
}

impl AudioCoreService {
    pub(crate) async fn fetch_output_pass(&self, reason: DeviceChangeReason) -> PassOutcome {
        if let Some(mac) = self.check_modem_scene().await {
            return PassOutcome::Refetch { mac };
        }
        let mut streams = self.pipes.all_output_stream_descs();
        if streams.is_empty() {
            self.fetch_output_device_for_no_running_stream().await;
            return PassOutcome::Done;
        }

        let old_pipe_of = pipe_of_sessions(&self.pipes.pipes_with_role(PipeRole::Output));
        let mut active_updated = false;
        for stream in &mut streams {
            stream.old_device_descs = std::mem::take(&mut stream.new_device_descs);
            stream.new_device_descs = self
                .router
                .fetch_output_devices(stream.renderer_info.usage, stream.real_uid());
            self.update_playback_stream_flag(stream);
            let Some(device) = stream.first_new_device().cloned() else {
                continue;
            };
            debug!(session_id = stream.session_id, device = %device, flag = %stream.route_flag, "output device fetched");
            if device.is_none() {
                stream.keep_old_devices();
                continue;
            }
            if !self.handle_output_stream_in_running(stream, reason).await {
                continue;
            }

            match self.activate_output_device(stream).await {
                Ok(Activation::Ready) => {}
                Ok(Activation::Refetch { mac }) => return PassOutcome::Refetch { mac },
                Err(e) => {
                    warn!(session_id = stream.session_id, device = %device, error = %e, "activation failed, keeping device");
                    stream.keep_old_devices();
                    continue;
                }
            }
            if !active_updated && self.update_output_device(&device, stream.real_uid()) {
                active_updated = true;
            }
            if stream.is_started() {
                let switched = stream.first_old_device().is_some_and(|old| !device.is_same_device_desc(old));
                if let Some(sink) = old_pipe_of.get(&stream.session_id).filter(|_| switched) {
                    self.mute_sink_for_switch(sink).await;
                }
            }
        }
        if active_updated {
            let current = self.active.current_output_device();
            self.apply_switch_volume(&current).await;
            self.emit(CoreEvent::PreferredOutputDeviceUpdated { device: current });
        }

        let offload = self.registry.a2dp_offload_state();
        let rerouted: HashSet<u32> = streams
            .iter()
            .filter(|s| !s.devices_unchanged(offload))
            .map(|s| s.session_id)
            .collect();
        let current = self.pipes.pipes_with_role(PipeRole::Output);
        let pipes = self.selector.fetch_pipes(current, &mut streams, &rerouted);
        let pipes = self.execute_pipes(PipeRole::Output, pipes, &old_pipe_of, reason).await;
        self.pipes.update_renderer_pipe_infos(pipes);
        self.remove_unused_pipes().await;

        if !streams.iter().any(StreamDescriptor::is_started) {
            self.fetch_output_device_for_no_running_stream().await;
        }
        PassOutcome::Done
    }

    /// Whether the pass must route this stream; running streams that stay
    /// on their device are skipped unless they ring.
    async fn handle_output_stream_in_running(&self, stream: &StreamDescriptor, reason: DeviceChangeReason) -> bool {
        if !stream.is_started() {
            return true;
        }
        match self.handle_device_change_for_fetch_output_device(stream, reason).await {
            SwitchDecision::Switch => true,
            SwitchDecision::NeedNotSwitch => stream.renderer_info.usage.is_ringer_or_alarm(),
        }
    }

    /// Decides whether a running stream switches device.
    ///
    /// A stream whose devices did not change, whose link is active and whose
    /// scene did not change stays put; only the current output device is
    /// refreshed if it disagrees.
    pub(crate) async fn handle_device_change_for_fetch_output_device(
        &self,
        stream: &StreamDescriptor,
        reason: DeviceChangeReason,
    ) -> SwitchDecision {
        if stream.old_device_descs.is_empty() {
            return SwitchDecision::Switch;
        }
        let Some(device) = stream.first_new_device().filter(|d| !d.is_none()) else {
            return SwitchDecision::NeedNotSwitch;
        };
        let offload = self.registry.a2dp_offload_state();
        let same_scene = !(reason == DeviceChangeReason::SetAudioScene && !self.is_same_scene());
        if stream.devices_unchanged(offload) && device.connect_state != ConnectState::DeactiveConnected && same_scene {
            let current = self.active.current_output_device();
            let pinned_elsewhere = self
                .registry
                .renderer_affinity(stream.real_uid())
                .is_some_and(|p| !p.is_same_device_info(device));
            if !device.is_same_device(&current, offload) && !pinned_elsewhere {
                info!(session_id = stream.session_id, device = %device, "refresh current output device");
                self.active.set_current_output_device(device);
                self.apply_switch_volume(device).await;
                if let Err(e) = self.active.update_active_device_route(device, DeviceRole::Output).await {
                    warn!(device = %device, error = %e, "route refresh failed");
                }
                self.emit(CoreEvent::PreferredOutputDeviceUpdated {
                    device: device.to_info(),
                });
            }
            debug!(session_id = stream.session_id, "need not switch device");
            return SwitchDecision::NeedNotSwitch;
        }
        SwitchDecision::Switch
    }

    /// Makes `device` the current output device if it changed.
    ///
    /// A stream pinned to a device by its application only updates the
    /// current device when it lands somewhere other than the pinned type.
    pub(crate) fn update_output_device(&self, device: &DeviceDescriptor, uid: i32) -> bool {
        if device.is_none() {
            return false;
        }
        let changed = !device.is_same_device_info(&self.active.current_output_device());
        let update = match self.registry.renderer_affinity(uid) {
            Some(pinned) => changed && device.device_type != pinned.device_type,
            None => changed,
        };
        if update {
            self.active.set_current_output_device(device);
        }
        update
    }

    /// Moves a running stream to the device it was fetched for.
    pub(crate) async fn move_to_new_output_device(
        &self,
        stream: &StreamDescriptor,
        pipe: &PipeInfo,
        reason: DeviceChangeReason,
    ) -> Result<(), RouteError> {
        let Some(device) = stream.first_new_device() else {
            return Err(RouteError::invalid_param(format!("session {} has no device", stream.session_id)));
        };
        if stream.stream_info.encoding == Encoding::Eac3
            && !matches!(device.device_type, DeviceType::Hdmi | DeviceType::LineDigital)
        {
            return Err(RouteError::NotSupported {
                device: device.device_type,
            });
        }
        info!(session_id = stream.session_id, device = %device, pipe = %pipe.name, "move to new output device");

        let old = stream.first_old_device();
        if let Some(old) = old {
            self.emit(CoreEvent::DeviceChanged {
                session_id: stream.session_id,
                pid: stream.app_info.pid,
                old_device: old.clone(),
                new_device: device.clone(),
                reason,
            });
        }
        self.set_effect_sink(device.device_type).await;

        let moved = if device.is_local() {
            self.move_to_local_output_device(stream, pipe, device).await
        } else {
            self.move_to_remote_output_device(stream, pipe, device).await
        };
        if let Err(e) = moved {
            if let Some(old) = old {
                self.set_effect_sink(old.device_type).await;
            }
            return Err(e);
        }

        if self.config.update_route_supported && reason != DeviceChangeReason::SetAudioScene {
            self.update_output_route(stream).await;
        }
        self.apply_switch_volume(device).await;
        self.collector.update_renderer_device_info(stream.session_id, device).await;
        Ok(())
    }

    async fn move_to_local_output_device(
        &self,
        stream: &StreamDescriptor,
        pipe: &PipeInfo,
        device: &DeviceDescriptor,
    ) -> Result<(), RouteError> {
        if device.device_type == DeviceType::BluetoothA2dp {
            if let Err(e) = self.hdi.suspend_audio_device(&pipe.name, false).await {
                warn!(pipe = %pipe.name, error = %e, "resume a2dp port failed");
            }
        }
        self.move_sink_input(stream.session_id, pipe).await
    }

    async fn move_to_remote_output_device(
        &self,
        stream: &StreamDescriptor,
        pipe: &PipeInfo,
        device: &DeviceDescriptor,
    ) -> Result<(), RouteError> {
        if let Err(e) = self
            .hdi
            .check_remote_device_state(&device.network_id, DeviceRole::Output, true)
            .await
        {
            warn!(network_id = %device.network_id, error = %e, "remote output device unreachable");
            return Err(RouteError::operation_failed(format!(
                "remote device {} state check: {e}",
                device.network_id
            )));
        }
        self.move_sink_input(stream.session_id, pipe).await
    }

    async fn move_sink_input(&self, session_id: u32, pipe: &PipeInfo) -> Result<(), RouteError> {
        self.hdi
            .move_sink_input(session_id, pipe.pa_index, &pipe.name)
            .await
            .map_err(|e| RouteError::MoveFailed {
                session_id,
                port: pipe.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Moves a stream that is not playing; no client notification.
    pub(crate) async fn move_stream_sink(&self, stream: &StreamDescriptor, pipe: &PipeInfo) -> Result<(), RouteError> {
        self.move_sink_input(stream.session_id, pipe).await?;
        if let Some(device) = stream.first_new_device() {
            self.collector.update_renderer_device_info(stream.session_id, device).await;
        }
        Ok(())
    }

    async fn set_effect_sink(&self, device_type: DeviceType) {
        if let Err(e) = self.hdi.update_effect_default_sink(device_type).await {
            warn!(%device_type, error = %e, "update effect sink failed");
        }
    }

    pub(crate) async fn apply_switch_volume(&self, device: &DeviceDescriptor) {
        if let Err(e) = self.hdi.set_volume_for_switch_device(device).await {
            warn!(device = %device, error = %e, "set volume for switch device failed");
        }
    }

    /// With no output streams, only the current output device follows the
    /// media route.
    async fn fetch_output_device_for_no_running_stream(&self) {
        let devices = self.router.fetch_output_devices(StreamUsage::Media, -1);
        let Some(device) = devices.first().filter(|d| !d.is_none()) else {
            return;
        };
        let current = self.active.current_output_device();
        if device.is_same_device(&current, self.registry.a2dp_offload_state()) {
            return;
        }
        self.active.set_current_output_device(device);
        self.apply_switch_volume(device).await;
        if device.device_type == DeviceType::BluetoothA2dp {
            if let Err(e) = self.switch_active_a2dp_locked(device).await {
                warn!(device = %device, error = %e, "a2dp switch without running stream failed");
            }
        }
        self.emit(CoreEvent::PreferredOutputDeviceUpdated {
            device: device.to_info(),
        });
    }

    /// Keeps modem call sessions in step with the scene and the call route.
    ///
    /// Returns the address of a hands-free peer that failed to activate.
    async fn check_modem_scene(&self) -> Option<String> {
        if !self.pipes.is_modem_communication_id_exist() {
            return None;
        }
        let scene = self.audio_scene();
        if scene == AudioScene::PhoneCall {
            self.pipes.update_modem_stream_status(StreamStatus::Started);
        } else {
            self.pipes.update_modem_stream_status(StreamStatus::Stopped);
        }
        let devices = self
            .router
            .fetch_output_devices(StreamUsage::VoiceModemCommunication, -1);
        let device = devices.first().filter(|d| !d.is_none())?.clone();

        let previous = self
            .pipes
            .modem_communication_map()
            .values()
            .next()
            .and_then(|d| d.first_new_device().cloned());
        let changed = previous.map_or(true, |p| !device.is_same_device_desc(&p));
        if !changed && self.is_same_scene() {
            return None;
        }
        if device.device_type == DeviceType::BluetoothSco && scene == AudioScene::PhoneCall {
            if let Some(mac) = self.activate_hfp_device(&device).await {
                return Some(mac);
            }
        }
        info!(device = %device, ?scene, "modem call device");
        self.pipes.update_modem_stream_device(&devices);
        if scene == AudioScene::PhoneCall {
            self.active.set_current_output_device(&device);
            if let Err(e) = self.active.update_active_device_route(&device, DeviceRole::Output).await {
                warn!(device = %device, error = %e, "modem route failed");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{music, out, Harness};
    use super::*;
    use crate::mock::HdiCall;
    use crate::stream::{StreamInfo, StreamStatus};

    #[tokio::test]
    async fn test_no_running_stream_updates_current_device() {
        let h = Harness::new();
        h.connect(out(DeviceType::WiredHeadset));
        h.service
            .fetch_output_device_and_route(DeviceChangeReason::Unknown)
            .await
            .unwrap();
        assert_eq!(
            h.service.active_devices().current_output_device().device_type,
            DeviceType::WiredHeadset
        );
        assert!(h.hdi.calls().contains(&HdiCall::SetVolumeForSwitchDevice(DeviceType::WiredHeadset)));
        assert!(h.service.pipe_manager().pipes().is_empty());
    }

    #[tokio::test]
    async fn test_running_stream_on_same_device_need_not_switch() {
        let h = Harness::new();
        let created = h.service.create_renderer_client(music()).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        let mut stream = h.service.pipe_manager().stream_desc_by_id(created.session_id).unwrap();
        stream.old_device_descs = std::mem::take(&mut stream.new_device_descs);
        stream.new_device_descs = vec![out(DeviceType::Speaker)];
        let decision = h
            .service
            .handle_device_change_for_fetch_output_device(&stream, DeviceChangeReason::Unknown)
            .await;
        assert_eq!(decision, SwitchDecision::NeedNotSwitch);

        stream.new_device_descs = vec![out(DeviceType::WiredHeadset)];
        let decision = h
            .service
            .handle_device_change_for_fetch_output_device(&stream, DeviceChangeReason::Unknown)
            .await;
        assert_eq!(decision, SwitchDecision::Switch);
    }

    #[tokio::test]
    async fn test_scene_change_forces_switch() {
        let h = Harness::new();
        let created = h.service.create_renderer_client(music()).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();
        h.service.state.lock().scene = AudioScene::PhoneChat;

        let mut stream = h.service.pipe_manager().stream_desc_by_id(created.session_id).unwrap();
        stream.old_device_descs = stream.new_device_descs.clone();
        let decision = h
            .service
            .handle_device_change_for_fetch_output_device(&stream, DeviceChangeReason::SetAudioScene)
            .await;
        assert_eq!(decision, SwitchDecision::Switch);
    }

    #[tokio::test]
    async fn test_update_output_device_respects_affinity() {
        let h = Harness::new();
        let wired = out(DeviceType::WiredHeadset);
        h.registry.set_renderer_affinity(20_010, Some(wired.clone()));
        assert!(!h.service.update_output_device(&wired, 20_010));
        assert!(h.service.update_output_device(&out(DeviceType::Speaker), 20_010));
        assert!(!h.service.update_output_device(&out(DeviceType::Speaker), 20_011));
        assert!(!h.service.update_output_device(&DeviceDescriptor::none(DeviceRole::Output), 1));
    }

    #[tokio::test]
    async fn test_eac3_only_on_digital_outputs() {
        let h = Harness::new();
        let mut stream = StreamDescriptor::renderer(
            StreamUsage::Movie,
            StreamInfo {
                encoding: Encoding::Eac3,
                ..StreamInfo::default()
            },
        )
        .with_session_id(100_050);
        stream.new_device_descs = vec![out(DeviceType::Speaker)];
        let pipe = PipeInfo {
            id: 1,
            pa_index: 1,
            role: PipeRole::Output,
            route_flag: stream.route_flag,
            adapter_name: "primary".to_string(),
            name: "primary_output".to_string(),
            module_info: crate::pipe::module_info_for(
                "primary",
                "primary_output",
                PipeRole::Output,
                &stream,
                &out(DeviceType::Speaker),
            ),
            action: crate::pipe::PipeAction::Default,
            streams: Vec::new(),
        };
        let err = h
            .service
            .move_to_new_output_device(&stream, &pipe, DeviceChangeReason::Unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NotSupported { device: DeviceType::Speaker }));
    }

    #[tokio::test]
    async fn test_remote_state_failure_rolls_back_effect_sink() {
        let h = Harness::new();
        let created = h.service.create_renderer_client(music()).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        let remote = out(DeviceType::Speaker).with_network_id("node-7");
        h.connect(remote.clone());
        h.hdi.set_remote_reachable(false);
        h.hdi.clear_calls();
        h.service.select_output_device(20_010, Some(remote)).await.unwrap();

        let calls = h.hdi.calls();
        let check = calls
            .iter()
            .position(|c| *c == HdiCall::CheckRemoteDeviceState("node-7".to_string()))
            .unwrap();
        assert!(calls[check..].contains(&HdiCall::UpdateEffectDefaultSink(DeviceType::Speaker)));
        let stream = h.service.pipe_manager().stream_desc_by_id(created.session_id).unwrap();
        assert!(stream.new_device_descs[0].is_local());
    }

    #[tokio::test]
    async fn test_modem_session_routed_by_scene() {
        let h = Harness::new();
        h.connect(out(DeviceType::Earpiece));
        let call = StreamDescriptor::renderer(StreamUsage::VoiceModemCommunication, StreamInfo::default())
            .with_app(1001, 1);
        let created = h.service.create_renderer_client(call).await.unwrap();
        assert!(h.service.pipe_manager().is_modem_session(created.session_id));

        h.service.set_audio_scene(AudioScene::PhoneCall).await.unwrap();
        let modem = h.service.pipe_manager().modem_communication_map();
        let desc = &modem[&created.session_id];
        assert_eq!(desc.stream_status, StreamStatus::Started);
        assert_eq!(desc.new_device_descs[0].device_type, DeviceType::Earpiece);
        assert!(h.service.pipe_manager().pipes().is_empty());
    }

    #[tokio::test]
    async fn test_modem_session_stops_when_call_ends() {
        let h = Harness::new();
        h.connect(out(DeviceType::Earpiece));
        let call = StreamDescriptor::renderer(StreamUsage::VoiceModemCommunication, StreamInfo::default())
            .with_app(1001, 1);
        let created = h.service.create_renderer_client(call).await.unwrap();

        h.service.set_audio_scene(AudioScene::PhoneCall).await.unwrap();
        h.service.set_audio_scene(AudioScene::Default).await.unwrap();
        let modem = h.service.pipe_manager().modem_communication_map();
        assert_eq!(modem[&created.session_id].stream_status, StreamStatus::Stopped);
    }
}
