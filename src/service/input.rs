//! Input fetch.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::device::{ConnectState, DeviceDescriptor, DeviceRole, DeviceType};
use crate::event::{CoreEvent, DeviceChangeReason};
use crate::pipe::{PipeInfo, PipeRole};
use crate::stream::{SourceType, StreamDescriptor};
use crate::RouteError;

use super::bluetooth::Activation;
use super::execute::PassOutcome;
use super::output::{pipe_of_sessions, SwitchDecision};
use super::AudioCoreService;

impl AudioCoreService {
    pub(crate) async fn fetch_input_pass(&self, reason: DeviceChangeReason) -> PassOutcome {
        let mut streams = self.pipes.all_input_stream_descs();
        if streams.is_empty() {
            self.fetch_input_device_for_no_running_stream().await;
            return PassOutcome::Done;
        }

        let old_pipe_of = pipe_of_sessions(&self.pipes.pipes_with_role(PipeRole::Input));
        let mut need_update_active = true;
        for stream in &mut streams {
            stream.old_device_descs = std::mem::take(&mut stream.new_device_descs);
            let device = self
                .router
                .fetch_input_device(stream.capturer_info.source_type, stream.real_uid());
            debug!(session_id = stream.session_id, device = %device, "input device fetched");
            stream.new_device_descs = vec![device.clone()];
            self.update_record_stream_flag(stream);
            if device.is_none() {
                stream.keep_old_devices();
                continue;
            }
            if stream.is_started() && self.handle_device_change_for_fetch_input_device(stream) == SwitchDecision::NeedNotSwitch {
                continue;
            }

            if let Activation::Refetch { mac } = self.activate_input_device(stream).await {
                return PassOutcome::Refetch { mac };
            }
            if need_update_active {
                need_update_active = false;
                if self.update_input_device(&device, stream.real_uid()) {
                    self.emit(CoreEvent::PreferredInputDeviceUpdated {
                        device: device.to_info(),
                    });
                }
            }
        }

        let offload = self.registry.a2dp_offload_state();
        let rerouted: HashSet<u32> = streams
            .iter()
            .filter(|s| !s.devices_unchanged(offload))
            .map(|s| s.session_id)
            .collect();
        let current = self.pipes.pipes_with_role(PipeRole::Input);
        let pipes = self.selector.fetch_pipes(current, &mut streams, &rerouted);
        let pipes = self.execute_pipes(PipeRole::Input, pipes, &old_pipe_of, reason).await;
        self.pipes.update_capturer_pipe_infos(pipes);
        self.remove_unused_pipes().await;
        PassOutcome::Done
    }

    /// Decides whether a running capturer switches device; refreshes the
    /// current input device when it stays.
    pub(crate) fn handle_device_change_for_fetch_input_device(&self, stream: &StreamDescriptor) -> SwitchDecision {
        if stream.old_device_descs.is_empty() {
            return SwitchDecision::Switch;
        }
        let Some(device) = stream.first_new_device() else {
            return SwitchDecision::NeedNotSwitch;
        };
        let offload = self.registry.a2dp_offload_state();
        if stream.devices_unchanged(offload) && device.connect_state != ConnectState::DeactiveConnected {
            let current = self.active.current_input_device();
            if !device.is_same_device(&current, offload) {
                self.active.set_current_input_device(device);
                self.emit(CoreEvent::PreferredInputDeviceUpdated {
                    device: device.to_info(),
                });
            }
            return SwitchDecision::NeedNotSwitch;
        }
        SwitchDecision::Switch
    }

    /// Makes `device` the current input device if it changed, honoring the
    /// application's pinned input device.
    pub(crate) fn update_input_device(&self, device: &DeviceDescriptor, uid: i32) -> bool {
        if device.is_none() {
            return false;
        }
        let changed = !device.is_same_device_info(&self.active.current_input_device());
        let update = match self.registry.capturer_affinity(uid) {
            Some(pinned) => changed && device.device_type != pinned.device_type,
            None => changed,
        };
        if update {
            self.active.set_current_input_device(device);
        }
        update
    }

    /// Moves a capturer to the device it was fetched for.
    pub(crate) async fn move_to_new_input_device(
        &self,
        stream: &StreamDescriptor,
        pipe: &PipeInfo,
        reason: DeviceChangeReason,
    ) -> Result<(), RouteError> {
        let Some(device) = stream.first_new_device() else {
            return Err(RouteError::invalid_param(format!("session {} has no device", stream.session_id)));
        };
        info!(session_id = stream.session_id, device = %device, pipe = %pipe.name, "move to new input device");
        if let Some(old) = stream.first_old_device() {
            self.emit(CoreEvent::DeviceChanged {
                session_id: stream.session_id,
                pid: stream.app_info.pid,
                old_device: old.clone(),
                new_device: device.clone(),
                reason,
            });
        }

        if !device.is_local() {
            if let Err(e) = self
                .hdi
                .check_remote_device_state(&device.network_id, DeviceRole::Input, true)
                .await
            {
                warn!(network_id = %device.network_id, error = %e, "remote input device unreachable");
                return Err(RouteError::operation_failed(format!(
                    "remote device {} state check: {e}",
                    device.network_id
                )));
            }
        }
        self.hdi
            .move_source_output(stream.session_id, pipe.pa_index, &pipe.name)
            .await
            .map_err(|e| RouteError::MoveFailed {
                session_id: stream.session_id,
                port: pipe.name.clone(),
                reason: e.to_string(),
            })?;

        if self.config.update_route_supported && device.is_local() {
            if let Err(e) = self.active.update_active_device_route(device, DeviceRole::Input).await {
                warn!(device = %device, error = %e, "input route failed");
            }
        }
        self.collector.update_capturer_device_info(stream.session_id, device).await;
        Ok(())
    }

    /// With no input streams, only the current input device follows the
    /// microphone route, or the recognition route while SCO recognition runs.
    async fn fetch_input_device_for_no_running_stream(&self) {
        let current = self.active.current_input_device();
        let source = if current.device_type == DeviceType::BluetoothSco && self.bluetooth.is_recognition_active() {
            SourceType::VoiceRecognition
        } else {
            SourceType::Mic
        };
        let device = self.router.fetch_input_device(source, -1);
        if device.is_none() || device.is_same_device(&current, self.registry.a2dp_offload_state()) {
            return;
        }
        self.active.set_current_input_device(&device);
        self.emit(CoreEvent::PreferredInputDeviceUpdated {
            device: device.to_info(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::mock::{BluetoothCall, HdiCall};
    use crate::stream::StreamInfo;

    fn input(device_type: DeviceType) -> DeviceDescriptor {
        DeviceDescriptor::new(device_type, DeviceRole::Input)
    }

    fn recorder(source: SourceType) -> StreamDescriptor {
        StreamDescriptor::capturer(source, StreamInfo::default()).with_app(20_030, 500)
    }

    #[tokio::test]
    async fn test_no_running_input_uses_mic() {
        let h = Harness::new();
        h.service
            .fetch_input_device_and_route(DeviceChangeReason::Unknown)
            .await
            .unwrap();
        assert_eq!(h.service.active_devices().current_input_device().device_type, DeviceType::Mic);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, CoreEvent::PreferredInputDeviceUpdated { device } if device.device_type == DeviceType::Mic)));
    }

    #[tokio::test]
    async fn test_running_capture_moves_to_headset() {
        let h = Harness::new();
        let created = h.service.create_capturer_client(recorder(SourceType::Mic)).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        h.service.on_device_connected(input(DeviceType::WiredHeadset)).await.unwrap();
        let calls = h.hdi.calls();
        assert!(calls.contains(&HdiCall::MoveSourceOutput {
            session_id: created.session_id,
            source: "wired_input".to_string(),
        }));
        assert!(calls.contains(&HdiCall::SetActiveDeviceRoute(DeviceType::WiredHeadset, DeviceRole::Input)));
        assert!(h
            .collector
            .capturer_updates()
            .contains(&(created.session_id, DeviceType::WiredHeadset)));
        assert!(h.service.pipe_manager().pipe_by_name("primary_input").is_none());
    }

    #[tokio::test]
    async fn test_recognition_over_sco() {
        let h = Harness::new();
        h.connect(
            input(DeviceType::BluetoothSco)
                .with_mac("bb:01")
                .with_connect_state(crate::device::ConnectState::DeactiveConnected),
        );
        let created = h
            .service
            .create_capturer_client(recorder(SourceType::VoiceRecognition))
            .await
            .unwrap();
        h.service.start_client(created.session_id).await.unwrap();
        h.service
            .fetch_input_device_and_route(DeviceChangeReason::Override)
            .await
            .unwrap();
        assert!(h.bluetooth.calls().contains(&BluetoothCall::HandleScoWithRecognition(true)));
        assert_eq!(h.service.active_devices().active_bt_in_mac(), "bb:01");
    }

    #[tokio::test]
    async fn test_stable_capture_need_not_switch() {
        let h = Harness::new();
        let created = h.service.create_capturer_client(recorder(SourceType::Mic)).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        h.hdi.clear_calls();
        h.service
            .fetch_input_device_and_route(DeviceChangeReason::Unknown)
            .await
            .unwrap();
        assert_eq!(h.hdi.count(|c| matches!(c, HdiCall::MoveSourceOutput { .. })), 0);
    }
}
