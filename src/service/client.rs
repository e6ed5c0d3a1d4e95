//! Client lifecycle: create, start, pause, stop, release.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::event::{CoreEvent, DeviceChangeReason};
use crate::pipe::PipeRole;
use crate::stream::{AudioMode, RouteFlag, SourceType, StreamDescriptor, StreamStatus, StreamUsage};
use crate::RouteError;

use super::bluetooth::Activation;
use super::AudioCoreService;

/// A stream accepted by the routing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedClient {
    /// Session id, allocated if the descriptor carried none.
    pub session_id: u32,
    /// Path class the stream was placed on.
    pub route_flag: RouteFlag,
}

impl AudioCoreService {
    /// Admits a renderer: picks its devices, activates Bluetooth peers,
    /// chooses its flag and places it in a pipe.
    ///
    /// If the pipe's port cannot be opened the client is still created; it
    /// is retried on the next fetch.
    ///
    /// # Errors
    ///
    /// - [`RouteError::NoDeviceAvailable`] if no output device fits
    /// - [`RouteError::OperationFailed`] if the A2DP peer cannot be activated
    /// - [`RouteError::RetryBudgetExhausted`] if hands-free peers keep failing
    pub async fn create_renderer_client(&self, mut desc: StreamDescriptor) -> Result<CreatedClient, RouteError> {
        let _gate = self.fetch_gate.lock().await;
        if desc.session_id == 0 {
            desc.session_id = self.session_ids.generate();
        }
        desc.audio_mode = AudioMode::Playback;
        desc.stream_status = StreamStatus::New;
        desc.start_time = self.next_start_time();
        let session_id = desc.session_id;
        let usage = desc.renderer_info.usage;
        info!(session_id, ?usage, uid = desc.real_uid(), "create renderer client");

        if usage == StreamUsage::VoiceModemCommunication {
            desc.new_device_descs = self.router.fetch_output_devices(usage, desc.real_uid());
            desc.route_flag = RouteFlag::NORMAL;
            self.record_owner(&desc);
            self.pipes.add_modem_communication(desc);
            return Ok(CreatedClient {
                session_id,
                route_flag: RouteFlag::NORMAL,
            });
        }

        let mut tried = HashSet::new();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            desc.new_device_descs = self.router.fetch_output_devices(usage, desc.real_uid());
            match self.activate_output_device(&desc).await {
                Ok(Activation::Ready) => break,
                Ok(Activation::Refetch { mac }) => self.check_retry(&mut tried, attempts, mac)?,
                Err(RouteError::A2dpActivationFailed { mac, reason }) => {
                    return Err(RouteError::operation_failed(format!(
                        "activate a2dp device {mac}: {reason}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        if desc.first_new_device().map_or(true, |d| d.is_none()) {
            warn!(session_id, ?usage, "no output device for renderer");
            return Err(RouteError::NoDeviceAvailable { session_id });
        }

        self.update_playback_stream_flag(&mut desc);
        let current = self.pipes.pipes_with_role(PipeRole::Output);
        let pipes = self.selector.fetch_pipe(current, &mut desc);
        let pipes = self
            .execute_pipes(PipeRole::Output, pipes, &HashMap::new(), DeviceChangeReason::Unknown)
            .await;
        self.pipes.update_renderer_pipe_infos(pipes);

        let route_flag = self
            .pipes
            .stream_desc_by_id(session_id)
            .map_or(desc.route_flag, |s| s.route_flag);
        self.record_owner(&desc);
        debug!(session_id, ?route_flag, "renderer client created");
        Ok(CreatedClient { session_id, route_flag })
    }

    /// Admits a capturer.
    ///
    /// Playback captures read the internal mix and never occupy a pipe.
    ///
    /// # Errors
    ///
    /// - [`RouteError::NoDeviceAvailable`] if no input device fits
    /// - [`RouteError::RetryBudgetExhausted`] if hands-free peers keep failing
    pub async fn create_capturer_client(&self, mut desc: StreamDescriptor) -> Result<CreatedClient, RouteError> {
        let _gate = self.fetch_gate.lock().await;
        if desc.session_id == 0 {
            desc.session_id = self.session_ids.generate();
        }
        desc.audio_mode = AudioMode::Record;
        desc.stream_status = StreamStatus::New;
        desc.start_time = self.next_start_time();
        let session_id = desc.session_id;
        let source = desc.capturer_info.source_type;
        info!(session_id, ?source, uid = desc.real_uid(), "create capturer client");

        if source == SourceType::PlaybackCapture {
            desc.new_device_descs = vec![self.router.fetch_input_device(source, desc.real_uid())];
            desc.route_flag = RouteFlag::NORMAL;
            self.record_owner(&desc);
            self.state.lock().playback_captures.insert(session_id, desc);
            return Ok(CreatedClient {
                session_id,
                route_flag: RouteFlag::NORMAL,
            });
        }

        let mut tried = HashSet::new();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            desc.new_device_descs = vec![self.router.fetch_input_device(source, desc.real_uid())];
            match self.activate_input_device(&desc).await {
                Activation::Ready => break,
                Activation::Refetch { mac } => self.check_retry(&mut tried, attempts, mac)?,
            }
        }
        if desc.first_new_device().map_or(true, |d| d.is_none()) {
            warn!(session_id, ?source, "no input device for capturer");
            return Err(RouteError::NoDeviceAvailable { session_id });
        }

        self.update_record_stream_flag(&mut desc);
        let current = self.pipes.pipes_with_role(PipeRole::Input);
        let pipes = self.selector.fetch_pipe(current, &mut desc);
        let pipes = self
            .execute_pipes(PipeRole::Input, pipes, &HashMap::new(), DeviceChangeReason::Unknown)
            .await;
        self.pipes.update_capturer_pipe_infos(pipes);

        let route_flag = self
            .pipes
            .stream_desc_by_id(session_id)
            .map_or(desc.route_flag, |s| s.route_flag);
        self.record_owner(&desc);
        Ok(CreatedClient { session_id, route_flag })
    }

    /// Marks a client started and brings its device up.
    ///
    /// # Errors
    ///
    /// [`RouteError::SessionNotFound`] for an unknown session, or the error
    /// of activating its A2DP peer.
    pub async fn start_client(&self, session_id: u32) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        if self.pipes.is_modem_session(session_id) {
            debug!(session_id, "start modem session");
            return Ok(());
        }
        if let Some(capture) = self.state.lock().playback_captures.get_mut(&session_id) {
            capture.stream_status = StreamStatus::Started;
            return Ok(());
        }
        if !self.pipes.update_client_status(session_id, StreamStatus::Started) {
            return Err(RouteError::SessionNotFound { session_id });
        }
        self.pipes.update_start_time(session_id, self.next_start_time());
        let Some(desc) = self.pipes.stream_desc_by_id(session_id) else {
            return Err(RouteError::SessionNotFound { session_id });
        };
        let Some(device) = desc.first_new_device().filter(|d| !d.is_none()).cloned() else {
            debug!(session_id, "started client has no device yet");
            return Ok(());
        };
        info!(session_id, device = %device, "start client");

        if desc.is_playback() {
            if let Activation::Refetch { .. } = self.activate_output_device(&desc).await? {
                return self
                    .run_fetch_epoch(PipeRole::Output, DeviceChangeReason::Unknown)
                    .await;
            }
            let current = self.active.current_output_device();
            if !device.is_same_device(&current, self.registry.a2dp_offload_state()) {
                self.active.set_current_output_device(&device);
                self.apply_switch_volume(&device).await;
                self.emit(CoreEvent::PreferredOutputDeviceUpdated {
                    device: device.to_info(),
                });
            }
            if self.config.update_route_supported {
                self.update_output_route(&desc).await;
            }
            self.collector.update_renderer_device_info(session_id, &device).await;
        } else {
            if let Activation::Refetch { .. } = self.activate_input_device(&desc).await {
                return self
                    .run_fetch_epoch(PipeRole::Input, DeviceChangeReason::Unknown)
                    .await;
            }
            let current = self.active.current_input_device();
            if !device.is_same_device(&current, self.registry.a2dp_offload_state()) {
                self.active.set_current_input_device(&device);
                self.emit(CoreEvent::PreferredInputDeviceUpdated {
                    device: device.to_info(),
                });
            }
            if self.config.update_route_supported && device.is_local() {
                if let Err(e) = self
                    .active
                    .update_active_device_route(&device, crate::device::DeviceRole::Input)
                    .await
                {
                    warn!(session_id, device = %device, error = %e, "input route failed");
                }
            }
            self.collector.update_capturer_device_info(session_id, &device).await;
        }
        Ok(())
    }

    /// Marks a client paused.
    ///
    /// # Errors
    ///
    /// [`RouteError::SessionNotFound`] for an unknown session.
    pub async fn pause_client(&self, session_id: u32) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.set_client_status(session_id, StreamStatus::Paused)
    }

    /// Marks a client stopped.
    ///
    /// # Errors
    ///
    /// [`RouteError::SessionNotFound`] for an unknown session.
    pub async fn stop_client(&self, session_id: u32) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.set_client_status(session_id, StreamStatus::Stopped)
    }

    /// Removes a client, closing pipes it leaves empty.
    ///
    /// # Errors
    ///
    /// [`RouteError::SessionNotFound`] for an unknown session.
    pub async fn release_client(&self, session_id: u32) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.release_client_locked(session_id).await
    }

    async fn release_client_locked(&self, session_id: u32) -> Result<(), RouteError> {
        let removed = if self.pipes.remove_modem_communication(session_id).is_some() {
            true
        } else {
            self.state.lock().playback_captures.remove(&session_id).is_some()
        };
        if !removed {
            let Some(desc) = self.pipes.remove_client(session_id) else {
                return Err(RouteError::SessionNotFound { session_id });
            };
            self.release_recognition_sco(&desc).await;
            if self.dual_tone_session() == Some(session_id) {
                self.update_dual_tone_state(false, session_id).await;
            }
            self.remove_unused_pipes().await;
        }
        self.state.lock().session_owners.remove(&session_id);
        info!(session_id, "client released");
        Ok(())
    }

    /// Applies a lifecycle change reported by the stream service and
    /// re-routes what it affects.
    ///
    /// A renderer going quiet re-fetches output so the remaining streams
    /// settle; a released capturer re-fetches input. A recognition
    /// capturer that stops or is released drops its SCO link.
    ///
    /// # Errors
    ///
    /// [`RouteError::SessionNotFound`] for an unknown session, or the error
    /// of the triggered fetch.
    pub async fn update_tracker(
        &self,
        mode: AudioMode,
        session_id: u32,
        status: StreamStatus,
    ) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        debug!(?mode, session_id, ?status, "update tracker");
        self.set_client_status(session_id, status)?;

        if matches!(status, StreamStatus::Stopped | StreamStatus::Released)
            && self.dual_tone_session() == Some(session_id)
        {
            self.update_dual_tone_state(false, session_id).await;
        }
        if status == StreamStatus::Released {
            self.release_client_locked(session_id).await?;
        } else if (mode, status) == (AudioMode::Record, StreamStatus::Stopped) {
            if let Some(desc) = self.pipes.stream_desc_by_id(session_id) {
                self.release_recognition_sco(&desc).await;
            }
        }

        match (mode, status) {
            (AudioMode::Playback, StreamStatus::Stopped | StreamStatus::Paused | StreamStatus::Released) => {
                self.run_fetch_epoch(PipeRole::Output, DeviceChangeReason::Unknown).await
            }
            (AudioMode::Record, StreamStatus::Released) => {
                self.run_fetch_epoch(PipeRole::Input, DeviceChangeReason::Unknown).await
            }
            _ => Ok(()),
        }
    }

    /// Releases every session a dead client process owned and re-routes.
    ///
    /// # Errors
    ///
    /// The error of the re-route.
    pub async fn on_client_died(&self, uid: i32) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        let mut owned: Vec<u32> = self
            .state
            .lock()
            .session_owners
            .iter()
            .filter(|(_, owner)| **owner == uid)
            .map(|(session_id, _)| *session_id)
            .collect();
        owned.sort_unstable();
        info!(uid, sessions = owned.len(), "client died");
        for session_id in owned {
            if let Err(e) = self.release_client_locked(session_id).await {
                warn!(uid, session_id, error = %e, "release of dead client's session failed");
            }
        }
        self.trigger_fetch_locked(DeviceChangeReason::Unknown).await
    }

    /// Returns `true` if `session_id` was created by `uid`.
    pub fn is_stream_belong_to_uid(&self, uid: i32, session_id: u32) -> bool {
        self.state.lock().session_owners.get(&session_id) == Some(&uid)
    }

    fn set_client_status(&self, session_id: u32, status: StreamStatus) -> Result<(), RouteError> {
        if self.pipes.is_modem_session(session_id) {
            return Ok(());
        }
        if let Some(capture) = self.state.lock().playback_captures.get_mut(&session_id) {
            capture.stream_status = status;
            return Ok(());
        }
        if self.pipes.update_client_status(session_id, status) {
            Ok(())
        } else {
            Err(RouteError::SessionNotFound { session_id })
        }
    }

    /// Streams created on behalf of the MCU are not tracked per owner.
    fn record_owner(&self, desc: &StreamDescriptor) {
        if desc.caller_uid == self.config.mcu_uid {
            return;
        }
        self.state
            .lock()
            .session_owners
            .insert(desc.session_id, desc.real_uid());
    }
}
