//! Fetch epochs and pipe execution.
//!
//! A fetch epoch runs passes until no Bluetooth activation asks for another
//! one. Each pass ends by executing the pipe list the selector produced:
//! new ports are opened first, then every changed pipe's streams are moved,
//! recreated or left alone. One stream's failure never stops the batch.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::config::REMOTE_ADAPTER_PREFIX;
use crate::event::{CoreEvent, DeviceChangeReason};
use crate::pipe::{PipeAction, PipeInfo, PipeRole};
use crate::stream::{StreamAction, StreamDescriptor};
use crate::RouteError;

use super::AudioCoreService;

/// Result of one fetch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PassOutcome {
    /// Routing is settled.
    Done,
    /// A device with this address failed to activate and was excluded.
    Refetch {
        /// Address of the failed peer.
        mac: String,
    },
}

impl AudioCoreService {
    /// Runs fetch passes for one role until routing settles.
    ///
    /// Each failing Bluetooth peer may cause one more pass. The epoch gives
    /// up when a peer fails twice or the pass count exceeds
    /// `max_fetch_retries`.
    pub(crate) async fn run_fetch_epoch(&self, role: PipeRole, reason: DeviceChangeReason) -> Result<(), RouteError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            info!(
                ?role,
                ?reason,
                attempts,
                streams = self.pipes.stream_count(),
                devices = self.registry.connected_devices().len(),
                "fetch start"
            );
            let outcome = match role {
                PipeRole::Output => self.fetch_output_pass(reason).await,
                PipeRole::Input => self.fetch_input_pass(reason).await,
            };
            self.unmute_switched_sinks().await;

            match outcome {
                PassOutcome::Done => return Ok(()),
                PassOutcome::Refetch { mac } => self.check_retry(&mut tried, attempts, mac)?,
            }
        }
    }

    /// Allows another pass after `mac` failed, unless it failed before in
    /// this epoch or the pass budget is spent.
    pub(crate) fn check_retry(&self, tried: &mut HashSet<String>, attempts: u32, mac: String) -> Result<(), RouteError> {
        if tried.contains(&mac) || attempts > self.config.max_fetch_retries {
            error!(mac = %mac, attempts, "fetch retry budget exhausted");
            return Err(RouteError::RetryBudgetExhausted { attempts });
        }
        info!(mac = %mac, "device excluded, fetching again");
        tried.insert(mac);
        Ok(())
    }

    /// Mutes a sink whose streams are about to switch device.
    pub(crate) async fn mute_sink_for_switch(&self, sink: &str) {
        if self.state.lock().muted_sinks.iter().any(|s| s == sink) {
            return;
        }
        debug!(sink, "mute for device switch");
        if let Err(e) = self.hdi.set_sink_mute(sink, true).await {
            warn!(sink, error = %e, "mute for device switch failed");
            return;
        }
        self.active.gate().arm();
        self.state.lock().muted_sinks.push(sink.to_string());
    }

    /// Unmutes every sink muted during the pass, all at once.
    async fn unmute_switched_sinks(&self) {
        let sinks = std::mem::take(&mut self.state.lock().muted_sinks);
        let unmutes = sinks.iter().map(|sink| async move {
            if let Err(e) = self.hdi.set_sink_mute(sink, false).await {
                warn!(sink = %sink, error = %e, "unmute after device switch failed");
            }
        });
        futures::future::join_all(unmutes).await;
    }

    /// Opens the port of a new pipe, adopting a parked offload port by name.
    pub(crate) async fn open_pipe(&self, pipe: &mut PipeInfo) -> Result<(), RouteError> {
        if let Some(port) = self.offload.adopt(&pipe.name) {
            info!(pipe = %pipe.name, id = port.id, "adopt parked port");
            pipe.id = port.id;
            pipe.pa_index = port.pa_index;
            return Ok(());
        }
        if pipe.adapter_name.starts_with(REMOTE_ADAPTER_PREFIX) && !self.config.remote_open_enabled {
            return Err(RouteError::invalid_param(format!(
                "remote module {} is not loaded and may not be opened",
                pipe.name
            )));
        }
        let port = self
            .hdi
            .open_audio_port(pipe)
            .await
            .map_err(|e| RouteError::OpenPortFailed {
                pipe: pipe.name.clone(),
                reason: e.to_string(),
            })?;
        info!(pipe = %pipe.name, id = port.id, pa_index = port.pa_index, "open pipe");
        pipe.id = port.id;
        pipe.pa_index = port.pa_index;
        Ok(())
    }

    /// Executes the selector's decisions for one role.
    ///
    /// `old_pipe_of` maps each session to the pipe it sat in before the
    /// pass; failed streams go back there. Returns the pipe list to store.
    pub(crate) async fn execute_pipes(
        &self,
        role: PipeRole,
        mut pipes: Vec<PipeInfo>,
        old_pipe_of: &HashMap<u32, String>,
        reason: DeviceChangeReason,
    ) -> Vec<PipeInfo> {
        for i in 0..pipes.len() {
            if pipes[i].action != PipeAction::New {
                continue;
            }
            if let Err(e) = self.open_pipe(&mut pipes[i]).await {
                error!(pipe = %pipes[i].name, error = %e, "open pipe failed");
                self.abandon_pipe(&mut pipes, i, old_pipe_of, &e);
            }
        }

        let mut reverts: Vec<(usize, String, StreamDescriptor)> = Vec::new();
        for i in 0..pipes.len() {
            if pipes[i].action == PipeAction::Default {
                continue;
            }
            debug!(pipe = %pipes[i].name, action = ?pipes[i].action, "execute pipe");
            let streams = std::mem::take(&mut pipes[i].streams);
            let mut kept = Vec::with_capacity(streams.len());
            for mut stream in streams {
                let result = match role {
                    PipeRole::Output => self.execute_output_stream(&stream, &pipes[i], reason).await,
                    PipeRole::Input => self.execute_input_stream(&stream, &pipes[i], reason).await,
                };
                let Err(e) = result else {
                    kept.push(stream);
                    continue;
                };
                warn!(session_id = stream.session_id, pipe = %pipes[i].name, error = %e, "stream action failed");
                self.emit(CoreEvent::StreamMoveFailed {
                    session_id: stream.session_id,
                    error: e.to_string(),
                });
                stream.keep_old_devices();
                match old_pipe_of.get(&stream.session_id) {
                    Some(old) if *old != pipes[i].name => reverts.push((i, old.clone(), stream)),
                    _ => kept.push(stream),
                }
            }
            pipes[i].streams = kept;
        }

        for (failed_in, old, mut stream) in reverts {
            stream.stream_action = StreamAction::Default;
            match pipes.iter_mut().find(|p| p.name == old) {
                Some(pipe) => {
                    stream.route_flag = pipe.route_flag;
                    debug!(session_id = stream.session_id, pipe = %pipe.name, "stream stays in old pipe");
                    pipe.streams.push(stream);
                }
                None => pipes[failed_in].streams.push(stream),
            }
        }
        pipes
    }

    /// Handles a pipe whose port did not open.
    ///
    /// Streams that sat in another pipe go back there with their old
    /// devices. Streams never routed stay in the unopened pipe with no
    /// device, so the next fetch places them again.
    fn abandon_pipe(&self, pipes: &mut [PipeInfo], index: usize, old_pipe_of: &HashMap<u32, String>, err: &RouteError) {
        let name = pipes[index].name.clone();
        pipes[index].action = PipeAction::Default;
        let streams = std::mem::take(&mut pipes[index].streams);
        self.emit(CoreEvent::PipeOpenFailed {
            pipe: name.clone(),
            sessions: streams.iter().map(|s| s.session_id).collect(),
            error: err.to_string(),
        });

        let mut stay = Vec::new();
        for mut stream in streams {
            stream.stream_action = StreamAction::Default;
            let target = old_pipe_of
                .get(&stream.session_id)
                .filter(|old| **old != name)
                .and_then(|old| pipes.iter().position(|p| p.name == *old));
            match target {
                Some(t) => {
                    stream.keep_old_devices();
                    stream.route_flag = pipes[t].route_flag;
                    pipes[t].streams.push(stream);
                }
                None => {
                    stream.new_device_descs.clear();
                    stay.push(stream);
                }
            }
        }
        pipes[index].streams = stay;
    }

    async fn execute_output_stream(
        &self,
        stream: &StreamDescriptor,
        pipe: &PipeInfo,
        reason: DeviceChangeReason,
    ) -> Result<(), RouteError> {
        match stream.stream_action {
            StreamAction::New => {
                debug!(session_id = stream.session_id, pipe = %pipe.name, "stream joins pipe");
                Ok(())
            }
            StreamAction::Move if stream.is_started() => self.move_to_new_output_device(stream, pipe, reason).await,
            StreamAction::Move => self.move_stream_sink(stream, pipe).await,
            StreamAction::Recreate => {
                self.request_recreate(stream, reason);
                Ok(())
            }
            StreamAction::Default => Ok(()),
        }
    }

    async fn execute_input_stream(
        &self,
        stream: &StreamDescriptor,
        pipe: &PipeInfo,
        reason: DeviceChangeReason,
    ) -> Result<(), RouteError> {
        match stream.stream_action {
            StreamAction::New => {
                debug!(session_id = stream.session_id, pipe = %pipe.name, "stream joins pipe");
                Ok(())
            }
            StreamAction::Move => self.move_to_new_input_device(stream, pipe, reason).await,
            StreamAction::Recreate => {
                self.request_recreate(stream, reason);
                Ok(())
            }
            StreamAction::Default => Ok(()),
        }
    }

    fn request_recreate(&self, stream: &StreamDescriptor, reason: DeviceChangeReason) {
        info!(session_id = stream.session_id, flag = %stream.route_flag, "stream must be recreated");
        self.emit(CoreEvent::StreamRecreateRequired {
            session_id: stream.session_id,
            pid: stream.app_info.pid,
            mode: stream.audio_mode,
            route_flag: stream.route_flag,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{music, out, Harness};
    use super::*;
    use crate::config::CoreConfig;
    use crate::device::{DeviceRole, DeviceType};
    use crate::mock::HdiCall;
    use crate::pipe::A2DP_OUTPUT;

    #[tokio::test]
    async fn test_open_failure_keeps_stream_in_old_pipe() {
        let h = Harness::new();
        let created = h.service.create_renderer_client(music()).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        h.hdi.fail_open(A2DP_OUTPUT);
        h.service
            .on_device_connected(out(DeviceType::BluetoothA2dp).with_mac("aa:01"))
            .await
            .unwrap();

        let pipes = h.service.pipe_manager().pipes_with_role(PipeRole::Output);
        assert_eq!(pipes.len(), 1);
        assert_eq!(pipes[0].name, "primary_output");
        let stream = &pipes[0].streams[0];
        assert_eq!(stream.first_new_device().unwrap().device_type, DeviceType::Speaker);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, CoreEvent::PipeOpenFailed { pipe, .. } if pipe == A2DP_OUTPUT)));
    }

    #[tokio::test]
    async fn test_open_failure_on_create_leaves_stream_unrouted() {
        let h = Harness::new();
        h.hdi.fail_open("primary_output");
        let created = h.service.create_renderer_client(music()).await.unwrap();

        let stream = h.service.pipe_manager().stream_desc_by_id(created.session_id).unwrap();
        assert!(stream.new_device_descs.is_empty());

        // retried on the next fetch
        h.hdi.allow_open("primary_output");
        h.service
            .fetch_output_device_and_route(DeviceChangeReason::Unknown)
            .await
            .unwrap();
        let pipe = h.service.pipe_manager().pipe_by_name("primary_output").unwrap();
        assert!(pipe.is_open());
        assert!(pipe.contains_session(created.session_id));
    }

    #[tokio::test]
    async fn test_remote_open_disabled() {
        let config = CoreConfig {
            remote_open_enabled: false,
            ..CoreConfig::default()
        };
        let h = Harness::with_config(config);
        let remote = out(DeviceType::Speaker).with_network_id("node-7");
        h.connect(remote.clone());
        h.registry.set_renderer_affinity(20_010, Some(remote));

        h.service.create_renderer_client(music()).await.unwrap();
        assert_eq!(h.hdi.count(|c| matches!(c, HdiCall::OpenAudioPort(_))), 0);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, CoreEvent::PipeOpenFailed { error, .. } if error.contains("invalid parameter"))));
    }

    #[tokio::test]
    async fn test_move_failure_is_isolated() {
        let h = Harness::new();
        let a = h.service.create_renderer_client(music()).await.unwrap();
        let b = h.service.create_renderer_client(music()).await.unwrap();
        h.service.start_client(a.session_id).await.unwrap();
        h.service.start_client(b.session_id).await.unwrap();

        h.hdi.fail_move(a.session_id);
        h.service.on_device_connected(out(DeviceType::WiredHeadset)).await.unwrap();

        let manager = h.service.pipe_manager();
        let wired = manager.pipe_by_name("wired_output").unwrap();
        assert!(wired.contains_session(b.session_id));
        assert!(!wired.contains_session(a.session_id));
        let primary = manager.pipe_by_name("primary_output").unwrap();
        assert!(primary.contains_session(a.session_id));
        assert_eq!(
            manager.stream_desc_by_id(a.session_id).unwrap().new_device_descs[0].device_type,
            DeviceType::Speaker
        );
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, CoreEvent::StreamMoveFailed { session_id, .. } if *session_id == a.session_id)));
    }

    #[tokio::test]
    async fn test_started_switch_mutes_then_unmutes() {
        let h = Harness::new();
        let created = h.service.create_renderer_client(music()).await.unwrap();
        h.service.start_client(created.session_id).await.unwrap();

        h.service.on_device_connected(out(DeviceType::WiredHeadset)).await.unwrap();
        let calls = h.hdi.calls();
        let mute = calls
            .iter()
            .position(|c| *c == HdiCall::SetSinkMute("primary_output".to_string(), true))
            .unwrap();
        let unmute = calls
            .iter()
            .position(|c| *c == HdiCall::SetSinkMute("primary_output".to_string(), false))
            .unwrap();
        assert!(mute < unmute);
        assert!(calls.contains(&HdiCall::SetActiveDeviceRoute(DeviceType::WiredHeadset, DeviceRole::Output)));
    }
}
