//! In-memory collaborators for testing without hardware.
//!
//! Each mock records the calls it receives and can be told to fail
//! specific operations, so the whole fetch-and-route flow can run in CI.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::device::{DeviceDescriptor, DeviceRole, DeviceType};
use crate::facade::{A2dpStreamInfo, AudioRoute, BluetoothFacade, HdiAdapter, StreamCollector};
use crate::pipe::{PipeInfo, PortHandle};
use crate::scene::AudioScene;
use crate::stream::SampleFormat;
use crate::FacadeError;

/// A call received by [`MockHdiAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HdiCall {
    OpenAudioPort(String),
    CloseAudioPort(u32),
    ReloadAudioPort(String),
    MoveSinkInput { session_id: u32, sink: String },
    MoveSourceOutput { session_id: u32, source: String },
    SetActiveDeviceRoute(DeviceType, DeviceRole),
    UpdateAudioRoute(Vec<DeviceType>),
    CheckRemoteDeviceState(String),
    SetSinkMute(String, bool),
    UpdateEffectDefaultSink(DeviceType),
    SetVolumeForSwitchDevice(DeviceType),
    UpdateDualToneState(bool, u32),
}

/// Recording HAL and audio server.
///
/// Port ids are handed out sequentially from 1.
///
/// # Example
///
/// ```
/// use audio_route_core::mock::{HdiCall, MockHdiAdapter};
///
/// let hdi = MockHdiAdapter::new();
/// hdi.fail_open("a2dp_output");
/// assert!(hdi.calls().is_empty());
/// ```
#[derive(Debug)]
pub struct MockHdiAdapter {
    calls: Mutex<Vec<HdiCall>>,
    next_id: AtomicU32,
    failing_opens: Mutex<HashSet<String>>,
    failing_moves: Mutex<HashSet<u32>>,
    remote_reachable: AtomicBool,
}

impl MockHdiAdapter {
    /// Creates a mock where every call succeeds.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            failing_opens: Mutex::new(HashSet::new()),
            failing_moves: Mutex::new(HashSet::new()),
            remote_reachable: AtomicBool::new(true),
        }
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<HdiCall> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&HdiCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Makes opening the named port fail.
    pub fn fail_open(&self, name: &str) {
        self.failing_opens.lock().insert(name.to_string());
    }

    /// Lets the named port open again.
    pub fn allow_open(&self, name: &str) {
        self.failing_opens.lock().remove(name);
    }

    /// Makes moving the session fail.
    pub fn fail_move(&self, session_id: u32) {
        self.failing_moves.lock().insert(session_id);
    }

    /// Sets whether remote device checks succeed.
    pub fn set_remote_reachable(&self, reachable: bool) {
        self.remote_reachable.store(reachable, Ordering::SeqCst);
    }

    fn record(&self, call: HdiCall) {
        self.calls.lock().push(call);
    }

    fn next_port(&self) -> PortHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        PortHandle { id, pa_index: id + 1000 }
    }

    fn check_move(&self, session_id: u32) -> Result<(), FacadeError> {
        if self.failing_moves.lock().contains(&session_id) {
            return Err(FacadeError::failed("move", format!("session {session_id} refused")));
        }
        Ok(())
    }
}

impl Default for MockHdiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HdiAdapter for MockHdiAdapter {
    async fn open_audio_port(&self, pipe: &PipeInfo) -> Result<PortHandle, FacadeError> {
        self.record(HdiCall::OpenAudioPort(pipe.name.clone()));
        if self.failing_opens.lock().contains(&pipe.name) {
            return Err(FacadeError::failed("open_audio_port", format!("{} unavailable", pipe.name)));
        }
        Ok(self.next_port())
    }

    async fn close_audio_port(&self, port: PortHandle) -> Result<(), FacadeError> {
        self.record(HdiCall::CloseAudioPort(port.id));
        Ok(())
    }

    async fn reload_audio_port(&self, _port: PortHandle, pipe: &PipeInfo) -> Result<PortHandle, FacadeError> {
        self.record(HdiCall::ReloadAudioPort(pipe.name.clone()));
        Ok(self.next_port())
    }

    async fn move_sink_input(&self, session_id: u32, _pa_index: u32, sink_name: &str) -> Result<(), FacadeError> {
        self.record(HdiCall::MoveSinkInput {
            session_id,
            sink: sink_name.to_string(),
        });
        self.check_move(session_id)
    }

    async fn move_source_output(
        &self,
        session_id: u32,
        _pa_index: u32,
        source_name: &str,
    ) -> Result<(), FacadeError> {
        self.record(HdiCall::MoveSourceOutput {
            session_id,
            source: source_name.to_string(),
        });
        self.check_move(session_id)
    }

    async fn set_active_device_route(&self, device: &DeviceDescriptor, role: DeviceRole) -> Result<(), FacadeError> {
        self.record(HdiCall::SetActiveDeviceRoute(device.device_type, role));
        Ok(())
    }

    async fn update_audio_route(&self, route: &AudioRoute) -> Result<(), FacadeError> {
        self.record(HdiCall::UpdateAudioRoute(
            route.devices.iter().map(|d| d.device_type).collect(),
        ));
        Ok(())
    }

    async fn check_remote_device_state(
        &self,
        network_id: &str,
        _role: DeviceRole,
        _connected: bool,
    ) -> Result<(), FacadeError> {
        self.record(HdiCall::CheckRemoteDeviceState(network_id.to_string()));
        if self.remote_reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FacadeError::not_connected(network_id))
        }
    }

    async fn set_sink_mute(&self, sink_name: &str, mute: bool) -> Result<(), FacadeError> {
        self.record(HdiCall::SetSinkMute(sink_name.to_string(), mute));
        Ok(())
    }

    async fn update_effect_default_sink(&self, device_type: DeviceType) -> Result<(), FacadeError> {
        self.record(HdiCall::UpdateEffectDefaultSink(device_type));
        Ok(())
    }

    async fn set_volume_for_switch_device(&self, device: &DeviceDescriptor) -> Result<(), FacadeError> {
        self.record(HdiCall::SetVolumeForSwitchDevice(device.device_type));
        Ok(())
    }

    async fn update_dual_tone_state(&self, enable: bool, session_id: u32) -> Result<(), FacadeError> {
        self.record(HdiCall::UpdateDualToneState(enable, session_id));
        Ok(())
    }
}

/// A call received by [`MockBluetooth`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BluetoothCall {
    SetActiveHfpDevice(String),
    ConnectScoWithAudioScene(AudioScene),
    SetActiveA2dpDevice(String),
    HandleScoWithRecognition(bool),
}

/// Recording Bluetooth stack.
#[derive(Debug, Default)]
pub struct MockBluetooth {
    calls: Mutex<Vec<BluetoothCall>>,
    failing_macs: Mutex<HashSet<String>>,
    stream_infos: Mutex<HashMap<String, A2dpStreamInfo>>,
    recognition_active: AtomicBool,
}

impl MockBluetooth {
    /// Creates a mock where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<BluetoothCall> {
        self.calls.lock().clone()
    }

    /// Makes activating the peer fail (hands-free and A2DP).
    pub fn fail_mac(&self, mac: &str) {
        self.failing_macs.lock().insert(mac.to_string());
    }

    /// Sets the stream parameters an A2DP peer reports.
    pub fn set_stream_info(&self, mac: &str, info: A2dpStreamInfo) {
        self.stream_infos.lock().insert(mac.to_string(), info);
    }

    /// Sets whether voice recognition holds the SCO link.
    pub fn set_recognition_active(&self, active: bool) {
        self.recognition_active.store(active, Ordering::SeqCst);
    }

    fn record(&self, call: BluetoothCall) {
        self.calls.lock().push(call);
    }

    fn check_mac(&self, mac: &str, operation: &str) -> Result<(), FacadeError> {
        if self.failing_macs.lock().contains(mac) {
            return Err(FacadeError::failed(operation, format!("{mac} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl BluetoothFacade for MockBluetooth {
    async fn set_active_hfp_device(&self, mac: &str) -> Result<(), FacadeError> {
        self.record(BluetoothCall::SetActiveHfpDevice(mac.to_string()));
        self.check_mac(mac, "set_active_hfp_device")
    }

    async fn connect_sco_with_audio_scene(&self, scene: AudioScene) -> Result<(), FacadeError> {
        self.record(BluetoothCall::ConnectScoWithAudioScene(scene));
        Ok(())
    }

    async fn set_active_a2dp_device(&self, mac: &str) -> Result<(), FacadeError> {
        self.record(BluetoothCall::SetActiveA2dpDevice(mac.to_string()));
        self.check_mac(mac, "set_active_a2dp_device")
    }

    async fn a2dp_stream_info(&self, mac: &str) -> Result<A2dpStreamInfo, FacadeError> {
        Ok(self.stream_infos.lock().get(mac).copied().unwrap_or(A2dpStreamInfo {
            sampling_rate: 48_000,
            format: SampleFormat::S16Le,
            channels: 2,
        }))
    }

    async fn handle_sco_with_recognition(&self, enable: bool, _device: &DeviceDescriptor) -> Result<(), FacadeError> {
        self.record(BluetoothCall::HandleScoWithRecognition(enable));
        Ok(())
    }

    fn is_recognition_active(&self) -> bool {
        self.recognition_active.load(Ordering::SeqCst)
    }
}

/// Recording stream collector.
#[derive(Debug, Default)]
pub struct MockStreamCollector {
    renderer_updates: Mutex<Vec<(u32, DeviceType)>>,
    capturer_updates: Mutex<Vec<(u32, DeviceType)>>,
}

impl MockStreamCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renderer device updates as `(session, device)` pairs.
    pub fn renderer_updates(&self) -> Vec<(u32, DeviceType)> {
        self.renderer_updates.lock().clone()
    }

    /// Capturer device updates as `(session, device)` pairs.
    pub fn capturer_updates(&self) -> Vec<(u32, DeviceType)> {
        self.capturer_updates.lock().clone()
    }
}

#[async_trait]
impl StreamCollector for MockStreamCollector {
    async fn update_renderer_device_info(&self, session_id: u32, device: &DeviceDescriptor) {
        self.renderer_updates.lock().push((session_id, device.device_type));
    }

    async fn update_capturer_device_info(&self, session_id: u32, device: &DeviceDescriptor) {
        self.capturer_updates.lock().push((session_id, device.device_type));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_bluetooth_failure_injection() {
        let bt = MockBluetooth::new();
        bt.fail_mac("aa");
        assert!(bt.set_active_hfp_device("aa").await.is_err());
        assert!(bt.set_active_hfp_device("bb").await.is_ok());
        assert_eq!(bt.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_hdi_remote_reachability() {
        let hdi = MockHdiAdapter::new();
        assert!(hdi.check_remote_device_state("n1", DeviceRole::Output, true).await.is_ok());
        hdi.set_remote_reachable(false);
        assert!(hdi.check_remote_device_state("n1", DeviceRole::Output, true).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_hdi_move_failure() {
        let hdi = MockHdiAdapter::new();
        hdi.fail_move(7);
        assert!(hdi.move_sink_input(7, 1, "primary_output").await.is_err());
        assert!(hdi.move_sink_input(8, 1, "primary_output").await.is_ok());
        assert_eq!(hdi.count(|c| matches!(c, HdiCall::MoveSinkInput { .. })), 2);
    }
}
