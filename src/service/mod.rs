//! The routing core.
//!
//! [`AudioCoreService`] owns the device registry, the pipe table and the
//! active device tracker, and drives the injected collaborators. Every entry
//! point that reads or changes routing state takes one async fetch gate for
//! its whole duration, so fetches never interleave. Internal helpers named
//! `*_locked` or called from those entry points never take the gate again.

mod bluetooth;
mod client;
mod dual_tone;
mod execute;
mod flags;
mod input;
mod offload;
mod output;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::device::{ActiveDeviceTracker, DeviceDescriptor, DeviceRegistry, DeviceRole, DeviceType, PreferredSlot};
use crate::event::{CoreEvent, DeviceChangeReason, EventCallback};
use crate::facade::{BluetoothFacade, HdiAdapter, StreamCollector};
use crate::pipe::{PipeManager, PipeRole, PipeSelector};
use crate::priming::RenderEmptyGate;
use crate::router::RouterCenter;
use crate::scene::{AudioScene, RingerMode};
use crate::stream::{SessionIdGenerator, StreamDescriptor, StreamUsage};
use crate::RouteError;

pub use client::CreatedClient;
pub use output::SwitchDecision;

use offload::OffloadState;

/// Mutable service state outside the pipe table and the registry.
#[derive(Debug, Default)]
struct ServiceState {
    scene: AudioScene,
    /// Scene before the last `set_audio_scene`; equal to `scene` otherwise.
    last_scene: AudioScene,
    ringer_mode: RingerMode,
    /// Session currently ringing on two devices.
    dual_tone_session: Option<u32>,
    /// Session id to creating uid.
    session_owners: HashMap<u32, i32>,
    /// Capturers reading the internal mix; they never occupy a pipe.
    playback_captures: HashMap<u32, StreamDescriptor>,
    /// Sinks muted while their streams switch device.
    muted_sinks: Vec<String>,
}

/// Fetch-and-route engine of the audio policy service.
///
/// Construct it once with [`AudioCoreService::new`] (or through
/// [`AudioCoreServiceBuilder`](crate::AudioCoreServiceBuilder)) and share it
/// behind an [`Arc`]. For strictly ordered processing from many callers, put
/// it behind a worker with [`spawn_core_worker`](crate::spawn_core_worker).
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_route_core::mock::{MockBluetooth, MockHdiAdapter, MockStreamCollector};
/// use audio_route_core::{AudioCoreService, CoreConfig, DeviceRegistry, StreamDescriptor, StreamInfo, StreamUsage};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), audio_route_core::RouteError> {
/// let service = AudioCoreService::new(
///     CoreConfig::default(),
///     Arc::new(DeviceRegistry::with_builtin_devices()),
///     Arc::new(MockHdiAdapter::new()),
///     Arc::new(MockBluetooth::new()),
///     Arc::new(MockStreamCollector::new()),
/// );
///
/// let desc = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_app(20_010, 300);
/// let created = service.create_renderer_client(desc).await?;
/// service.start_client(created.session_id).await?;
/// # Ok(())
/// # }
/// ```
pub struct AudioCoreService {
    config: CoreConfig,
    registry: Arc<DeviceRegistry>,
    router: RouterCenter,
    selector: PipeSelector,
    pipes: PipeManager,
    active: ActiveDeviceTracker,
    hdi: Arc<dyn HdiAdapter>,
    bluetooth: Arc<dyn BluetoothFacade>,
    collector: Arc<dyn StreamCollector>,
    session_ids: Arc<SessionIdGenerator>,
    event_callback: Option<EventCallback>,
    fetch_gate: Arc<AsyncMutex<()>>,
    state: Mutex<ServiceState>,
    offload: Arc<OffloadState>,
    clock: AtomicU64,
}

impl AudioCoreService {
    /// Creates a service over the given registry and collaborators.
    ///
    /// Session ids come from the process-wide [`SessionIdGenerator`].
    pub fn new(
        config: CoreConfig,
        registry: Arc<DeviceRegistry>,
        hdi: Arc<dyn HdiAdapter>,
        bluetooth: Arc<dyn BluetoothFacade>,
        collector: Arc<dyn StreamCollector>,
    ) -> Self {
        let router = RouterCenter::new(Arc::clone(&registry));
        let selector = PipeSelector::new(config.adapters.clone(), config.concurrency.clone());
        let active = ActiveDeviceTracker::new(
            Arc::clone(&hdi),
            Arc::new(RenderEmptyGate::new()),
            config.render_empty_wait,
        );
        Self {
            config,
            registry,
            router,
            selector,
            pipes: PipeManager::new(),
            active,
            hdi,
            bluetooth,
            collector,
            session_ids: SessionIdGenerator::shared(),
            event_callback: None,
            fetch_gate: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(ServiceState::default()),
            offload: Arc::new(OffloadState::default()),
            clock: AtomicU64::new(0),
        }
    }

    /// Sets the callback that receives [`CoreEvent`]s.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// Uses a private session id counter instead of the process-wide one.
    #[must_use]
    pub fn with_session_ids(mut self, session_ids: Arc<SessionIdGenerator>) -> Self {
        self.session_ids = session_ids;
        self
    }

    /// Configuration the service runs with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Connected devices and routing preferences.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Pipe table.
    pub fn pipe_manager(&self) -> &PipeManager {
        &self.pipes
    }

    /// Current devices.
    pub fn active_devices(&self) -> &ActiveDeviceTracker {
        &self.active
    }

    /// Device selection policy.
    pub fn router(&self) -> &RouterCenter {
        &self.router
    }

    /// Current audio scene.
    pub fn audio_scene(&self) -> AudioScene {
        self.state.lock().scene
    }

    /// Current ringer mode.
    pub fn ringer_mode(&self) -> RingerMode {
        self.state.lock().ringer_mode
    }

    /// Session that currently rings on two devices, if any.
    pub fn dual_tone_session(&self) -> Option<u32> {
        self.state.lock().dual_tone_session
    }

    /// Reports that a stream muted for a device switch has drained.
    pub fn on_render_frame_drained(&self) {
        self.active.gate().frame_drained();
    }

    /// Human readable snapshot of the routing state.
    pub fn dump(&self) -> String {
        let mut out = self.pipes.dump();
        let state = self.state.lock();
        let _ = writeln!(out, "scene: {:?}, ringer: {:?}", state.scene, state.ringer_mode);
        let _ = writeln!(out, "current output: {}", self.active.current_output_device());
        let _ = writeln!(out, "current input: {}", self.active.current_input_device());
        match state.dual_tone_session {
            Some(session_id) => {
                let _ = writeln!(out, "dual tone: session {session_id}");
            }
            None => {
                let _ = writeln!(out, "dual tone: off");
            }
        }
        out
    }

    /// Re-fetches devices and routes for every output and input stream.
    ///
    /// # Errors
    ///
    /// Returns the first error from the output or input fetch; both run.
    pub async fn trigger_fetch_device(&self, reason: DeviceChangeReason) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.trigger_fetch_locked(reason).await
    }

    async fn trigger_fetch_locked(&self, reason: DeviceChangeReason) -> Result<(), RouteError> {
        let output = self.run_fetch_epoch(PipeRole::Output, reason).await;
        let input = self.run_fetch_epoch(PipeRole::Input, reason).await;
        output.and(input)
    }

    /// Re-fetches devices and routes for every output stream.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::RetryBudgetExhausted`] if Bluetooth activation
    /// keeps failing.
    pub async fn fetch_output_device_and_route(&self, reason: DeviceChangeReason) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.run_fetch_epoch(PipeRole::Output, reason).await
    }

    /// Re-fetches devices and routes for every input stream.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::RetryBudgetExhausted`] if Bluetooth activation
    /// keeps failing.
    pub async fn fetch_input_device_and_route(&self, reason: DeviceChangeReason) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.run_fetch_epoch(PipeRole::Input, reason).await
    }

    /// Registers a newly connected device and re-routes.
    ///
    /// # Errors
    ///
    /// See [`trigger_fetch_device`](Self::trigger_fetch_device).
    pub async fn on_device_connected(&self, device: DeviceDescriptor) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        info!(device = %device, role = ?device.device_role, "device connected");
        self.registry.add_connected_device(device);
        self.trigger_fetch_locked(DeviceChangeReason::NewDeviceAvailable).await
    }

    /// Forgets a disconnected device and re-routes.
    ///
    /// # Errors
    ///
    /// See [`trigger_fetch_device`](Self::trigger_fetch_device).
    pub async fn on_device_disconnected(&self, device: &DeviceDescriptor) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        info!(device = %device, role = ?device.device_role, "device disconnected");
        if self.registry.remove_connected_device(device).is_none() {
            debug!(device = %device, "disconnected device was not registered");
        }
        if device.device_type == DeviceType::BluetoothA2dp && self.active.active_bt_mac() == device.mac_address {
            self.active.set_active_bt_mac("");
        }
        self.trigger_fetch_locked(DeviceChangeReason::OldDeviceUnavailable).await
    }

    /// Sets the user's preferred output device for a usage class and re-routes.
    ///
    /// Call usages share one preference; every other usage shares the media
    /// preference. `None` clears it.
    ///
    /// # Errors
    ///
    /// See [`fetch_output_device_and_route`](Self::fetch_output_device_and_route).
    pub async fn set_preferred_device(
        &self,
        usage: StreamUsage,
        device: Option<DeviceDescriptor>,
    ) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        let slot = if usage.is_call() {
            PreferredSlot::CallRender
        } else {
            PreferredSlot::MediaRender
        };
        self.registry.set_preferred(slot, device);
        self.run_fetch_epoch(PipeRole::Output, DeviceChangeReason::Override).await
    }

    /// Pins an application's playback to a device and re-routes.
    ///
    /// # Errors
    ///
    /// See [`fetch_output_device_and_route`](Self::fetch_output_device_and_route).
    pub async fn select_output_device(&self, uid: i32, device: Option<DeviceDescriptor>) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.registry.set_renderer_affinity(uid, device);
        self.run_fetch_epoch(PipeRole::Output, DeviceChangeReason::Override).await
    }

    /// Pins an application's capture to a device and re-routes.
    ///
    /// # Errors
    ///
    /// See [`fetch_input_device_and_route`](Self::fetch_input_device_and_route).
    pub async fn select_input_device(&self, uid: i32, device: Option<DeviceDescriptor>) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        self.registry.set_capturer_affinity(uid, device);
        self.run_fetch_epoch(PipeRole::Input, DeviceChangeReason::Override).await
    }

    /// Changes the audio scene and re-routes every stream.
    ///
    /// Moves made by this fetch leave the HAL route alone; the route of the
    /// new current output device is pushed once at the end.
    ///
    /// # Errors
    ///
    /// See [`trigger_fetch_device`](Self::trigger_fetch_device).
    pub async fn set_audio_scene(&self, scene: AudioScene) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        {
            let mut state = self.state.lock();
            info!(from = ?state.scene, to = ?scene, "set audio scene");
            state.last_scene = state.scene;
            state.scene = scene;
        }
        let result = self.trigger_fetch_locked(DeviceChangeReason::SetAudioScene).await;

        let current = self.active.current_output_device();
        if !current.is_none() {
            if let Err(e) = self.active.update_active_device_route(&current, DeviceRole::Output).await {
                warn!(device = %current, error = %e, "scene route update failed");
            }
        }
        {
            let mut state = self.state.lock();
            state.last_scene = state.scene;
        }
        result
    }

    /// Changes the ringer mode; re-routes output while something rings.
    ///
    /// # Errors
    ///
    /// See [`fetch_output_device_and_route`](Self::fetch_output_device_and_route).
    pub async fn set_ringer_mode(&self, mode: RingerMode) -> Result<(), RouteError> {
        let _gate = self.fetch_gate.lock().await;
        let ringing = {
            let mut state = self.state.lock();
            state.ringer_mode = mode;
            state.scene.is_ringing()
        };
        info!(?mode, ringing, "set ringer mode");
        if ringing {
            self.run_fetch_epoch(PipeRole::Output, DeviceChangeReason::Unknown).await
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: CoreEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }

    fn is_same_scene(&self) -> bool {
        let state = self.state.lock();
        state.scene == state.last_scene
    }

    fn next_start_time(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl std::fmt::Debug for AudioCoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCoreService")
            .field("config", &self.config)
            .field("pipes", &self.pipes)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{out, Harness};
    use super::*;
    use crate::mock::HdiCall;

    #[tokio::test]
    async fn test_dump_mentions_state() {
        let h = Harness::new();
        let dump = h.service.dump();
        assert!(dump.contains("dual tone: off"));
        assert!(dump.contains("scene: Default"));
    }

    #[tokio::test]
    async fn test_set_ringer_mode_outside_ringing_does_not_fetch() {
        let h = Harness::new();
        h.service.set_ringer_mode(RingerMode::Silent).await.unwrap();
        assert_eq!(h.service.ringer_mode(), RingerMode::Silent);
        assert!(h.hdi.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scene_change_routes_current_output() {
        let h = Harness::new();
        h.service.fetch_output_device_and_route(DeviceChangeReason::Unknown).await.unwrap();
        assert_eq!(h.service.active_devices().current_output_device().device_type, DeviceType::Speaker);

        h.hdi.clear_calls();
        h.service.set_audio_scene(AudioScene::PhoneChat).await.unwrap();
        assert_eq!(h.service.audio_scene(), AudioScene::PhoneChat);
        assert!(h
            .hdi
            .calls()
            .contains(&HdiCall::SetActiveDeviceRoute(DeviceType::Speaker, DeviceRole::Output)));
        assert!(h.service.is_same_scene());
    }

    #[tokio::test]
    async fn test_disconnect_clears_active_a2dp_mac() {
        let h = Harness::new();
        let a2dp = out(DeviceType::BluetoothA2dp).with_mac("aa:01");
        h.service.on_device_connected(a2dp.clone()).await.unwrap();
        h.service.active_devices().set_active_bt_mac("aa:01");

        h.service.on_device_disconnected(&a2dp).await.unwrap();
        assert_eq!(h.service.active_devices().active_bt_mac(), "");
        assert!(h.registry.find(DeviceType::BluetoothA2dp, DeviceRole::Output, "aa:01").is_none());
    }
}
