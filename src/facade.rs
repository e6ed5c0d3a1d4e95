//! Collaborator traits.
//!
//! The routing core never touches hardware itself. It drives three
//! collaborators:
//!
//! - [`HdiAdapter`]: the audio HAL and audio server (ports, moves, routes)
//! - [`BluetoothFacade`]: the Bluetooth stack (active peers, SCO links)
//! - [`StreamCollector`]: the stream bookkeeping service that tells clients
//!   where their streams went
//!
//! In-memory implementations live in [`mock`](crate::mock).

use async_trait::async_trait;

use crate::device::{DeviceDescriptor, DeviceRole, DeviceType};
use crate::pipe::{PipeInfo, PortHandle};
use crate::scene::AudioScene;
use crate::stream::SampleFormat;
use crate::FacadeError;

/// A multi-device route pushed to the HAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRoute {
    /// Direction.
    pub role: DeviceRole,
    /// Devices the route spans, main device first.
    pub devices: Vec<DeviceDescriptor>,
    /// Sink or source the route belongs to.
    pub port_name: String,
}

/// Stream parameters of an A2DP peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A2dpStreamInfo {
    /// Frames per second.
    pub sampling_rate: u32,
    /// Sample layout.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u32,
}

/// Audio HAL and audio server operations.
///
/// # Implementation Notes
///
/// - Methods take `&self`; use interior mutability if needed
/// - Calls may block on IPC; the core never holds a table lock across them
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use audio_route_core::{AudioRoute, DeviceDescriptor, DeviceRole, FacadeError, HdiAdapter, PipeInfo, PortHandle};
///
/// struct NullHdi;
///
/// #[async_trait]
/// impl HdiAdapter for NullHdi {
///     async fn open_audio_port(&self, _pipe: &PipeInfo) -> Result<PortHandle, FacadeError> {
///         Ok(PortHandle { id: 1, pa_index: 1 })
///     }
///     async fn close_audio_port(&self, _port: PortHandle) -> Result<(), FacadeError> { Ok(()) }
///     async fn move_sink_input(&self, _session_id: u32, _pa_index: u32, _sink: &str) -> Result<(), FacadeError> { Ok(()) }
///     async fn move_source_output(&self, _session_id: u32, _pa_index: u32, _source: &str) -> Result<(), FacadeError> { Ok(()) }
///     async fn set_active_device_route(&self, _device: &DeviceDescriptor, _role: DeviceRole) -> Result<(), FacadeError> { Ok(()) }
///     async fn update_audio_route(&self, _route: &AudioRoute) -> Result<(), FacadeError> { Ok(()) }
///     async fn check_remote_device_state(&self, _network_id: &str, _role: DeviceRole, _connected: bool) -> Result<(), FacadeError> { Ok(()) }
/// }
/// ```
#[async_trait]
pub trait HdiAdapter: Send + Sync {
    /// Opens the port described by `pipe.module_info`.
    async fn open_audio_port(&self, pipe: &PipeInfo) -> Result<PortHandle, FacadeError>;

    /// Closes a port.
    async fn close_audio_port(&self, port: PortHandle) -> Result<(), FacadeError>;

    /// Moves a playback session to another sink.
    async fn move_sink_input(&self, session_id: u32, pa_index: u32, sink_name: &str) -> Result<(), FacadeError>;

    /// Moves a capture session to another source.
    async fn move_source_output(&self, session_id: u32, pa_index: u32, source_name: &str)
        -> Result<(), FacadeError>;

    /// Routes a single device.
    async fn set_active_device_route(&self, device: &DeviceDescriptor, role: DeviceRole) -> Result<(), FacadeError>;

    /// Routes several devices at once.
    async fn update_audio_route(&self, route: &AudioRoute) -> Result<(), FacadeError>;

    /// Verifies that a remote node's device is reachable.
    async fn check_remote_device_state(
        &self,
        network_id: &str,
        role: DeviceRole,
        connected: bool,
    ) -> Result<(), FacadeError>;

    /// Reopens a port with new parameters.
    ///
    /// Default implementation closes then opens.
    async fn reload_audio_port(&self, port: PortHandle, pipe: &PipeInfo) -> Result<PortHandle, FacadeError> {
        self.close_audio_port(port).await?;
        self.open_audio_port(pipe).await
    }

    /// Suspends or resumes a port.
    ///
    /// Default implementation does nothing.
    async fn suspend_audio_device(&self, _port_name: &str, _suspend: bool) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Mutes or unmutes a sink while its streams switch device.
    ///
    /// Default implementation does nothing.
    async fn set_sink_mute(&self, _sink_name: &str, _mute: bool) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Points the effect chain at the device now playing.
    ///
    /// Default implementation does nothing.
    async fn update_effect_default_sink(&self, _device_type: DeviceType) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Applies the volume of the device being switched to.
    ///
    /// Default implementation does nothing.
    async fn set_volume_for_switch_device(&self, _device: &DeviceDescriptor) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Tells the audio server whether a stream plays on two devices.
    ///
    /// Default implementation does nothing.
    async fn update_dual_tone_state(&self, _enable: bool, _session_id: u32) -> Result<(), FacadeError> {
        Ok(())
    }
}

/// Bluetooth stack operations.
#[async_trait]
pub trait BluetoothFacade: Send + Sync {
    /// Makes a hands-free peer active.
    async fn set_active_hfp_device(&self, mac: &str) -> Result<(), FacadeError>;

    /// Brings up the SCO link for the given scene.
    async fn connect_sco_with_audio_scene(&self, scene: AudioScene) -> Result<(), FacadeError>;

    /// Makes an A2DP peer active.
    async fn set_active_a2dp_device(&self, mac: &str) -> Result<(), FacadeError>;

    /// Returns the stream parameters an A2DP peer negotiated.
    async fn a2dp_stream_info(&self, mac: &str) -> Result<A2dpStreamInfo, FacadeError>;

    /// Starts or stops voice recognition over SCO.
    ///
    /// Default implementation does nothing.
    async fn handle_sco_with_recognition(&self, _enable: bool, _device: &DeviceDescriptor) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Returns `true` while voice recognition holds the SCO link.
    fn is_recognition_active(&self) -> bool {
        false
    }
}

/// Stream bookkeeping service.
#[async_trait]
pub trait StreamCollector: Send + Sync {
    /// Records the device a playback session now plays on.
    async fn update_renderer_device_info(&self, session_id: u32, device: &DeviceDescriptor);

    /// Records the device a capture session now records from.
    async fn update_capturer_device_info(&self, session_id: u32, device: &DeviceDescriptor);
}
