//! Notifications emitted by the routing core.
//!
//! Events are non-fatal: a failing move or a failed port open inside a batch
//! is reported here and the batch carries on.

use std::sync::Arc;

use crate::device::{DeviceDescriptor, DeviceType};
use crate::stream::{AudioMode, RouteFlag};

/// Why a fetch ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceChangeReason {
    /// No specific reason.
    #[default]
    Unknown,
    /// A device was connected.
    NewDeviceAvailable,
    /// A device was disconnected.
    OldDeviceUnavailable,
    /// The user or an application overrode the routing.
    Override,
    /// The audio scene changed.
    SetAudioScene,
}

/// Runtime notifications from [`AudioCoreService`](crate::AudioCoreService).
///
/// # Example
///
/// ```
/// use audio_route_core::CoreEvent;
///
/// fn handle_event(event: CoreEvent) {
///     match event {
///         CoreEvent::DeviceChanged { session_id, new_device, .. } => {
///             eprintln!("session {session_id} now on {new_device}");
///         }
///         CoreEvent::StreamRecreateRequired { session_id, route_flag, .. } => {
///             eprintln!("session {session_id} must be recreated as {route_flag}");
///         }
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A stream now plays on (or records from) another device.
    DeviceChanged {
        /// Session that moved.
        session_id: u32,
        /// Owning process.
        pid: i32,
        /// Previous main device.
        old_device: DeviceDescriptor,
        /// New main device.
        new_device: DeviceDescriptor,
        /// Why the fetch ran.
        reason: DeviceChangeReason,
    },

    /// A stream cannot be moved and must be recreated by its client.
    StreamRecreateRequired {
        /// Session to recreate.
        session_id: u32,
        /// Owning process.
        pid: i32,
        /// Direction.
        mode: AudioMode,
        /// Flag the recreated stream should use.
        route_flag: RouteFlag,
        /// Why the fetch ran.
        reason: DeviceChangeReason,
    },

    /// Dual-device ringing was switched on or off.
    DualToneStateChanged {
        /// New state.
        enabled: bool,
        /// Session that owns (or owned) the dual tone.
        session_id: u32,
    },

    /// The current output device changed.
    PreferredOutputDeviceUpdated {
        /// New current output device.
        device: DeviceDescriptor,
    },

    /// The current input device changed.
    PreferredInputDeviceUpdated {
        /// New current input device.
        device: DeviceDescriptor,
    },

    /// A port could not be opened; its streams stay unrouted until the
    /// next fetch.
    PipeOpenFailed {
        /// Pipe that failed.
        pipe: String,
        /// Sessions left unrouted.
        sessions: Vec<u32>,
        /// Error reported by the HAL.
        error: String,
    },

    /// Moving one stream failed; the rest of the batch continued.
    StreamMoveFailed {
        /// Session that failed to move.
        session_id: u32,
        /// Description of the failure.
        error: String,
    },

    /// A device failed to activate and is excluded from routing.
    DeviceMarkedExceptional {
        /// Device kind.
        device_type: DeviceType,
        /// Bluetooth address.
        mac: String,
    },
}

/// Callback type for receiving [`CoreEvent`]s.
///
/// Register one via [`AudioCoreServiceBuilder::on_event()`].
///
/// [`AudioCoreServiceBuilder::on_event()`]: crate::AudioCoreServiceBuilder::on_event
pub type EventCallback = Arc<dyn Fn(CoreEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use audio_route_core::{event_callback, CoreEvent};
///
/// let callback = event_callback(|event: CoreEvent| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(CoreEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_event_debug() {
        let event = CoreEvent::DualToneStateChanged {
            enabled: true,
            session_id: 100_001,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("DualToneStateChanged"));
        assert!(debug.contains("100001"));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(CoreEvent::StreamMoveFailed {
            session_id: 1,
            error: "gone".to_string(),
        });
        assert!(called.load(Ordering::SeqCst));
    }
}
