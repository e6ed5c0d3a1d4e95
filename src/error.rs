//! Error types for audio-route-core.
//!
//! Errors are split into two categories:
//! - **Route errors** ([`RouteError`]): returned by core operations when a
//!   stream could not be routed or a client request was invalid
//! - **Facade errors** ([`FacadeError`]): reported by injected collaborators
//!   (HDI adapter, Bluetooth stack, stream collector)
//!
//! Non-fatal conditions (a stream's move failing inside a batch, a device
//! change notification) are surfaced via [`EventCallback`](crate::EventCallback)
//! and logging instead.

use crate::device::DeviceType;

/// Errors returned from [`AudioCoreService`](crate::AudioCoreService) operations.
///
/// None of these are fatal to the service. A stream that hits one of them
/// stays unrouted until the next successful fetch.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The request carried an invalid or unsupported parameter.
    #[error("invalid parameter: {reason}")]
    InvalidParam {
        /// What was wrong with the request.
        reason: String,
    },

    /// A collaborator call completed but reported failure.
    #[error("operation failed: {reason}")]
    OperationFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// The router found no eligible device for a stream.
    #[error("no device available for session {session_id}")]
    NoDeviceAvailable {
        /// Session that could not be routed.
        session_id: u32,
    },

    /// No stream with this session id is known to the pipe manager.
    #[error("session {session_id} not found")]
    SessionNotFound {
        /// The unknown session id.
        session_id: u32,
    },

    /// The HDI adapter refused to open a port for a pipe.
    #[error("failed to open port for pipe '{pipe}': {reason}")]
    OpenPortFailed {
        /// Name of the pipe being opened.
        pipe: String,
        /// Why the port could not be opened.
        reason: String,
    },

    /// Moving a sink input or source output between ports failed.
    #[error("failed to move session {session_id} to '{port}': {reason}")]
    MoveFailed {
        /// Session being moved.
        session_id: u32,
        /// Target sink or source port.
        port: String,
        /// Why the move failed.
        reason: String,
    },

    /// Activating an A2DP peer failed; the previous active peer was restored.
    #[error("a2dp activation failed for {mac}: {reason}")]
    A2dpActivationFailed {
        /// Address of the peer that failed to activate.
        mac: String,
        /// Reason reported by the Bluetooth stack.
        reason: String,
    },

    /// Activating an SCO peer failed; the device was marked exceptional.
    #[error("sco activation failed for {mac}")]
    ScoActivationFailed {
        /// Address of the peer that failed to activate.
        mac: String,
    },

    /// A remote device is not reachable or its module is not loaded.
    #[error("remote device {network_id} unavailable: {reason}")]
    RemoteDeviceUnavailable {
        /// Network id of the remote node.
        network_id: String,
        /// Why the device is unavailable.
        reason: String,
    },

    /// The target device cannot play this stream.
    #[error("device {device} does not support this stream")]
    NotSupported {
        /// Device that rejected the stream.
        device: DeviceType,
    },

    /// The same failing device was offered again within one fetch epoch.
    #[error("fetch retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Number of fetch passes that ran.
        attempts: u32,
    },

    /// The core worker task is no longer running.
    #[error("core worker stopped")]
    WorkerStopped,

    /// An injected collaborator reported an error.
    #[error(transparent)]
    Facade(#[from] FacadeError),
}

impl RouteError {
    /// Creates an invalid parameter error with the given reason.
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            reason: reason.into(),
        }
    }

    /// Creates an operation failed error with the given reason.
    pub fn operation_failed(reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            reason: reason.into(),
        }
    }
}

/// Errors reported by an injected collaborator.
///
/// Implementations of [`HdiAdapter`](crate::HdiAdapter),
/// [`BluetoothFacade`](crate::BluetoothFacade) and
/// [`StreamCollector`](crate::StreamCollector) return these; the core maps
/// them onto [`RouteError`] variants according to where they happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FacadeError {
    /// The call reached the collaborator but failed.
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        /// Name of the failing operation.
        operation: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// The target of the call is not connected.
    #[error("{target} is not connected")]
    NotConnected {
        /// Device, port or peer that was not connected.
        target: String,
    },

    /// Custom error for user-implemented collaborators.
    #[error("{0}")]
    Custom(String),
}

impl FacadeError {
    /// Creates a custom facade error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates an operation failed error for the named operation.
    pub fn failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not connected error for the given target.
    pub fn not_connected(target: impl Into<String>) -> Self {
        Self::NotConnected {
            target: target.into(),
        }
    }
}
