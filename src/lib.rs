//! # audio-route-core
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Device fetch-and-route engine for an audio policy service.
//!
//! `audio-route-core` decides which physical device every playback and
//! capture stream uses, groups streams into pipes (one open HAL port per
//! adapter and path class), and moves or recreates streams when devices,
//! scenes or preferences change. Bluetooth activation, dual-tone ringing
//! and delayed offload release are handled along the way.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use audio_route_core::{AudioCoreServiceBuilder, StreamDescriptor, StreamInfo, StreamUsage};
//!
//! let core = AudioCoreServiceBuilder::new()
//!     .hdi_adapter(Arc::new(my_hal))
//!     .bluetooth(Arc::new(my_bluetooth))
//!     .stream_collector(Arc::new(my_collector))
//!     .on_event(|e| tracing::info!(?e, "core event"))
//!     .spawn()
//!     .await?;
//!
//! let desc = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_app(uid, pid);
//! let created = core.create_renderer_client(desc).await?;
//! core.start_client(created.session_id).await?;
//!
//! // A headset is plugged in: the stream follows it.
//! core.on_device_connected(headset).await?;
//! ```
//!
//! ## Architecture
//!
//! - **Router center**: picks devices per usage or source from the registry
//! - **Pipe selector**: turns device choices into pipe actions (new, update, move, recreate)
//! - **Core service**: executes those actions against the HAL and Bluetooth facades
//! - **Worker**: one task that runs requests in arrival order
//!
//! Every mutation runs under one serialization gate, so a fetch always sees
//! the state the previous one left.

#![warn(missing_docs)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

mod builder;
mod config;
pub mod device;
mod error;
mod event;
mod facade;
pub mod mock;
pub mod pipe;
mod priming;
mod router;
mod scene;
mod service;
pub mod stream;
mod worker;

pub use builder::AudioCoreServiceBuilder;
pub use config::{AdapterTable, CoreConfig, REMOTE_ADAPTER_PREFIX};
pub use device::{DeviceDescriptor, DeviceRegistry, DeviceRole, DeviceType};
pub use error::{FacadeError, RouteError};
pub use event::{event_callback, CoreEvent, DeviceChangeReason, EventCallback};
pub use facade::{A2dpStreamInfo, AudioRoute, BluetoothFacade, HdiAdapter, StreamCollector};
pub use pipe::{PipeInfo, PortHandle};
pub use priming::RenderEmptyGate;
pub use router::RouterCenter;
pub use scene::{AudioScene, RingerMode};
pub use service::{AudioCoreService, CreatedClient, SwitchDecision};
pub use stream::{RouteFlag, StreamDescriptor, StreamInfo, StreamUsage};
pub use worker::{spawn_core_worker, CoreHandle};
