//! Pipe records and module naming.

use std::fmt;

use crate::device::{DeviceDescriptor, DeviceType};
use crate::stream::{RouteFlag, SampleFormat, SourceType, StreamDescriptor};

/// Port id of a pipe whose port is not open.
pub const HDI_INVALID_ID: u32 = u32::MAX;

/// Module name of the primary playback pipe.
pub const PRIMARY_OUTPUT: &str = "primary_output";
/// Module name of the offload playback pipe.
pub const OFFLOAD_OUTPUT: &str = "offload_output";
/// Module name of the multichannel playback pipe.
pub const MULTICHANNEL_OUTPUT: &str = "multichannel_output";
/// Module name of the A2DP playback pipe.
pub const A2DP_OUTPUT: &str = "a2dp_output";
/// Module name of the inner capturer used by cast sessions.
pub const REMOTE_CAST_INNER_CAPTURER: &str = "RemoteCastInnerCapturer";

/// Direction of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeRole {
    /// Playback.
    Output,
    /// Capture.
    Input,
}

impl PipeRole {
    fn suffix(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Input => "input",
        }
    }
}

/// What the executor must do with a pipe after a selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipeAction {
    /// Nothing changed.
    #[default]
    Default,
    /// Membership or a member's placement changed.
    Update,
    /// The port must be opened.
    New,
}

/// Audio server side of a pipe: sink for playback, source for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleRole {
    /// Playback sink.
    Sink,
    /// Capture source.
    Source,
}

/// Parameters used to open a pipe's port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module (sink or source) name.
    pub name: String,
    /// Adapter that owns the port.
    pub adapter_name: String,
    /// Module class; special pipes use their own class.
    pub class_name: String,
    /// Sink or source.
    pub role: ModuleRole,
    /// Frames per second.
    pub rate: u32,
    /// Sample layout.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u32,
    /// Bytes per 20 ms period.
    pub buffer_size: u32,
    /// Device the port is opened for.
    pub device_type: DeviceType,
    /// Network id of that device.
    pub network_id: String,
    /// Capture source; `Invalid` for playback.
    pub source_type: SourceType,
    /// Offload playback.
    pub offload_enable: bool,
    /// Latency is fixed by the hardware.
    pub fixed_latency: bool,
}

/// Handle returned by the HDI layer for an opened port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle {
    /// HDI port id.
    pub id: u32,
    /// Audio server module index.
    pub pa_index: u32,
}

impl PortHandle {
    /// Handle of a port that is not open.
    pub const INVALID: Self = Self {
        id: HDI_INVALID_ID,
        pa_index: HDI_INVALID_ID,
    };
}

/// A logical audio path on one adapter with one flag class.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeInfo {
    /// HDI port id, or [`HDI_INVALID_ID`] while unopened.
    pub id: u32,
    /// Audio server module index.
    pub pa_index: u32,
    /// Direction.
    pub role: PipeRole,
    /// Flag class shared by every member.
    pub route_flag: RouteFlag,
    /// Adapter name.
    pub adapter_name: String,
    /// Pipe name; equals the module name.
    pub name: String,
    /// Port parameters.
    pub module_info: ModuleInfo,
    /// Action chosen by the last selection pass.
    pub action: PipeAction,
    /// Streams carried by this pipe.
    pub streams: Vec<StreamDescriptor>,
}

impl PipeInfo {
    /// Returns `true` if the port is open.
    pub fn is_open(&self) -> bool {
        self.id != HDI_INVALID_ID
    }

    /// Returns the port handle.
    pub fn port(&self) -> PortHandle {
        PortHandle {
            id: self.id,
            pa_index: self.pa_index,
        }
    }

    /// Returns `true` if `adapter` and `flag` identify this pipe.
    pub fn matches(&self, adapter: &str, flag: RouteFlag) -> bool {
        self.adapter_name == adapter && self.route_flag == flag
    }

    /// Returns `true` if the session is carried by this pipe.
    pub fn contains_session(&self, session_id: u32) -> bool {
        self.streams.iter().any(|s| s.session_id == session_id)
    }

    /// Returns `true` for the offload pipe.
    pub fn is_offload(&self) -> bool {
        self.name == OFFLOAD_OUTPUT
    }
}

impl fmt::Display for PipeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [id={}, adapter={}, flag={}, streams={}]",
            self.name,
            self.id,
            self.adapter_name,
            self.route_flag,
            self.streams.len()
        )
    }
}

fn flag_kind(flag: RouteFlag) -> Option<&'static str> {
    if flag.contains(RouteFlag::VOIP) {
        Some("voip")
    } else if flag.contains(RouteFlag::FAST) {
        Some("fast")
    } else if flag.intersects(RouteFlag::DIRECT | RouteFlag::HD) {
        Some("direct")
    } else if flag.contains(RouteFlag::LOWPOWER) {
        Some("offload")
    } else if flag.contains(RouteFlag::MULTICHANNEL) {
        Some("multichannel")
    } else {
        None
    }
}

/// Derives the pipe (module) name for a placement.
///
/// Remote devices use `{network}_out` / `{network}_in`; cast capture uses
/// [`REMOTE_CAST_INNER_CAPTURER`]. Local pipes are `{adapter}_{role}` for
/// the normal class, `{kind}_{role}` for special classes on the primary
/// adapter and `{adapter}_{kind}_{role}` elsewhere.
pub fn pipe_name(adapter: &str, role: PipeRole, flag: RouteFlag, device: &DeviceDescriptor) -> String {
    if !device.is_local() {
        let dir = match role {
            PipeRole::Output => "out",
            PipeRole::Input => "in",
        };
        return format!("{}_{dir}", device.network_id);
    }
    if device.device_type == DeviceType::RemoteCast {
        return REMOTE_CAST_INNER_CAPTURER.to_string();
    }
    match flag_kind(flag) {
        None => format!("{adapter}_{}", role.suffix()),
        Some(kind) if adapter == "primary" => format!("{kind}_{}", role.suffix()),
        Some(kind) => format!("{adapter}_{kind}_{}", role.suffix()),
    }
}

/// Builds the port parameters for a new pipe carrying `stream`.
pub fn module_info_for(
    adapter: &str,
    name: &str,
    role: PipeRole,
    stream: &StreamDescriptor,
    device: &DeviceDescriptor,
) -> ModuleInfo {
    let info = &stream.stream_info;
    let channels = info.channels.max(1);
    let buffer_size = info.sampling_rate * info.format.bytes() * channels / 50;
    let mut module = ModuleInfo {
        name: name.to_string(),
        adapter_name: adapter.to_string(),
        class_name: if device.is_local() {
            adapter.to_string()
        } else {
            "remote".to_string()
        },
        role: match role {
            PipeRole::Output => ModuleRole::Sink,
            PipeRole::Input => ModuleRole::Source,
        },
        rate: info.sampling_rate,
        format: info.format,
        channels,
        buffer_size,
        device_type: device.device_type,
        network_id: device.network_id.clone(),
        source_type: stream.capturer_info.source_type,
        offload_enable: false,
        fixed_latency: false,
    };
    match name {
        MULTICHANNEL_OUTPUT => {
            module.class_name = "multichannel".to_string();
            module.fixed_latency = true;
            module.buffer_size = buffer_size / channels * 2;
        }
        OFFLOAD_OUTPUT => {
            module.class_name = "offload".to_string();
            module.offload_enable = true;
            module.fixed_latency = true;
        }
        _ => {}
    }
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRole;
    use crate::stream::{StreamInfo, StreamUsage};

    fn speaker() -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output)
    }

    #[test]
    fn test_pipe_names() {
        let dev = speaker();
        assert_eq!(pipe_name("primary", PipeRole::Output, RouteFlag::NORMAL, &dev), PRIMARY_OUTPUT);
        assert_eq!(pipe_name("primary", PipeRole::Output, RouteFlag::LOWPOWER, &dev), OFFLOAD_OUTPUT);
        assert_eq!(
            pipe_name("primary", PipeRole::Output, RouteFlag::MULTICHANNEL, &dev),
            MULTICHANNEL_OUTPUT
        );
        assert_eq!(pipe_name("primary", PipeRole::Output, RouteFlag::FAST | RouteFlag::VOIP, &dev), "voip_output");
        assert_eq!(pipe_name("a2dp", PipeRole::Output, RouteFlag::NORMAL, &dev), A2DP_OUTPUT);
        assert_eq!(pipe_name("usb", PipeRole::Input, RouteFlag::FAST, &dev), "usb_fast_input");
    }

    #[test]
    fn test_remote_pipe_name() {
        let dev = speaker().with_network_id("node-7");
        assert_eq!(pipe_name("remote@node-7", PipeRole::Output, RouteFlag::NORMAL, &dev), "node-7_out");
        assert_eq!(pipe_name("remote@node-7", PipeRole::Input, RouteFlag::NORMAL, &dev), "node-7_in");
    }

    #[test]
    fn test_module_info_buffer_size() {
        let stream = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default());
        let module = module_info_for("primary", PRIMARY_OUTPUT, PipeRole::Output, &stream, &speaker());
        // 48000 * 2 bytes * 2 channels / 50
        assert_eq!(module.buffer_size, 3840);
        assert_eq!(module.role, ModuleRole::Sink);
        assert!(!module.offload_enable);
    }

    #[test]
    fn test_special_module_info() {
        let info = StreamInfo {
            channels: 6,
            ..StreamInfo::default()
        };
        let stream = StreamDescriptor::renderer(StreamUsage::Movie, info);
        let module = module_info_for("primary", MULTICHANNEL_OUTPUT, PipeRole::Output, &stream, &speaker());
        assert_eq!(module.class_name, "multichannel");
        assert!(module.fixed_latency);
        assert_eq!(module.buffer_size, 48_000 * 2 * 6 / 50 / 6 * 2);

        let stream = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default());
        let module = module_info_for("primary", OFFLOAD_OUTPUT, PipeRole::Output, &stream, &speaker());
        assert_eq!(module.class_name, "offload");
        assert!(module.offload_enable);
    }
}
