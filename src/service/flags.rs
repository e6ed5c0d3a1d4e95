//! Route flag rules.
//!
//! A stream's flag decides which path class (and so which pipe) carries it.
//! Flags are recomputed on every fetch because they depend on the device
//! the stream was just routed to.

use tracing::debug;

use crate::device::{A2dpOffloadState, DeviceDescriptor, DeviceType};
use crate::stream::{ClientFlag, RouteFlag, SampleFormat, SourceType, StreamDescriptor, StreamUsage};

use super::AudioCoreService;

const VIDEO_CALL_RATE: u32 = 48_000;
const DIRECT_RATES: std::ops::RangeInclusive<u32> = 48_000..=192_000;

/// Flag for a renderer on its current main device.
///
/// `other_offload_session` tells whether some other stream already holds
/// the offload path.
pub(crate) fn playback_route_flag(
    desc: &StreamDescriptor,
    offload_state: A2dpOffloadState,
    other_offload_session: bool,
) -> RouteFlag {
    let info = &desc.renderer_info;
    if info.original_flag == ClientFlag::ForcedNormal
        || (info.usage == StreamUsage::VideoCommunication && desc.stream_info.sampling_rate != VIDEO_CALL_RATE)
    {
        return RouteFlag::NORMAL;
    }
    let Some(device) = desc.first_new_device() else {
        return RouteFlag::NORMAL;
    };
    if device.device_type == DeviceType::RemoteCast || !device.is_local() {
        return RouteFlag::NORMAL;
    }
    if matches!(info.usage, StreamUsage::VoiceCommunication | StreamUsage::VideoCommunication) {
        return RouteFlag::VOIP;
    }
    match info.original_flag {
        ClientFlag::Mmap => {
            return if info.fast_allowed { RouteFlag::FAST } else { RouteFlag::NORMAL };
        }
        ClientFlag::VoipFast => {
            return if info.fast_allowed { RouteFlag::VOIP } else { RouteFlag::NORMAL };
        }
        _ => {}
    }

    if is_direct_supported(desc, device) {
        RouteFlag::HD
    } else if is_lowpower_supported(desc, device, other_offload_session) {
        RouteFlag::LOWPOWER
    } else if is_multichannel_supported(desc, device, offload_state) {
        RouteFlag::MULTICHANNEL
    } else {
        RouteFlag::NORMAL
    }
}

/// Flag for a capturer on its current device.
pub(crate) fn record_route_flag(desc: &StreamDescriptor) -> RouteFlag {
    let info = &desc.capturer_info;
    if info.original_flag == ClientFlag::ForcedNormal {
        return RouteFlag::NORMAL;
    }
    if info.source_type == SourceType::VoiceCommunication {
        return RouteFlag::VOIP;
    }
    if info.source_type == SourceType::RemoteCast {
        return RouteFlag::NORMAL;
    }
    match info.original_flag {
        ClientFlag::Mmap => RouteFlag::FAST,
        ClientFlag::VoipFast => RouteFlag::VOIP | RouteFlag::FAST,
        _ => RouteFlag::NORMAL,
    }
}

/// High resolution music on a wired or USB headset.
fn is_direct_supported(desc: &StreamDescriptor, device: &DeviceDescriptor) -> bool {
    matches!(device.device_type, DeviceType::WiredHeadset | DeviceType::UsbHeadset)
        && desc.renderer_info.usage == StreamUsage::Music
        && DIRECT_RATES.contains(&desc.stream_info.sampling_rate)
        && matches!(
            desc.stream_info.format,
            SampleFormat::S24Le | SampleFormat::S32Le | SampleFormat::F32Le
        )
}

fn is_movie_pcm_offload(desc: &StreamDescriptor) -> bool {
    desc.renderer_info.usage == StreamUsage::Movie && desc.renderer_info.original_flag == ClientFlag::PcmOffload
}

/// Whether a renderer may take the low power offload path.
pub(crate) fn is_lowpower_supported(
    desc: &StreamDescriptor,
    device: &DeviceDescriptor,
    other_offload_session: bool,
) -> bool {
    if other_offload_session || !desc.renderer_info.offload_allowed {
        return false;
    }
    let movie_offload = is_movie_pcm_offload(desc);
    if desc.stream_info.channels > 2 && !movie_offload {
        return false;
    }
    if !matches!(desc.renderer_info.usage, StreamUsage::Music | StreamUsage::Audiobook) && !movie_offload {
        return false;
    }
    matches!(
        device.device_type,
        DeviceType::BluetoothA2dp | DeviceType::Speaker | DeviceType::UsbHeadset
    )
}

fn is_multichannel_supported(
    desc: &StreamDescriptor,
    device: &DeviceDescriptor,
    offload_state: A2dpOffloadState,
) -> bool {
    let device_ok = device.device_type == DeviceType::Speaker
        || (device.device_type == DeviceType::BluetoothA2dp && offload_state == A2dpOffloadState::Offload);
    device_ok && desc.stream_info.channels > 2 && !is_movie_pcm_offload(desc)
}

impl AudioCoreService {
    /// Recomputes a renderer's flag.
    pub(crate) fn update_playback_stream_flag(&self, desc: &mut StreamDescriptor) {
        let other_offload = self
            .pipes
            .offload_session_ids()
            .into_iter()
            .any(|id| id != desc.session_id);
        let flag = playback_route_flag(desc, self.registry.a2dp_offload_state(), other_offload);
        if flag != desc.route_flag {
            debug!(session_id = desc.session_id, from = %desc.route_flag, to = %flag, "playback flag");
        }
        desc.route_flag = flag;
    }

    /// Recomputes a capturer's flag.
    pub(crate) fn update_record_stream_flag(&self, desc: &mut StreamDescriptor) {
        let flag = record_route_flag(desc);
        if flag != desc.route_flag {
            debug!(session_id = desc.session_id, from = %desc.route_flag, to = %flag, "record flag");
        }
        desc.route_flag = flag;
    }
}
