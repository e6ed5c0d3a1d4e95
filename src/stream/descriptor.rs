//! Stream descriptor and its vocabulary types.

use crate::device::{A2dpOffloadState, DeviceDescriptor};

use super::flag::RouteFlag;

/// Uid of the media service itself; streams it opens on behalf of an
/// application are attributed to that application.
pub const MEDIA_SERVICE_UID: i32 = 1013;

/// Direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AudioMode {
    /// Renderer.
    #[default]
    Playback,
    /// Capturer.
    Record,
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamStatus {
    /// Created, never started.
    #[default]
    New,
    /// Playing or recording.
    Started,
    /// Paused by the client.
    Paused,
    /// Stopped by the client.
    Stopped,
    /// Released; about to be removed.
    Released,
}

/// What the executor must do with a stream after a selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamAction {
    /// Nothing changed.
    #[default]
    Default,
    /// The stream is new to the pipe set.
    New,
    /// Move the stream to another port.
    Move,
    /// The client must recreate the stream on the new path.
    Recreate,
}

/// Purpose of a playback stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum StreamUsage {
    #[default]
    Unknown,
    Media,
    Music,
    VoiceCommunication,
    VoiceAssistant,
    Alarm,
    VoiceMessage,
    Ringtone,
    Notification,
    Accessibility,
    Movie,
    Game,
    Audiobook,
    Navigation,
    VideoCommunication,
    VoiceModemCommunication,
    VoiceRingtone,
    System,
}

impl StreamUsage {
    /// Ringtones and alarms; these may play on two devices at once.
    pub fn is_ringer_or_alarm(self) -> bool {
        matches!(self, Self::Ringtone | Self::VoiceRingtone | Self::Alarm)
    }

    /// Call audio.
    pub fn is_call(self) -> bool {
        matches!(
            self,
            Self::VoiceCommunication | Self::VideoCommunication | Self::VoiceModemCommunication
        )
    }
}

/// Purpose of a capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum SourceType {
    #[default]
    Invalid,
    Mic,
    VoiceRecognition,
    PlaybackCapture,
    Wakeup,
    VoiceCall,
    VoiceCommunication,
    VoiceMessage,
    RemoteCast,
    Camcorder,
}

impl SourceType {
    /// Sources that hold their own SCO link instead of the call link.
    pub fn uses_recognition_sco(self) -> bool {
        matches!(self, Self::VoiceRecognition)
    }
}

/// PCM sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum SampleFormat {
    U8,
    #[default]
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    /// Bytes per sample.
    pub fn bytes(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le | Self::F32Le => 4,
        }
    }

    /// Name used in module parameters.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16Le => "s16le",
            Self::S24Le => "s24le",
            Self::S32Le => "s32le",
            Self::F32Le => "f32le",
        }
    }
}

/// Stream encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Linear PCM.
    #[default]
    Pcm,
    /// Dolby Digital Plus passthrough; only HDMI and digital line can carry it.
    Eac3,
}

/// Sample rate, format and channel count of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamInfo {
    /// Frames per second.
    pub sampling_rate: u32,
    /// Sample layout.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u32,
    /// Encoding.
    pub encoding: Encoding,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sampling_rate: 48_000,
            format: SampleFormat::S16Le,
            channels: 2,
            encoding: Encoding::Pcm,
        }
    }
}

/// Path hint the client asked for when creating the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientFlag {
    /// No hint.
    #[default]
    Normal,
    /// Low latency memory mapped.
    Mmap,
    /// Low latency call.
    VoipFast,
    /// Always use the normal path.
    ForcedNormal,
    /// PCM offload requested by a movie player.
    PcmOffload,
    /// Multichannel output requested.
    Multichannel,
}

/// Renderer specific attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RendererInfo {
    /// Purpose.
    pub usage: StreamUsage,
    /// Whether the client permits offload playback.
    pub offload_allowed: bool,
    /// Whether the system permits the fast path.
    pub fast_allowed: bool,
    /// Path hint.
    pub original_flag: ClientFlag,
}

/// Capturer specific attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapturerInfo {
    /// Purpose.
    pub source_type: SourceType,
    /// Path hint.
    pub original_flag: ClientFlag,
}

/// Identity of the owning application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AppInfo {
    /// Application uid.
    pub uid: i32,
    /// Application pid.
    pub pid: i32,
    /// Access token id.
    pub token_id: u32,
}

/// An audio stream as known to the routing core.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    /// Unique id; allocated on creation when zero.
    pub session_id: u32,
    /// Renderer or capturer.
    pub audio_mode: AudioMode,
    /// Format.
    pub stream_info: StreamInfo,
    /// Renderer attributes; ignored for capturers.
    pub renderer_info: RendererInfo,
    /// Capturer attributes; ignored for renderers.
    pub capturer_info: CapturerInfo,
    /// Owning application.
    pub app_info: AppInfo,
    /// Uid of the process that created the stream.
    pub caller_uid: i32,
    /// Lifecycle state.
    pub stream_status: StreamStatus,
    /// Action chosen by the last selection pass.
    pub stream_action: StreamAction,
    /// Path class chosen by the flag rules.
    pub route_flag: RouteFlag,
    /// Ordering key for selection; assigned on creation and on start.
    pub start_time: u64,
    /// Devices the stream was on before the current fetch.
    pub old_device_descs: Vec<DeviceDescriptor>,
    /// Devices chosen by the current fetch.
    pub new_device_descs: Vec<DeviceDescriptor>,
}

impl StreamDescriptor {
    /// Creates a renderer descriptor.
    pub fn renderer(usage: StreamUsage, stream_info: StreamInfo) -> Self {
        Self {
            session_id: 0,
            audio_mode: AudioMode::Playback,
            stream_info,
            renderer_info: RendererInfo {
                usage,
                ..RendererInfo::default()
            },
            capturer_info: CapturerInfo::default(),
            app_info: AppInfo::default(),
            caller_uid: 0,
            stream_status: StreamStatus::New,
            stream_action: StreamAction::Default,
            route_flag: RouteFlag::NORMAL,
            start_time: 0,
            old_device_descs: Vec::new(),
            new_device_descs: Vec::new(),
        }
    }

    /// Creates a capturer descriptor.
    pub fn capturer(source_type: SourceType, stream_info: StreamInfo) -> Self {
        Self {
            audio_mode: AudioMode::Record,
            capturer_info: CapturerInfo {
                source_type,
                ..CapturerInfo::default()
            },
            ..Self::renderer(StreamUsage::Unknown, stream_info)
        }
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Sets the owning application and caller.
    #[must_use]
    pub fn with_app(mut self, uid: i32, pid: i32) -> Self {
        self.app_info.uid = uid;
        self.app_info.pid = pid;
        self.caller_uid = uid;
        self
    }

    /// Sets the uid of the creating process.
    #[must_use]
    pub fn with_caller_uid(mut self, caller_uid: i32) -> Self {
        self.caller_uid = caller_uid;
        self
    }

    /// Sets the client path hint for either direction.
    #[must_use]
    pub fn with_original_flag(mut self, flag: ClientFlag) -> Self {
        self.renderer_info.original_flag = flag;
        self.capturer_info.original_flag = flag;
        self
    }

    /// Allows offload playback.
    #[must_use]
    pub fn with_offload_allowed(mut self, allowed: bool) -> Self {
        self.renderer_info.offload_allowed = allowed;
        self
    }

    /// Allows the fast path.
    #[must_use]
    pub fn with_fast_allowed(mut self, allowed: bool) -> Self {
        self.renderer_info.fast_allowed = allowed;
        self
    }

    /// Returns `true` for renderers.
    pub fn is_playback(&self) -> bool {
        self.audio_mode == AudioMode::Playback
    }

    /// Returns `true` while the stream is playing or recording.
    pub fn is_started(&self) -> bool {
        self.stream_status == StreamStatus::Started
    }

    /// Uid routing decisions are made for.
    pub fn real_uid(&self) -> i32 {
        if self.caller_uid == MEDIA_SERVICE_UID {
            self.app_info.uid
        } else {
            self.caller_uid
        }
    }

    /// Main device chosen by the current fetch.
    pub fn first_new_device(&self) -> Option<&DeviceDescriptor> {
        self.new_device_descs.first()
    }

    /// Main device before the current fetch.
    pub fn first_old_device(&self) -> Option<&DeviceDescriptor> {
        self.old_device_descs.first()
    }

    /// Returns `true` if the current fetch kept every device the stream was on.
    pub fn devices_unchanged(&self, offload_state: A2dpOffloadState) -> bool {
        !self.old_device_descs.is_empty()
            && self.old_device_descs.len() == self.new_device_descs.len()
            && self
                .new_device_descs
                .iter()
                .zip(&self.old_device_descs)
                .all(|(new, old)| new.is_same_device(old, offload_state))
    }

    /// Keeps the previous devices, undoing the current fetch for this stream.
    pub fn keep_old_devices(&mut self) {
        if !self.old_device_descs.is_empty() {
            self.new_device_descs = self.old_device_descs.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceRole, DeviceType};

    #[test]
    fn test_real_uid_through_media_service() {
        let desc = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default())
            .with_app(20_010, 300)
            .with_caller_uid(MEDIA_SERVICE_UID);
        assert_eq!(desc.real_uid(), 20_010);

        let direct = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_app(20_011, 301);
        assert_eq!(direct.real_uid(), 20_011);
    }

    #[test]
    fn test_capturer_mode() {
        let desc = StreamDescriptor::capturer(SourceType::Mic, StreamInfo::default());
        assert!(!desc.is_playback());
        assert_eq!(desc.capturer_info.source_type, SourceType::Mic);
    }

    #[test]
    fn test_devices_unchanged() {
        let speaker = DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output);
        let wired = DeviceDescriptor::new(DeviceType::WiredHeadset, DeviceRole::Output);
        let mut desc = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default());

        // never routed
        desc.new_device_descs = vec![speaker.clone()];
        assert!(!desc.devices_unchanged(A2dpOffloadState::NoDevice));

        desc.old_device_descs = vec![speaker.to_info()];
        assert!(desc.devices_unchanged(A2dpOffloadState::NoDevice));

        desc.new_device_descs = vec![wired];
        assert!(!desc.devices_unchanged(A2dpOffloadState::NoDevice));

        desc.keep_old_devices();
        assert!(desc.devices_unchanged(A2dpOffloadState::NoDevice));
    }

    #[test]
    fn test_ringer_usage() {
        assert!(StreamUsage::Ringtone.is_ringer_or_alarm());
        assert!(StreamUsage::Alarm.is_ringer_or_alarm());
        assert!(!StreamUsage::Music.is_ringer_or_alarm());
    }

    #[test]
    fn test_sample_format_bytes() {
        assert_eq!(SampleFormat::S16Le.bytes(), 2);
        assert_eq!(SampleFormat::S24Le.bytes(), 3);
        assert_eq!(SampleFormat::F32Le.bytes(), 4);
    }
}
