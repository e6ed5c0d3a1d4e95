//! Stream descriptors, routing flags and session ids.

mod descriptor;
mod flag;
mod session_id;

pub use descriptor::{
    AppInfo, AudioMode, CapturerInfo, ClientFlag, Encoding, RendererInfo, SampleFormat, SourceType,
    StreamAction, StreamDescriptor, StreamInfo, StreamStatus, StreamUsage, MEDIA_SERVICE_UID,
};
pub use flag::RouteFlag;
pub use session_id::{SessionIdGenerator, FIRST_SESSION_ID, MAX_SESSION_ID};
