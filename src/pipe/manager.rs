//! Pipe table.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::DeviceDescriptor;
use crate::stream::{RouteFlag, SessionIdGenerator, StreamAction, StreamDescriptor, StreamStatus};

use super::info::{PipeAction, PipeInfo, PipeRole};

#[derive(Debug, Default)]
struct PipeTable {
    pipes: Vec<PipeInfo>,
    modem: BTreeMap<u32, StreamDescriptor>,
}

/// Table of pipes and the streams they carry.
///
/// Also holds modem call sessions, which never occupy a pipe. Each method
/// takes the lock for the duration of one read or one atomic mutation;
/// callers get clones.
#[derive(Debug, Default)]
pub struct PipeManager {
    table: Mutex<PipeTable>,
}

fn settle(mut pipe: PipeInfo) -> PipeInfo {
    pipe.action = PipeAction::Default;
    for stream in &mut pipe.streams {
        stream.stream_action = StreamAction::Default;
    }
    pipe
}

impl PipeManager {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pipe, settling its pending actions.
    pub fn add_pipe(&self, pipe: PipeInfo) {
        info!(pipe = %pipe, "add pipe");
        self.table.lock().pipes.push(settle(pipe));
    }

    /// Replaces the pipe with the same name, or adds it.
    pub fn update_pipe(&self, pipe: PipeInfo) {
        let pipe = settle(pipe);
        let mut table = self.table.lock();
        if let Some(slot) = table.pipes.iter_mut().find(|p| p.name == pipe.name) {
            *slot = pipe;
        } else {
            table.pipes.push(pipe);
        }
    }

    /// Removes a pipe by name.
    pub fn remove_pipe(&self, name: &str) -> Option<PipeInfo> {
        let mut table = self.table.lock();
        let pos = table.pipes.iter().position(|p| p.name == name)?;
        info!(pipe = name, "remove pipe");
        Some(table.pipes.remove(pos))
    }

    /// Removes a pipe by port id.
    pub fn remove_pipe_by_id(&self, id: u32) -> Option<PipeInfo> {
        let mut table = self.table.lock();
        let pos = table.pipes.iter().position(|p| p.id == id && p.is_open())?;
        Some(table.pipes.remove(pos))
    }

    /// Returns every pipe.
    pub fn pipes(&self) -> Vec<PipeInfo> {
        self.table.lock().pipes.clone()
    }

    /// Returns the pipes of one role.
    pub fn pipes_with_role(&self, role: PipeRole) -> Vec<PipeInfo> {
        self.table.lock().pipes.iter().filter(|p| p.role == role).cloned().collect()
    }

    /// Returns a pipe by name.
    pub fn pipe_by_name(&self, name: &str) -> Option<PipeInfo> {
        self.table.lock().pipes.iter().find(|p| p.name == name).cloned()
    }

    /// Returns the pipe with the given module name and flag.
    pub fn pipe_by_module_and_flag(&self, name: &str, flag: RouteFlag) -> Option<PipeInfo> {
        self.table
            .lock()
            .pipes
            .iter()
            .find(|p| p.module_info.name == name && p.route_flag == flag)
            .cloned()
    }

    /// Returns pipes that carry no stream.
    pub fn unused_pipes(&self) -> Vec<PipeInfo> {
        self.table
            .lock()
            .pipes
            .iter()
            .filter(|p| p.streams.is_empty())
            .cloned()
            .collect()
    }

    /// Removes and returns every pipe that carries no stream.
    pub fn take_unused_pipes(&self) -> Vec<PipeInfo> {
        let mut table = self.table.lock();
        let (unused, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut table.pipes)
            .into_iter()
            .partition(|p| p.streams.is_empty());
        table.pipes = kept;
        unused
    }

    /// Replaces every output pipe with the result of a fetch pass.
    pub fn update_renderer_pipe_infos(&self, pipes: Vec<PipeInfo>) {
        self.replace_role(PipeRole::Output, pipes);
    }

    /// Replaces every input pipe with the result of a fetch pass.
    pub fn update_capturer_pipe_infos(&self, pipes: Vec<PipeInfo>) {
        self.replace_role(PipeRole::Input, pipes);
    }

    fn replace_role(&self, role: PipeRole, pipes: Vec<PipeInfo>) {
        let mut table = self.table.lock();
        table.pipes.retain(|p| p.role != role);
        table
            .pipes
            .extend(pipes.into_iter().filter(|p| p.role == role).map(settle));
        debug!(?role, total = table.pipes.len(), "pipe table replaced");
    }

    /// Returns a stream by session id.
    pub fn stream_desc_by_id(&self, session_id: u32) -> Option<StreamDescriptor> {
        self.table
            .lock()
            .pipes
            .iter()
            .flat_map(|p| &p.streams)
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    /// Replaces the stored record of a stream.
    pub fn update_stream(&self, desc: &StreamDescriptor) -> bool {
        let mut table = self.table.lock();
        let slot = table
            .pipes
            .iter_mut()
            .flat_map(|p| p.streams.iter_mut())
            .find(|s| s.session_id == desc.session_id);
        match slot {
            Some(slot) => {
                *slot = desc.clone();
                true
            }
            None => false,
        }
    }

    /// Number of streams in all pipes.
    pub fn stream_count(&self) -> usize {
        self.table.lock().pipes.iter().map(|p| p.streams.len()).sum()
    }

    /// Every playback stream.
    pub fn all_output_stream_descs(&self) -> Vec<StreamDescriptor> {
        self.streams_with_role(PipeRole::Output)
    }

    /// Every capture stream.
    pub fn all_input_stream_descs(&self) -> Vec<StreamDescriptor> {
        self.streams_with_role(PipeRole::Input)
    }

    fn streams_with_role(&self, role: PipeRole) -> Vec<StreamDescriptor> {
        self.table
            .lock()
            .pipes
            .iter()
            .filter(|p| p.role == role)
            .flat_map(|p| p.streams.iter().cloned())
            .collect()
    }

    /// Streams carried by the pipe with the given port id.
    pub fn stream_descs_by_io_handle(&self, id: u32) -> Vec<StreamDescriptor> {
        self.table
            .lock()
            .pipes
            .iter()
            .find(|p| p.id == id && p.is_open())
            .map(|p| p.streams.clone())
            .unwrap_or_default()
    }

    /// Audio server module index of the pipe with the given port id.
    pub fn pa_index_by_io_handle(&self, id: u32) -> Option<u32> {
        self.table
            .lock()
            .pipes
            .iter()
            .find(|p| p.id == id && p.is_open())
            .map(|p| p.pa_index)
    }

    /// Adapter of the pipe carrying a session.
    pub fn adapter_name_by_session_id(&self, session_id: u32) -> Option<String> {
        self.table
            .lock()
            .pipes
            .iter()
            .find(|p| p.contains_session(session_id))
            .map(|p| p.adapter_name.clone())
    }

    /// Main device of a session.
    pub fn process_device_info_by_session_id(&self, session_id: u32) -> Option<DeviceDescriptor> {
        self.stream_desc_by_id(session_id)?.new_device_descs.into_iter().next()
    }

    /// Sessions carried by offload pipes.
    pub fn offload_session_ids(&self) -> Vec<u32> {
        self.table
            .lock()
            .pipes
            .iter()
            .filter(|p| p.route_flag.contains(RouteFlag::LOWPOWER))
            .flat_map(|p| p.streams.iter().map(|s| s.session_id))
            .collect()
    }

    /// Number of sessions carried by offload pipes.
    pub fn pcm_offload_session_count(&self) -> usize {
        self.offload_session_ids().len()
    }

    /// Sets a stream's lifecycle state. Returns `false` for unknown sessions.
    pub fn update_client_status(&self, session_id: u32, status: StreamStatus) -> bool {
        let mut table = self.table.lock();
        let found = table
            .pipes
            .iter_mut()
            .flat_map(|p| p.streams.iter_mut())
            .find(|s| s.session_id == session_id);
        match found {
            Some(stream) => {
                stream.stream_status = status;
                true
            }
            None => false,
        }
    }

    /// Sets a stream's ordering key.
    pub fn update_start_time(&self, session_id: u32, start_time: u64) {
        let mut table = self.table.lock();
        if let Some(stream) = table
            .pipes
            .iter_mut()
            .flat_map(|p| p.streams.iter_mut())
            .find(|s| s.session_id == session_id)
        {
            stream.start_time = start_time;
        }
    }

    /// Removes a stream from its pipe. The pipe stays, possibly empty.
    pub fn remove_client(&self, session_id: u32) -> Option<StreamDescriptor> {
        let mut table = self.table.lock();
        for pipe in &mut table.pipes {
            if let Some(pos) = pipe.streams.iter().position(|s| s.session_id == session_id) {
                info!(session_id, pipe = %pipe.name, "remove client");
                return Some(pipe.streams.remove(pos));
            }
        }
        None
    }

    /// Parks a modem call session.
    pub fn add_modem_communication(&self, desc: StreamDescriptor) {
        if !SessionIdGenerator::is_valid(desc.session_id) {
            warn!(session_id = desc.session_id, "modem session id outside the generated range");
        }
        self.table.lock().modem.insert(desc.session_id, desc);
    }

    /// Removes a modem call session.
    pub fn remove_modem_communication(&self, session_id: u32) -> Option<StreamDescriptor> {
        self.table.lock().modem.remove(&session_id)
    }

    /// Returns `true` if any modem call session exists.
    pub fn is_modem_communication_id_exist(&self) -> bool {
        !self.table.lock().modem.is_empty()
    }

    /// Returns `true` if the session is a modem call session.
    pub fn is_modem_session(&self, session_id: u32) -> bool {
        self.table.lock().modem.contains_key(&session_id)
    }

    /// Returns the modem call sessions.
    pub fn modem_communication_map(&self) -> BTreeMap<u32, StreamDescriptor> {
        self.table.lock().modem.clone()
    }

    /// Sets the lifecycle state of every modem call session.
    pub fn update_modem_stream_status(&self, status: StreamStatus) {
        for desc in self.table.lock().modem.values_mut() {
            desc.stream_status = status;
        }
    }

    /// Routes every modem call session to `devices`.
    pub fn update_modem_stream_device(&self, devices: &[DeviceDescriptor]) {
        for desc in self.table.lock().modem.values_mut() {
            desc.old_device_descs = std::mem::take(&mut desc.new_device_descs);
            desc.new_device_descs = devices.iter().map(DeviceDescriptor::to_info).collect();
        }
    }

    /// Human readable snapshot of the table.
    pub fn dump(&self) -> String {
        let table = self.table.lock();
        let mut out = String::new();
        let _ = writeln!(out, "pipes: {}", table.pipes.len());
        for pipe in &table.pipes {
            let _ = writeln!(out, "  {pipe}");
            for stream in &pipe.streams {
                let device = stream
                    .first_new_device()
                    .map_or_else(|| "none".to_string(), ToString::to_string);
                let _ = writeln!(
                    out,
                    "    session {} {:?} {:?} flag={} device={device}",
                    stream.session_id, stream.audio_mode, stream.stream_status, stream.route_flag
                );
            }
        }
        let _ = writeln!(out, "modem sessions: {}", table.modem.len());
        for id in table.modem.keys() {
            let _ = writeln!(out, "  session {id}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceRole, DeviceType};
    use crate::pipe::info::{module_info_for, PRIMARY_OUTPUT};
    use crate::stream::{StreamInfo, StreamUsage};

    fn stream(session_id: u32) -> StreamDescriptor {
        let mut desc = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_session_id(session_id);
        desc.new_device_descs = vec![DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output)];
        desc
    }

    fn pipe(name: &str, id: u32, streams: Vec<StreamDescriptor>) -> PipeInfo {
        let device = DeviceDescriptor::new(DeviceType::Speaker, DeviceRole::Output);
        PipeInfo {
            id,
            pa_index: id + 10,
            role: PipeRole::Output,
            route_flag: RouteFlag::NORMAL,
            adapter_name: "primary".to_string(),
            name: name.to_string(),
            module_info: module_info_for("primary", name, PipeRole::Output, &stream(1), &device),
            action: PipeAction::New,
            streams,
        }
    }

    #[test]
    fn test_add_settles_actions() {
        let manager = PipeManager::new();
        let mut s = stream(100_001);
        s.stream_action = StreamAction::New;
        manager.add_pipe(pipe(PRIMARY_OUTPUT, 1, vec![s]));

        let pipes = manager.pipes();
        assert_eq!(pipes[0].action, PipeAction::Default);
        assert_eq!(pipes[0].streams[0].stream_action, StreamAction::Default);
    }

    #[test]
    fn test_session_lookups() {
        let manager = PipeManager::new();
        manager.add_pipe(pipe(PRIMARY_OUTPUT, 1, vec![stream(100_001)]));

        assert_eq!(manager.adapter_name_by_session_id(100_001).as_deref(), Some("primary"));
        assert_eq!(
            manager.process_device_info_by_session_id(100_001).map(|d| d.device_type),
            Some(DeviceType::Speaker)
        );
        assert_eq!(manager.pa_index_by_io_handle(1), Some(11));
        assert_eq!(manager.stream_descs_by_io_handle(1).len(), 1);
        assert!(manager.stream_desc_by_id(5).is_none());
    }

    #[test]
    fn test_remove_client_leaves_unused_pipe() {
        let manager = PipeManager::new();
        manager.add_pipe(pipe(PRIMARY_OUTPUT, 1, vec![stream(100_001)]));

        assert!(manager.remove_client(100_001).is_some());
        assert_eq!(manager.unused_pipes().len(), 1);

        let taken = manager.take_unused_pipes();
        assert_eq!(taken.len(), 1);
        assert!(manager.pipes().is_empty());
    }

    #[test]
    fn test_replace_role_keeps_other_role() {
        let manager = PipeManager::new();
        manager.add_pipe(pipe(PRIMARY_OUTPUT, 1, vec![stream(100_001)]));
        let mut input = pipe("primary_input", 2, Vec::new());
        input.role = PipeRole::Input;
        manager.add_pipe(input);

        manager.update_renderer_pipe_infos(vec![pipe("a2dp_output", 3, vec![stream(100_001)])]);
        let names: Vec<_> = manager.pipes().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["primary_input".to_string(), "a2dp_output".to_string()]);
    }

    #[test]
    fn test_client_status() {
        let manager = PipeManager::new();
        manager.add_pipe(pipe(PRIMARY_OUTPUT, 1, vec![stream(100_001)]));
        assert!(manager.update_client_status(100_001, StreamStatus::Started));
        assert!(manager.stream_desc_by_id(100_001).unwrap().is_started());
        assert!(!manager.update_client_status(9, StreamStatus::Started));
    }

    #[test]
    fn test_modem_map() {
        let manager = PipeManager::new();
        manager.add_modem_communication(stream(100_005));
        assert!(manager.is_modem_communication_id_exist());

        manager.update_modem_stream_status(StreamStatus::Started);
        let speaker = DeviceDescriptor::new(DeviceType::Earpiece, DeviceRole::Output);
        manager.update_modem_stream_device(&[speaker]);
        let modem = manager.modem_communication_map();
        assert!(modem[&100_005].is_started());
        assert_eq!(modem[&100_005].new_device_descs[0].device_type, DeviceType::Earpiece);

        assert!(manager.remove_modem_communication(100_005).is_some());
        assert!(!manager.is_modem_communication_id_exist());
    }

    #[test]
    fn test_dump_lists_sessions() {
        let manager = PipeManager::new();
        manager.add_pipe(pipe(PRIMARY_OUTPUT, 1, vec![stream(100_001)]));
        let dump = manager.dump();
        assert!(dump.contains("primary_output"));
        assert!(dump.contains("session 100001"));
    }
}
