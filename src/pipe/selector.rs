//! Stream to pipe assignment.
//!
//! The selector works on copies of the pipe table. It decides, for every
//! stream, which pipe carries it and what the executor must do
//! ([`StreamAction`]) and, for every pipe, whether its port must be opened or
//! its membership changed ([`PipeAction`]). It performs no I/O.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::AdapterTable;
use crate::stream::{AudioMode, RouteFlag, StreamAction, StreamDescriptor};

use super::concurrency::{ConcurrencyAction, ConcurrencyRules, PipeType};
use super::info::{module_info_for, pipe_name, PipeAction, PipeInfo, PipeRole, HDI_INVALID_ID};

/// Where a stream sat before the current pass.
#[derive(Debug, Clone)]
struct Placement {
    name: String,
    adapter_name: String,
    route_flag: RouteFlag,
    open: bool,
}

impl Placement {
    fn of(pipe: &PipeInfo) -> Self {
        Self {
            name: pipe.name.clone(),
            adapter_name: pipe.adapter_name.clone(),
            route_flag: pipe.route_flag,
            open: pipe.is_open(),
        }
    }
}

/// Assigns streams to pipes.
#[derive(Debug, Clone)]
pub struct PipeSelector {
    adapters: AdapterTable,
    rules: ConcurrencyRules,
}

impl PipeSelector {
    /// Creates a selector.
    pub fn new(adapters: AdapterTable, rules: ConcurrencyRules) -> Self {
        Self { adapters, rules }
    }

    /// Returns the adapter table.
    pub fn adapters(&self) -> &AdapterTable {
        &self.adapters
    }

    /// Adapter serving the stream's main device.
    pub fn adapter_for_stream(&self, stream: &StreamDescriptor) -> Option<String> {
        let device = stream.first_new_device()?;
        if device.is_none() {
            return None;
        }
        self.adapters.adapter_for(device)
    }

    /// Name of the pipe a stream would be placed in with its current flag.
    pub fn pipe_name_for(&self, stream: &StreamDescriptor) -> Option<String> {
        let adapter = self.adapter_for_stream(stream)?;
        let device = stream.first_new_device()?;
        Some(pipe_name(&adapter, role_of(stream), stream.route_flag, device))
    }

    /// Places one new stream.
    ///
    /// `current` holds the pipes of the stream's role. Every one of them is
    /// returned, plus a new pipe if none could take the stream.
    pub fn fetch_pipe(&self, current: Vec<PipeInfo>, stream: &mut StreamDescriptor) -> Vec<PipeInfo> {
        let mut pipes = current;
        for pipe in &mut pipes {
            pipe.action = PipeAction::Default;
        }
        self.apply_concurrency(&mut pipes, stream);
        stream.stream_action = StreamAction::New;

        let Some(adapter) = self.adapter_for_stream(stream) else {
            warn!(session_id = stream.session_id, "no adapter for stream device");
            return pipes;
        };

        if let Some(pipe) = pipes.iter_mut().find(|p| p.is_open() && p.matches(&adapter, stream.route_flag)) {
            pipe.streams.push(stream.clone());
            pipe.action = PipeAction::Update;
            info!(session_id = stream.session_id, pipe = %pipe.name, "use existing pipe");
            return pipes;
        }

        let mut pipe = self.new_pipe(adapter, stream);
        pipe.streams.push(stream.clone());
        info!(session_id = stream.session_id, pipe = %pipe.name, "use new pipe");
        pipes.push(pipe);
        pipes
    }

    /// Re-places every stream of one role.
    ///
    /// `current` holds the pipes of that role as they are in the table.
    /// Streams in `rerouted` changed device during this fetch; a stream that
    /// stays in its pipe gets [`StreamAction::Move`] if it is listed and
    /// [`StreamAction::Default`] otherwise. A pipe is marked
    /// [`PipeAction::Update`] only if a member arrived or has a non-default
    /// action, so re-running the selection on an unchanged system yields no
    /// work.
    pub fn fetch_pipes(
        &self,
        current: Vec<PipeInfo>,
        streams: &mut [StreamDescriptor],
        rerouted: &HashSet<u32>,
    ) -> Vec<PipeInfo> {
        if streams.is_empty() {
            return Vec::new();
        }

        let mut old_placement: HashMap<u32, Placement> = HashMap::new();
        for pipe in &current {
            for stream in &pipe.streams {
                old_placement.insert(stream.session_id, Placement::of(pipe));
            }
        }

        let mut pipes: Vec<PipeInfo> = current
            .into_iter()
            .map(|mut pipe| {
                pipe.streams.clear();
                pipe.action = PipeAction::Default;
                pipe
            })
            .collect();

        streams.sort_by_key(|s| (s.start_time, s.session_id));

        for stream in streams.iter_mut() {
            let old = old_placement.get(&stream.session_id);
            if old.is_none() {
                self.apply_concurrency(&mut pipes, stream);
            }

            let Some(adapter) = self.adapter_for_stream(stream) else {
                // Nothing routable; leave the stream where it was.
                if let Some(pipe) = old.and_then(|o| pipes.iter_mut().find(|p| p.name == o.name)) {
                    stream.stream_action = StreamAction::Default;
                    pipe.streams.push(stream.clone());
                }
                warn!(session_id = stream.session_id, "no adapter for stream device, keeping placement");
                continue;
            };
            let changed = rerouted.contains(&stream.session_id);

            let target = pipes.iter_mut().find(|p| {
                (p.is_open() || p.action == PipeAction::New) && p.matches(&adapter, stream.route_flag)
            });
            if let Some(pipe) = target {
                stream.stream_action = match old {
                    None => StreamAction::New,
                    Some(old) => judge_stream_action(old, pipe, changed, !stream.old_device_descs.is_empty()),
                };
                let arrived = old.map_or(true, |o| o.name != pipe.name || !o.open);
                if pipe.action != PipeAction::New && (arrived || stream.stream_action != StreamAction::Default) {
                    pipe.action = PipeAction::Update;
                }
                pipe.streams.push(stream.clone());
                debug!(
                    session_id = stream.session_id,
                    pipe = %pipe.name,
                    action = ?stream.stream_action,
                    "use existing pipe"
                );
                continue;
            }

            let mut pipe = self.new_pipe(adapter, stream);
            stream.stream_action = match old {
                None => StreamAction::New,
                Some(old) => judge_stream_action(old, &pipe, changed, !stream.old_device_descs.is_empty()),
            };
            pipe.streams.push(stream.clone());
            info!(
                session_id = stream.session_id,
                pipe = %pipe.name,
                action = ?stream.stream_action,
                "use new pipe"
            );
            pipes.push(pipe);
        }

        // Unopened pipes only exist to remember their streams.
        pipes.retain(|p| p.is_open() || p.action == PipeAction::New || !p.streams.is_empty());
        pipes
    }

    fn apply_concurrency(&self, pipes: &mut [PipeInfo], incoming: &mut StreamDescriptor) {
        for pipe in pipes.iter_mut() {
            let mut updated = false;
            for existing in &mut pipe.streams {
                let action = self.rules.action(
                    PipeType::classify(existing.route_flag, existing.audio_mode),
                    PipeType::classify(incoming.route_flag, incoming.audio_mode),
                );
                match action {
                    ConcurrencyAction::PlayBoth => {}
                    ConcurrencyAction::ConcedeIncoming => {
                        incoming.route_flag = RouteFlag::NORMAL;
                    }
                    ConcurrencyAction::ConcedeExisting => {
                        if existing.audio_mode == AudioMode::Record && incoming.audio_mode == AudioMode::Record {
                            incoming.route_flag = RouteFlag::NORMAL;
                        }
                        existing.route_flag = RouteFlag::NORMAL;
                        existing.stream_action = StreamAction::Recreate;
                        updated = true;
                    }
                }
                if action != ConcurrencyAction::PlayBoth {
                    info!(
                        existing = existing.session_id,
                        incoming = incoming.session_id,
                        ?action,
                        "concurrency rule applied"
                    );
                }
            }
            if updated && pipe.action != PipeAction::New {
                pipe.action = PipeAction::Update;
            }
        }
    }

    fn new_pipe(&self, adapter: String, stream: &StreamDescriptor) -> PipeInfo {
        let role = role_of(stream);
        let device = stream.first_new_device().cloned().unwrap_or_default();
        let name = pipe_name(&adapter, role, stream.route_flag, &device);
        let module_info = module_info_for(&adapter, &name, role, stream, &device);
        PipeInfo {
            id: HDI_INVALID_ID,
            pa_index: HDI_INVALID_ID,
            role,
            route_flag: stream.route_flag,
            adapter_name: adapter,
            name,
            module_info,
            action: PipeAction::New,
            streams: Vec::new(),
        }
    }
}

fn role_of(stream: &StreamDescriptor) -> PipeRole {
    match stream.audio_mode {
        AudioMode::Playback => PipeRole::Output,
        AudioMode::Record => PipeRole::Input,
    }
}

fn judge_stream_action(old: &Placement, new_pipe: &PipeInfo, changed: bool, was_routed: bool) -> StreamAction {
    if !old.open {
        return if was_routed { StreamAction::Move } else { StreamAction::New };
    }
    if old.adapter_name == new_pipe.adapter_name && old.route_flag == new_pipe.route_flag {
        return if changed { StreamAction::Move } else { StreamAction::Default };
    }
    let offload_switch =
        old.route_flag.contains(RouteFlag::LOWPOWER) != new_pipe.route_flag.contains(RouteFlag::LOWPOWER);
    if old.route_flag.needs_recreate() || new_pipe.route_flag.needs_recreate() || offload_switch {
        StreamAction::Recreate
    } else {
        StreamAction::Move
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDescriptor, DeviceRole, DeviceType};
    use crate::stream::{SourceType, StreamInfo, StreamUsage};

    fn selector() -> PipeSelector {
        PipeSelector::new(AdapterTable::default(), ConcurrencyRules::default())
    }

    fn device(device_type: DeviceType) -> DeviceDescriptor {
        let role = if device_type == DeviceType::Mic {
            DeviceRole::Input
        } else {
            DeviceRole::Output
        };
        DeviceDescriptor::new(device_type, role)
    }

    fn renderer(session_id: u32, device_type: DeviceType, start_time: u64) -> StreamDescriptor {
        let mut stream = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_session_id(session_id);
        stream.new_device_descs = vec![device(device_type)];
        stream.start_time = start_time;
        stream
    }

    /// Runs the single-stream path and pretends every new port opened.
    fn place(selector: &PipeSelector, table: Vec<PipeInfo>, stream: &mut StreamDescriptor) -> Vec<PipeInfo> {
        let mut pipes = selector.fetch_pipe(table, stream);
        for (i, pipe) in pipes.iter_mut().enumerate() {
            if !pipe.is_open() {
                pipe.id = u32::try_from(i).unwrap();
                pipe.pa_index = pipe.id;
            }
            pipe.action = PipeAction::Default;
            for s in &mut pipe.streams {
                s.stream_action = StreamAction::Default;
                s.old_device_descs = s.new_device_descs.clone();
            }
        }
        pipes
    }

    #[test]
    fn test_single_stream_opens_new_pipe() {
        let selector = selector();
        let mut stream = renderer(100_001, DeviceType::Speaker, 1);
        let pipes = selector.fetch_pipe(Vec::new(), &mut stream);

        assert_eq!(pipes.len(), 1);
        assert_eq!(pipes[0].name, "primary_output");
        assert_eq!(pipes[0].action, PipeAction::New);
        assert_eq!(stream.stream_action, StreamAction::New);
    }

    #[test]
    fn test_single_stream_reuses_matching_pipe() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        let table = place(&selector, Vec::new(), &mut first);

        let mut second = renderer(100_002, DeviceType::Speaker, 2);
        let pipes = selector.fetch_pipe(table, &mut second);
        assert_eq!(pipes.len(), 1);
        assert_eq!(pipes[0].action, PipeAction::Update);
        assert_eq!(pipes[0].streams.len(), 2);
    }

    #[test]
    fn test_batch_unchanged_yields_no_actions() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        let table = place(&selector, Vec::new(), &mut first);
        let mut second = renderer(100_002, DeviceType::Speaker, 2);
        let table = place(&selector, table, &mut second);

        let mut streams: Vec<_> = table[0].streams.clone();
        let pipes = selector.fetch_pipes(table, &mut streams, &HashSet::new());
        assert!(pipes.iter().all(|p| p.action == PipeAction::Default));
        assert!(pipes
            .iter()
            .flat_map(|p| &p.streams)
            .all(|s| s.stream_action == StreamAction::Default));
    }

    #[test]
    fn test_batch_moves_to_new_adapter() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        let table = place(&selector, Vec::new(), &mut first);

        let mut streams = table[0].streams.clone();
        streams[0].new_device_descs = vec![device(DeviceType::BluetoothA2dp)];
        let rerouted = HashSet::from([100_001]);
        let pipes = selector.fetch_pipes(table, &mut streams, &rerouted);

        let a2dp = pipes.iter().find(|p| p.name == "a2dp_output").unwrap();
        assert_eq!(a2dp.action, PipeAction::New);
        assert_eq!(a2dp.streams[0].stream_action, StreamAction::Move);
        let primary = pipes.iter().find(|p| p.name == "primary_output").unwrap();
        assert!(primary.streams.is_empty());
        assert_eq!(primary.action, PipeAction::Default);
    }

    #[test]
    fn test_batch_same_pipe_device_change_moves() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        let table = place(&selector, Vec::new(), &mut first);

        let mut streams = table[0].streams.clone();
        streams[0].new_device_descs = vec![device(DeviceType::Earpiece)];
        let pipes = selector.fetch_pipes(table, &mut streams, &HashSet::from([100_001]));
        assert_eq!(pipes.len(), 1);
        assert_eq!(pipes[0].action, PipeAction::Update);
        assert_eq!(pipes[0].streams[0].stream_action, StreamAction::Move);
    }

    #[test]
    fn test_fast_path_change_recreates() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        first.route_flag = RouteFlag::FAST;
        let table = place(&selector, Vec::new(), &mut first);

        let mut streams = table[0].streams.clone();
        streams[0].new_device_descs = vec![device(DeviceType::BluetoothA2dp)];
        streams[0].route_flag = RouteFlag::NORMAL;
        let pipes = selector.fetch_pipes(table, &mut streams, &HashSet::from([100_001]));
        let a2dp = pipes.iter().find(|p| p.adapter_name == "a2dp").unwrap();
        assert_eq!(a2dp.streams[0].stream_action, StreamAction::Recreate);
    }

    #[test]
    fn test_offload_switch_recreates() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        first.route_flag = RouteFlag::LOWPOWER;
        let table = place(&selector, Vec::new(), &mut first);
        assert_eq!(table[0].name, "offload_output");

        let mut streams = table[0].streams.clone();
        streams[0].route_flag = RouteFlag::NORMAL;
        let pipes = selector.fetch_pipes(table, &mut streams, &HashSet::new());
        let primary = pipes.iter().find(|p| p.name == "primary_output").unwrap();
        assert_eq!(primary.streams[0].stream_action, StreamAction::Recreate);
    }

    #[test]
    fn test_concede_existing_capture() {
        let selector = selector();
        let mut first = StreamDescriptor::capturer(SourceType::Mic, StreamInfo::default()).with_session_id(100_001);
        first.new_device_descs = vec![device(DeviceType::Mic)];
        first.route_flag = RouteFlag::FAST;
        let table = place(&selector, Vec::new(), &mut first);

        let mut second = StreamDescriptor::capturer(SourceType::Mic, StreamInfo::default()).with_session_id(100_002);
        second.new_device_descs = vec![device(DeviceType::Mic)];
        second.route_flag = RouteFlag::FAST;
        let pipes = selector.fetch_pipe(table, &mut second);

        let fast = pipes.iter().find(|p| p.name == "fast_input").unwrap();
        assert_eq!(fast.action, PipeAction::Update);
        assert_eq!(fast.streams[0].stream_action, StreamAction::Recreate);
        assert!(fast.streams[0].route_flag.is_normal());
        // both capturers concede, so the newcomer lands on the normal path
        assert!(second.route_flag.is_normal());
        assert!(pipes.iter().any(|p| p.name == "primary_input" && p.action == PipeAction::New));
    }

    #[test]
    fn test_unopened_pipe_is_retried() {
        let selector = selector();
        let mut first = renderer(100_001, DeviceType::Speaker, 1);
        let mut table = selector.fetch_pipe(Vec::new(), &mut first);
        // port open failed: pipe stays in the table without an id
        table[0].action = PipeAction::Default;

        let mut streams = table[0].streams.clone();
        let pipes = selector.fetch_pipes(table, &mut streams, &HashSet::new());
        let opened: Vec<_> = pipes.iter().filter(|p| p.action == PipeAction::New).collect();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].streams.len(), 1);
        assert_eq!(pipes.len(), 1);
    }

    #[test]
    fn test_streams_sorted_by_start_time() {
        let selector = selector();
        let mut streams = vec![
            renderer(100_002, DeviceType::Speaker, 5),
            renderer(100_001, DeviceType::Speaker, 1),
        ];
        let pipes = selector.fetch_pipes(Vec::new(), &mut streams, &HashSet::new());
        assert_eq!(pipes[0].streams[0].session_id, 100_001);
    }
}
