//! Unused pipe cleanup and delayed offload release.
//!
//! An idle offload port is expensive to reopen, so when its pipe empties the
//! port is parked rather than closed. A fetch that needs an offload pipe
//! within [`CoreConfig::offload_close_wait`](crate::CoreConfig) adopts the
//! parked port; otherwise a background task closes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::facade::HdiAdapter;
use crate::pipe::{PipeInfo, PortHandle};
use crate::stream::RouteFlag;

use super::AudioCoreService;

#[derive(Debug)]
struct Parked {
    pipe: PipeInfo,
    generation: u64,
}

/// The parked offload port, if any.
#[derive(Debug, Default)]
pub(crate) struct OffloadState {
    parked: Mutex<Option<Parked>>,
    generation: AtomicU64,
}

impl OffloadState {
    /// Parks a pipe, returning the one it displaced.
    fn park(&self, pipe: PipeInfo) -> (u64, Option<PipeInfo>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let displaced = self.parked.lock().replace(Parked { pipe, generation });
        (generation, displaced.map(|p| p.pipe))
    }

    /// Takes the parked pipe if it is still the one parked at `generation`.
    fn take_if_generation(&self, generation: u64) -> Option<PipeInfo> {
        let mut parked = self.parked.lock();
        if parked.as_ref().is_some_and(|p| p.generation == generation) {
            parked.take().map(|p| p.pipe)
        } else {
            None
        }
    }

    /// Takes the parked port if it belongs to a pipe named `name`.
    pub(crate) fn adopt(&self, name: &str) -> Option<PortHandle> {
        let mut parked = self.parked.lock();
        if parked.as_ref().is_some_and(|p| p.pipe.name == name) {
            parked.take().map(|p| p.pipe.port())
        } else {
            None
        }
    }

    /// Name of the parked pipe.
    #[cfg(test)]
    pub(crate) fn parked_name(&self) -> Option<String> {
        self.parked.lock().as_ref().map(|p| p.pipe.name.clone())
    }
}

async fn close_port(hdi: &dyn HdiAdapter, pipe: &PipeInfo) {
    info!(pipe = %pipe.name, id = pipe.id, "close pipe");
    if let Err(e) = hdi.close_audio_port(pipe.port()).await {
        warn!(pipe = %pipe.name, error = %e, "close audio port failed");
    }
}

impl AudioCoreService {
    /// Removes every pipe that carries no stream and closes its port.
    ///
    /// Offload ports are parked instead; see the module docs.
    pub(crate) async fn remove_unused_pipes(&self) {
        for pipe in self.pipes.take_unused_pipes() {
            if !pipe.is_open() {
                debug!(pipe = %pipe.name, "drop unopened pipe");
                continue;
            }
            if pipe.route_flag.contains(RouteFlag::LOWPOWER) {
                self.park_offload_pipe(pipe).await;
                continue;
            }
            close_port(self.hdi.as_ref(), &pipe).await;
        }
    }

    async fn park_offload_pipe(&self, pipe: PipeInfo) {
        let wait = self.config.offload_close_wait;
        info!(pipe = %pipe.name, ?wait, "park idle offload pipe");
        let (generation, displaced) = self.offload.park(pipe);
        if let Some(displaced) = displaced {
            close_port(self.hdi.as_ref(), &displaced).await;
        }

        let hdi = Arc::clone(&self.hdi);
        let gate = Arc::clone(&self.fetch_gate);
        let offload = Arc::clone(&self.offload);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _gate = gate.lock().await;
            if let Some(pipe) = offload.take_if_generation(generation) {
                close_port(hdi.as_ref(), &pipe).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_support::Harness;
    use super::*;
    use crate::mock::HdiCall;
    use crate::pipe::OFFLOAD_OUTPUT;
    use crate::stream::{StreamDescriptor, StreamInfo, StreamUsage};

    fn offload_music() -> StreamDescriptor {
        StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default())
            .with_app(20_010, 300)
            .with_offload_allowed(true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_offload_port_closed_after_wait() {
        let h = Harness::new();
        let created = h.service.create_renderer_client(offload_music()).await.unwrap();
        let pipe = h.service.pipe_manager().pipe_by_name(OFFLOAD_OUTPUT).unwrap();

        h.service.release_client(created.session_id).await.unwrap();
        assert!(h.service.pipe_manager().pipe_by_name(OFFLOAD_OUTPUT).is_none());
        assert_eq!(h.service.offload.parked_name().as_deref(), Some(OFFLOAD_OUTPUT));
        assert!(!h.hdi.calls().contains(&HdiCall::CloseAudioPort(pipe.id)));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.hdi.calls().contains(&HdiCall::CloseAudioPort(pipe.id)));
        assert!(h.service.offload.parked_name().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_offload_stream_adopts_parked_port() {
        let h = Harness::new();
        let first = h.service.create_renderer_client(offload_music()).await.unwrap();
        let pipe = h.service.pipe_manager().pipe_by_name(OFFLOAD_OUTPUT).unwrap();
        h.service.release_client(first.session_id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = h.service.create_renderer_client(offload_music()).await.unwrap();
        assert_eq!(second.route_flag, RouteFlag::LOWPOWER);

        let adopted = h.service.pipe_manager().pipe_by_name(OFFLOAD_OUTPUT).unwrap();
        assert_eq!(adopted.id, pipe.id);
        let opens = h
            .hdi
            .count(|c| matches!(c, HdiCall::OpenAudioPort(name) if name == OFFLOAD_OUTPUT));
        assert_eq!(opens, 1);

        // the pending close no longer applies
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!h.hdi.calls().contains(&HdiCall::CloseAudioPort(pipe.id)));
    }

    #[tokio::test]
    async fn test_normal_pipe_closed_immediately() {
        let h = Harness::new();
        let created = h
            .service
            .create_renderer_client(super::super::test_support::music())
            .await
            .unwrap();
        let pipe = h.service.pipe_manager().pipe_by_name("primary_output").unwrap();

        h.service.release_client(created.session_id).await.unwrap();
        assert!(h.hdi.calls().contains(&HdiCall::CloseAudioPort(pipe.id)));
        assert!(h.service.pipe_manager().pipes().is_empty());
    }
}
