//! Worker task that serializes requests to the routing core.
//!
//! Every request is a command on one bounded queue; the worker runs them
//! one at a time, in arrival order, and answers on a oneshot channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::device::DeviceDescriptor;
use crate::event::DeviceChangeReason;
use crate::scene::{AudioScene, RingerMode};
use crate::stream::{AudioMode, StreamDescriptor, StreamStatus, StreamUsage};
use crate::{AudioCoreService, CreatedClient, RouteError};

type Reply<T> = oneshot::Sender<Result<T, RouteError>>;

/// Command sent to the core worker.
pub(crate) enum CoreCommand {
    CreateRenderer { desc: StreamDescriptor, reply: Reply<CreatedClient> },
    CreateCapturer { desc: StreamDescriptor, reply: Reply<CreatedClient> },
    Start { session_id: u32, reply: Reply<()> },
    Pause { session_id: u32, reply: Reply<()> },
    Stop { session_id: u32, reply: Reply<()> },
    Release { session_id: u32, reply: Reply<()> },
    UpdateTracker { mode: AudioMode, session_id: u32, status: StreamStatus, reply: Reply<()> },
    DeviceConnected { device: DeviceDescriptor, reply: Reply<()> },
    DeviceDisconnected { device: DeviceDescriptor, reply: Reply<()> },
    SetAudioScene { scene: AudioScene, reply: Reply<()> },
    SetRingerMode { mode: RingerMode, reply: Reply<()> },
    SetPreferredDevice { usage: StreamUsage, device: Option<DeviceDescriptor>, reply: Reply<()> },
    SelectOutputDevice { uid: i32, device: Option<DeviceDescriptor>, reply: Reply<()> },
    SelectInputDevice { uid: i32, device: Option<DeviceDescriptor>, reply: Reply<()> },
    ClientDied { uid: i32, reply: Reply<()> },
    TriggerFetch { reason: DeviceChangeReason, reply: Reply<()> },
    /// Stop the worker after the commands already queued.
    Shutdown,
}

async fn handle(service: &AudioCoreService, cmd: CoreCommand) {
    // A dropped receiver only means the caller stopped waiting.
    match cmd {
        CoreCommand::CreateRenderer { desc, reply } => {
            let _ = reply.send(service.create_renderer_client(desc).await);
        }
        CoreCommand::CreateCapturer { desc, reply } => {
            let _ = reply.send(service.create_capturer_client(desc).await);
        }
        CoreCommand::Start { session_id, reply } => {
            let _ = reply.send(service.start_client(session_id).await);
        }
        CoreCommand::Pause { session_id, reply } => {
            let _ = reply.send(service.pause_client(session_id).await);
        }
        CoreCommand::Stop { session_id, reply } => {
            let _ = reply.send(service.stop_client(session_id).await);
        }
        CoreCommand::Release { session_id, reply } => {
            let _ = reply.send(service.release_client(session_id).await);
        }
        CoreCommand::UpdateTracker {
            mode,
            session_id,
            status,
            reply,
        } => {
            let _ = reply.send(service.update_tracker(mode, session_id, status).await);
        }
        CoreCommand::DeviceConnected { device, reply } => {
            let _ = reply.send(service.on_device_connected(device).await);
        }
        CoreCommand::DeviceDisconnected { device, reply } => {
            let _ = reply.send(service.on_device_disconnected(&device).await);
        }
        CoreCommand::SetAudioScene { scene, reply } => {
            let _ = reply.send(service.set_audio_scene(scene).await);
        }
        CoreCommand::SetRingerMode { mode, reply } => {
            let _ = reply.send(service.set_ringer_mode(mode).await);
        }
        CoreCommand::SetPreferredDevice { usage, device, reply } => {
            let _ = reply.send(service.set_preferred_device(usage, device).await);
        }
        CoreCommand::SelectOutputDevice { uid, device, reply } => {
            let _ = reply.send(service.select_output_device(uid, device).await);
        }
        CoreCommand::SelectInputDevice { uid, device, reply } => {
            let _ = reply.send(service.select_input_device(uid, device).await);
        }
        CoreCommand::ClientDied { uid, reply } => {
            let _ = reply.send(service.on_client_died(uid).await);
        }
        CoreCommand::TriggerFetch { reason, reply } => {
            let _ = reply.send(service.trigger_fetch_device(reason).await);
        }
        CoreCommand::Shutdown => {}
    }
}

async fn run(service: Arc<AudioCoreService>, mut cmd_rx: mpsc::Receiver<CoreCommand>, running: Arc<AtomicBool>) {
    info!("core worker started");
    while let Some(cmd) = cmd_rx.recv().await {
        if matches!(cmd, CoreCommand::Shutdown) {
            debug!("core worker shutdown requested");
            break;
        }
        handle(&service, cmd).await;
    }
    running.store(false, Ordering::SeqCst);
    info!("core worker stopped");
}

/// Starts a worker that runs requests against `service` one at a time.
///
/// `capacity` bounds the number of queued requests; senders wait when the
/// queue is full. Must be called inside a Tokio runtime.
pub fn spawn_core_worker(service: Arc<AudioCoreService>, capacity: usize) -> CoreHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
    let running = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(run(Arc::clone(&service), cmd_rx, Arc::clone(&running)));
    CoreHandle {
        service,
        cmd_tx,
        running,
        task: Some(task),
    }
}

/// Handle to a running core worker.
///
/// Each method queues one request and waits for its result. Requests from
/// every clone of the sender are processed in the order they were queued.
///
/// # Lifecycle
///
/// 1. Created by [`spawn_core_worker`] or
///    [`AudioCoreServiceBuilder::spawn()`](crate::AudioCoreServiceBuilder::spawn)
/// 2. Requests run in the background worker
/// 3. Call [`stop()`](CoreHandle::stop) to finish queued work and exit
/// 4. Dropping the handle also stops the worker (but prefer explicit `stop()`)
pub struct CoreHandle {
    service: Arc<AudioCoreService>,
    cmd_tx: mpsc::Sender<CoreCommand>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CoreHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> CoreCommand) -> Result<T, RouteError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RouteError::WorkerStopped)?;
        reply_rx.await.map_err(|_| RouteError::WorkerStopped)?
    }

    /// The service behind the worker, for read-only queries.
    pub fn service(&self) -> &Arc<AudioCoreService> {
        &self.service
    }

    /// Returns `true` while the worker accepts requests.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// See [`AudioCoreService::create_renderer_client`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn create_renderer_client(&self, desc: StreamDescriptor) -> Result<CreatedClient, RouteError> {
        self.request(|reply| CoreCommand::CreateRenderer { desc, reply }).await
    }

    /// See [`AudioCoreService::create_capturer_client`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn create_capturer_client(&self, desc: StreamDescriptor) -> Result<CreatedClient, RouteError> {
        self.request(|reply| CoreCommand::CreateCapturer { desc, reply }).await
    }

    /// See [`AudioCoreService::start_client`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn start_client(&self, session_id: u32) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::Start { session_id, reply }).await
    }

    /// See [`AudioCoreService::pause_client`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn pause_client(&self, session_id: u32) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::Pause { session_id, reply }).await
    }

    /// See [`AudioCoreService::stop_client`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn stop_client(&self, session_id: u32) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::Stop { session_id, reply }).await
    }

    /// See [`AudioCoreService::release_client`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn release_client(&self, session_id: u32) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::Release { session_id, reply }).await
    }

    /// See [`AudioCoreService::update_tracker`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn update_tracker(&self, mode: AudioMode, session_id: u32, status: StreamStatus) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::UpdateTracker {
            mode,
            session_id,
            status,
            reply,
        })
        .await
    }

    /// See [`AudioCoreService::on_device_connected`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn on_device_connected(&self, device: DeviceDescriptor) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::DeviceConnected { device, reply }).await
    }

    /// See [`AudioCoreService::on_device_disconnected`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn on_device_disconnected(&self, device: DeviceDescriptor) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::DeviceDisconnected { device, reply }).await
    }

    /// See [`AudioCoreService::set_audio_scene`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn set_audio_scene(&self, scene: AudioScene) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::SetAudioScene { scene, reply }).await
    }

    /// See [`AudioCoreService::set_ringer_mode`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn set_ringer_mode(&self, mode: RingerMode) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::SetRingerMode { mode, reply }).await
    }

    /// See [`AudioCoreService::set_preferred_device`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn set_preferred_device(
        &self,
        usage: StreamUsage,
        device: Option<DeviceDescriptor>,
    ) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::SetPreferredDevice { usage, device, reply })
            .await
    }

    /// See [`AudioCoreService::select_output_device`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn select_output_device(&self, uid: i32, device: Option<DeviceDescriptor>) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::SelectOutputDevice { uid, device, reply })
            .await
    }

    /// See [`AudioCoreService::select_input_device`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn select_input_device(&self, uid: i32, device: Option<DeviceDescriptor>) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::SelectInputDevice { uid, device, reply })
            .await
    }

    /// See [`AudioCoreService::on_client_died`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn on_client_died(&self, uid: i32) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::ClientDied { uid, reply }).await
    }

    /// See [`AudioCoreService::trigger_fetch_device`].
    ///
    /// # Errors
    ///
    /// The service's error, or [`RouteError::WorkerStopped`].
    pub async fn trigger_fetch_device(&self, reason: DeviceChangeReason) -> Result<(), RouteError> {
        self.request(|reply| CoreCommand::TriggerFetch { reason, reply }).await
    }

    /// Finishes the queued requests and stops the worker.
    pub async fn stop(mut self) {
        self.stop_internal().await;
    }

    async fn stop_internal(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(CoreCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            let _ = self.cmd_tx.try_send(CoreCommand::Shutdown);
        }
    }
}

impl std::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceRegistry, DeviceRole, DeviceType};
    use crate::mock::{MockBluetooth, MockHdiAdapter, MockStreamCollector};
    use crate::stream::{SessionIdGenerator, StreamInfo};
    use crate::CoreConfig;

    fn service() -> Arc<AudioCoreService> {
        Arc::new(
            AudioCoreService::new(
                CoreConfig::default(),
                Arc::new(DeviceRegistry::with_builtin_devices()),
                Arc::new(MockHdiAdapter::new()),
                Arc::new(MockBluetooth::new()),
                Arc::new(MockStreamCollector::new()),
            )
            .with_session_ids(Arc::new(SessionIdGenerator::new())),
        )
    }

    fn music() -> StreamDescriptor {
        StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_app(20_010, 300)
    }

    #[tokio::test]
    async fn test_requests_run_in_order() {
        let handle = spawn_core_worker(service(), 4);
        let created = handle.create_renderer_client(music()).await.unwrap();
        handle.start_client(created.session_id).await.unwrap();

        let headset = DeviceDescriptor::new(DeviceType::WiredHeadset, DeviceRole::Output);
        handle.on_device_connected(headset).await.unwrap();
        let stream = handle
            .service()
            .pipe_manager()
            .stream_desc_by_id(created.session_id)
            .unwrap();
        assert_eq!(stream.new_device_descs[0].device_type, DeviceType::WiredHeadset);

        handle.release_client(created.session_id).await.unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_sessions() {
        let handle = Arc::new(spawn_core_worker(service(), 2));
        let creates = (0..8).map(|_| {
            let handle = Arc::clone(&handle);
            async move { handle.create_renderer_client(music()).await }
        });
        let results = futures::future::join_all(creates).await;
        let mut ids: Vec<u32> = results.into_iter().map(|r| r.unwrap().session_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(handle.service().pipe_manager().stream_count(), 8);
    }

    #[tokio::test]
    async fn test_stopped_worker_rejects_requests() {
        let mut handle = spawn_core_worker(service(), 1);
        assert!(handle.is_running());
        handle.stop_internal().await;
        assert!(!handle.is_running());

        let result = handle.start_client(1).await;
        assert!(matches!(result, Err(RouteError::WorkerStopped)));
    }

    #[tokio::test]
    async fn test_worker_reports_service_errors() {
        let handle = spawn_core_worker(service(), 1);
        let result = handle.release_client(99).await;
        assert!(matches!(result, Err(RouteError::SessionNotFound { session_id: 99 })));
        handle.stop().await;
    }
}
