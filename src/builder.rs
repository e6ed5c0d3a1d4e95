//! Builder pattern for `AudioCoreService`.

use std::sync::Arc;

use crate::device::DeviceRegistry;
use crate::facade::{BluetoothFacade, HdiAdapter, StreamCollector};
use crate::stream::SessionIdGenerator;
use crate::worker::{spawn_core_worker, CoreHandle};
use crate::{event_callback, AudioCoreService, CoreConfig, CoreEvent, EventCallback, RouteError};

/// Builder for configuring an [`AudioCoreService`].
///
/// The HAL adapter, Bluetooth facade and stream collector are required.
/// Without a registry the service starts with the built-in speaker and
/// microphone.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_route_core::mock::{MockBluetooth, MockHdiAdapter, MockStreamCollector};
/// use audio_route_core::AudioCoreServiceBuilder;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), audio_route_core::RouteError> {
/// let handle = AudioCoreServiceBuilder::new()
///     .hdi_adapter(Arc::new(MockHdiAdapter::new()))
///     .bluetooth(Arc::new(MockBluetooth::new()))
///     .stream_collector(Arc::new(MockStreamCollector::new()))
///     .on_event(|e| tracing::info!(?e, "core event"))
///     .spawn()
///     .await?;
///
/// handle.stop().await;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct AudioCoreServiceBuilder {
    config: CoreConfig,
    registry: Option<Arc<DeviceRegistry>>,
    hdi: Option<Arc<dyn HdiAdapter>>,
    bluetooth: Option<Arc<dyn BluetoothFacade>>,
    collector: Option<Arc<dyn StreamCollector>>,
    session_ids: Option<Arc<SessionIdGenerator>>,
    event_callback: Option<EventCallback>,
}

impl Default for AudioCoreServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCoreServiceBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            registry: None,
            hdi: None,
            bluetooth: None,
            collector: None,
            session_ids: None,
            event_callback: None,
        }
    }

    /// Uses an existing device registry.
    pub fn registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the audio HAL adapter.
    pub fn hdi_adapter<H: HdiAdapter + 'static>(mut self, hdi: Arc<H>) -> Self {
        self.hdi = Some(hdi);
        self
    }

    /// Sets the Bluetooth facade.
    pub fn bluetooth<B: BluetoothFacade + 'static>(mut self, bluetooth: Arc<B>) -> Self {
        self.bluetooth = Some(bluetooth);
        self
    }

    /// Sets the stream collector that learns about device changes.
    pub fn stream_collector<C: StreamCollector + 'static>(mut self, collector: Arc<C>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Uses a private session id counter.
    ///
    /// Default: the process-wide counter.
    pub fn session_ids(mut self, session_ids: Arc<SessionIdGenerator>) -> Self {
        self.session_ids = Some(session_ids);
        self
    }

    /// Set a callback to receive routing events.
    ///
    /// Events include device changes, recreate requests, dual tone changes
    /// and failed port opens or moves.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(CoreEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Set custom core configuration.
    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    fn validate(&self) -> Result<(), RouteError> {
        if self.hdi.is_none() {
            return Err(RouteError::invalid_param("no hdi adapter configured"));
        }
        if self.bluetooth.is_none() {
            return Err(RouteError::invalid_param("no bluetooth facade configured"));
        }
        if self.collector.is_none() {
            return Err(RouteError::invalid_param("no stream collector configured"));
        }
        if self.config.worker_queue_capacity == 0 {
            return Err(RouteError::invalid_param("worker queue capacity must be positive"));
        }
        if self.config.max_fetch_retries == 0 {
            return Err(RouteError::invalid_param("max fetch retries must be positive"));
        }
        Ok(())
    }

    /// Builds the service.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidParam`] if a collaborator is missing or
    /// the configuration is out of range.
    pub fn build(self) -> Result<AudioCoreService, RouteError> {
        self.validate()?;
        let (Some(hdi), Some(bluetooth), Some(collector)) = (self.hdi, self.bluetooth, self.collector) else {
            return Err(RouteError::invalid_param("incomplete builder"));
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(DeviceRegistry::with_builtin_devices()));

        let mut service = AudioCoreService::new(self.config, registry, hdi, bluetooth, collector);
        if let Some(session_ids) = self.session_ids {
            service = service.with_session_ids(session_ids);
        }
        if let Some(callback) = self.event_callback {
            service = service.with_event_callback(callback);
        }
        Ok(service)
    }

    /// Builds the service, routes the idle devices once and starts a worker
    /// that processes requests in order.
    ///
    /// Returns a [`CoreHandle`] to submit requests and stop the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the initial fetch fails.
    pub async fn spawn(self) -> Result<CoreHandle, RouteError> {
        let capacity = self.config.worker_queue_capacity;
        let service = Arc::new(self.build()?);
        service
            .trigger_fetch_device(crate::DeviceChangeReason::Unknown)
            .await?;
        Ok(spawn_core_worker(service, capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::mock::{MockBluetooth, MockHdiAdapter, MockStreamCollector};

    fn complete() -> AudioCoreServiceBuilder {
        AudioCoreServiceBuilder::new()
            .hdi_adapter(Arc::new(MockHdiAdapter::new()))
            .bluetooth(Arc::new(MockBluetooth::new()))
            .stream_collector(Arc::new(MockStreamCollector::new()))
    }

    #[test]
    fn test_builder_default() {
        let builder = AudioCoreServiceBuilder::new();
        assert!(builder.hdi.is_none());
        assert!(builder.registry.is_none());
        assert_eq!(builder.config.worker_queue_capacity, 32);
    }

    #[test]
    fn test_builder_rejects_missing_facades() {
        let result = AudioCoreServiceBuilder::new()
            .hdi_adapter(Arc::new(MockHdiAdapter::new()))
            .build();
        assert!(matches!(result, Err(RouteError::InvalidParam { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let result = complete()
            .with_config(CoreConfig {
                worker_queue_capacity: 0,
                ..CoreConfig::default()
            })
            .validate();
        assert!(matches!(result, Err(RouteError::InvalidParam { .. })));
    }

    #[test]
    fn test_builder_uses_builtin_registry() {
        let service = complete().build().unwrap();
        let types: Vec<DeviceType> = service
            .registry()
            .connected_devices()
            .iter()
            .map(|d| d.device_type)
            .collect();
        assert!(types.contains(&DeviceType::Speaker));
        assert!(types.contains(&DeviceType::Mic));
    }

    #[tokio::test]
    async fn test_spawn_routes_idle_devices() {
        let handle = complete().session_ids(Arc::new(SessionIdGenerator::new())).spawn().await.unwrap();
        assert_eq!(
            handle.service().active_devices().current_output_device().device_type,
            DeviceType::Speaker
        );
        assert_eq!(
            handle.service().active_devices().current_input_device().device_type,
            DeviceType::Mic
        );
        handle.stop().await;
    }
}
