//! The public facade tying the device table, event bus, media server and
//! adapter supervisor together.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::adapter::{AdapterState, MediaAdapter, RegistryHandle, SessionGuard};
use crate::config::RegistryConfig;
use crate::device_table::DeviceTable;
use crate::errors::CastError;
use crate::events::{EventBus, EventStream, Subscription};
use crate::media_server::{MediaServer, MediaState};
use crate::model::{
    Device, DeviceEvent, DeviceId, MediaPayload, PayloadSource, SendOptions, SendRequest,
    SendResult,
};
use crate::supervisor::AdapterSupervisor;

/// Global lifecycle of a registry instance. `Stopped` is terminal; a new
/// instance is needed to start again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Started,
    Stopped,
}

/// Entry point for a casting session. Background work is torn down by
/// [`Registry::stop`], not by `Drop`.
pub struct Registry {
    config: RegistryConfig,
    bus: EventBus,
    devices: Arc<DeviceTable>,
    media: tokio::sync::Mutex<MediaServer>,
    media_state: Arc<MediaState>,
    supervisor: AdapterSupervisor,
    state: Mutex<RegistryState>,
    pending: Mutex<Vec<Arc<dyn MediaAdapter>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        let bus = EventBus::new(config.event_bus.clone());
        let devices = Arc::new(DeviceTable::new(bus.clone()));
        let media = MediaServer::new(config.media_server.clone());
        let media_state = media.state();
        let base_handle =
            RegistryHandle::new(devices.clone(), media_state.clone(), SessionGuard::new());
        let supervisor = AdapterSupervisor::new(base_handle, config.adapter_stop_timeout);
        Self {
            config,
            bus,
            devices,
            media: tokio::sync::Mutex::new(media),
            media_state,
            supervisor,
            state: Mutex::new(RegistryState::Uninitialized),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queues an adapter to be started by [`Registry::start`]. Adapters
    /// added after start are ignored with a warning.
    pub fn add_adapter(&self, adapter: Arc<dyn MediaAdapter>) {
        let state = *self.state.lock().unwrap();
        if state != RegistryState::Uninitialized {
            warn!(adapter = %adapter.name(), "Adapter added after start, ignored");
            return;
        }
        self.pending.lock().unwrap().push(adapter);
    }

    /// Binds the media server, then starts every queued adapter.
    ///
    /// A media server bind failure fails `start` and leaves the registry
    /// startable again. Individual adapter start failures do not: they are
    /// contained by the supervisor and logged.
    pub async fn start(&self) -> Result<(), CastError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                RegistryState::Started => return Err(CastError::AlreadyStarted),
                RegistryState::Stopped => return Err(CastError::AlreadyStopped),
                RegistryState::Uninitialized => *state = RegistryState::Started,
            }
        }

        let base_url = {
            let mut media = self.media.lock().await;
            match media.start().await {
                Ok(base_url) => base_url,
                Err(e) => {
                    *self.state.lock().unwrap() = RegistryState::Uninitialized;
                    return Err(e);
                }
            }
        };

        let adapters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain(..).collect()
        };
        for adapter in adapters {
            self.supervisor.start(adapter);
        }

        info!(base_url = %base_url, "Registry started");
        Ok(())
    }

    /// Stops adapters, drops every tracked device with reason `"shutdown"`
    /// and shuts the media server down. Terminal; a second call is a no-op.
    pub async fn stop(&self) -> Result<(), CastError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                RegistryState::Uninitialized => return Err(CastError::NotStarted),
                RegistryState::Stopped => return Ok(()),
                RegistryState::Started => *state = RegistryState::Stopped,
            }
        }

        self.supervisor.stop_all().await;
        for device in self.devices.list() {
            self.devices.remove(&device.id, Some("shutdown".to_string()));
        }
        self.media.lock().await.stop().await;
        info!("Registry stopped");
        Ok(())
    }

    /// Delivers a payload to a device. Always returns a result; lookup
    /// failures, adapter errors, panics and timeouts all come back as
    /// `success == false` with a stable `reason`.
    pub async fn send_media(
        &self,
        id: &DeviceId,
        payload: MediaPayload,
        options: SendOptions,
    ) -> SendResult {
        match *self.state.lock().unwrap() {
            RegistryState::Uninitialized => return SendResult::from_error(&CastError::NotStarted),
            RegistryState::Stopped => return SendResult::from_error(&CastError::AlreadyStopped),
            RegistryState::Started => {}
        }

        let Some(device) = self.devices.get(id) else {
            debug!(device = %id, "send_media to unknown device");
            return SendResult::from_error(&CastError::device_not_found(id.as_str()));
        };
        let Some(adapter) = self.supervisor.adapter_for_transport(&device.transport) else {
            return SendResult::from_error(&CastError::adapter_failure(format!(
                "no running adapter for transport {}",
                device.transport
            )));
        };

        let mime_type = payload
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let metadata = payload.metadata.clone();

        // URL payloads are handed to the device as-is; everything else is
        // published through the media server first.
        let direct_url = match &payload.source {
            PayloadSource::Url(url) => Some(url.clone()),
            _ => None,
        };
        let url = match direct_url {
            Some(url) => url,
            None => match self.media_state.register_url(None, payload) {
                Ok(url) => url,
                Err(e) => {
                    return SendResult::from_error(&CastError::PayloadRegistrationFailure(
                        e.to_string(),
                    ));
                }
            },
        };

        let request = SendRequest {
            url,
            mime_type,
            metadata,
            options: options.clone(),
        };
        let timeout = options.timeout.unwrap_or(self.config.send_timeout);
        let device_id = device.id.clone();
        let transport = device.transport.clone();

        debug!(device = %device_id, transport = %transport, url = %request.url, "Delegating send_media");
        let task = tokio::spawn(async move { adapter.send_media(device, request).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                abort.abort();
                warn!(
                    device = %device_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "send_media timed out, delegate aborted"
                );
                SendResult::from_error(&CastError::Timeout(timeout))
            }
            Ok(Err(join_err)) => {
                let detail = if join_err.is_panic() {
                    "adapter panicked during send"
                } else {
                    "send task was cancelled"
                };
                warn!(device = %device_id, detail, "send_media delegate failed");
                SendResult::from_error(&CastError::adapter_failure(detail))
            }
            Ok(Ok(Err(e))) => {
                warn!(device = %device_id, error = %format!("{e:#}"), "send_media failed");
                SendResult::from_error(&CastError::adapter_failure(format!("{e:#}")))
            }
            Ok(Ok(Ok(result))) => result,
        }
    }

    /// Registers a payload with the media server and returns its URL.
    pub fn register_media_payload(
        &self,
        hint: Option<&str>,
        payload: MediaPayload,
    ) -> Result<String, CastError> {
        self.media_state.register_url(hint, payload)
    }

    /// Releases a payload registration before its idle eviction. Returns
    /// whether the id was live.
    pub fn unregister_media_payload(&self, id: &str) -> bool {
        self.media_state.unregister(id)
    }

    /// Base URL of the embedded media server, once started.
    pub fn media_base_url(&self) -> Option<String> {
        self.media_state.base_url()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.list()
    }

    pub fn get_device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    pub fn subscribe_sync<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(DeviceEvent) + Send + 'static,
    {
        self.bus.subscribe_sync(callback)
    }

    pub fn events(&self) -> EventStream {
        self.bus.events()
    }

    pub fn adapter_state(&self, name: &str) -> AdapterState {
        self.supervisor.state_of(name)
    }

    pub fn state(&self) -> RegistryState {
        *self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaServerConfig;

    fn local_config() -> RegistryConfig {
        RegistryConfig::default()
            .with_media_server(MediaServerConfig::default().with_ip("127.0.0.1"))
    }

    #[tokio::test]
    async fn lifecycle_is_linear_and_terminal() {
        let registry = Registry::new(local_config());
        assert_eq!(registry.state(), RegistryState::Uninitialized);
        assert!(matches!(
            registry.stop().await.unwrap_err(),
            CastError::NotStarted
        ));

        registry.start().await.unwrap();
        assert_eq!(registry.state(), RegistryState::Started);
        assert!(matches!(
            registry.start().await.unwrap_err(),
            CastError::AlreadyStarted
        ));

        registry.stop().await.unwrap();
        assert_eq!(registry.state(), RegistryState::Stopped);
        registry.stop().await.unwrap();
        assert!(matches!(
            registry.start().await.unwrap_err(),
            CastError::AlreadyStopped
        ));
    }

    #[tokio::test]
    async fn send_media_reports_lifecycle_reasons() {
        let registry = Registry::new(local_config());
        let id = DeviceId::new("uuid:any");

        let result = registry
            .send_media(&id, MediaPayload::from_url("http://example.com/a.mp3"), SendOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("NotStarted"));

        registry.start().await.unwrap();
        let result = registry
            .send_media(&id, MediaPayload::from_url("http://example.com/a.mp3"), SendOptions::default())
            .await;
        assert_eq!(result.reason.as_deref(), Some("DeviceNotFound"));

        registry.stop().await.unwrap();
        let result = registry
            .send_media(&id, MediaPayload::from_url("http://example.com/a.mp3"), SendOptions::default())
            .await;
        assert_eq!(result.reason.as_deref(), Some("AlreadyStopped"));
    }

    #[tokio::test]
    async fn payload_registration_requires_start() {
        let registry = Registry::new(local_config());
        assert!(matches!(
            registry
                .register_media_payload(None, MediaPayload::from_bytes(vec![1u8]))
                .unwrap_err(),
            CastError::NotStarted
        ));

        registry.start().await.unwrap();
        let url = registry
            .register_media_payload(Some("track"), MediaPayload::from_bytes(vec![1u8]))
            .unwrap();
        let base = registry.media_base_url().unwrap();
        assert_eq!(url, format!("{base}/track"));
        registry.stop().await.unwrap();
    }
}
