//! The contract between the registry core and transport adapters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::device_table::DeviceTable;
use crate::errors::CastError;
use crate::media_server::MediaState;
use crate::model::{Device, DeviceEvent, DeviceId, MediaPayload, MediaStatus, SendRequest, SendResult};

/// A transport adapter: discovers devices for one protocol family and
/// delivers media to them.
///
/// `start` runs for the adapter's whole lifetime (discovery loops live in
/// it) and only returns early on a startup failure. The supervisor cancels
/// it on `stop` and then calls [`MediaAdapter::stop`] for protocol-level
/// cleanup.
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// Transport name, also used as the `transport` field on devices this
    /// adapter registers.
    fn name(&self) -> &str;

    /// Runs discovery until cancelled. Registers and unregisters devices
    /// through the handle.
    async fn start(&self, handle: RegistryHandle) -> anyhow::Result<()>;

    /// Releases protocol resources. Called once during shutdown, after the
    /// `start` future has been cancelled.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Delivers media to one of this adapter's devices. The request URL is
    /// already fetchable by the device.
    async fn send_media(&self, device: Device, request: SendRequest) -> anyhow::Result<SendResult>;
}

/// Post-send playback control for transports that support it.
#[async_trait]
pub trait MediaController: Send + Sync {
    async fn play(&self) -> Result<(), CastError>;
    async fn pause(&self) -> Result<(), CastError>;
    async fn stop(&self) -> Result<(), CastError>;
    async fn seek(&self, position: Duration) -> Result<(), CastError>;
    /// `level` is in `0.0..=1.0`.
    async fn set_volume(&self, level: f32) -> Result<(), CastError>;
    async fn set_mute(&self, muted: bool) -> Result<(), CastError>;
}

/// Lifecycle state of a supervised adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Revocable session token handed to each adapter run.
///
/// Controllers hold the guard of the run that created them; once the
/// adapter stops, every operation through an old controller fails with
/// `SessionEnded` instead of reaching a device the adapter no longer owns.
#[derive(Clone)]
pub struct SessionGuard {
    active: Arc<AtomicBool>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn ensure_active(&self) -> Result<(), CastError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CastError::SessionEnded)
        }
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// The adapter's window into the registry core.
///
/// Cheap to clone; every adapter run receives its own handle bound to that
/// run's session guard.
#[derive(Clone)]
pub struct RegistryHandle {
    devices: Arc<DeviceTable>,
    media: Arc<MediaState>,
    guard: SessionGuard,
}

impl RegistryHandle {
    pub(crate) fn new(devices: Arc<DeviceTable>, media: Arc<MediaState>, guard: SessionGuard) -> Self {
        Self {
            devices,
            media,
            guard,
        }
    }

    /// Same handle rebound to a fresh session guard.
    pub(crate) fn for_session(&self, guard: SessionGuard) -> Self {
        Self {
            devices: self.devices.clone(),
            media: self.media.clone(),
            guard,
        }
    }

    pub fn register_device(&self, device: Device) -> DeviceEvent {
        self.devices.upsert(device)
    }

    pub fn unregister_device(&self, id: &DeviceId, reason: impl Into<String>) -> Option<DeviceEvent> {
        self.devices.remove(id, Some(reason.into()))
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id)
    }

    /// Ids currently registered for the given transport, for absence-based
    /// expiry in discovery loops.
    pub fn device_ids(&self, transport: &str) -> Vec<DeviceId> {
        self.devices.ids_for_transport(transport)
    }

    pub fn publish_media_status(&self, id: &DeviceId, status: MediaStatus) {
        self.devices.publish_status(id, status);
    }

    pub fn publish_volume(&self, id: &DeviceId, level: f32, muted: bool) {
        self.devices.publish_volume(id, level, muted);
    }

    /// Registers a payload with the media server and returns the URL a
    /// device can fetch it from.
    pub fn register_media_payload(
        &self,
        hint: Option<&str>,
        payload: MediaPayload,
    ) -> Result<String, CastError> {
        self.media.register_url(hint, payload)
    }

    /// Base URL of the media server, once it is running.
    pub fn base_url(&self) -> Option<String> {
        self.media.base_url()
    }

    pub fn session_guard(&self) -> SessionGuard {
        self.guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_revocation_is_shared_across_clones() {
        let guard = SessionGuard::new();
        let clone = guard.clone();
        assert!(guard.ensure_active().is_ok());

        clone.revoke();
        assert!(!guard.is_active());
        assert!(matches!(
            guard.ensure_active().unwrap_err(),
            CastError::SessionEnded
        ));
    }
}
