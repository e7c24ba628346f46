use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CastError;

/// Stable device identifier, scoped to the adapter that discovered it.
///
/// Adapters use the device UDN (UPnP/DIAL) or cast uuid (Chromecast) so the
/// same physical device keeps the same id across rediscoveries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discovered media-rendering endpoint.
///
/// `transport` names the adapter that owns the device (`"dial"`, `"dlna"`,
/// `"chromecast"`). `transport_info` is an opaque key/value map the adapter
/// fills with whatever it needs to reach the device later; the core never
/// interprets it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub model: Option<String>,
    pub transport: String,
    /// Free-form capability tags, e.g. `"audio"`, `"video"`.
    pub capabilities: Vec<String>,
    pub transport_info: HashMap<String, serde_json::Value>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: name.into(),
            model: None,
            transport: transport.into(),
            capabilities: Vec::new(),
            transport_info: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transport_info(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.transport_info.insert(key.into(), value);
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    /// Names of the fields that differ between `self` and `other`.
    pub(crate) fn changed_fields(&self, other: &Device) -> Vec<String> {
        let mut changed = Vec::new();
        if self.name != other.name {
            changed.push("name".to_string());
        }
        if self.model != other.model {
            changed.push("model".to_string());
        }
        if self.transport != other.transport {
            changed.push("transport".to_string());
        }
        if self.capabilities != other.capabilities {
            changed.push("capabilities".to_string());
        }
        if self.transport_info != other.transport_info {
            changed.push("transport_info".to_string());
        }
        changed
    }
}

/// Playback state reported by an adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Transitioning,
    NoMedia,
}

/// Playback status snapshot attached to `DeviceEvent::MediaStatusUpdated`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaStatus {
    pub state: PlaybackState,
    pub position: Option<Duration>,
    pub duration: Option<Duration>,
}

impl MediaStatus {
    pub fn new(state: PlaybackState) -> Self {
        Self {
            state,
            position: None,
            duration: None,
        }
    }
}

/// Lifecycle and state-change events fanned out to subscribers.
///
/// Events are immutable snapshots taken at publish time. For one device the
/// sequence is always `Added`, then zero or more `Updated`/status events,
/// then an optional terminal `Removed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DeviceEvent {
    Added {
        device: Device,
        at: DateTime<Utc>,
    },
    Updated {
        device: Device,
        /// Names of the fields that changed; empty for an idempotent
        /// re-registration (consumers must tolerate no-op updates).
        changed: Vec<String>,
        at: DateTime<Utc>,
    },
    Removed {
        id: DeviceId,
        /// `"lost"` when discovery loses the device, `"shutdown"` on stop.
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    MediaStatusUpdated {
        id: DeviceId,
        status: MediaStatus,
        at: DateTime<Utc>,
    },
    VolumeUpdated {
        id: DeviceId,
        level: f32,
        muted: bool,
        at: DateTime<Utc>,
    },
}

impl DeviceEvent {
    /// Id of the device the event concerns.
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DeviceEvent::Added { device, .. } | DeviceEvent::Updated { device, .. } => &device.id,
            DeviceEvent::Removed { id, .. }
            | DeviceEvent::MediaStatusUpdated { id, .. }
            | DeviceEvent::VolumeUpdated { id, .. } => id,
        }
    }
}

/// Content source for a payload: exactly one of URL, local path or bytes.
#[derive(Clone, Debug)]
pub enum PayloadSource {
    Url(String),
    Path(PathBuf),
    /// Shared buffer; cloning never copies the content.
    Bytes(Bytes),
}

/// Image reference attached to media metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaImage {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Descriptive metadata forwarded to the target device. All fields optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub images: Vec<MediaImage>,
    /// Content-kind hint (`"music"`, `"movie"`, `"photo"`), not a MIME type.
    pub kind: Option<String>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// A piece of content to deliver to a device.
///
/// Construct with [`MediaPayload::from_url`] / [`from_path`] /
/// [`from_bytes`], or with [`MediaPayload::builder`] when assembling from
/// optional inputs (the builder rejects zero or multiple sources).
///
/// [`from_path`]: MediaPayload::from_path
/// [`from_bytes`]: MediaPayload::from_bytes
#[derive(Clone, Debug)]
pub struct MediaPayload {
    pub source: PayloadSource,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub metadata: Option<MediaMetadata>,
}

impl MediaPayload {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            source: PayloadSource::Url(url.into()),
            mime_type: None,
            size: None,
            metadata: None,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: PayloadSource::Path(path.into()),
            mime_type: None,
            size: None,
            metadata: None,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        Self {
            source: PayloadSource::Bytes(bytes),
            mime_type: None,
            size: Some(size),
            metadata: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn builder() -> MediaPayloadBuilder {
        MediaPayloadBuilder::default()
    }
}

/// Fallible payload construction from optional inputs.
#[derive(Default)]
pub struct MediaPayloadBuilder {
    url: Option<String>,
    path: Option<PathBuf>,
    bytes: Option<Bytes>,
    mime_type: Option<String>,
    metadata: Option<MediaMetadata>,
}

impl MediaPayloadBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.bytes = Some(bytes.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn build(self) -> Result<MediaPayload, CastError> {
        let sources =
            self.url.is_some() as u8 + self.path.is_some() as u8 + self.bytes.is_some() as u8;
        if sources == 0 {
            return Err(CastError::InvalidPayload(
                "one of url, path or bytes is required".to_string(),
            ));
        }
        if sources > 1 {
            return Err(CastError::InvalidPayload(
                "url, path and bytes are mutually exclusive".to_string(),
            ));
        }

        let mut payload = if let Some(url) = self.url {
            MediaPayload::from_url(url)
        } else if let Some(path) = self.path {
            MediaPayload::from_path(path)
        } else {
            MediaPayload::from_bytes(self.bytes.unwrap())
        };
        payload.mime_type = self.mime_type;
        payload.metadata = self.metadata;
        Ok(payload)
    }
}

/// Caller-supplied options for `send_media`.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Application to launch on app-launching transports (DIAL).
    pub app: Option<String>,
    /// Overrides the registry's default send timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What an adapter receives on `send_media`: the payload already resolved to
/// a device-fetchable URL.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub url: String,
    pub mime_type: String,
    pub metadata: Option<MediaMetadata>,
    pub options: SendOptions,
}

/// Outcome of a `send_media` call. Never an unhandled failure: errors,
/// timeouts and panics in the delegate all land here as `success == false`
/// with a `reason` from the stable error taxonomy.
#[derive(Clone)]
pub struct SendResult {
    pub success: bool,
    pub reason: Option<String>,
    pub controller: Option<std::sync::Arc<dyn crate::adapter::MediaController>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
            controller: None,
            metadata: HashMap::new(),
        }
    }

    pub fn ok_with_controller(
        controller: std::sync::Arc<dyn crate::adapter::MediaController>,
    ) -> Self {
        Self {
            success: true,
            reason: None,
            controller: Some(controller),
            metadata: HashMap::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            controller: None,
            metadata: HashMap::new(),
        }
    }

    pub fn from_error(err: &CastError) -> Self {
        Self::failed(err.send_reason())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl std::fmt::Debug for SendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendResult")
            .field("success", &self.success)
            .field("reason", &self.reason)
            .field("controller", &self.controller.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_exactly_one_source() {
        let err = MediaPayload::builder().build().unwrap_err();
        assert!(matches!(err, CastError::InvalidPayload(_)));

        let err = MediaPayload::builder()
            .url("http://example.com/a.mp4")
            .bytes(vec![1u8, 2, 3])
            .build()
            .unwrap_err();
        assert!(matches!(err, CastError::InvalidPayload(_)));

        let payload = MediaPayload::builder()
            .bytes(vec![1u8, 2, 3])
            .mime_type("video/mp4")
            .build()
            .unwrap();
        assert!(matches!(payload.source, PayloadSource::Bytes(_)));
        assert_eq!(payload.size, Some(3));
        assert_eq!(payload.mime_type.as_deref(), Some("video/mp4"));
    }

    #[test]
    fn changed_fields_reports_differences() {
        let a = Device::new("uuid:1", "Living Room", "dlna").with_capabilities(["audio"]);
        let same = a.clone();
        assert!(a.changed_fields(&same).is_empty());

        let mut b = a.clone();
        b.name = "Kitchen".to_string();
        b.capabilities = vec!["audio".to_string(), "video".to_string()];
        let changed = a.changed_fields(&b);
        assert_eq!(changed, vec!["name".to_string(), "capabilities".to_string()]);
    }

    #[test]
    fn bytes_payload_records_size() {
        let payload = MediaPayload::from_bytes(vec![0u8; 1024]);
        assert_eq!(payload.size, Some(1024));
    }
}
